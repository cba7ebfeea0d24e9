//! In-memory [`SecretsApi`] for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::SecretsApiError;
use crate::identity::OrganizationId;
use crate::secrets::{SecretId, SecretIdentifier, SecretRecord, SecretsApi};

#[derive(Default)]
pub(crate) struct FakeSecretsApi {
    secrets: Vec<SecretRecord>,
    list_status: Option<u16>,
    get_status: Option<u16>,
    gates: HashMap<String, Arc<Notify>>,
    lists: AtomicUsize,
    fetched: Mutex<Vec<String>>,
}

impl FakeSecretsApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_secret(mut self, id: &str, key: &str, value: &str) -> Self {
        self.secrets.push(SecretRecord {
            id: SecretId::new(id),
            organization_id: "org-1".into(),
            key: key.into(),
            value: value.into(),
            note: None,
        });
        self
    }

    pub(crate) fn failing_list(mut self, status: u16) -> Self {
        self.list_status = Some(status);
        self
    }

    pub(crate) fn failing_get(mut self, status: u16) -> Self {
        self.get_status = Some(status);
        self
    }

    /// Hold `get(id)` until the returned handle is notified.
    pub(crate) fn gate(&mut self, id: &str) -> Arc<Notify> {
        self.gates
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub(crate) fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub(crate) fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

impl SecretsApi for FakeSecretsApi {
    async fn list(
        &self,
        _organization: &OrganizationId,
    ) -> Result<Vec<SecretIdentifier>, SecretsApiError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.list_status {
            return Err(SecretsApiError::Api {
                status,
                body: "list failed".into(),
            });
        }
        Ok(self
            .secrets
            .iter()
            .map(|s| SecretIdentifier {
                id: s.id.clone(),
                organization_id: s.organization_id.clone(),
                key: s.key.clone(),
            })
            .collect())
    }

    async fn get(&self, id: &SecretId) -> Result<SecretRecord, SecretsApiError> {
        self.fetched.lock().unwrap().push(id.to_string());
        if let Some(gate) = self.gates.get(id.as_str()) {
            gate.notified().await;
        }
        if let Some(status) = self.get_status {
            return Err(SecretsApiError::Api {
                status,
                body: "get failed".into(),
            });
        }
        self.secrets
            .iter()
            .find(|s| &s.id == id)
            .cloned()
            .ok_or_else(|| SecretsApiError::Api {
                status: 404,
                body: "Resource not found.".into(),
            })
    }
}
