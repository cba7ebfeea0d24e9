//! Remote Secrets Manager API.
//!
//! [`SecretsApi`] is the seam the gateway talks through; [`HttpSecretsApi`]
//! is the production backend.  Listing returns identifiers only, values need
//! a point fetch by id.  On the wire every `key`, `value` and `note` is
//! encrypted under the organization key; the types here hold plaintext.

use std::fmt;
use std::future::Future;

use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::credential::ApiCredential;
use crate::crypto::SymmetricKey;
use crate::error::SecretsApiError;
use crate::identity::OrganizationId;
use crate::oauth::{AccessToken, IdentityClient};

// ── Types ─────────────────────────────────────────────────────────────────────

/// Remote identifier of a secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(transparent)]
pub struct SecretId(String);

impl SecretId {
    pub fn new(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Entry of a secrets listing; carries no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretIdentifier {
    pub id: SecretId,
    pub organization_id: String,
    pub key: String,
}

/// A secret including its value.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretRecord {
    pub id: SecretId,
    pub organization_id: String,
    pub key: String,
    pub value: String,
    pub note: Option<String>,
}

impl fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretRecord")
            .field("id", &self.id)
            .field("organization_id", &self.organization_id)
            .field("key", &self.key)
            .field("value", &"<redacted>")
            .finish_non_exhaustive()
    }
}

// Wire shapes; string fields are encrypted.

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptedIdentifier {
    id: SecretId,
    #[serde(default)]
    organization_id: String,
    key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptedSecret {
    id: SecretId,
    #[serde(default)]
    organization_id: String,
    key: String,
    value: String,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Deserialize)]
struct SecretIdentifiersResponse {
    secrets: Vec<EncryptedIdentifier>,
}

// ── Trait ─────────────────────────────────────────────────────────────────────

/// List and point-fetch operations of the remote secrets service.
///
/// Implementations are shared by every connection task, hence `Send + Sync`.
pub trait SecretsApi: Send + Sync {
    /// Every secret visible to `organization`, without values.
    fn list(
        &self,
        organization: &OrganizationId,
    ) -> impl Future<Output = Result<Vec<SecretIdentifier>, SecretsApiError>> + Send;

    /// The full secret with id `id`.
    fn get(&self, id: &SecretId) -> impl Future<Output = Result<SecretRecord, SecretsApiError>> + Send;
}

// ── HTTP backend ──────────────────────────────────────────────────────────────

/// Secrets Manager REST API authenticated with a bearer token.
///
/// When the API answers 401 the token is exchanged again once with the held
/// credential and the call is retried.  The organization and its key are not
/// re-derived.
pub struct HttpSecretsApi {
    http: reqwest::Client,
    api_url: String,
    identity: IdentityClient,
    credential: ApiCredential,
    bearer: RwLock<String>,
    organization_key: SymmetricKey,
}

impl HttpSecretsApi {
    pub fn new(
        http: reqwest::Client,
        api_url: &str,
        identity: IdentityClient,
        credential: ApiCredential,
        token: &AccessToken,
        organization_key: SymmetricKey,
    ) -> Self {
        Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            identity,
            credential,
            bearer: RwLock::new(token.as_str().to_string()),
            organization_key,
        }
    }

    fn decrypt(&self, id: &SecretId, field: &str) -> Result<String, SecretsApiError> {
        self.organization_key
            .decrypt_to_string(field)
            .map_err(|source| SecretsApiError::Decrypt {
                id: id.clone(),
                source,
            })
    }

    fn list_url(&self, organization: &OrganizationId) -> String {
        format!("{}/organizations/{organization}/secrets", self.api_url)
    }

    fn secret_url(&self, id: &SecretId) -> String {
        format!("{}/secrets/{id}", self.api_url)
    }

    /// Replace `stale` with a freshly exchanged token.
    ///
    /// If another task already replaced it, that token is returned instead.
    async fn reauthenticate(&self, stale: &str) -> Result<String, SecretsApiError> {
        let mut bearer = self.bearer.write().await;
        if *bearer != stale {
            return Ok(bearer.clone());
        }

        warn!("access token rejected, exchanging credential again");
        let token = self
            .identity
            .exchange(&self.credential)
            .await
            .map_err(SecretsApiError::Reauthenticate)?;
        *bearer = token.as_str().to_string();
        Ok(bearer.clone())
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, SecretsApiError> {
        let token = self.bearer.read().await.clone();

        match self.send(url, &token).await {
            Err(SecretsApiError::Api { status: 401, .. }) => {
                let fresh = self.reauthenticate(&token).await?;
                self.send(url, &fresh).await
            }
            other => other,
        }
    }

    async fn send<T: DeserializeOwned>(&self, url: &str, token: &str) -> Result<T, SecretsApiError> {
        debug!(%url, "secrets API request");
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SecretsApiError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(resp.json().await?)
    }
}

impl SecretsApi for HttpSecretsApi {
    async fn list(
        &self,
        organization: &OrganizationId,
    ) -> Result<Vec<SecretIdentifier>, SecretsApiError> {
        let res: SecretIdentifiersResponse = self.get_json(&self.list_url(organization)).await?;
        res.secrets
            .into_iter()
            .map(|s| {
                Ok(SecretIdentifier {
                    key: self.decrypt(&s.id, &s.key)?,
                    id: s.id,
                    organization_id: s.organization_id,
                })
            })
            .collect()
    }

    async fn get(&self, id: &SecretId) -> Result<SecretRecord, SecretsApiError> {
        let s: EncryptedSecret = self.get_json(&self.secret_url(id)).await?;
        let note = s
            .note
            .filter(|n| !n.is_empty())
            .map(|n| self.decrypt(&s.id, &n))
            .transpose()?;
        Ok(SecretRecord {
            key: self.decrypt(&s.id, &s.key)?,
            value: self.decrypt(&s.id, &s.value)?,
            note,
            id: s.id,
            organization_id: s.organization_id,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
