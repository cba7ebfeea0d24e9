//! Resolve a secret by name.
//!
//! The remote API only returns values from a point fetch, so resolution is a
//! listing of the organization followed by a fetch of the first match.

use tracing::info;

use crate::error::GatewayError;
use crate::identity::OrganizationId;
use crate::secrets::{SecretRecord, SecretsApi};

/// Find the first secret whose key equals `name` exactly and fetch it.
///
/// Exactly one list call is made; a fetch happens only on a match.
pub async fn resolve_by_name<A: SecretsApi>(
    organization: &OrganizationId,
    api: &A,
    name: &str,
) -> Result<SecretRecord, GatewayError> {
    info!(organization = %organization, "fetching secrets");
    let secrets = api
        .list(organization)
        .await
        .map_err(|source| GatewayError::List {
            organization: organization.clone(),
            source,
        })?;

    let Some(found) = secrets.iter().find(|s| s.key == name) else {
        return Err(GatewayError::NotFound(name.to_string()));
    };

    info!(secret = %name, id = %found.id, "fetching secret by id");
    api.get(&found.id)
        .await
        .map_err(|source| GatewayError::Fetch {
            id: found.id.clone(),
            source,
        })
}

/// Authenticated API handle plus the organization it serves.
///
/// Built once at startup and shared read-only by every connection.
pub struct SecretsGateway<A> {
    api: A,
    organization: OrganizationId,
}

impl<A: SecretsApi> SecretsGateway<A> {
    pub fn new(api: A, organization: OrganizationId) -> Self {
        Self { api, organization }
    }

    pub fn organization(&self) -> &OrganizationId {
        &self.organization
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub async fn resolve(&self, name: &str) -> Result<SecretRecord, GatewayError> {
        resolve_by_name(&self.organization, &self.api, name).await
    }
}
