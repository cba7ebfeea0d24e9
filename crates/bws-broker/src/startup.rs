//! Startup sequence.
//!
//! Everything here runs exactly once.  Any failure is fatal: without a token,
//! an organization and its key the broker has nothing to serve.

use tracing::info;

use crate::config::BrokerConfig;
use crate::credential::ApiCredential;
use crate::dispatcher::{Dispatcher, bind_listener};
use crate::error::StartupError;
use crate::gateway::SecretsGateway;
use crate::identity::{JwksVerifier, TrustTransport, extract_organization, organization_key};
use crate::oauth::IdentityClient;
use crate::secrets::HttpSecretsApi;

/// Exchange the credential, derive the organization, unlock its key and
/// build the gateway.
pub async fn authenticate(
    config: &BrokerConfig,
    credential: ApiCredential,
) -> Result<SecretsGateway<HttpSecretsApi>, StartupError> {
    let http = config.http_client()?;
    let identity = IdentityClient::new(http.clone(), config.token_url());
    let token = identity.exchange(&credential).await?;

    let organization = if config.verify_signature {
        let verifier = JwksVerifier::fetch(&http, &config.jwks_url()).await?;
        extract_organization(&token, &verifier)?
    } else {
        extract_organization(&token, &TrustTransport)?
    };

    let key = organization_key(&credential, &token)?;

    let api = HttpSecretsApi::new(http, &config.api_url, identity, credential, &token, key);
    info!(organization = %organization, expires_at = %token.expires_at, "authenticated");
    Ok(SecretsGateway::new(api, organization))
}

/// Authenticate, bind the socket and serve until accepting fails.
pub async fn run(config: &BrokerConfig, credential: ApiCredential) -> Result<(), StartupError> {
    let gateway = authenticate(config, credential).await?;
    let listener = bind_listener(&config.socket_path)?;
    Dispatcher::new(gateway).serve(listener).await
}
