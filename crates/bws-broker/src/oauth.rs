//! OAuth2 client-credentials exchange.
//!
//! Trades the machine-account credential for a short-lived bearer token at
//! the identity provider's `/connect/token` endpoint.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tracing::info;

use crate::credential::ApiCredential;
use crate::error::ExchangeError;

/// Scope granting read access to Secrets Manager.
pub const SCOPE: &str = "api.secrets";

/// Body of a successful token response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    token_type: String,
    #[serde(default)]
    scope: String,
    /// Organization key, encrypted under the credential's access key.
    #[serde(default)]
    encrypted_payload: Option<String>,
}

/// Bearer token issued by the identity provider.
#[derive(Clone)]
pub struct AccessToken {
    token: String,
    pub token_type: String,
    pub scope: String,
    /// Lifetime in seconds as reported by the provider.
    pub expires_in: i64,
    /// `expires_in` applied to the time the response arrived.
    pub expires_at: DateTime<Utc>,
    encrypted_payload: Option<String>,
}

impl AccessToken {
    fn from_response(res: TokenResponse, received_at: DateTime<Utc>) -> Self {
        let lifetime = TimeDelta::try_seconds(res.expires_in).unwrap_or(TimeDelta::zero());
        Self {
            token: res.access_token,
            token_type: res.token_type,
            scope: res.scope,
            expires_in: res.expires_in,
            expires_at: received_at.checked_add_signed(lifetime).unwrap_or(received_at),
            encrypted_payload: res.encrypted_payload,
        }
    }

    /// The raw compact JWS, as returned in `access_token`.
    pub fn as_str(&self) -> &str {
        &self.token
    }

    /// Encrypted organization key sent along with the token, if any.
    pub fn encrypted_payload(&self) -> Option<&str> {
        self.encrypted_payload.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn for_tests(raw: &str) -> Self {
        Self::from_response(
            TokenResponse {
                access_token: raw.to_string(),
                expires_in: 3600,
                token_type: "Bearer".into(),
                scope: SCOPE.into(),
                encrypted_payload: None,
            },
            Utc::now(),
        )
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Client for the identity provider's token endpoint.
#[derive(Debug, Clone)]
pub struct IdentityClient {
    http: reqwest::Client,
    token_url: String,
}

impl IdentityClient {
    /// `http` should carry the request timeout; see
    /// [`BrokerConfig::http_client`](crate::config::BrokerConfig::http_client).
    pub fn new(http: reqwest::Client, token_url: impl Into<String>) -> Self {
        Self {
            http,
            token_url: token_url.into(),
        }
    }

    /// Exchange `credential` for an access token.
    ///
    /// The credential is validated before any request is made.
    pub async fn exchange(&self, credential: &ApiCredential) -> Result<AccessToken, ExchangeError> {
        let client = credential.client_credentials()?;
        info!(client_id = %client.client_id, "fetching BWS token");

        let res = self
            .http
            .post(&self.token_url)
            .header(ACCEPT, "application/json")
            .form(&[
                ("scope", SCOPE),
                ("client_id", client.client_id),
                ("client_secret", client.client_secret),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(ExchangeError::Network)?;

        let status = res.status();
        let body = res.text().await.map_err(ExchangeError::Network)?;

        if status != StatusCode::OK {
            return Err(ExchangeError::AuthServer {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(ExchangeError::MalformedResponse)?;
        let token = AccessToken::from_response(parsed, Utc::now());
        info!(expires_at = %token.expires_at, "BWS token obtained");
        Ok(token)
    }
}
