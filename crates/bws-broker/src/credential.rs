//! Long-lived machine-account credential.
//!
//! A Bitwarden Secrets Manager access token looks like
//! `0.<client_id>.<client_secret>:<encryption_key>`.  The client id and
//! secret take part in the token exchange; the encryption key unlocks the
//! organization key that comes back with the token.

use std::fmt;
use std::path::PathBuf;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use tracing::info;
use zeroize::Zeroizing;

use crate::config::ReadEnv;
use crate::crypto::{ACCESS_SEED_LEN, SymmetricKey};
use crate::error::{CredentialError, CryptoError, ExchangeError};

/// Supported credential format version.
const VERSION: &str = "0";

/// The raw access token the broker was configured with.
///
/// The `Debug` impl never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredential(String);

/// The parts of an [`ApiCredential`] sent to the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCredentials<'a> {
    pub client_id: &'a str,
    pub client_secret: &'a str,
}

impl ApiCredential {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Validate the structure and borrow the OAuth2 client credentials.
    ///
    /// Segments are separated by `.` or `:`; there must be exactly four and
    /// the first must be the version marker `0`.
    pub fn client_credentials(&self) -> Result<ClientCredentials<'_>, ExchangeError> {
        let [_, client_id, client_secret, _] = self.segments()?;
        Ok(ClientCredentials {
            client_id,
            client_secret,
        })
    }

    /// Key derived from the last segment, a base64 encoded 16-byte secret.
    pub fn access_key(&self) -> Result<SymmetricKey, CryptoError> {
        let [_, _, _, encoded] = self
            .segments()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let seed = Zeroizing::new(
            STANDARD
                .decode(encoded)
                .map_err(|e| CryptoError::InvalidKey(format!("access token secret: {e}")))?,
        );
        let seed = <&[u8; ACCESS_SEED_LEN]>::try_from(seed.as_slice()).map_err(|_| {
            CryptoError::InvalidKey(format!(
                "access token secret must be {ACCESS_SEED_LEN} bytes, found {}",
                seed.len()
            ))
        })?;
        SymmetricKey::from_access_seed(seed)
    }

    fn segments(&self) -> Result<[&str; 4], ExchangeError> {
        let parts: Vec<&str> = self.0.split(['.', ':']).collect();
        let &[version, client_id, client_secret, key] = parts.as_slice() else {
            return Err(ExchangeError::MalformedCredential(format!(
                "expected 4 segments, found {}",
                parts.len()
            )));
        };
        if version != VERSION {
            return Err(ExchangeError::MalformedCredential(
                "unexpected BWS access token version".into(),
            ));
        }
        Ok([version, client_id, client_secret, key])
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiCredential(<redacted>)")
    }
}

/// Resolve the credential from `BWS_ACCESS_TOKEN`, falling back to the file
/// named by `BWS_ACCESS_TOKEN_FILE`.
pub fn resolve(env: &impl ReadEnv) -> Result<ApiCredential, CredentialError> {
    if let Some(token) = env.var("BWS_ACCESS_TOKEN") {
        info!("using access token from BWS_ACCESS_TOKEN");
        return Ok(ApiCredential::new(token));
    }

    let path = env
        .var("BWS_ACCESS_TOKEN_FILE")
        .map(PathBuf::from)
        .ok_or(CredentialError::NotProvided)?;

    info!(path = %path.display(), "reading access token from file");
    let contents = std::fs::read_to_string(&path)
        .map_err(|source| CredentialError::Unreadable { path, source })?;

    Ok(ApiCredential::new(contents.trim_end()))
}
