//! Broker configuration.
//!
//! Everything is read from environment variables at startup through the
//! [`ReadEnv`] seam, so resolution rules can be tested against a plain map
//! instead of the process environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::StartupError;

/// Bitwarden cloud identity provider.
pub const DEFAULT_IDENTITY_URL: &str = "https://identity.bitwarden.com";
/// Bitwarden cloud API.
pub const DEFAULT_API_URL: &str = "https://api.bitwarden.com";
/// Socket file name inside the runtime directory.
pub const SOCKET_NAME: &str = "bws.sock";
/// Upper bound for every outbound HTTP request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const DEFAULT_RUNTIME_DIR: &str = "/run/bws";

/// Read access to environment variables.
pub trait ReadEnv {
    /// Value of `key`, or `None` when unset or not valid Unicode.
    fn var(&self, key: &str) -> Option<String>;
}

/// Delegates to [`std::env`].
pub struct SystemEnv;

impl ReadEnv for SystemEnv {
    #[inline]
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl ReadEnv for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Process-wide configuration, built once in `main`.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Identity provider base URL, without trailing slash.
    pub identity_url: String,
    /// Secrets API base URL, without trailing slash.
    pub api_url: String,
    /// Unix socket the dispatcher listens on.
    pub socket_path: PathBuf,
    /// Verify the access token signature against the provider's JWKS.
    pub verify_signature: bool,
    /// Timeout applied to token exchange and secrets API calls.
    pub request_timeout: Duration,
}

impl BrokerConfig {
    /// Build the configuration from environment variables.
    ///
    /// | Variable                     | Default                          |
    /// |------------------------------|----------------------------------|
    /// | `BWS_IDENTITY_URL`           | `https://identity.bitwarden.com` |
    /// | `BWS_API_URL`                | `https://api.bitwarden.com`      |
    /// | `BWS_VERIFY_TOKEN_SIGNATURE` | `false`                          |
    /// | `RUNTIME_DIRECTORY`          | see [`runtime_directory`]        |
    /// | `XDG_RUNTIME_DIR`            | see [`runtime_directory`]        |
    pub fn from_env(env: &impl ReadEnv) -> Self {
        let identity_url = env
            .var("BWS_IDENTITY_URL")
            .unwrap_or_else(|| DEFAULT_IDENTITY_URL.to_string());
        let api_url = env
            .var("BWS_API_URL")
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let verify_signature = env
            .var("BWS_VERIFY_TOKEN_SIGNATURE")
            .is_some_and(|v| parse_flag(&v));

        Self {
            identity_url: identity_url.trim_end_matches('/').to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
            socket_path: runtime_directory(env).join(SOCKET_NAME),
            verify_signature,
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    /// Listen on `path` instead of the runtime-directory default.
    #[must_use]
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Force JWKS signature verification on.
    #[must_use]
    pub fn with_signature_verification(mut self) -> Self {
        self.verify_signature = true;
        self
    }

    /// OAuth2 token endpoint.
    pub fn token_url(&self) -> String {
        format!("{}/connect/token", self.identity_url)
    }

    /// Published signing keys of the identity provider.
    pub fn jwks_url(&self) -> String {
        format!("{}/.well-known/openid-configuration/jwks", self.identity_url)
    }

    /// HTTP client shared by the token exchange and the secrets API.
    pub fn http_client(&self) -> Result<reqwest::Client, StartupError> {
        reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(StartupError::HttpClient)
    }
}

/// Directory holding the broker socket.
///
/// `$RUNTIME_DIRECTORY` (set by systemd's `RuntimeDirectory=`) wins, then
/// `$XDG_RUNTIME_DIR/bws`, then `/run/bws`.
pub fn runtime_directory(env: &impl ReadEnv) -> PathBuf {
    if let Some(dir) = env.var("RUNTIME_DIRECTORY") {
        PathBuf::from(dir)
    } else if let Some(dir) = env.var("XDG_RUNTIME_DIR") {
        PathBuf::from(dir).join("bws")
    } else {
        PathBuf::from(DEFAULT_RUNTIME_DIR)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn defaults_point_at_bitwarden_cloud() {
        let cfg = BrokerConfig::from_env(&env(&[]));
        assert_eq!(cfg.token_url(), "https://identity.bitwarden.com/connect/token");
        assert_eq!(
            cfg.jwks_url(),
            "https://identity.bitwarden.com/.well-known/openid-configuration/jwks"
        );
        assert_eq!(cfg.api_url, "https://api.bitwarden.com");
        assert_eq!(cfg.socket_path, PathBuf::from("/run/bws/bws.sock"));
        assert!(!cfg.verify_signature);
        assert_eq!(cfg.request_timeout, Duration::from_secs(15));
    }

    #[test]
    fn runtime_directory_prefers_systemd() {
        let e = env(&[
            ("RUNTIME_DIRECTORY", "/run/custom"),
            ("XDG_RUNTIME_DIR", "/run/user/1000"),
        ]);
        assert_eq!(runtime_directory(&e), PathBuf::from("/run/custom"));
    }

    #[test]
    fn runtime_directory_falls_back_to_xdg_subdir() {
        let e = env(&[("XDG_RUNTIME_DIR", "/run/user/1000")]);
        assert_eq!(runtime_directory(&e), PathBuf::from("/run/user/1000/bws"));
    }

    #[test]
    fn urls_lose_trailing_slash() {
        let cfg = BrokerConfig::from_env(&env(&[
            ("BWS_IDENTITY_URL", "http://localhost:4000/"),
            ("BWS_API_URL", "http://localhost:4001/"),
        ]));
        assert_eq!(cfg.token_url(), "http://localhost:4000/connect/token");
        assert_eq!(cfg.api_url, "http://localhost:4001");
    }

    #[test]
    fn verification_flag_parsing() {
        for on in ["1", "true", "TRUE", " yes ", "on"] {
            let cfg = BrokerConfig::from_env(&env(&[("BWS_VERIFY_TOKEN_SIGNATURE", on)]));
            assert!(cfg.verify_signature, "{on:?} should enable verification");
        }
        for off in ["0", "false", "", "nope"] {
            let cfg = BrokerConfig::from_env(&env(&[("BWS_VERIFY_TOKEN_SIGNATURE", off)]));
            assert!(!cfg.verify_signature, "{off:?} should not enable verification");
        }
    }

    #[test]
    fn socket_override_replaces_runtime_path() {
        let cfg = BrokerConfig::from_env(&env(&[])).with_socket_path("/tmp/b.sock");
        assert_eq!(cfg.socket_path, PathBuf::from("/tmp/b.sock"));
    }
}
