//! # bws-broker
//!
//! Serves Bitwarden Secrets Manager values to local processes over a Unix
//! socket.
//!
//! At startup the broker trades a machine-account access token for a bearer
//! token, reads the organization from it, unlocks the organization key and
//! starts listening.  A client
//! connects from an address whose last path segment names the secret and
//! receives the raw value bytes.
//!
//! * [`config`]: environment-driven [`BrokerConfig`].
//! * [`credential`]: locating and parsing the [`ApiCredential`].
//! * [`oauth`]: the client-credentials exchange.
//! * [`crypto`]: Bitwarden encrypted strings and keys.
//! * [`identity`]: the `organization` claim and optional JWKS verification.
//! * [`secrets`]: the remote [`SecretsApi`] and its HTTP backend.
//! * [`gateway`]: name to value resolution.
//! * [`dispatcher`]: the socket accept loop.
//! * [`startup`]: wiring everything together.
//!
//! ```rust,no_run
//! use bws_broker::config::{BrokerConfig, SystemEnv};
//!
//! # async fn go() -> Result<(), bws_broker::StartupError> {
//! let config = BrokerConfig::from_env(&SystemEnv);
//! let credential = bws_broker::credential::resolve(&SystemEnv)?;
//! bws_broker::run(&config, credential).await
//! # }
//! ```

pub mod config;
pub mod credential;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod oauth;
pub mod secrets;
pub mod startup;

#[cfg(test)]
mod fake;

pub use config::BrokerConfig;
pub use credential::ApiCredential;
pub use error::{ConnectionError, StartupError};
pub use gateway::SecretsGateway;
pub use identity::OrganizationId;
pub use secrets::{HttpSecretsApi, SecretsApi};
pub use startup::{authenticate, run};
