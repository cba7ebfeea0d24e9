//! Error types for the broker.
//!
//! Each stage of the pipeline has its own enum.  They roll up into two tiers:
//!
//! * [`StartupError`]: the service cannot start (credential, token exchange,
//!   identity, listener).  Propagated out of `main`, which exits non-zero.
//! * [`ConnectionError`]: a single local request failed.  Logged by the
//!   connection task; the accept loop keeps running.

use std::io;
use std::path::PathBuf;

use crate::identity::OrganizationId;
use crate::secrets::SecretId;

/// The long-lived credential could not be obtained.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Neither `BWS_ACCESS_TOKEN` nor `BWS_ACCESS_TOKEN_FILE` is set.
    #[error("BWS access token or token file not provided")]
    NotProvided,

    /// `BWS_ACCESS_TOKEN_FILE` points at a file that cannot be read.
    #[error("failed to read access token file {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The OAuth2 client-credentials exchange failed.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// The credential does not have the `0.<id>.<secret>:<key>` shape.
    #[error("unexpected BWS access token format: {0}")]
    MalformedCredential(String),

    /// Transport failure or timeout talking to the identity provider.
    #[error("failed to reach identity provider: {0}")]
    Network(#[source] reqwest::Error),

    /// The identity provider answered with a non-success status.
    #[error("failed to obtain token: status={status} error={body}")]
    AuthServer { status: u16, body: String },

    /// The token response body is not the expected JSON document.
    #[error("failed to parse token response: {0}")]
    MalformedResponse(#[source] serde_json::Error),
}

/// An encrypted field or key could not be opened.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Not of the form `<type>.<iv>|<data>|<mac>` with base64 parts.
    #[error("malformed encrypted string: {0}")]
    Malformed(String),

    /// Anything but type 2 (AES-256-CBC with HMAC-SHA256).
    #[error("unsupported encryption type {0}")]
    UnsupportedType(String),

    /// Key material of the wrong size or encoding.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("MAC verification failed")]
    MacMismatch,

    #[error("decryption failed: invalid padding")]
    Padding,

    #[error("decrypted data is not valid UTF-8")]
    Utf8,

    /// The decrypted token payload is not the expected JSON document.
    #[error("unexpected token payload: {0}")]
    Payload(String),
}

/// The organization identity could not be recovered from an access token.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The token is not a compact JWS with a JSON object payload.
    #[error("failed to parse access token: {0}")]
    MalformedToken(String),

    /// The payload has no string-valued `organization` claim.
    #[error("missing organization claim")]
    MissingClaim,

    /// The JWKS document could not be fetched from the identity provider.
    #[error("failed to fetch signing keys: {0}")]
    KeySet(#[source] reqwest::Error),

    /// The token signature did not verify against the published keys.
    #[error("access token signature rejected: {0}")]
    Verification(String),

    /// The token response did not include the encrypted organization key.
    #[error("token response carries no encrypted payload")]
    MissingPayload,

    /// The organization key could not be unlocked with the credential.
    #[error("failed to unlock organization key: {0}")]
    Unlock(#[from] CryptoError),
}

/// A call to the remote secrets API failed.
#[derive(Debug, thiserror::Error)]
pub enum SecretsApiError {
    /// Transport failure, timeout or undecodable body.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with a non-success status.
    #[error("secrets API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The bearer token expired and a fresh exchange failed.
    #[error("re-authentication failed: {0}")]
    Reauthenticate(#[source] ExchangeError),

    /// A field of the secret did not decrypt under the organization key.
    #[error("failed to decrypt secret {id}: {source}")]
    Decrypt {
        id: SecretId,
        #[source]
        source: CryptoError,
    },
}

/// Resolving a secret by name failed.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("failed to list secrets in {organization}: {source}")]
    List {
        organization: OrganizationId,
        #[source]
        source: SecretsApiError,
    },

    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("failed to fetch secret {id}: {source}")]
    Fetch {
        id: SecretId,
        #[source]
        source: SecretsApiError,
    },
}

/// The broker cannot offer any service.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("failed to create runtime directory {}: {source}", path.display())]
    RuntimeDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("error listening to socket {}: {source}", path.display())]
    Listener {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("error accepting connection: {0}")]
    Accept(#[source] io::Error),
}

/// A single local connection could not be served.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The peer address does not follow the `…/…/…/<secret>` convention.
    #[error("unexpected peer name: {0:?}")]
    UnexpectedPeer(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),
}
