//! Mock Bitwarden identity provider and Secrets Manager API.
//!
//! Serves, on a single listener:
//!
//! * `POST /connect/token`: client-credentials grant, issues RS256 access
//!   tokens carrying an `organization` claim.
//! * `GET /.well-known/openid-configuration[/jwks]`: discovery and keys.
//! * `GET /organizations/{org}/secrets`: secret identifiers, no values.
//! * `GET /secrets/{id}`: a full secret.
//!
//! Like the real service, secret fields are returned as type 2 encrypted
//! strings under a random organization key, and the token response carries
//! that key encrypted under the access token's secret.
//!
//! Every request is counted so tests can assert on call patterns.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use aes::Aes256;
use axum::extract::{Form, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use chrono::{Duration, Utc};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rand::RngCore;
use rsa::{pkcs1::EncodeRsaPrivateKey, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::task::JoinHandle;

/// Key id advertised in the JWKS and stamped on every token.
pub const KEY_ID: &str = "mock-key-1";

// Global keys, generated once per process.
struct SigningKeys {
    encoding_key: EncodingKey,
    public_jwk: Value,
}

static KEYS: OnceLock<SigningKeys> = OnceLock::new();

fn keys() -> &'static SigningKeys {
    KEYS.get_or_init(|| {
        use rsa::traits::PublicKeyParts;

        let mut rng = rand::thread_rng();
        let priv_key = RsaPrivateKey::new(&mut rng, 2048).expect("Failed to generate private key");
        let pub_key = RsaPublicKey::from(&priv_key);

        let priv_pem = priv_key
            .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
            .expect("Failed to encode private key");
        let encoding_key =
            EncodingKey::from_rsa_pem(priv_pem.as_bytes()).expect("Failed to load private key");

        let public_jwk = json!({
            "kty": "RSA",
            "alg": "RS256",
            "use": "sig",
            "kid": KEY_ID,
            "n": URL_SAFE_NO_PAD.encode(pub_key.n().to_bytes_be()),
            "e": URL_SAFE_NO_PAD.encode(pub_key.e().to_bytes_be()),
        });

        SigningKeys {
            encoding_key,
            public_jwk,
        }
    })
}

// ---------------------------------------------------------------------------
// Encryption
// ---------------------------------------------------------------------------

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;

/// 64-byte Bitwarden key: AES-256 half, then HMAC-SHA256 half.
#[derive(Debug, Clone)]
struct MockKey([u8; 64]);

impl MockKey {
    fn random() -> Self {
        let mut key = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Key Bitwarden derives from the secret at the end of an access token.
    fn from_access_seed(seed: &[u8; 16]) -> Self {
        let mut mac = HmacSha256::new_from_slice(b"bitwarden-accesstoken")
            .expect("HMAC takes keys of any length");
        mac.update(seed);
        let prk = mac.finalize().into_bytes();

        let mut key = [0u8; 64];
        Hkdf::<Sha256>::from_prk(&prk)
            .expect("PRK is one hash long")
            .expand(b"sm-access-token", &mut key)
            .expect("64 bytes is a valid HKDF length");
        Self(key)
    }

    /// `2.<iv>|<ciphertext>|<mac>` with a fresh IV.
    fn encrypt(&self, plaintext: &[u8]) -> String {
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);

        let data = Aes256CbcEnc::new_from_slices(&self.0[..32], &iv)
            .expect("key and IV sizes are fixed")
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut mac = HmacSha256::new_from_slice(&self.0[32..])
            .expect("HMAC takes keys of any length");
        mac.update(&iv);
        mac.update(&data);
        let tag = mac.finalize().into_bytes();

        format!(
            "2.{}|{}|{}",
            STANDARD.encode(iv),
            STANDARD.encode(&data),
            STANDARD.encode(tag)
        )
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// A secret held by the mock API.
#[derive(Debug, Clone)]
pub struct MockSecret {
    pub id: String,
    pub key: String,
    pub value: String,
    /// Served encrypted under a key the machine account does not hold.
    pub undecryptable: bool,
}

/// Builder for a mock deployment.
#[derive(Debug, Clone)]
pub struct MockBws {
    organization: String,
    client_id: String,
    client_secret: String,
    secrets: Vec<MockSecret>,
    include_organization_claim: bool,
    include_encrypted_payload: bool,
    token_failure: Option<(u16, String)>,
    access_seed: [u8; 16],
    organization_key: MockKey,
}

impl MockBws {
    /// A deployment for `organization` with a random machine account.
    pub fn new(organization: &str) -> Self {
        Self {
            organization: organization.to_string(),
            client_id: uuid::Uuid::new_v4().to_string(),
            client_secret: uuid::Uuid::new_v4().simple().to_string(),
            secrets: Vec::new(),
            include_organization_claim: true,
            include_encrypted_payload: true,
            token_failure: None,
            access_seed: rand::random(),
            organization_key: MockKey::random(),
        }
    }

    /// Add a secret; order is preserved in list responses.
    pub fn with_secret(mut self, id: &str, key: &str, value: &str) -> Self {
        self.secrets.push(MockSecret {
            id: id.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            undecryptable: false,
        });
        self
    }

    /// Add a secret encrypted under some other organization's key.
    pub fn with_undecryptable_secret(mut self, id: &str, key: &str, value: &str) -> Self {
        self.secrets.push(MockSecret {
            id: id.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            undecryptable: true,
        });
        self
    }

    /// Leave `encrypted_payload` out of token responses.
    pub fn without_encrypted_payload(mut self) -> Self {
        self.include_encrypted_payload = false;
        self
    }

    /// Issue tokens without the `organization` claim.
    pub fn without_organization_claim(mut self) -> Self {
        self.include_organization_claim = false;
        self
    }

    /// Make the token endpoint answer `status` with `body`.
    pub fn with_token_failure(mut self, status: u16, body: &str) -> Self {
        self.token_failure = Some((status, body.to_string()));
        self
    }

    /// Machine-account access token accepted by this deployment.
    pub fn access_token(&self) -> String {
        format!(
            "0.{}.{}:{}",
            self.client_id,
            self.client_secret,
            STANDARD.encode(self.access_seed)
        )
    }

    pub fn router(self) -> (Router, Arc<MockState>) {
        let state = Arc::new(MockState {
            config: self,
            issued: Mutex::new(HashSet::new()),
            token_requests: Mutex::new(Vec::new()),
            list_requests: AtomicUsize::new(0),
            fetched: Mutex::new(Vec::new()),
        });

        let router = Router::new()
            .route("/.well-known/openid-configuration", get(openid_configuration))
            .route("/.well-known/openid-configuration/jwks", get(jwks))
            .route("/connect/token", post(token))
            .route("/organizations/{org}/secrets", get(list_secrets))
            .route("/secrets/{id}", get(get_secret))
            .with_state(state.clone());

        (router, state)
    }

    /// Serve on an ephemeral localhost port until the handle is dropped.
    pub async fn spawn(self) -> std::io::Result<MockBwsHandle> {
        let access_token = self.access_token();
        let (router, state) = self.router();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(MockBwsHandle {
            addr,
            access_token,
            state,
            task,
        })
    }
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

/// Form fields and headers of one token request.
#[derive(Debug, Clone)]
pub struct TokenRequestRecord {
    pub grant_type: String,
    pub scope: String,
    pub client_id: String,
    pub client_secret: String,
    pub content_type: Option<String>,
    pub accept: Option<String>,
}

pub struct MockState {
    config: MockBws,
    issued: Mutex<HashSet<String>>,
    token_requests: Mutex<Vec<TokenRequestRecord>>,
    list_requests: AtomicUsize,
    fetched: Mutex<Vec<String>>,
}

impl MockState {
    fn key_for(&self, secret: &MockSecret) -> MockKey {
        if secret.undecryptable {
            MockKey::random()
        } else {
            self.config.organization_key.clone()
        }
    }

    fn is_authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|t| self.issued.lock().unwrap().contains(t))
    }
}

/// Running mock; the server stops when this is dropped.
pub struct MockBwsHandle {
    addr: SocketAddr,
    access_token: String,
    state: Arc<MockState>,
    task: JoinHandle<()>,
}

impl MockBwsHandle {
    /// Base URL serving both the identity and the API routes.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn organization(&self) -> &str {
        &self.state.config.organization
    }

    /// The organization key, base64 encoded.
    pub fn organization_key(&self) -> String {
        STANDARD.encode(self.state.config.organization_key.0)
    }

    pub fn token_requests(&self) -> Vec<TokenRequestRecord> {
        self.state.token_requests.lock().unwrap().clone()
    }

    pub fn list_requests(&self) -> usize {
        self.state.list_requests.load(Ordering::SeqCst)
    }

    /// Ids passed to `GET /secrets/{id}`, in call order.
    pub fn fetched_ids(&self) -> Vec<String> {
        self.state.fetched.lock().unwrap().clone()
    }

    /// Forget every issued access token, as if they had all expired.
    pub fn expire_tokens(&self) {
        self.state.issued.lock().unwrap().clear();
    }
}

impl Drop for MockBwsHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ---------------------------------------------------------------------------
// Identity endpoints
// ---------------------------------------------------------------------------

async fn openid_configuration(headers: HeaderMap) -> Json<Value> {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let issuer = format!("http://{host}");
    Json(json!({
        "issuer": issuer,
        "token_endpoint": format!("{issuer}/connect/token"),
        "jwks_uri": format!("{issuer}/.well-known/openid-configuration/jwks"),
        "grant_types_supported": ["client_credentials"],
        "id_token_signing_alg_values_supported": ["RS256"]
    }))
}

async fn jwks() -> Json<Value> {
    Json(json!({ "keys": [keys().public_jwk.clone()] }))
}

#[derive(Deserialize)]
struct TokenForm {
    #[serde(default)]
    grant_type: String,
    #[serde(default)]
    scope: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
}

#[derive(Serialize)]
struct AccessTokenClaims {
    iss: String,
    nbf: i64,
    iat: i64,
    exp: i64,
    scope: Vec<String>,
    client_id: String,
    sub: String,
    #[serde(rename = "type")]
    token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<String>,
}

async fn token(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Form(req): Form<TokenForm>,
) -> Response {
    let header_str = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    state.token_requests.lock().unwrap().push(TokenRequestRecord {
        grant_type: req.grant_type.clone(),
        scope: req.scope.clone(),
        client_id: req.client_id.clone(),
        client_secret: req.client_secret.clone(),
        content_type: header_str(header::CONTENT_TYPE),
        accept: header_str(header::ACCEPT),
    });

    let config = &state.config;
    if let Some((status, body)) = &config.token_failure {
        let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST);
        return (status, body.clone()).into_response();
    }

    if req.grant_type != "client_credentials"
        || req.client_id != config.client_id
        || req.client_secret != config.client_secret
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_client" })),
        )
            .into_response();
    }

    let now = Utc::now();
    let claims = AccessTokenClaims {
        iss: "http://localhost".to_string(),
        nbf: now.timestamp(),
        iat: now.timestamp(),
        exp: (now + Duration::hours(1)).timestamp(),
        scope: vec![req.scope.clone()],
        client_id: req.client_id.clone(),
        sub: req.client_id.clone(),
        token_type: "ServiceAccount".to_string(),
        organization: config
            .include_organization_claim
            .then(|| config.organization.clone()),
    };
    let header = Header {
        kid: Some(KEY_ID.to_string()),
        alg: Algorithm::RS256,
        ..Default::default()
    };
    let access_token = encode(&header, &claims, &keys().encoding_key).expect("Failed to sign token");
    state.issued.lock().unwrap().insert(access_token.clone());

    let mut body = json!({
        "access_token": access_token,
        "expires_in": 3600,
        "token_type": "Bearer",
        "scope": req.scope
    });
    if config.include_encrypted_payload {
        let payload = json!({ "encryptionKey": STANDARD.encode(config.organization_key.0) });
        body["encrypted_payload"] = Value::String(
            MockKey::from_access_seed(&config.access_seed).encrypt(payload.to_string().as_bytes()),
        );
    }

    Json(body).into_response()
}

// ---------------------------------------------------------------------------
// Secrets endpoints
// ---------------------------------------------------------------------------

async fn list_secrets(
    State(state): State<Arc<MockState>>,
    Path(org): Path<String>,
    headers: HeaderMap,
) -> Response {
    state.list_requests.fetch_add(1, Ordering::SeqCst);
    if !state.is_authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if org != state.config.organization {
        return (StatusCode::NOT_FOUND, "Resource not found.").into_response();
    }

    let secrets: Vec<Value> = state
        .config
        .secrets
        .iter()
        .map(|s| {
            let key = state.key_for(s);
            json!({
                "id": s.id,
                "organizationId": state.config.organization,
                "key": key.encrypt(s.key.as_bytes()),
                "creationDate": "2024-01-01T00:00:00Z",
                "revisionDate": "2024-01-01T00:00:00Z"
            })
        })
        .collect();

    Json(json!({ "secrets": secrets, "projects": [] })).into_response()
}

async fn get_secret(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    state.fetched.lock().unwrap().push(id.clone());
    if !state.is_authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match state.config.secrets.iter().find(|s| s.id == id) {
        Some(s) => {
            let key = state.key_for(s);
            Json(json!({
                "id": s.id,
                "organizationId": state.config.organization,
                "key": key.encrypt(s.key.as_bytes()),
                "value": key.encrypt(s.value.as_bytes()),
                "note": key.encrypt(b""),
                "creationDate": "2024-01-01T00:00:00Z",
                "revisionDate": "2024-01-01T00:00:00Z",
                "projects": []
            }))
            .into_response()
        }
        None => (StatusCode::NOT_FOUND, "Resource not found.").into_response(),
    }
}
