//! Organization identity carried by the access token.
//!
//! The access token is a compact JWS whose payload includes an
//! `organization` claim.  By default the payload is read without checking the
//! signature: the token came straight from the identity provider over TLS.
//! Deployments that want the signature checked plug in a [`JwksVerifier`].
//!
//! The organization's symmetric key travels next to the token, encrypted
//! under a key only the credential holder can derive.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde_json::{Map, Value};
use tracing::info;

use crate::credential::ApiCredential;
use crate::crypto::{SymmetricKey, unlock_organization_key};
use crate::error::IdentityError;
use crate::oauth::AccessToken;

// ---------------------------------------------------------------------------
// OrganizationId
// ---------------------------------------------------------------------------

/// Tenant every secret lookup is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrganizationId(String);

impl OrganizationId {
    pub fn new(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrganizationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Signature verification
// ---------------------------------------------------------------------------

/// Signature check applied before claims are trusted.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<(), IdentityError>;
}

/// Accepts every token; trust rests on the TLS channel it arrived through.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustTransport;

impl TokenVerifier for TrustTransport {
    fn verify(&self, _token: &str) -> Result<(), IdentityError> {
        Ok(())
    }
}

/// Verifies tokens against the identity provider's published key set.
///
/// The key is chosen by the JOSE `kid`; `exp` is validated, the audience is
/// not.  Symmetric algorithms are refused outright.
pub struct JwksVerifier {
    keys: JwkSet,
}

impl JwksVerifier {
    pub fn new(keys: JwkSet) -> Self {
        Self { keys }
    }

    /// Download the key set from `jwks_url`.
    pub async fn fetch(http: &reqwest::Client, jwks_url: &str) -> Result<Self, IdentityError> {
        let keys: JwkSet = http
            .get(jwks_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(IdentityError::KeySet)?
            .json()
            .await
            .map_err(IdentityError::KeySet)?;

        info!(keys = keys.keys.len(), url = %jwks_url, "signing keys loaded");
        Ok(Self::new(keys))
    }
}

impl TokenVerifier for JwksVerifier {
    fn verify(&self, token: &str) -> Result<(), IdentityError> {
        let header =
            decode_header(token).map_err(|e| IdentityError::MalformedToken(e.to_string()))?;

        if matches!(
            header.alg,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(IdentityError::Verification(format!(
                "refusing symmetric algorithm {:?}",
                header.alg
            )));
        }

        let jwk = match header.kid.as_deref() {
            Some(kid) => self.keys.find(kid),
            None => self.keys.keys.first(),
        }
        .ok_or_else(|| {
            IdentityError::Verification(format!("no signing key for kid {:?}", header.kid))
        })?;

        let key =
            DecodingKey::from_jwk(jwk).map_err(|e| IdentityError::Verification(e.to_string()))?;
        let mut validation = Validation::new(header.alg);
        validation.validate_aud = false;

        decode::<Value>(token, &key, &validation)
            .map(|_| ())
            .map_err(|e| IdentityError::Verification(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Claim extraction
// ---------------------------------------------------------------------------

/// Recover the organization the access token was issued for.
pub fn extract_organization(
    token: &AccessToken,
    verifier: &dyn TokenVerifier,
) -> Result<OrganizationId, IdentityError> {
    organization_from_jws(token.as_str(), verifier)
}

fn organization_from_jws(
    token: &str,
    verifier: &dyn TokenVerifier,
) -> Result<OrganizationId, IdentityError> {
    verifier.verify(token)?;

    let claims = decode_claims(token)?;
    let organization = claims
        .get("organization")
        .and_then(Value::as_str)
        .ok_or(IdentityError::MissingClaim)?;

    info!(organization = %organization, "extracted organization id");
    Ok(OrganizationId::new(organization))
}

/// Unlock the key every secret of the organization is encrypted with.
pub fn organization_key(
    credential: &ApiCredential,
    token: &AccessToken,
) -> Result<SymmetricKey, IdentityError> {
    let payload = token
        .encrypted_payload()
        .ok_or(IdentityError::MissingPayload)?;
    let key = unlock_organization_key(&credential.access_key()?, payload)?;
    info!("organization key unlocked");
    Ok(key)
}

/// Decode the payload segment of a compact JWS as a JSON object.
fn decode_claims(token: &str) -> Result<Map<String, Value>, IdentityError> {
    let segments: Vec<&str> = token.split('.').collect();
    let &[_header, payload, _signature] = segments.as_slice() else {
        return Err(IdentityError::MalformedToken(format!(
            "expected 3 segments, found {}",
            segments.len()
        )));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| IdentityError::MalformedToken(format!("payload is not base64url: {e}")))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| IdentityError::MalformedToken(format!("payload is not a JSON object: {e}")))
}

#[cfg(test)]
mod tests {
    use mock_bws::MockBws;
    use serde_json::json;

    use super::*;
    use crate::error::CryptoError;
    use crate::oauth::IdentityClient;

    fn unsigned(payload: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","typ":"at+jwt"}"#);
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).unwrap());
        format!("{header}.{body}.c2lnbmF0dXJl")
    }

    async fn signed_token(mock: &mock_bws::MockBwsHandle) -> AccessToken {
        let identity = IdentityClient::new(
            reqwest::Client::new(),
            format!("{}/connect/token", mock.url()),
        );
        identity
            .exchange(&ApiCredential::new(mock.access_token()))
            .await
            .unwrap()
    }

    fn jwks_url(mock: &mock_bws::MockBwsHandle) -> String {
        format!("{}/.well-known/openid-configuration/jwks", mock.url())
    }

    // -- unverified ---------------------------------------------------------

    #[test]
    fn reads_organization_claim() {
        let token = unsigned(&json!({ "organization": "org-123" }));
        let org = organization_from_jws(&token, &TrustTransport).unwrap();
        assert_eq!(org, OrganizationId::new("org-123"));
    }

    #[test]
    fn ignores_other_claims() {
        let token = unsigned(&json!({
            "sub": "machine-account",
            "scope": ["api.secrets"],
            "organization": "f0c4b2a0-0000-4000-8000-000000000000",
        }));
        let org = organization_from_jws(&token, &TrustTransport).unwrap();
        assert_eq!(org.as_str(), "f0c4b2a0-0000-4000-8000-000000000000");
    }

    #[test]
    fn missing_claim() {
        let token = unsigned(&json!({ "sub": "someone" }));
        assert!(matches!(
            organization_from_jws(&token, &TrustTransport),
            Err(IdentityError::MissingClaim)
        ));
    }

    #[test]
    fn non_string_claim_counts_as_missing() {
        let token = unsigned(&json!({ "organization": 42 }));
        assert!(matches!(
            organization_from_jws(&token, &TrustTransport),
            Err(IdentityError::MissingClaim)
        ));
    }

    #[test]
    fn padded_payload_is_accepted() {
        let header = URL_SAFE_NO_PAD.encode("{}");
        let body = base64::engine::general_purpose::URL_SAFE.encode(r#"{"organization":"o"}"#);
        assert!(body.ends_with('='));
        let token = format!("{header}.{body}.sig");
        assert_eq!(
            organization_from_jws(&token, &TrustTransport).unwrap().as_str(),
            "o"
        );
    }

    #[test]
    fn malformed_tokens() {
        let not_object = URL_SAFE_NO_PAD.encode("[1,2,3]");
        let cases = [
            "no-dots".to_string(),
            "two.segments".to_string(),
            "a.b.c.d".to_string(),
            "hdr.!!!not-base64!!!.sig".to_string(),
            format!("hdr.{not_object}.sig"),
        ];
        for token in cases {
            assert!(
                matches!(
                    organization_from_jws(&token, &TrustTransport),
                    Err(IdentityError::MalformedToken(_))
                ),
                "{token:?} should be malformed"
            );
        }
    }

    // -- JWKS ---------------------------------------------------------------

    #[tokio::test]
    async fn verified_token_yields_organization() {
        let mock = MockBws::new("org-verified").spawn().await.unwrap();
        let token = signed_token(&mock).await;
        let verifier = JwksVerifier::fetch(&reqwest::Client::new(), &jwks_url(&mock))
            .await
            .unwrap();

        let org = extract_organization(&token, &verifier).unwrap();
        assert_eq!(org.as_str(), "org-verified");
    }

    #[tokio::test]
    async fn tampered_payload_is_rejected() {
        let mock = MockBws::new("org-real").spawn().await.unwrap();
        let token = signed_token(&mock).await;
        let verifier = JwksVerifier::fetch(&reqwest::Client::new(), &jwks_url(&mock))
            .await
            .unwrap();

        let mut parts: Vec<String> = token.as_str().split('.').map(String::from).collect();
        let forged = json!({
            "organization": "org-forged",
            "exp": chrono::Utc::now().timestamp() + 3600,
        });
        parts[1] = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        let forged_token = parts.join(".");

        assert!(matches!(
            organization_from_jws(&forged_token, &verifier),
            Err(IdentityError::Verification(_))
        ));
        // Without verification the forgery would have been accepted.
        assert_eq!(
            organization_from_jws(&forged_token, &TrustTransport)
                .unwrap()
                .as_str(),
            "org-forged"
        );
    }

    #[tokio::test]
    async fn verified_token_without_claim_is_missing_claim() {
        let mock = MockBws::new("org-x")
            .without_organization_claim()
            .spawn()
            .await
            .unwrap();
        let token = signed_token(&mock).await;
        let verifier = JwksVerifier::fetch(&reqwest::Client::new(), &jwks_url(&mock))
            .await
            .unwrap();

        assert!(matches!(
            extract_organization(&token, &verifier),
            Err(IdentityError::MissingClaim)
        ));
    }

    #[test]
    fn symmetric_algorithms_are_refused() {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(r#"{"organization":"o"}"#);
        let token = format!("{header}.{body}.c2ln");
        let verifier = JwksVerifier::new(JwkSet { keys: Vec::new() });

        assert!(matches!(
            verifier.verify(&token),
            Err(IdentityError::Verification(_))
        ));
    }

    #[test]
    fn unknown_kid_is_refused() {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","kid":"other"}"#);
        let body = URL_SAFE_NO_PAD.encode(r#"{"organization":"o"}"#);
        let token = format!("{header}.{body}.c2ln");
        let verifier = JwksVerifier::new(JwkSet { keys: Vec::new() });

        assert!(matches!(
            verifier.verify(&token),
            Err(IdentityError::Verification(_))
        ));
    }

    // -- organization key ---------------------------------------------------

    #[tokio::test]
    async fn unlocks_organization_key_with_credential() {
        let mock = MockBws::new("org-1")
            .with_secret("id-1", "A", "secret-a")
            .spawn()
            .await
            .unwrap();
        let token = signed_token(&mock).await;

        let key = organization_key(&ApiCredential::new(mock.access_token()), &token).unwrap();
        assert_eq!(key, SymmetricKey::from_base64(&mock.organization_key()).unwrap());
    }

    #[tokio::test]
    async fn foreign_credential_cannot_unlock() {
        let mock = MockBws::new("org-1").spawn().await.unwrap();
        let token = signed_token(&mock).await;
        let other = ApiCredential::new(MockBws::new("org-1").access_token());

        assert!(matches!(
            organization_key(&other, &token),
            Err(IdentityError::Unlock(CryptoError::MacMismatch))
        ));
    }

    #[tokio::test]
    async fn token_without_payload_is_missing_payload() {
        let mock = MockBws::new("org-1")
            .without_encrypted_payload()
            .spawn()
            .await
            .unwrap();
        let token = signed_token(&mock).await;

        assert!(matches!(
            organization_key(&ApiCredential::new(mock.access_token()), &token),
            Err(IdentityError::MissingPayload)
        ));
    }

    #[tokio::test]
    async fn unreachable_jwks_is_key_set_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result =
            JwksVerifier::fetch(&reqwest::Client::new(), &format!("http://{addr}/jwks")).await;
        assert!(matches!(result, Err(IdentityError::KeySet(_))));
    }
}
