//! Bitwarden symmetric encryption.
//!
//! Secrets Manager returns every secret field as an encrypted string of
//! type 2:
//!
//! ```text
//! 2.<iv>|<ciphertext>|<mac>
//! ```
//!
//! Each part is standard base64.  The cipher is AES-256-CBC with PKCS#7
//! padding; the MAC is HMAC-SHA256 over `iv || ciphertext`.  A
//! [`SymmetricKey`] is 64 bytes: 32 for encryption followed by 32 for the MAC.
//!
//! The organization key arrives encrypted in the token response.  It is
//! unlocked with a key derived from the 16-byte secret at the end of the
//! access token.

use aes::Aes256;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const KEY_LEN: usize = 32;

/// Length of the secret embedded in an access token.
pub const ACCESS_SEED_LEN: usize = 16;

/// AES-256 encryption key plus HMAC-SHA256 key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    enc: [u8; KEY_LEN],
    mac: [u8; KEY_LEN],
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

impl SymmetricKey {
    /// Split 64 bytes of key material into encryption and MAC halves.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 2 * KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} bytes, found {}",
                2 * KEY_LEN,
                bytes.len()
            )));
        }
        let mut key = Self {
            enc: [0; KEY_LEN],
            mac: [0; KEY_LEN],
        };
        key.enc.copy_from_slice(&bytes[..KEY_LEN]);
        key.mac.copy_from_slice(&bytes[KEY_LEN..]);
        Ok(key)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?,
        );
        Self::from_bytes(&bytes)
    }

    /// Key derived from an access token secret.
    ///
    /// HMAC-SHA256 keyed with `bitwarden-accesstoken` over the seed gives the
    /// pseudo-random key; HKDF-Expand with `sm-access-token` stretches it to
    /// 64 bytes.
    pub fn from_access_seed(seed: &[u8; ACCESS_SEED_LEN]) -> Result<Self, CryptoError> {
        derive_shareable(seed, "accesstoken", "sm-access-token")
    }

    /// Open a type 2 encrypted string.
    ///
    /// The MAC is checked before anything is decrypted.
    pub fn decrypt(&self, enc_string: &str) -> Result<Vec<u8>, CryptoError> {
        let parsed = EncString::parse(enc_string)?;

        let mut mac = HmacSha256::new_from_slice(&self.mac)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        mac.update(&parsed.iv);
        mac.update(&parsed.data);
        mac.verify_slice(&parsed.mac)
            .map_err(|_| CryptoError::MacMismatch)?;

        Aes256CbcDec::new_from_slices(&self.enc, &parsed.iv)
            .map_err(|_| {
                CryptoError::Malformed(format!("iv must be 16 bytes, found {}", parsed.iv.len()))
            })?
            .decrypt_padded_vec_mut::<Pkcs7>(&parsed.data)
            .map_err(|_| CryptoError::Padding)
    }

    pub fn decrypt_to_string(&self, enc_string: &str) -> Result<String, CryptoError> {
        String::from_utf8(self.decrypt(enc_string)?).map_err(|_| CryptoError::Utf8)
    }
}

fn derive_shareable(
    seed: &[u8],
    name: &str,
    info: &str,
) -> Result<SymmetricKey, CryptoError> {
    let mut mac = HmacSha256::new_from_slice(format!("bitwarden-{name}").as_bytes())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(seed);

    let mut prk = Zeroizing::new([0u8; KEY_LEN]);
    prk.copy_from_slice(&mac.finalize().into_bytes());

    let hkdf = Hkdf::<Sha256>::from_prk(prk.as_slice())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let mut okm = Zeroizing::new([0u8; 2 * KEY_LEN]);
    hkdf.expand(info.as_bytes(), okm.as_mut_slice())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    SymmetricKey::from_bytes(okm.as_slice())
}

struct EncString {
    iv: Vec<u8>,
    data: Vec<u8>,
    mac: Vec<u8>,
}

impl EncString {
    fn parse(s: &str) -> Result<Self, CryptoError> {
        let (kind, rest) = s
            .split_once('.')
            .ok_or_else(|| CryptoError::Malformed("missing type prefix".into()))?;
        if kind != "2" {
            return Err(CryptoError::UnsupportedType(kind.to_string()));
        }

        let parts: Vec<&str> = rest.split('|').collect();
        let &[iv, data, mac] = parts.as_slice() else {
            return Err(CryptoError::Malformed(format!(
                "expected 3 parts, found {}",
                parts.len()
            )));
        };

        let decode = |part: &str, what: &str| {
            STANDARD
                .decode(part)
                .map_err(|e| CryptoError::Malformed(format!("{what} is not base64: {e}")))
        };
        Ok(Self {
            iv: decode(iv, "iv")?,
            data: decode(data, "ciphertext")?,
            mac: decode(mac, "mac")?,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPayload {
    encryption_key: String,
}

/// Recover the organization key from the token response's
/// `encrypted_payload`, a JSON document `{"encryptionKey": "<base64>"}`.
pub fn unlock_organization_key(
    access_key: &SymmetricKey,
    encrypted_payload: &str,
) -> Result<SymmetricKey, CryptoError> {
    let plaintext = Zeroizing::new(access_key.decrypt(encrypted_payload)?);
    let payload: TokenPayload =
        serde_json::from_slice(&plaintext).map_err(|e| CryptoError::Payload(e.to_string()))?;
    SymmetricKey::from_base64(&payload.encryption_key)
}
