//! Token decryption
//!
//! A token is `base64(json({"iv": base64, "value": base64}))` where `value`
//! is the CBC ciphertext of a JSON connection descriptor.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use tg_core::config::{CipherKind, CryptConfig};
use tg_core::TokenError;

/// Decrypted token payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Connection request, absent when the token only carries metadata
    #[serde(default)]
    pub connection: Option<ConnectionInfo>,
    /// Any other top-level fields (issue/expiry stamps and the like)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Connection request carried by a token
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Connection type (`rdp`, `vnc`, `ssh`, `telnet`, ...)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Settings forwarded to the backend daemon
    #[serde(default)]
    pub settings: Map<String, Value>,

    /// Session id to attach to instead of opening a new session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<String>,

    /// Backend daemon host override
    #[serde(default, alias = "guacdHost", skip_serializing_if = "Option::is_none")]
    pub backend_host: Option<String>,

    /// Backend daemon port override
    #[serde(
        default,
        alias = "guacdPort",
        deserialize_with = "lenient_port",
        skip_serializing_if = "Option::is_none"
    )]
    pub backend_port: Option<u16>,

    /// Unrecognised fields, kept for the registry record
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConnectionInfo {
    /// Join target, ignoring empty strings
    pub fn join_target(&self) -> Option<&str> {
        self.join.as_deref().filter(|s| !s.is_empty())
    }
}

/// Accept ports given either as numbers or numeric strings; 0 means unset
fn lenient_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    let port = match Option::<Port>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(Port::Number(port)) => port,
        Some(Port::Text(text)) if text.trim().is_empty() => return Ok(None),
        Some(Port::Text(text)) => text.trim().parse().map_err(D::Error::custom)?,
    };
    Ok((port != 0).then_some(port))
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    iv: String,
    value: String,
}

/// Decrypts tokens with the cipher and key configured at startup
#[derive(Clone)]
pub struct TokenCodec {
    cipher: CipherKind,
    key: Option<Vec<u8>>,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("cipher", &self.cipher)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn decryption(reason: impl Into<String>) -> TokenError {
    TokenError::Decryption(reason.into())
}

impl TokenCodec {
    /// Create a codec from the crypt configuration
    pub fn new(config: &CryptConfig) -> Self {
        Self {
            cipher: config.cipher,
            key: config.key.as_ref().map(|k| k.as_bytes().to_vec()),
        }
    }

    fn key(&self) -> Result<&[u8], TokenError> {
        self.key
            .as_deref()
            .ok_or_else(|| decryption("encryption key not configured"))
    }

    /// Decrypt a raw token into a connection descriptor.
    ///
    /// Fails without side effects if any layer (envelope, ciphertext,
    /// plaintext JSON) is malformed.
    pub fn decrypt(&self, raw_token: &str) -> Result<ConnectionDescriptor, TokenError> {
        let key = self.key()?;

        let envelope = STANDARD
            .decode(raw_token.trim())
            .map_err(|e| decryption(format!("token is not valid base64: {}", e)))?;
        let envelope: Envelope = serde_json::from_slice(&envelope)
            .map_err(|e| decryption(format!("token envelope is not valid JSON: {}", e)))?;

        let iv = STANDARD
            .decode(&envelope.iv)
            .map_err(|e| decryption(format!("iv is not valid base64: {}", e)))?;
        let ciphertext = STANDARD
            .decode(&envelope.value)
            .map_err(|e| decryption(format!("value is not valid base64: {}", e)))?;

        let invalid_length = |_| decryption("key or iv has the wrong length for the cipher");
        let plaintext = match self.cipher {
            CipherKind::Aes128Cbc => cbc::Decryptor::<aes::Aes128>::new_from_slices(key, &iv)
                .map_err(invalid_length)?
                .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext),
            CipherKind::Aes192Cbc => cbc::Decryptor::<aes::Aes192>::new_from_slices(key, &iv)
                .map_err(invalid_length)?
                .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext),
            CipherKind::Aes256Cbc => cbc::Decryptor::<aes::Aes256>::new_from_slices(key, &iv)
                .map_err(invalid_length)?
                .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext),
        }
        .map_err(|_| decryption("ciphertext does not decrypt under the configured key"))?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| decryption(format!("decrypted payload is not valid JSON: {}", e)))
    }

    /// Seal a JSON payload into a token using a random IV.
    ///
    /// This is the inverse of [`TokenCodec::decrypt`]; token issuers and tests
    /// use it to mint tokens the gateway accepts.
    pub fn seal(&self, payload: &Value) -> Result<String, TokenError> {
        let key = self.key()?;
        let iv: [u8; 16] = rand::random();
        let plaintext = serde_json::to_vec(payload)
            .map_err(|e| decryption(format!("payload is not serializable: {}", e)))?;

        let invalid_length = |_| decryption("key has the wrong length for the cipher");
        let ciphertext = match self.cipher {
            CipherKind::Aes128Cbc => cbc::Encryptor::<aes::Aes128>::new_from_slices(key, &iv)
                .map_err(invalid_length)?
                .encrypt_padded_vec_mut::<Pkcs7>(&plaintext),
            CipherKind::Aes192Cbc => cbc::Encryptor::<aes::Aes192>::new_from_slices(key, &iv)
                .map_err(invalid_length)?
                .encrypt_padded_vec_mut::<Pkcs7>(&plaintext),
            CipherKind::Aes256Cbc => cbc::Encryptor::<aes::Aes256>::new_from_slices(key, &iv)
                .map_err(invalid_length)?
                .encrypt_padded_vec_mut::<Pkcs7>(&plaintext),
        };

        let envelope = Envelope {
            iv: STANDARD.encode(iv),
            value: STANDARD.encode(ciphertext),
        };
        let envelope = serde_json::to_vec(&envelope)
            .map_err(|e| decryption(format!("envelope is not serializable: {}", e)))?;
        Ok(STANDARD.encode(envelope))
    }
}
