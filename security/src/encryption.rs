//! AES-256-GCM payload encryption.
//!
//! The wire form is an [`EncryptedEnvelope`]: base64 iv, ciphertext and
//! tag plus the key id, serialized as JSON and carried as the message
//! payload. Key material lives in a registry keyed by id so keys can be
//! rotated by adding a new id; issuing and rotating the keys themselves
//! is the host's concern.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use courier_core::error::BrokerError;

/// GCM tag length in bytes.
const TAG_LEN: usize = 16;

/// Nonce (iv) length for AES-GCM, 96 bits.
const NONCE_LEN: usize = 12;

/// The encrypted wire payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    /// Base64 nonce.
    pub iv: String,
    /// Base64 ciphertext (without the tag).
    pub ciphertext: String,
    /// Base64 authentication tag.
    pub tag: String,
    /// Id of the key that encrypted this payload.
    pub key_id: String,
}

/// Encrypts and decrypts payloads with a registry of named keys.
pub struct MessageEncryptor {
    ciphers: HashMap<String, Aes256Gcm>,
    default_key_id: String,
}

impl MessageEncryptor {
    /// Create an encryptor whose publishes use `default_key_id`.
    #[must_use]
    pub fn new(default_key_id: impl Into<String>) -> Self {
        Self {
            ciphers: HashMap::new(),
            default_key_id: default_key_id.into(),
        }
    }

    /// Register 32-byte key material under `key_id`.
    #[must_use]
    pub fn with_key(mut self, key_id: impl Into<String>, key: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        self.ciphers.insert(key_id.into(), Aes256Gcm::new(key));
        self
    }

    /// The key id used when a publish does not name one.
    #[must_use]
    pub fn default_key_id(&self) -> &str {
        &self.default_key_id
    }

    /// Encrypt `plain` under `key_id` (or the default key).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidArgument`] for an unknown key id and
    /// [`BrokerError::Serialization`] if encryption fails.
    pub fn encrypt(
        &self,
        plain: &[u8],
        key_id: Option<&str>,
    ) -> Result<EncryptedEnvelope, BrokerError> {
        let key_id = key_id.unwrap_or(&self.default_key_id);
        let cipher = self.cipher_for(key_id)?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plain)
            .map_err(|e| BrokerError::Serialization(format!("encryption failed: {e}")))?;

        // aes-gcm appends the tag to the ciphertext; the envelope carries
        // them separately.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        Ok(EncryptedEnvelope {
            iv: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
            tag: BASE64.encode(tag),
            key_id: key_id.to_string(),
        })
    }

    /// Decrypt an envelope with the key its `key_id` names.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidArgument`] for an unknown key id and
    /// [`BrokerError::Authentication`] when the envelope is malformed or
    /// fails integrity verification.
    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, BrokerError> {
        let cipher = self.cipher_for(&envelope.key_id)?;

        let iv = BASE64
            .decode(&envelope.iv)
            .map_err(|e| BrokerError::Authentication(format!("invalid iv: {e}")))?;
        if iv.len() != NONCE_LEN {
            return Err(BrokerError::Authentication(format!(
                "iv must be {NONCE_LEN} bytes, got {}",
                iv.len()
            )));
        }
        let mut sealed = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|e| BrokerError::Authentication(format!("invalid ciphertext: {e}")))?;
        let mut tag = BASE64
            .decode(&envelope.tag)
            .map_err(|e| BrokerError::Authentication(format!("invalid tag: {e}")))?;
        sealed.append(&mut tag);

        let nonce = Nonce::clone_from_slice(&iv);
        cipher
            .decrypt(&nonce, sealed.as_slice())
            .map_err(|_| BrokerError::Authentication("payload failed integrity check".to_string()))
    }

    fn cipher_for(&self, key_id: &str) -> Result<&Aes256Gcm, BrokerError> {
        self.ciphers.get(key_id).ok_or_else(|| {
            BrokerError::InvalidArgument(format!("no encryption key registered for id '{key_id}'"))
        })
    }
}
