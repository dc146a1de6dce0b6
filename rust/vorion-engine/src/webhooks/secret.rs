//! Authenticated-encryption envelope for secrets at rest
//!
//! Webhook secrets (and, when enabled, intent context) are stored as
//! AES-256-GCM envelopes: `hex(nonce || ciphertext)`. Plaintext exists only
//! transiently in memory around an attempt.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;

use crate::error::{EngineError, EngineResult};

const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher for at-rest secrets
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    /// Build from raw key bytes
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Build from a 64-char hex key
    pub fn from_hex(hex_key: &str) -> EngineResult<Self> {
        let bytes = hex::decode(hex_key)
            .map_err(|e| EngineError::Validation(format!("encryption key is not hex: {}", e)))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| EngineError::Validation("encryption key must be 32 bytes".to_string()))?;
        Ok(Self::new(&key))
    }

    /// Generate a random key (used when no key is configured; envelopes then
    /// only survive the process lifetime)
    pub fn ephemeral() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(&key)
    }

    /// Encrypt to `hex(nonce || ciphertext)`
    pub fn encrypt(&self, plaintext: &str) -> EngineResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| EngineError::Internal("secret encryption failed".to_string()))?;
        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);
        Ok(hex::encode(envelope))
    }

    /// Decrypt an envelope produced by [`encrypt`](Self::encrypt)
    pub fn decrypt(&self, envelope: &str) -> EngineResult<String> {
        let bytes = hex::decode(envelope)
            .map_err(|_| EngineError::Internal("malformed secret envelope".to_string()))?;
        if bytes.len() <= NONCE_LEN {
            return Err(EngineError::Internal(
                "malformed secret envelope".to_string(),
            ));
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| EngineError::Internal("secret decryption failed".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|_| EngineError::Internal("secret is not valid UTF-8".to_string()))
    }
}
