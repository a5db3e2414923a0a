//! AES-256-GCM encryption of text field values.
//!
//! Wire form: `base64(nonce[12] || ciphertext || tag[16])`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use tracing::error;
use zeroize::Zeroizing;

use crate::key_vault::{CryptoError, EncryptionKey};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Stateless apart from the shared key; safe to clone across threads.
#[derive(Clone, Debug)]
pub struct CipherService {
    key: Arc<EncryptionKey>,
}

impl CipherService {
    pub fn new(key: Arc<EncryptionKey>) -> Self {
        Self { key }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_bytes()))
    }

    /// Encrypt `plaintext`. The empty string passes through unchanged.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Optional-field variant: `None` stays `None`.
    pub fn encrypt_opt(&self, plaintext: Option<&str>) -> Result<Option<String>, CryptoError> {
        plaintext.map(|p| self.encrypt(p)).transpose()
    }

    pub fn decrypt(&self, ciphertext_b64: &str) -> Result<String, CryptoError> {
        if ciphertext_b64.is_empty() {
            return Ok(String::new());
        }
        let data = BASE64
            .decode(ciphertext_b64.trim())
            .map_err(|e| CryptoError::MalformedInput(format!("invalid base64: {e}")))?;
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::MalformedInput(format!(
                "payload too short: {} bytes",
                data.len()
            )));
        }
        let (nonce, body) = data.split_at(NONCE_LEN);
        let plaintext = Zeroizing::new(
            self.cipher()
                .decrypt(Nonce::from_slice(nonce), body)
                .map_err(|_| CryptoError::AuthenticationFailed)?,
        );
        String::from_utf8(plaintext.to_vec())
            .map_err(|_| CryptoError::MalformedInput("plaintext is not UTF-8".into()))
    }

    pub fn decrypt_opt(&self, ciphertext_b64: Option<&str>) -> Result<Option<String>, CryptoError> {
        ciphertext_b64.map(|c| self.decrypt(c)).transpose()
    }

    /// Heuristic for legacy data: valid base64 longer than a nonce.
    /// Never use it for a security decision.
    pub fn looks_encrypted(text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        BASE64
            .decode(text.trim())
            .map(|d| d.len() > NONCE_LEN)
            .unwrap_or(false)
    }

    /// Round-trip a probe value through encrypt/decrypt.
    pub fn self_test(&self) -> Result<(), CryptoError> {
        const PROBE: &str = "inventario-self-test";
        let sealed = self.encrypt(PROBE)?;
        let opened = self.decrypt(&sealed)?;
        if opened != PROBE {
            error!("cipher self-test returned a different value");
            return Err(CryptoError::AuthenticationFailed);
        }
        Ok(())
    }
}
