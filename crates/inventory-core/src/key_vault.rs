//! Persistent storage of the 256-bit field-encryption key.
//!
//! - Unix: base64 key file, mode 0600, directory 0700
//! - Windows: base64 key file with hidden + system attributes
//!
//! Every buffer holding decoded key bytes is a `Zeroizing` value, so it is
//! wiped on success, on error and on early return alike.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::ErrorClass;
use crate::fsutil;

pub const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key file {path} is corrupt: {reason}")]
    KeyCorrupt { path: PathBuf, reason: String },

    #[error("key file {path}: {source}")]
    KeyIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("authentication tag check failed (tampered data or wrong key)")]
    AuthenticationFailed,

    #[error("malformed ciphertext: {0}")]
    MalformedInput(String),

    #[error("encryption failed")]
    EncryptFailed,
}

impl CryptoError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CryptoError::KeyIo { .. } => ErrorClass::Io,
            _ => ErrorClass::Crypto,
        }
    }
}

/// Raw AES-256 key. Wiped on drop; `Debug` never prints the bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_LEN],
}

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Copy exactly `KEY_LEN` bytes; any other length is `None`.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() != KEY_LEN {
            return None;
        }
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(slice);
        Some(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Owns the key for the process lifetime. Construct once, share the `Arc`.
pub struct KeyVault {
    key_path: PathBuf,
    key: Arc<EncryptionKey>,
}

impl KeyVault {
    /// Load the key at `key_path`, or generate and persist a new one if absent.
    pub fn load_or_create(key_path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let key_path = key_path.as_ref().to_path_buf();
        let key = if key_path.exists() {
            Self::load_key(&key_path)?
        } else {
            let key = EncryptionKey::generate();
            Self::save_key(&key_path, &key)?;
            info!(path = %key_path.display(), "generated new field-encryption key");
            key
        };
        Ok(Self {
            key_path,
            key: Arc::new(key),
        })
    }

    pub fn key(&self) -> Arc<EncryptionKey> {
        Arc::clone(&self.key)
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Directory holding the key material; archived verbatim by backups.
    pub fn key_dir(&self) -> Option<&Path> {
        self.key_path.parent()
    }

    /// Decode the key file at `path` without adopting it. Used to vet key
    /// material before it replaces the live key.
    pub fn check_key_file(path: &Path) -> Result<(), CryptoError> {
        Self::load_key(path).map(drop)
    }

    fn load_key(path: &Path) -> Result<EncryptionKey, CryptoError> {
        let encoded = Zeroizing::new(fs::read_to_string(path).map_err(|source| {
            CryptoError::KeyIo {
                path: path.to_path_buf(),
                source,
            }
        })?);
        let decoded = Zeroizing::new(BASE64.decode(encoded.trim()).map_err(|e| {
            CryptoError::KeyCorrupt {
                path: path.to_path_buf(),
                reason: format!("invalid base64: {e}"),
            }
        })?);
        EncryptionKey::from_slice(&decoded).ok_or_else(|| CryptoError::KeyCorrupt {
            path: path.to_path_buf(),
            reason: format!("expected {KEY_LEN} bytes, got {}", decoded.len()),
        })
    }

    fn save_key(path: &Path, key: &EncryptionKey) -> Result<(), CryptoError> {
        let io_err = |source| CryptoError::KeyIo {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
            fsutil::restrict_to_owner(dir);
        }
        let encoded = Zeroizing::new(BASE64.encode(key.as_bytes()));
        fsutil::write_atomic(path, encoded.as_bytes()).map_err(io_err)?;
        fsutil::restrict_to_owner(path);
        fsutil::set_hidden(path);
        if !path.exists() {
            warn!(path = %path.display(), "key file vanished after write");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn key_creation_and_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("security/encryption.key");

        let first = KeyVault::load_or_create(&path).unwrap();
        assert!(path.exists());
        let second = KeyVault::load_or_create(&path).unwrap();
        assert_eq!(first.key().as_bytes(), second.key().as_bytes());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("security/encryption.key");
        KeyVault::load_or_create(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn wrong_length_is_key_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("encryption.key");
        fs::write(&path, BASE64.encode([1u8; 16])).unwrap();
        match KeyVault::load_or_create(&path) {
            Err(CryptoError::KeyCorrupt { reason, .. }) => assert!(reason.contains("16")),
            other => panic!("expected KeyCorrupt, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn garbage_is_key_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("encryption.key");
        fs::write(&path, "not base64 at all!!").unwrap();
        let err = KeyVault::load_or_create(&path).err().unwrap();
        assert!(matches!(err, CryptoError::KeyCorrupt { .. }));
        assert_eq!(err.class(), ErrorClass::Crypto);
    }

    #[test]
    fn check_key_file_never_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("encryption.key");
        assert!(matches!(
            KeyVault::check_key_file(&path),
            Err(CryptoError::KeyIo { .. })
        ));
        assert!(!path.exists());

        fs::write(&path, BASE64.encode([9u8; 31])).unwrap();
        assert!(matches!(
            KeyVault::check_key_file(&path),
            Err(CryptoError::KeyCorrupt { .. })
        ));
        fs::write(&path, BASE64.encode([9u8; KEY_LEN])).unwrap();
        KeyVault::check_key_file(&path).unwrap();
    }

    #[test]
    fn debug_output_is_redacted() {
        let key = EncryptionKey::generate();
        assert_eq!(format!("{key:?}"), "EncryptionKey(<redacted>)");
    }
}
