//! PBKDF2-HMAC-SHA256 password hashing with constant-time verification.
//!
//! Stored form: `PBKDF2$<iterations>$<salt_b64>$<hash_b64>`. Anything without
//! the tag is a legacy plaintext credential.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::CredentialError;

pub const ALGORITHM_TAG: &str = "PBKDF2";
pub const ITERATIONS: u32 = 310_000;
pub const SALT_LEN: usize = 16;
pub const HASH_LEN: usize = 32;

/// Upper bound on an embedded iteration count; larger values are treated as
/// malformed rather than run.
const MAX_ITERATIONS: u32 = 10_000_000;

/// How a stored credential is encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialFormat<'a> {
    Pbkdf2Sha256 {
        iterations: u32,
        salt: Vec<u8>,
        hash: Vec<u8>,
    },
    LegacyPlaintext(&'a str),
}

impl<'a> CredentialFormat<'a> {
    /// `None` when the tag is present but the rest does not parse.
    pub fn parse(stored: &'a str) -> Option<Self> {
        let Some(rest) = stored
            .strip_prefix(ALGORITHM_TAG)
            .and_then(|r| r.strip_prefix('$'))
        else {
            return Some(CredentialFormat::LegacyPlaintext(stored));
        };
        let mut parts = rest.split('$');
        let iterations = parts.next()?.parse::<u32>().ok()?;
        let salt = BASE64.decode(parts.next()?).ok()?;
        let hash = BASE64.decode(parts.next()?).ok()?;
        if parts.next().is_some()
            || iterations == 0
            || iterations > MAX_ITERATIONS
            || salt.is_empty()
            || hash.is_empty()
        {
            return None;
        }
        Some(CredentialFormat::Pbkdf2Sha256 {
            iterations,
            salt,
            hash,
        })
    }

    pub fn encode(&self) -> String {
        match self {
            CredentialFormat::Pbkdf2Sha256 {
                iterations,
                salt,
                hash,
            } => format!(
                "{ALGORITHM_TAG}${iterations}${}${}",
                BASE64.encode(salt),
                BASE64.encode(hash)
            ),
            CredentialFormat::LegacyPlaintext(s) => s.to_string(),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, CredentialFormat::LegacyPlaintext(_))
    }
}

fn derive(password: &str, salt: &[u8], iterations: u32, len: usize) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(vec![0u8; len]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

pub fn hash_password(password: &str) -> Result<String, CredentialError> {
    hash_with_iterations(password, ITERATIONS)
}

pub(crate) fn hash_with_iterations(
    password: &str,
    iterations: u32,
) -> Result<String, CredentialError> {
    if password.is_empty() {
        return Err(CredentialError::EmptyPassword);
    }
    let mut salt = vec![0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let hash = derive(password, &salt, iterations, HASH_LEN);
    Ok(CredentialFormat::Pbkdf2Sha256 {
        iterations,
        salt,
        hash: hash.to_vec(),
    }
    .encode())
}

/// Never fails: malformed stored values verify as `false`.
pub fn verify_password(password: &str, stored: &str) -> bool {
    match CredentialFormat::parse(stored) {
        Some(CredentialFormat::Pbkdf2Sha256 {
            iterations,
            salt,
            hash,
        }) => {
            let candidate = derive(password, &salt, iterations, hash.len());
            candidate.as_slice().ct_eq(&hash).into()
        }
        Some(CredentialFormat::LegacyPlaintext(plain)) => {
            password.as_bytes().ct_eq(plain.as_bytes()).into()
        }
        None => false,
    }
}

/// True for legacy plaintext and for hashes below the current work factor.
pub fn needs_rehash(stored: &str) -> bool {
    match CredentialFormat::parse(stored) {
        Some(CredentialFormat::Pbkdf2Sha256 { iterations, .. }) => iterations < ITERATIONS,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: u32 = 1_000;

    #[test]
    fn hash_round_trip_with_fast_iterations() {
        let stored = hash_with_iterations("Bodega#2024", FAST).unwrap();
        assert!(stored.starts_with("PBKDF2$1000$"));
        assert!(verify_password("Bodega#2024", &stored));
        assert!(!verify_password("bodega#2024", &stored));
    }

    #[test]
    fn salts_differ() {
        let a = hash_with_iterations("same", FAST).unwrap();
        let b = hash_with_iterations("same", FAST).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_password_is_rejected() {
        assert!(matches!(
            hash_password(""),
            Err(CredentialError::EmptyPassword)
        ));
    }

    #[test]
    fn legacy_plaintext_compares_exactly() {
        assert!(verify_password("admin123", "admin123"));
        assert!(!verify_password("admin12", "admin123"));
        assert!(CredentialFormat::parse("admin123").unwrap().is_legacy());
    }

    #[test]
    fn malformed_hashes_verify_false() {
        for stored in [
            "PBKDF2$",
            "PBKDF2$abc$AAAA$AAAA",
            "PBKDF2$0$AAAA$AAAA",
            "PBKDF2$1000$!!!$AAAA",
            "PBKDF2$1000$AAAA",
            "PBKDF2$1000$AAAA$AAAA$extra",
            "PBKDF2$4000000000$AAAA$AAAA",
        ] {
            assert!(!verify_password("anything", stored), "{stored}");
        }
    }

    #[test]
    fn rehash_policy() {
        assert!(needs_rehash("plain"));
        assert!(needs_rehash(&hash_with_iterations("x", FAST).unwrap()));
    }

    #[test]
    fn default_work_factor_is_encoded() {
        let stored = hash_password("Inventario!9").unwrap();
        assert!(stored.starts_with("PBKDF2$310000$"));
        assert!(!needs_rehash(&stored));
    }
}
