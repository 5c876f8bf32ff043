//! Master-password verifier: a salted, labeled tag that answers "is this
//! password right?" without storing anything an attacker could decrypt with.

use serde::{Deserialize, Serialize};

use crate::crypto::{self, KeyMaterial, PBKDF2_ITERATIONS, SALT_LEN, ct_eq, derive_key, keyed_tag};
use crate::error::{Result, VaultError};

/// Domain-separation label for the verifier tag. The tag is
/// `HMAC-SHA-256(derived_key, label)`, so verifier bytes are a password check
/// and never double as an encryption key.
const VERIFIER_LABEL: &[u8] = b"keyvault.verifier.v1";

/// Persisted verifier record: salt, iteration count, and tag.
///
/// The iteration count is stored explicitly so a future version can raise the
/// build-time constant without invalidating existing vaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordVerifier {
    #[serde(with = "crate::hex::serde_hex")]
    salt: Vec<u8>,
    iterations: u32,
    #[serde(with = "crate::hex::serde_hex")]
    tag: Vec<u8>,
}

impl PasswordVerifier {
    /// Installs a verifier for `password` with a fresh random salt.
    ///
    /// Returns the verifier together with the derived wrapping key, so
    /// initialization does not pay the KDF twice.
    ///
    /// # Errors
    /// Propagates KDF parameter errors.
    pub fn install(password: &str) -> Result<(Self, KeyMaterial)> {
        let salt = crypto::random_bytes::<SALT_LEN>().to_vec();
        let key = derive_key(password, &salt, PBKDF2_ITERATIONS)?;
        let tag = keyed_tag(&key, VERIFIER_LABEL);
        let verifier = Self {
            salt,
            iterations: PBKDF2_ITERATIONS,
            tag,
        };
        Ok((verifier, key))
    }

    /// Re-derives from `password` and compares tags in constant time.
    ///
    /// Returns the wrapping key when the password matches, `None` otherwise.
    /// This is the single KDF invocation of an unlock; callers must not
    /// derive again.
    ///
    /// # Errors
    /// Propagates KDF parameter errors (a persisted iteration count of zero
    /// is corrupt data, not a wrong password).
    pub fn check(&self, password: &str) -> Result<Option<KeyMaterial>> {
        let key = derive_key(password, &self.salt, self.iterations)?;
        if ct_eq(&keyed_tag(&key, VERIFIER_LABEL), &self.tag) {
            Ok(Some(key))
        } else {
            Ok(None)
        }
    }

    /// Constant-time check of an already-derived key, e.g. one resumed from a
    /// file-backed session token.
    #[must_use]
    pub fn matches_key(&self, key: &KeyMaterial) -> bool {
        ct_eq(&keyed_tag(key, VERIFIER_LABEL), &self.tag)
    }

    /// The KDF salt; entry envelopes sealed by the session carry this salt so
    /// the cached key opens them without re-derivation.
    ///
    /// # Errors
    /// Returns [`VaultError::Corrupt`] when the persisted salt has the wrong
    /// length.
    pub fn salt_array(&self) -> Result<[u8; SALT_LEN]> {
        self.salt
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::Corrupt("verifier salt has wrong length".into()))
    }

    #[must_use]
    pub const fn iterations(&self) -> u32 {
        self.iterations
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_install_and_check_round_trip() {
        let (verifier, key) = PasswordVerifier::install("master-password").unwrap();
        let checked = verifier.check("master-password").unwrap().expect("password matches");
        assert_eq!(key.0, checked.0);
        assert!(verifier.check("wrong-password").unwrap().is_none());
    }

    #[test]
    fn test_fresh_salt_per_install() {
        let (v1, k1) = PasswordVerifier::install("same-password").unwrap();
        let (v2, k2) = PasswordVerifier::install("same-password").unwrap();
        assert_ne!(v1.salt, v2.salt);
        // Different salt, different derived key, different tag.
        assert_ne!(k1.0, k2.0);
        assert_ne!(v1.tag, v2.tag);
    }

    #[test]
    fn test_matches_key() {
        let (verifier, key) = PasswordVerifier::install("pw").unwrap();
        assert!(verifier.matches_key(&key));
        assert!(!verifier.matches_key(&KeyMaterial::random()));
    }

    #[test]
    fn test_serde_round_trip_is_hex() {
        let (verifier, _) = PasswordVerifier::install("pw").unwrap();
        let json = serde_json::to_string(&verifier).unwrap();
        assert!(json.contains("\"iterations\":100000"));
        // Binary fields are hex strings, not byte arrays.
        assert!(!json.contains('['));
        let back: PasswordVerifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back.salt, verifier.salt);
        assert_eq!(back.tag, verifier.tag);
        assert!(back.check("pw").unwrap().is_some());
    }

    #[test]
    fn test_salt_array_length_guard() {
        let (mut verifier, _) = PasswordVerifier::install("pw").unwrap();
        verifier.salt.truncate(4);
        assert!(matches!(verifier.salt_array().unwrap_err(), VaultError::Corrupt(_)));
    }
}
