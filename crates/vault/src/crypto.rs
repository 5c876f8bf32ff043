//! Cryptographic primitives: PBKDF2-HMAC-SHA-256 key derivation,
//! AES-256-GCM authenticated encryption, CSPRNG material, constant-time
//! comparison, and zeroizing key storage.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::{Result, VaultError};

pub type HmacSha256 = Hmac<Sha256>;

/// Derived key length (AES-256).
pub const KEY_LEN: usize = 32;
/// KDF salt length.
pub const SALT_LEN: usize = 16;
/// AES-GCM nonce length.
pub const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length.
pub const TAG_LEN: usize = 16;

/// PBKDF2 iteration count for envelope version 1.
///
/// Build-time constant: raising it requires a new envelope version so that
/// existing envelopes keep decrypting with the parameters they were sealed
/// under. It must never be lowered.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// A 256-bit key that is wiped from memory when dropped.
#[derive(Clone)]
pub struct KeyMaterial(pub [u8; KEY_LEN]);

impl KeyMaterial {
    /// Generates a fresh key from the system CSPRNG.
    ///
    /// # Panics
    /// Panics if the system CSPRNG is unavailable; there is no meaningful way
    /// to continue operating a vault without entropy.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn random() -> Self {
        let mut k = [0u8; KEY_LEN];
        getrandom::fill(&mut k).expect("failed to get random bytes");
        Self(k)
    }

    /// Builds key material from raw bytes, e.g. a file-backed session token.
    ///
    /// # Errors
    /// Returns [`VaultError::Corrupt`] when `bytes` is not exactly
    /// [`KEY_LEN`] long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let k: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| VaultError::Corrupt("session key has wrong length".into()))?;
        Ok(Self(k))
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key bytes must never reach logs.
        f.write_str("KeyMaterial(..)")
    }
}

/// Fills a fixed-size buffer from the system CSPRNG.
///
/// # Panics
/// Panics if the system CSPRNG is unavailable.
#[allow(clippy::expect_used)]
#[must_use]
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    getrandom::fill(&mut buf).expect("failed to get random bytes");
    buf
}

/// Derives a 256-bit key from a password and salt via PBKDF2-HMAC-SHA-256.
///
/// Deterministic for a fixed `(password, salt, iterations)` triple; this is
/// what lets the verifier and the session manager re-derive the same wrapping
/// key on every unlock.
///
/// # Errors
/// Returns [`VaultError::KdfOverflow`] when `iterations` is zero.
pub fn derive_key(password: &str, salt: &[u8], iterations: u32) -> Result<KeyMaterial> {
    if iterations == 0 {
        return Err(VaultError::KdfOverflow("iteration count must be positive"));
    }
    let mut out = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    Ok(KeyMaterial(out))
}

/// Computes an HMAC-SHA-256 tag over `label` keyed by `key`.
///
/// Used for the password verifier: the label gives domain separation, so the
/// stored tag is a password check rather than the wrapping key itself.
#[allow(clippy::expect_used)]
#[must_use]
pub fn keyed_tag(key: &KeyMaterial, label: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&key.0).expect("HMAC accepts keys of any length");
    mac.update(label);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time equality over byte slices.
///
/// Length mismatch returns early; the lengths of verifier tags are public.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Seals `plaintext` under `key` with AES-256-GCM and a fresh random nonce.
///
/// Returns the nonce and the ciphertext (which includes the 16-byte GCM tag).
///
/// # Errors
/// Returns [`VaultError::Corrupt`] if the cipher rejects the input; with a
/// 32-byte key this only happens for plaintexts beyond AES-GCM's length bound.
pub fn aead_seal(key: &KeyMaterial, plaintext: &[u8], aad: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
    let aead = Aes256Gcm::new((&key.0).into());
    let nonce = random_bytes::<NONCE_LEN>();
    let ciphertext = aead
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| VaultError::Corrupt("AEAD seal failed".into()))?;
    Ok((nonce, ciphertext))
}

/// Opens an AES-256-GCM ciphertext.
///
/// # Errors
/// Returns [`VaultError::AuthFailure`] when the tag does not verify, i.e. a
/// wrong key, tampered ciphertext, or mismatched associated data.
pub fn aead_open(key: &KeyMaterial, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let aead = Aes256Gcm::new((&key.0).into());
    aead.decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| VaultError::AuthFailure)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::hex;

    // Reduced iteration count keeps the suite fast; production paths always
    // use PBKDF2_ITERATIONS.
    const TEST_ITERATIONS: u32 = 1_000;

    #[test]
    fn test_keymaterial_random_and_distinct() {
        let k1 = KeyMaterial::random();
        let k2 = KeyMaterial::random();
        assert_eq!(k1.0.len(), KEY_LEN);
        assert_ne!(hex::encode(&k1.0), hex::encode(&k2.0));
    }

    #[test]
    fn test_keymaterial_debug_hides_bytes() {
        let k = KeyMaterial::random();
        assert_eq!(format!("{k:?}"), "KeyMaterial(..)");
    }

    #[test]
    fn test_derive_key_deterministic_and_salt_sensitive() {
        let password = "correct horse battery staple";
        let a = derive_key(password, b"salt-one-16bytes", TEST_ITERATIONS).unwrap();
        let b = derive_key(password, b"salt-one-16bytes", TEST_ITERATIONS).unwrap();
        let c = derive_key(password, b"salt-two-16bytes", TEST_ITERATIONS).unwrap();
        let d = derive_key("different password", b"salt-one-16bytes", TEST_ITERATIONS).unwrap();

        assert_eq!(hex::encode(&a.0), hex::encode(&b.0));
        assert_ne!(hex::encode(&a.0), hex::encode(&c.0));
        assert_ne!(hex::encode(&a.0), hex::encode(&d.0));
    }

    #[test]
    fn test_derive_key_rejects_zero_iterations() {
        let err = derive_key("pw", b"salt", 0).unwrap_err();
        assert!(matches!(err, VaultError::KdfOverflow(_)));
    }

    #[test]
    fn test_aead_round_trip_with_aad() {
        let key = KeyMaterial::random();
        let (nonce, ct) = aead_seal(&key, b"secret message", b"backup:v1").unwrap();
        let pt = aead_open(&key, &nonce, &ct, b"backup:v1").unwrap();
        assert_eq!(pt, b"secret message");
    }

    #[test]
    fn test_aead_wrong_aad_fails() {
        let key = KeyMaterial::random();
        let (nonce, ct) = aead_seal(&key, b"message", b"aad-ok").unwrap();
        assert!(matches!(
            aead_open(&key, &nonce, &ct, b"aad-bad").unwrap_err(),
            VaultError::AuthFailure
        ));
    }

    #[test]
    fn test_aead_wrong_key_fails() {
        let key1 = KeyMaterial::random();
        let key2 = KeyMaterial::random();
        let (nonce, ct) = aead_seal(&key1, b"data", b"").unwrap();
        assert!(matches!(aead_open(&key2, &nonce, &ct, b"").unwrap_err(), VaultError::AuthFailure));
    }

    #[test]
    fn test_aead_tamper_detection_every_region() {
        let key = KeyMaterial::random();
        let (nonce, ct) = aead_seal(&key, b"payload payload payload", b"").unwrap();

        // Flip one bit in the first byte, a middle byte, and the tag.
        for idx in [0, ct.len() / 2, ct.len() - 1] {
            let mut tampered = ct.clone();
            tampered[idx] ^= 0x01;
            assert!(matches!(
                aead_open(&key, &nonce, &tampered, b"").unwrap_err(),
                VaultError::AuthFailure
            ));
        }
    }

    #[test]
    fn test_aead_nonces_are_fresh_per_seal() {
        let key = KeyMaterial::random();
        let (n1, _) = aead_seal(&key, b"x", b"").unwrap();
        let (n2, _) = aead_seal(&key, b"x", b"").unwrap();
        assert_ne!(n1, n2);
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
        assert!(ct_eq(b"", b""));
    }

    #[test]
    fn test_keyed_tag_deterministic_and_key_sensitive() {
        let k1 = derive_key("m1", b"salt", TEST_ITERATIONS).unwrap();
        let k2 = derive_key("m2", b"salt", TEST_ITERATIONS).unwrap();
        let t1a = keyed_tag(&k1, b"label");
        let t1b = keyed_tag(&k1, b"label");
        let t2 = keyed_tag(&k2, b"label");
        assert_eq!(t1a, t1b);
        assert_ne!(t1a, t2);
        assert_ne!(keyed_tag(&k1, b"other-label"), t1a);
    }
}
