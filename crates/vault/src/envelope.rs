//! Entry codec: the portable byte framing that wraps every sealed secret.
//!
//! Layout (concatenated, big-endian):
//!
//! ```text
//! magic(2) | version(1) | salt(16) | nonce(12) | ciphertext_and_tag(n+16)
//! ```
//!
//! The version byte selects the KDF parameter set; version 1 means
//! PBKDF2-HMAC-SHA-256 with 100 000 iterations, so envelope headers always
//! record enough to re-derive their key from a password alone.

use crate::crypto::{
    KeyMaterial, NONCE_LEN, PBKDF2_ITERATIONS, SALT_LEN, TAG_LEN, aead_open, aead_seal, derive_key, random_bytes,
};
use crate::error::{Result, VaultError};

/// Fixed two-byte envelope magic.
pub const MAGIC: [u8; 2] = *b"KV";
/// Current envelope version.
pub const VERSION: u8 = 1;
/// Associated data distinguishing full-vault backup envelopes from entry
/// envelopes (which use empty associated data).
pub const BACKUP_AAD: &[u8] = b"backup:v1";

const HEADER_LEN: usize = MAGIC.len() + 1 + SALT_LEN + NONCE_LEN;

/// Borrowed view over a parsed envelope.
#[derive(Debug)]
pub struct ParsedEnvelope<'a> {
    pub version: u8,
    pub salt: &'a [u8],
    pub nonce: &'a [u8],
    pub ciphertext: &'a [u8],
}

impl ParsedEnvelope<'_> {
    /// PBKDF2 iteration count recorded by this envelope's version byte.
    #[must_use]
    pub const fn iterations(&self) -> u32 {
        // Only VERSION parses today; new parameter sets get new versions.
        PBKDF2_ITERATIONS
    }
}

/// Splits envelope bytes into header fields and ciphertext.
///
/// # Errors
/// Returns [`VaultError::InvalidEnvelope`] on truncation, bad magic, or an
/// unknown version. Framing problems are distinct from [`VaultError::AuthFailure`]:
/// a malformed envelope can never be "the wrong password".
pub fn parse(bytes: &[u8]) -> Result<ParsedEnvelope<'_>> {
    if bytes.len() < HEADER_LEN + TAG_LEN {
        return Err(VaultError::InvalidEnvelope("truncated"));
    }
    if bytes[..MAGIC.len()] != MAGIC {
        return Err(VaultError::InvalidEnvelope("bad magic"));
    }
    let version = bytes[MAGIC.len()];
    if version != VERSION {
        return Err(VaultError::InvalidEnvelope("unknown version"));
    }
    let salt_start = MAGIC.len() + 1;
    let nonce_start = salt_start + SALT_LEN;
    Ok(ParsedEnvelope {
        version,
        salt: &bytes[salt_start..nonce_start],
        nonce: &bytes[nonce_start..HEADER_LEN],
        ciphertext: &bytes[HEADER_LEN..],
    })
}

/// Seals `plaintext` under a password, deriving the key from a fresh salt.
///
/// # Errors
/// Propagates KDF and seal failures.
pub fn seal(password: &str, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let salt = random_bytes::<SALT_LEN>();
    let key = derive_key(password, &salt, PBKDF2_ITERATIONS)?;
    seal_with_key(&key, &salt, plaintext, aad)
}

/// Seals `plaintext` under an already-derived key, recording `salt` in the
/// header. This amortizes the KDF across bulk operations (session writes,
/// re-keying, import); the envelope layout is identical to [`seal`]'s.
///
/// # Errors
/// Propagates seal failures.
pub fn seal_with_key(key: &KeyMaterial, salt: &[u8; SALT_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let (nonce, ciphertext) = aead_seal(key, plaintext, aad)?;
    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    out.extend_from_slice(salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Opens an envelope with a password, re-deriving the key from the header
/// salt and the version's parameter set.
///
/// # Errors
/// [`VaultError::InvalidEnvelope`] for framing problems,
/// [`VaultError::AuthFailure`] when the password is wrong for this envelope
/// (or the body was tampered with).
pub fn open(password: &str, bytes: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let env = parse(bytes)?;
    // KeyMaterial zeroizes on drop at the end of this call.
    let key = derive_key(password, env.salt, env.iterations())?;
    aead_open(&key, env.nonce, env.ciphertext, aad)
}

/// Opens an envelope with a cached session key, skipping derivation. The
/// caller guarantees the key matches the salt recorded in the header.
///
/// # Errors
/// Same failure modes as [`open`].
pub fn open_with_key(key: &KeyMaterial, bytes: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let env = parse(bytes)?;
    aead_open(key, env.nonce, env.ciphertext, aad)
}
