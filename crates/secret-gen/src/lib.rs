//! Uniform random secret generation over a URL-safe alphabet.
//!
//! Bytes come straight from the system CSPRNG and are mapped onto the
//! alphabet with rejection sampling, so every character is exactly uniform
//! regardless of the alphabet size.

use thiserror::Error;

/// The 64-character generation alphabet: alphanumerics plus `-` and `_`.
pub const SECRET_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Default generated length.
pub const DEFAULT_LENGTH: usize = 32;

const MIN_LENGTH: usize = 1;
const MAX_LENGTH: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenerateError {
    #[error("secret length must be between {MIN_LENGTH} and {MAX_LENGTH}, got {0}")]
    InvalidLength(usize),
}

#[derive(Debug, Clone)]
pub struct SecretConfig {
    pub length: usize,
}

impl Default for SecretConfig {
    fn default() -> Self {
        Self { length: DEFAULT_LENGTH }
    }
}

impl SecretConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.length >= MIN_LENGTH && self.length <= MAX_LENGTH
    }

    /// Generates a secret of the configured length.
    ///
    /// # Errors
    /// [`GenerateError::InvalidLength`] when the length is out of bounds.
    ///
    /// # Panics
    /// Panics if the system CSPRNG is unavailable.
    #[allow(clippy::expect_used)]
    pub fn generate(&self) -> Result<String, GenerateError> {
        if !self.is_valid() {
            return Err(GenerateError::InvalidLength(self.length));
        }

        let alphabet_len = SECRET_ALPHABET.len();
        // Largest multiple of the alphabet size that fits in a byte; values
        // at or above it are rejected to keep the mapping uniform. (For the
        // 64-character alphabet every byte is accepted, but the bound keeps
        // alphabet changes safe.)
        let zone = 256 - (256 % alphabet_len);

        let mut out = String::with_capacity(self.length);
        let mut buf = [0u8; 128];
        while out.len() < self.length {
            getrandom::fill(&mut buf).expect("failed to get random bytes");
            for &byte in &buf {
                if (byte as usize) < zone {
                    out.push(char::from(SECRET_ALPHABET[byte as usize % alphabet_len]));
                    if out.len() == self.length {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Generates a secret of `length` characters from [`SECRET_ALPHABET`].
///
/// # Errors
/// [`GenerateError::InvalidLength`] when `length` is out of bounds.
pub fn generate_secret(length: usize) -> Result<String, GenerateError> {
    SecretConfig::new().with_length(length).generate()
}
