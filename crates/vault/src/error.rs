use thiserror::Error;

/// Error taxonomy surfaced by the vault engine.
///
/// The core never panics on bad data; every failure a host can trigger is one
/// of these variants. Internal AEAD failures on envelopes the vault itself
/// produced are promoted to [`VaultError::Corrupt`] before they reach a host.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault is not initialized")]
    NotInitialized,

    #[error("vault is already initialized")]
    AlreadyInitialized,

    #[error("vault is locked")]
    Locked,

    #[error("invalid master password")]
    BadPassword,

    #[error("invalid backup password")]
    BadBackupPassword,

    /// AEAD tag mismatch. For a caller-supplied envelope this means "wrong
    /// password for that envelope"; for a stored entry it is promoted to
    /// [`VaultError::Corrupt`].
    #[error("envelope authentication failed")]
    AuthFailure,

    #[error("malformed envelope: {0}")]
    InvalidEnvelope(&'static str),

    #[error("key derivation parameter out of range: {0}")]
    KdfOverflow(&'static str),

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("vault data is corrupt: {0}")]
    Corrupt(String),

    #[error("vault I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("vault serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl VaultError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        VaultError::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Process exit code for CLI hosts: 0 success, 1 generic failure,
    /// 2 misuse, 3 authentication failure, 4 not initialized, 5 not found.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            VaultError::BadPassword | VaultError::BadBackupPassword | VaultError::AuthFailure | VaultError::Locked => 3,
            VaultError::NotInitialized => 4,
            VaultError::NotFound(_) => 5,
            VaultError::Validation { .. } => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_follow_cli_contract() {
        assert_eq!(VaultError::BadPassword.exit_code(), 3);
        assert_eq!(VaultError::Locked.exit_code(), 3);
        assert_eq!(VaultError::NotInitialized.exit_code(), 4);
        assert_eq!(VaultError::NotFound("x".into()).exit_code(), 5);
        assert_eq!(VaultError::validation("service_name", "must not be empty").exit_code(), 2);
        assert_eq!(VaultError::AlreadyInitialized.exit_code(), 1);
        assert_eq!(VaultError::Corrupt("bad".into()).exit_code(), 1);
    }

    #[test]
    fn test_validation_message_names_field() {
        let err = VaultError::validation("environment", "unknown value");
        assert!(err.to_string().contains("environment"));
        assert!(err.to_string().contains("unknown value"));
    }
}
