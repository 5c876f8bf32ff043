//! Backup envelope: a full-vault snapshot sealed under a (possibly
//! different) password, and the merge machinery for bringing one back in.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::entry::Environment;
use crate::envelope::{self, BACKUP_AAD};
use crate::error::{Result, VaultError};
use crate::settings::VaultSettings;

/// Snapshot format version inside the sealed blob.
pub const SNAPSHOT_VERSION: u32 = 1;

/// One entry inside a snapshot, with its secret in the clear. The snapshot
/// only ever exists as plaintext inside an export/import call; at rest it is
/// always sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEntry {
    pub id: String,
    pub service_name: String,
    pub secret: String,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub domains: BTreeSet<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub favorite: bool,
    pub created_at: i64,
    #[serde(default)]
    pub last_used_at: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub rate_limit: String,
}

/// The serialized payload of a backup envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub format_version: u32,
    /// Milliseconds since the Unix epoch.
    pub exported_at: i64,
    pub entry_count: usize,
    pub entries: Vec<BackupEntry>,
    pub settings: VaultSettings,
}

/// Policy applied per incoming entry when its `service_name` collides
/// (case-insensitively) with an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    SkipDuplicate,
    Overwrite,
    Rename,
}

impl MergePolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MergePolicy::SkipDuplicate => "skip",
            MergePolicy::Overwrite => "overwrite",
            MergePolicy::Rename => "rename",
        }
    }
}

impl FromStr for MergePolicy {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "skip" | "skip_duplicate" | "skip-duplicate" => Ok(MergePolicy::SkipDuplicate),
            "overwrite" => Ok(MergePolicy::Overwrite),
            "rename" => Ok(MergePolicy::Rename),
            other => Err(VaultError::validation(
                "policy",
                format!("unknown merge policy '{other}' (expected skip, overwrite, or rename)"),
            )),
        }
    }
}

/// Outcome counts of an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub inserted: usize,
    pub skipped: usize,
    pub overwritten: usize,
    pub renamed: usize,
}

/// Seals a snapshot under `backup_password` with the backup associated data.
///
/// # Errors
/// Serialization and seal failures.
pub fn seal_snapshot(backup_password: &str, snapshot: &BackupSnapshot) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(snapshot)?;
    envelope::seal(backup_password, &payload, BACKUP_AAD)
}

/// Unseals and parses a backup envelope.
///
/// # Errors
/// A wrong password surfaces as [`VaultError::BadBackupPassword`]; framing
/// problems stay [`VaultError::InvalidEnvelope`]; a sealed payload that does
/// not parse as a snapshot is [`VaultError::Corrupt`].
pub fn open_snapshot(backup_password: &str, bytes: &[u8]) -> Result<BackupSnapshot> {
    let payload = envelope::open(backup_password, bytes, BACKUP_AAD).map_err(|e| match e {
        VaultError::AuthFailure => VaultError::BadBackupPassword,
        other => other,
    })?;
    let snapshot: BackupSnapshot =
        serde_json::from_slice(&payload).map_err(|e| VaultError::Corrupt(format!("unreadable backup payload: {e}")))?;
    if snapshot.format_version == 0 || snapshot.format_version > SNAPSHOT_VERSION {
        return Err(VaultError::Corrupt(format!(
            "unsupported backup format version {}",
            snapshot.format_version
        )));
    }
    Ok(snapshot)
}
