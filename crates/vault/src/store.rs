//! Persistent vault root: a self-describing JSON tree written with an
//! atomic temp-file-plus-rename commit.
//!
//! The store is single-writer within a process. Processes sharing a path are
//! last-writer-wins on the root record; audit entries and usage counters are
//! advisory, so writes lost to cross-process interleaving are acceptable.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audit::AuditLog;
use crate::entry::Entry;
use crate::envelope;
use crate::error::{Result, VaultError};
use crate::settings::VaultSettings;
use crate::verifier::PasswordVerifier;

/// On-disk format version of the root record.
pub const FORMAT_VERSION: u32 = 1;

/// Conventional directory name under the user's home.
pub const VAULT_DIR_NAME: &str = ".keyvault";
/// Root record file name.
pub const VAULT_FILE_NAME: &str = "vault.json";

/// The root persistent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultRoot {
    pub format_version: u32,
    pub initialized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifier: Option<PasswordVerifier>,
    #[serde(default)]
    pub entries: BTreeMap<String, Entry>,
    #[serde(default)]
    pub settings: VaultSettings,
    #[serde(default)]
    pub audit_log: AuditLog,
    /// Milliseconds since the Unix epoch; drives auto-lock across restarts.
    #[serde(default)]
    pub last_activity: i64,
    /// Fields written by newer versions survive a round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl VaultRoot {
    #[must_use]
    pub fn new(verifier: PasswordVerifier, now_ms: i64) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            initialized: true,
            verifier: Some(verifier),
            entries: BTreeMap::new(),
            settings: VaultSettings::default(),
            audit_log: AuditLog::default(),
            last_activity: now_ms,
            extra: serde_json::Map::new(),
        }
    }
}

/// File-backed store for a [`VaultRoot`].
#[derive(Debug, Clone)]
pub struct VaultStore {
    path: PathBuf,
}

impl VaultStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the conventional `~/.keyvault/vault.json` location, creating
    /// the directory if needed.
    ///
    /// # Errors
    /// Fails when no home directory can be determined or the directory cannot
    /// be created.
    pub fn open_default() -> Result<Self> {
        let dir = default_vault_dir()?;
        std::fs::create_dir_all(&dir)?;
        Ok(Self::new(dir.join(VAULT_FILE_NAME)))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Loads and validates the root record.
    ///
    /// Returns `Ok(None)` when no vault file exists.
    ///
    /// # Errors
    /// Unparseable content or violated structural invariants surface as
    /// [`VaultError::Corrupt`]; the host should switch to rescue mode rather
    /// than overwrite.
    pub fn load(&self) -> Result<Option<VaultRoot>> {
        if !self.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let root: VaultRoot = serde_json::from_str(&content)
            .map_err(|e| VaultError::Corrupt(format!("unreadable vault root: {e}")))?;
        validate_root(&root)?;
        Ok(Some(root))
    }

    /// Atomically persists the root: serialize to a temp file in the same
    /// directory, fsync, then rename over the target. A crash at any point
    /// leaves either the old or the new root, never a torn one.
    ///
    /// # Errors
    /// I/O and serialization failures; the previous root file is untouched on
    /// any failure path.
    pub fn commit(&self, root: &VaultRoot) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let bytes = serde_json::to_vec_pretty(root)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| VaultError::Io(e.error))?;

        debug!(path = %self.path.display(), entries = root.entries.len(), "vault root committed");
        Ok(())
    }
}

/// Structural invariants checked on load.
fn validate_root(root: &VaultRoot) -> Result<()> {
    if root.format_version == 0 || root.format_version > FORMAT_VERSION {
        return Err(VaultError::Corrupt(format!(
            "unsupported vault format version {}",
            root.format_version
        )));
    }
    if root.initialized && root.verifier.is_none() {
        return Err(VaultError::Corrupt("initialized vault has no verifier".into()));
    }
    for (id, entry) in &root.entries {
        if *id != entry.id {
            return Err(VaultError::Corrupt(format!("entry key '{id}' does not match its id")));
        }
        envelope::parse(&entry.ciphertext)
            .map_err(|_| VaultError::Corrupt(format!("entry '{id}' has a malformed envelope")))?;
        if let Some(last_used) = entry.last_used_at {
            if last_used < entry.created_at {
                return Err(VaultError::Corrupt(format!("entry '{id}' was used before it was created")));
            }
        }
    }
    Ok(())
}

fn default_vault_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        VaultError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no home directory found",
        ))
    })?;
    Ok(home.join(VAULT_DIR_NAME))
}
