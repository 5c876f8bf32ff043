use std::path::{Path, PathBuf};
use std::str::FromStr;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use serde::{Deserialize, Serialize};

/// On-disk representation of a scheduled backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupFormat {
    /// Encrypted backup envelope (the default).
    Envelope,
    /// Plaintext JSON rescue dump.
    Json,
    /// Plaintext CSV rescue dump.
    Csv,
}

impl BackupFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            BackupFormat::Envelope => "envelope",
            BackupFormat::Json => "json",
            BackupFormat::Csv => "csv",
        }
    }

    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            BackupFormat::Envelope => "kvbackup",
            BackupFormat::Json => "json",
            BackupFormat::Csv => "csv",
        }
    }

    #[must_use]
    pub const fn is_plaintext(self) -> bool {
        matches!(self, BackupFormat::Json | BackupFormat::Csv)
    }
}

impl FromStr for BackupFormat {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "envelope" | "backup" => Ok(BackupFormat::Envelope),
            "json" => Ok(BackupFormat::Json),
            "csv" => Ok(BackupFormat::Csv),
            other => Err(eyre!("Invalid backup format: {other} (expected envelope, json, or csv)")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Enable/disable scheduled backups.
    pub enabled: bool,

    /// Backup directory path.
    pub backup_dir: PathBuf,

    /// Minimum hours between scheduled backups.
    pub interval_hours: u64,

    /// Maximum number of backups to retain.
    pub max_backups: usize,

    pub format: BackupFormat,

    /// Gzip plaintext backups; ignored for the envelope format.
    pub compress: bool,

    /// Re-read and sanity-check each backup after writing it.
    pub verify_after_backup: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backup_dir: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".keyvault")
                .join("backups"),
            interval_hours: 24,
            max_backups: 7,
            format: BackupFormat::Envelope,
            compress: false,
            verify_after_backup: true,
        }
    }
}

impl BackupConfig {
    /// Conventional config location next to the vault root.
    ///
    /// # Errors
    /// Fails when no home directory can be determined.
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| eyre!("No home directory found"))?;
        Ok(home.join(".keyvault").join("backup_config.json"))
    }

    /// Loads the config from `path`, falling back to defaults when absent.
    ///
    /// # Errors
    /// Read or parse failures for an existing file.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// # Errors
    /// I/O and serialization failures.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
