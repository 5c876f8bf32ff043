//! Host-side preferences (`~/.keyvault/config.json`), distinct from the
//! vault's own settings record.

use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::eyre;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const SESSION_FILE_NAME: &str = "session.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// Overrides the default vault location when set.
    #[serde(default)]
    pub vault_path: Option<PathBuf>,
    /// Milliseconds since the Unix epoch of the last CLI invocation.
    #[serde(default)]
    pub last_access: Option<i64>,
}

impl HostConfig {
    /// The host directory (`~/.keyvault`), created on demand.
    ///
    /// # Errors
    /// Fails when no home directory can be determined.
    pub fn host_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| eyre!("No home directory found"))?;
        let dir = home.join(".keyvault");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

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

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_load_save_round_trip() {
        let dir = std::env::temp_dir().join(format!(
            "keyvault_hostcfg_{}_{}",
            std::process::id(),
            time::OffsetDateTime::now_utc().unix_timestamp_nanos()
        ));
        let path = dir.join(CONFIG_FILE_NAME);

        let config = HostConfig::load(&path).unwrap();
        assert!(config.vault_path.is_none());

        let config = HostConfig {
            vault_path: Some(PathBuf::from("/tmp/alt/vault.json")),
            last_access: Some(42),
        };
        config.save(&path).unwrap();

        let loaded = HostConfig::load(&path).unwrap();
        assert_eq!(loaded.vault_path, Some(PathBuf::from("/tmp/alt/vault.json")));
        assert_eq!(loaded.last_access, Some(42));
        std::fs::remove_dir_all(dir).ok();
    }
}
