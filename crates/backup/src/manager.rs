use std::fs;
use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::eyre;
use keyvault_import_export::{ExportFormat, PortableEntry, export_entries};
use keyvault_vault::{Clock, EntryFilter, Vault};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::config::{BackupConfig, BackupFormat};

const BACKUP_PREFIX: &str = "keyvault_backup_";

/// What the manager needs from a vault. A trait so tests can back it with a
/// canned source instead of a real unlocked vault.
pub trait BackupSource {
    /// Sealed full-vault envelope under `backup_password`.
    ///
    /// # Errors
    /// Vault failures (locked session, corrupt entries).
    fn export_envelope(&mut self, backup_password: &str) -> Result<Vec<u8>>;

    /// Decrypted entries for plaintext rescue formats.
    ///
    /// # Errors
    /// Vault failures (locked session, corrupt entries).
    fn portable_entries(&mut self) -> Result<Vec<PortableEntry>>;
}

impl<C: Clock> BackupSource for Vault<C> {
    fn export_envelope(&mut self, backup_password: &str) -> Result<Vec<u8>> {
        Ok(self.export(backup_password)?)
    }

    fn portable_entries(&mut self) -> Result<Vec<PortableEntry>> {
        let views = self.list(&EntryFilter::default())?;
        let mut entries = Vec::with_capacity(views.len());
        for view in views {
            let decrypted = self.get(&view.id)?;
            entries.push(PortableEntry {
                service_name: decrypted.view.service_name,
                secret: decrypted.secret,
                environment: Some(decrypted.view.environment.as_str().to_string()),
                tags: decrypted.view.tags.into_iter().collect(),
                domains: decrypted.view.domains.into_iter().collect(),
                notes: Some(decrypted.view.notes).filter(|n| !n.is_empty()),
                expires_at: decrypted.view.expires_at,
                rate_limit: Some(decrypted.view.rate_limit).filter(|r| !r.is_empty()),
            });
        }
        Ok(entries)
    }
}

pub struct BackupManager<S: BackupSource> {
    pub config: BackupConfig,
    source: S,
}

impl<S: BackupSource> BackupManager<S> {
    pub const fn new(source: S, config: BackupConfig) -> Self {
        Self { config, source }
    }

    /// Runs a backup when scheduled backups are enabled and the configured
    /// interval has elapsed since the most recent one.
    ///
    /// # Errors
    /// Export, write, or verification failures.
    pub fn backup_if_needed(&mut self, backup_password: &str) -> Result<Option<PathBuf>> {
        if !self.config.enabled {
            return Ok(None);
        }
        if !self.should_backup()? {
            debug!("backup interval not elapsed, skipping");
            return Ok(None);
        }
        self.perform_backup(backup_password).map(Some)
    }

    /// Runs a backup unconditionally.
    ///
    /// # Errors
    /// Export, write, or verification failures.
    pub fn force_backup(&mut self, backup_password: &str) -> Result<PathBuf> {
        self.perform_backup(backup_password)
    }

    fn should_backup(&self) -> Result<bool> {
        if !self.config.backup_dir.exists() {
            return Ok(true);
        }

        let Some(most_recent) = self.find_most_recent_backup()? else {
            return Ok(true);
        };
        let Some(timestamp) = extract_timestamp_from_filename(&most_recent) else {
            return Ok(true);
        };

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let interval_secs = i64::try_from(self.config.interval_hours.saturating_mul(3600)).unwrap_or(i64::MAX);
        Ok(now - timestamp >= interval_secs)
    }

    fn perform_backup(&mut self, backup_password: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.config.backup_dir)?;

        let timestamp = OffsetDateTime::now_utc();
        let base_name = generate_backup_filename(&timestamp, self.config.format)?;
        let base_path = self.config.backup_dir.join(&base_name);
        let mut backup_path = base_path.clone();

        match self.config.format {
            BackupFormat::Envelope => {
                let sealed = self.source.export_envelope(backup_password)?;
                fs::write(&backup_path, sealed)?;
            }
            BackupFormat::Json | BackupFormat::Csv => {
                let entries = self.source.portable_entries()?;
                let export_format = match self.config.format {
                    BackupFormat::Json => ExportFormat::Json,
                    _ => ExportFormat::Csv,
                };
                export_entries(&entries, export_format, &base_path)?;
                if self.config.compress {
                    backup_path = self.config.backup_dir.join(format!("{base_name}.gz"));
                    compress_file(&base_path, &backup_path)?;
                    fs::remove_file(&base_path)?;
                }
            }
        }

        if self.config.verify_after_backup {
            self.verify_backup(&backup_path)?;
        }

        self.cleanup_old_backups()?;

        info!(path = %backup_path.display(), "backup written");
        Ok(backup_path)
    }

    fn verify_backup(&self, path: &Path) -> Result<()> {
        let bytes = fs::read(path)?;
        if bytes.is_empty() {
            return Err(eyre!("backup verification failed: {} is empty", path.display()));
        }
        if self.config.format == BackupFormat::Envelope {
            keyvault_vault::envelope::parse(&bytes)
                .map_err(|e| eyre!("backup verification failed for {}: {e}", path.display()))?;
        }
        Ok(())
    }

    fn find_most_recent_backup(&self) -> Result<Option<PathBuf>> {
        let mut backups = self.list_backups()?;
        Ok(backups.pop())
    }

    /// Backup files in this config's directory, oldest first.
    ///
    /// # Errors
    /// Directory read failures.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>> {
        if !self.config.backup_dir.exists() {
            return Ok(Vec::new());
        }
        let mut backups: Vec<PathBuf> = fs::read_dir(&self.config.backup_dir)?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(BACKUP_PREFIX))
            })
            .collect();
        backups.sort_by_key(|p| extract_timestamp_from_filename(p).unwrap_or(0));
        Ok(backups)
    }

    fn cleanup_old_backups(&self) -> Result<()> {
        let backups = self.list_backups()?;
        if backups.len() <= self.config.max_backups {
            return Ok(());
        }
        let excess = backups.len() - self.config.max_backups;
        for old in &backups[..excess] {
            debug!(path = %old.display(), "pruning old backup");
            fs::remove_file(old)?;
        }
        Ok(())
    }
}

fn generate_backup_filename(timestamp: &OffsetDateTime, format: BackupFormat) -> Result<String> {
    let date_str = timestamp.format(&time::format_description::well_known::Rfc3339)?;
    let safe_date = date_str.replace(':', "-").replace('T', "_");

    Ok(format!(
        "{BACKUP_PREFIX}{}_{}.{}",
        safe_date,
        timestamp.unix_timestamp(),
        format.extension()
    ))
}

// Filenames carry their unix timestamp as the segment before the extension.
fn extract_timestamp_from_filename(path: &Path) -> Option<i64> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_prefix(BACKUP_PREFIX)?;
    let after_last_underscore = stem.rsplit('_').next()?;
    let digits: String = after_last_underscore.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn compress_file(input: &Path, output: &Path) -> Result<()> {
    use std::io::BufReader;

    let input_file = fs::File::open(input)?;
    let output_file = fs::File::create(output)?;
    let mut encoder = flate2::write::GzEncoder::new(output_file, flate2::Compression::default());
    let mut reader = BufReader::new(input_file);
    std::io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?;
    Ok(())
}
