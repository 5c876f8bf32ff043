//! Moving secrets in and out: encrypted backup export/import, foreign
//! plaintext restores, and the scheduled backup subcommands.

use std::path::Path;
use std::str::FromStr;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use keyvault_backup::{BackupConfig, BackupFormat, BackupManager};
use keyvault_import_export::{ExportFormat, detect_format_from_extension, duplicate_warnings, import_entries};
use keyvault_vault::MergePolicy;

use crate::{BackupCommand, HostContext, prompt_new_password};

pub fn handle_export(mut ctx: HostContext, output: &Path) -> Result<()> {
    ctx.ensure_unlocked()?;
    let backup_password = prompt_new_password("Backup password")?;
    let bytes = ctx.vault.export(&backup_password)?;
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, bytes)?;
    println!("Exported encrypted backup to {}", output.display());
    Ok(())
}

pub fn handle_import(mut ctx: HostContext, input: &Path, policy: &str) -> Result<()> {
    ctx.ensure_unlocked()?;
    let policy = MergePolicy::from_str(policy)?;
    let backup_password = rpassword::prompt_password("Backup password: ")?;
    let bytes = std::fs::read(input)?;
    let report = ctx.vault.import(&bytes, &backup_password, policy)?;
    println!(
        "Imported: {} inserted, {} skipped, {} overwritten, {} renamed",
        report.inserted, report.skipped, report.overwritten, report.renamed
    );
    Ok(())
}

pub fn handle_restore(mut ctx: HostContext, input: &Path, format: Option<&str>) -> Result<()> {
    ctx.ensure_unlocked()?;
    let format = match format {
        Some(f) => ExportFormat::from_str(f)?,
        None => detect_format_from_extension(input)
            .ok_or_else(|| eyre!("cannot detect format of {}; pass --format json|csv", input.display()))?,
    };

    let records = import_entries(input, format)?;
    for warning in duplicate_warnings(&records) {
        eprintln!("warning: {warning}");
    }

    let total = records.len();
    for record in records {
        let id = ctx.vault.add(record)?;
        println!("Added entry {id}");
    }
    println!("Restored {total} entries from {}", input.display());
    Ok(())
}

pub fn handle_backup(ctx: HostContext, command: BackupCommand) -> Result<()> {
    let config_path = BackupConfig::default_path()?;
    let config = BackupConfig::load(&config_path)?;

    match command {
        BackupCommand::Now => run_backup_now(ctx, config),
        BackupCommand::List => {
            let manager = BackupManager::new(NoSource, config);
            let backups = manager.list_backups()?;
            if backups.is_empty() {
                println!("No backups");
            }
            for path in backups {
                println!("{}", path.display());
            }
            Ok(())
        }
        BackupCommand::Configure {
            enable,
            disable,
            dir,
            interval_hours,
            max_backups,
            format,
            compress,
        } => {
            let mut config = config;
            if enable {
                config.enabled = true;
            }
            if disable {
                config.enabled = false;
            }
            if let Some(dir) = dir {
                config.backup_dir = dir;
            }
            if let Some(hours) = interval_hours {
                config.interval_hours = hours;
            }
            if let Some(max) = max_backups {
                config.max_backups = max;
            }
            if let Some(format) = format {
                config.format = BackupFormat::from_str(&format)?;
            }
            if let Some(compress) = compress {
                config.compress = compress;
            }
            config.save(&config_path)?;

            println!("enabled:        {}", config.enabled);
            println!("backup_dir:     {}", config.backup_dir.display());
            println!("interval_hours: {}", config.interval_hours);
            println!("max_backups:    {}", config.max_backups);
            println!("format:         {}", config.format.as_str());
            println!("compress:       {}", config.compress);
            Ok(())
        }
    }
}

fn run_backup_now(mut ctx: HostContext, config: BackupConfig) -> Result<()> {
    ctx.ensure_unlocked()?;
    let backup_password = if config.format == BackupFormat::Envelope {
        prompt_new_password("Backup password")?
    } else {
        eprintln!("warning: {} backups are plaintext; prefer the envelope format", config.format.as_str());
        String::new()
    };

    let mut manager = BackupManager::new(ctx.vault, config);
    let path = manager.force_backup(&backup_password)?;
    println!("Backup written to {}", path.display());
    Ok(())
}

/// Listing backups never touches the vault.
struct NoSource;

impl keyvault_backup::BackupSource for NoSource {
    fn export_envelope(&mut self, _backup_password: &str) -> Result<Vec<u8>> {
        Err(eyre!("no vault attached"))
    }

    fn portable_entries(&mut self) -> Result<Vec<keyvault_import_export::PortableEntry>> {
        Err(eyre!("no vault attached"))
    }
}
