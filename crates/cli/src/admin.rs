//! Vault-level commands: init, unlock, lock, status, audit, settings, and
//! master password changes.

use std::str::FromStr;

use color_eyre::Result;
use keyvault_vault::{SettingsPatch, Theme};

use crate::entries::format_timestamp;
use crate::{HostContext, prompt_new_password};

pub fn handle_init(mut ctx: HostContext, overwrite: bool) -> Result<()> {
    if overwrite && ctx.vault.status().initialized {
        println!("Overwriting the existing vault at {}", ctx.vault.path().display());
    }
    let password = prompt_new_password("Master password")?;
    ctx.vault.initialize_with(&password, overwrite)?;
    ctx.drop_token();
    println!("Vault initialized at {}", ctx.vault.path().display());
    println!("Run `keyvault unlock` to start a session.");
    Ok(())
}

pub fn handle_unlock(mut ctx: HostContext) -> Result<()> {
    let password = rpassword::prompt_password("Master password: ")?;
    let count = ctx.vault.unlock(&password)?;
    ctx.refresh_token()?;
    println!("Unlocked ({count} entries)");
    Ok(())
}

pub fn handle_lock(mut ctx: HostContext) -> Result<()> {
    ctx.drop_token();
    ctx.vault.lock()?;
    println!("Locked");
    Ok(())
}

pub fn handle_status(ctx: &HostContext) -> Result<()> {
    let status = ctx.vault.status();
    println!("Vault:         {}", ctx.vault.path().display());
    println!("Initialized:   {}", status.initialized);
    println!("Unlocked:      {}", status.unlocked);
    println!("Entries:       {}", status.entry_count);
    match status.last_activity {
        Some(ms) => println!("Last activity: {}", format_timestamp(ms)),
        None => println!("Last activity: -"),
    }
    if status.read_only {
        println!("WARNING: vault is read-only (corruption detected); export what you can and re-initialize");
    }
    Ok(())
}

pub fn handle_audit(ctx: &HostContext, limit: usize) -> Result<()> {
    let records = ctx.vault.audit_tail(limit);
    if records.is_empty() {
        println!("No audit records");
        return Ok(());
    }
    for record in records {
        println!("{}  {}", format_timestamp(record.timestamp), record.action);
    }
    Ok(())
}

pub fn handle_change_password(mut ctx: HostContext) -> Result<()> {
    let current = rpassword::prompt_password("Current master password: ")?;
    let new = prompt_new_password("New master password")?;
    ctx.vault.change_master_password(&current, &new)?;
    // The old session token holds the old key; replace it.
    ctx.drop_token();
    ctx.refresh_token()?;
    println!("Master password changed; every entry was re-encrypted.");
    Ok(())
}

pub fn handle_config(
    mut ctx: HostContext,
    auto_lock_minutes: Option<u64>,
    clipboard_clear_seconds: Option<u64>,
    audit_log: Option<bool>,
    theme: Option<String>,
    expiration_warning_days: Option<u64>,
) -> Result<()> {
    let patch = SettingsPatch {
        auto_lock_minutes,
        clipboard_clear_seconds,
        enable_audit_log: audit_log,
        theme: theme.as_deref().map(Theme::from_str).transpose()?,
        expiration_warning_days,
        ..SettingsPatch::default()
    };

    let changing = patch.auto_lock_minutes.is_some()
        || patch.clipboard_clear_seconds.is_some()
        || patch.enable_audit_log.is_some()
        || patch.theme.is_some()
        || patch.expiration_warning_days.is_some();

    if changing {
        ctx.ensure_unlocked()?;
        ctx.vault.update_settings(&patch)?;
        println!("Settings updated");
    }

    let settings = ctx.vault.settings()?;
    println!("auto_lock_minutes:        {}", settings.auto_lock_minutes);
    println!("clipboard_clear_seconds:  {}", settings.clipboard_clear_seconds);
    println!("mask_keys:                {}", settings.mask_keys);
    println!("enable_audit_log:         {}", settings.enable_audit_log);
    println!("enable_auto_fill:         {}", settings.enable_auto_fill);
    println!("show_usage_stats:         {}", settings.show_usage_stats);
    println!("show_expiration_warnings: {}", settings.show_expiration_warnings);
    println!("expiration_warning_days:  {}", settings.expiration_warning_days);
    println!("theme:                    {}", settings.theme.as_str());
    Ok(())
}
