//! Entry-level commands: add, get, list, search, update, delete, use,
//! and standalone secret generation.

use std::str::FromStr;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use keyvault_secret_gen::generate_secret;
use keyvault_vault::{EntryFilter, EntryPatch, EntryView, Environment, NewEntryRecord, VaultError};

use crate::{HostContext, now_ms};

pub struct AddArgs {
    pub name: String,
    pub value: Option<String>,
    pub generate: bool,
    pub length: usize,
    pub environment: String,
    pub tags: Vec<String>,
    pub domains: Vec<String>,
    pub notes: Option<String>,
    pub expires_days: Option<u64>,
    pub rate_limit: Option<String>,
    pub favorite: bool,
}

pub struct UpdateArgs {
    pub rename: Option<String>,
    pub value: Option<String>,
    pub generate: bool,
    pub length: usize,
    pub environment: Option<String>,
    pub tags: Option<Vec<String>>,
    pub domains: Option<Vec<String>>,
    pub notes: Option<String>,
    pub expires_days: Option<u64>,
    pub no_expiry: bool,
    pub rate_limit: Option<String>,
    pub favorite: bool,
    pub no_favorite: bool,
}

const DAY_MS: i64 = 86_400_000;

pub fn handle_add(mut ctx: HostContext, args: AddArgs) -> Result<()> {
    ctx.ensure_unlocked()?;

    let secret = resolve_secret_value(args.value, args.generate, args.length)?;
    let record = NewEntryRecord {
        service_name: args.name,
        secret,
        environment: Environment::from_str(&args.environment)?,
        tags: args.tags,
        domains: args.domains,
        notes: args.notes.unwrap_or_default(),
        expires_at: args.expires_days.map(days_from_now),
        rate_limit: args.rate_limit.unwrap_or_default(),
        favorite: args.favorite,
    };

    let id = ctx.vault.add(record)?;
    println!("Added entry {id}");
    Ok(())
}

pub fn handle_get(mut ctx: HostContext, target: &str, copy: bool) -> Result<()> {
    ctx.ensure_unlocked()?;
    let id = resolve_target(&mut ctx, target)?;
    let decrypted = ctx.vault.get(&id)?;
    // Best-effort: revealing a secret still works on a read-only vault.
    if let Err(e) = ctx.vault.record_usage(&id, None) {
        tracing::debug!(error = %e, "could not record usage");
    }

    let view = &decrypted.view;
    println!("Service:     {}", view.service_name);
    println!("Environment: {}", view.environment);
    if !view.tags.is_empty() {
        println!("Tags:        {}", view.tags.iter().cloned().collect::<Vec<_>>().join(", "));
    }
    if !view.notes.is_empty() {
        println!("Notes:       {}", view.notes);
    }
    if let Some(expires_at) = view.expires_at {
        println!("Expires:     {}", format_timestamp(expires_at));
    }

    if copy {
        copy_to_clipboard(&decrypted.secret)?;
        let clear_hint = ctx.vault.settings().map(|s| s.clipboard_clear_seconds).unwrap_or(0);
        if clear_hint > 0 {
            println!("Secret copied to clipboard (clear it within {clear_hint}s)");
        } else {
            println!("Secret copied to clipboard");
        }
    } else {
        println!("Secret:      {}", decrypted.secret);
    }
    Ok(())
}

pub fn handle_list(
    mut ctx: HostContext,
    domain: Option<String>,
    environment: Option<String>,
    tag: Option<String>,
    favorites: bool,
    expiring_days: Option<u64>,
) -> Result<()> {
    ctx.ensure_unlocked()?;

    let filter = EntryFilter {
        domain,
        environment: environment.as_deref().map(Environment::from_str).transpose()?,
        tag,
        favorite: favorites,
        expired_within_days: expiring_days,
    };
    let views = ctx.vault.list(&filter)?;
    print_views(&views);
    Ok(())
}

pub fn handle_search(mut ctx: HostContext, query: &str) -> Result<()> {
    ctx.ensure_unlocked()?;
    let views = ctx.vault.search(query)?;
    print_views(&views);
    Ok(())
}

pub fn handle_update(mut ctx: HostContext, target: &str, args: UpdateArgs) -> Result<()> {
    ctx.ensure_unlocked()?;
    let id = resolve_target(&mut ctx, target)?;

    let secret = if args.generate {
        Some(generate_secret(args.length)?)
    } else {
        args.value
    };

    let patch = EntryPatch {
        service_name: args.rename,
        secret,
        environment: args.environment.as_deref().map(Environment::from_str).transpose()?,
        tags: args.tags,
        domains: args.domains,
        notes: args.notes,
        expires_at: if args.no_expiry {
            Some(None)
        } else {
            args.expires_days.map(|days| Some(days_from_now(days)))
        },
        rate_limit: args.rate_limit,
        favorite: if args.favorite {
            Some(true)
        } else if args.no_favorite {
            Some(false)
        } else {
            None
        },
    };

    ctx.vault.update(&id, patch)?;
    println!("Updated entry {id}");
    Ok(())
}

pub fn handle_delete(mut ctx: HostContext, target: &str) -> Result<()> {
    ctx.ensure_unlocked()?;
    let id = resolve_target(&mut ctx, target)?;
    ctx.vault.delete(&id)?;
    println!("Deleted entry {id}");
    Ok(())
}

pub fn handle_use(mut ctx: HostContext, target: &str, domain: Option<&str>) -> Result<()> {
    ctx.ensure_unlocked()?;
    let id = resolve_target(&mut ctx, target)?;
    ctx.vault.record_usage(&id, domain)?;
    println!("Recorded usage of {id}");
    Ok(())
}

pub fn handle_generate(length: usize, count: usize) -> Result<()> {
    for _ in 0..count.max(1) {
        println!("{}", generate_secret(length)?);
    }
    Ok(())
}

fn resolve_secret_value(value: Option<String>, generate: bool, length: usize) -> Result<String> {
    if generate {
        return Ok(generate_secret(length)?);
    }
    match value {
        Some(value) => Ok(value),
        None => Ok(rpassword::prompt_password("Secret value: ")?),
    }
}

/// Accepts an entry id or a service name; names resolve case-insensitively
/// and must be unambiguous.
fn resolve_target(ctx: &mut HostContext, target: &str) -> Result<String> {
    let views = ctx.vault.list(&EntryFilter::default())?;
    if views.iter().any(|v| v.id == target) {
        return Ok(target.to_string());
    }

    let needle = target.to_lowercase();
    let matches: Vec<&EntryView> = views.iter().filter(|v| v.service_name.to_lowercase() == needle).collect();
    match matches.len() {
        0 => Err(VaultError::NotFound(target.to_string()).into()),
        1 => Ok(matches[0].id.clone()),
        n => Err(eyre!(
            "'{target}' matches {n} entries; use an id instead (try: keyvault search '{target}')"
        )),
    }
}

fn print_views(views: &[EntryView]) {
    if views.is_empty() {
        println!("No entries");
        return;
    }
    println!("{:<38} {:<24} {:<12} {:>6}  {}", "ID", "SERVICE", "ENV", "USES", "LAST USED");
    for view in views {
        let marker = if view.favorite { "*" } else { " " };
        let last_used = view.last_used_at.map_or_else(|| "never".to_string(), format_relative_time);
        println!(
            "{:<38} {marker}{:<23} {:<12} {:>6}  {last_used}",
            view.id, view.service_name, view.environment, view.usage_count
        );
    }
}

fn days_from_now(days: u64) -> i64 {
    now_ms().saturating_add(i64::try_from(days).unwrap_or(i64::MAX).saturating_mul(DAY_MS))
}

pub(crate) fn format_timestamp(ms: i64) -> String {
    time::OffsetDateTime::from_unix_timestamp(ms / 1000)
        .ok()
        .and_then(|t| t.format(&time::format_description::well_known::Rfc3339).ok())
        .unwrap_or_else(|| ms.to_string())
}

pub(crate) fn format_relative_time(ms: i64) -> String {
    let delta = now_ms().saturating_sub(ms);
    let minutes = delta / 60_000;
    match minutes {
        i64::MIN..=0 => "just now".to_string(),
        1..60 => format!("{minutes}m ago"),
        60..1440 => format!("{}h ago", minutes / 60),
        _ => format!("{}d ago", minutes / 1440),
    }
}

fn copy_to_clipboard(secret: &str) -> Result<()> {
    let mut clipboard = arboard::Clipboard::new().map_err(|e| eyre!("clipboard unavailable: {e}"))?;
    clipboard
        .set_text(secret.to_string())
        .map_err(|e| eyre!("clipboard write failed: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_relative_time() {
        let now = now_ms();
        assert_eq!(format_relative_time(now), "just now");
        assert_eq!(format_relative_time(now - 5 * 60_000), "5m ago");
        assert_eq!(format_relative_time(now - 3 * 3_600_000), "3h ago");
        assert_eq!(format_relative_time(now - 50 * 3_600_000), "2d ago");
    }

    #[test]
    fn test_format_timestamp_rfc3339() {
        let formatted = format_timestamp(1_700_000_000_000);
        assert!(formatted.starts_with("2023-11-14"));
    }

    #[test]
    fn test_days_from_now_is_in_the_future() {
        assert!(days_from_now(3) > now_ms());
    }
}
