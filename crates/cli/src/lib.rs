mod admin;
mod config;
mod entries;
mod transfer;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use keyvault_vault::{SessionToken, Vault, VaultError};
use tracing::debug;

pub use crate::config::HostConfig;
use crate::config::{CONFIG_FILE_NAME, SESSION_FILE_NAME};

/// Session token lifetime when the vault's auto-lock is disabled.
const FALLBACK_TOKEN_TTL_MS: i64 = 8 * 60 * 60 * 1000;

#[derive(Parser, Debug)]
#[command(
    name = "keyvault",
    about = "A local, password-protected store for API credentials",
    long_about = "KeyVault keeps API keys and other credentials in a single encrypted file \
                  under your home directory. Secrets are sealed with AES-256-GCM under a key \
                  derived from your master password (PBKDF2-HMAC-SHA-256); nothing leaves \
                  your machine.\n\n\
                  Quick start:\n\
                  1. keyvault init                     # create the vault\n\
                  2. keyvault unlock                   # start a session\n\
                  3. keyvault add -n OpenAI --generate # store a secret\n\
                  4. keyvault list                     # browse metadata\n\
                  5. keyvault get OpenAI               # reveal a secret"
)]
pub struct Cli {
    /// Path to the vault file (defaults to ~/.keyvault/vault.json)
    #[arg(long, global = true)]
    pub vault: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new vault protected by a master password
    Init {
        /// Replace an existing vault (destroys its contents)
        #[arg(long)]
        overwrite: bool,
    },

    /// Verify the master password and start a session
    Unlock,

    /// End the session and forget the cached key
    Lock,

    /// Show vault state without touching any secrets
    Status,

    /// Add a new credential to the vault
    Add {
        /// Service name, e.g. "OpenAI" or "Stripe Live"
        #[arg(short, long)]
        name: String,
        /// The secret value (prompted for when omitted)
        #[arg(short, long)]
        value: Option<String>,
        /// Generate the secret instead of providing one
        #[arg(long)]
        generate: bool,
        /// Length of a generated secret
        #[arg(long, default_value = "32")]
        length: usize,
        /// Deployment environment: production, development, staging, testing
        #[arg(short, long, default_value = "production")]
        environment: String,
        /// Tag (repeatable)
        #[arg(short, long)]
        tag: Vec<String>,
        /// Associated hostname (repeatable)
        #[arg(short, long)]
        domain: Vec<String>,
        #[arg(long)]
        notes: Option<String>,
        /// Expire this credential N days from now
        #[arg(long)]
        expires_days: Option<u64>,
        /// Free-text rate limit hint
        #[arg(long)]
        rate_limit: Option<String>,
        #[arg(long)]
        favorite: bool,
    },

    /// Reveal one credential by id or service name
    Get {
        /// Entry id or (unique) service name
        target: String,
        /// Copy the secret to the clipboard instead of printing it
        #[arg(long)]
        copy: bool,
    },

    /// List credentials (metadata only)
    List {
        /// Keep entries associated with this hostname
        #[arg(long)]
        domain: Option<String>,
        /// Keep entries in this environment
        #[arg(short, long)]
        environment: Option<String>,
        /// Keep entries carrying this tag
        #[arg(short, long)]
        tag: Option<String>,
        /// Keep only favorites
        #[arg(long)]
        favorites: bool,
        /// Keep entries expiring within N days
        #[arg(long)]
        expiring_days: Option<u64>,
    },

    /// Search service names, tags, environments, and notes
    Search {
        query: String,
    },

    /// Update an existing credential
    Update {
        /// Entry id or (unique) service name
        target: String,
        /// New service name
        #[arg(long)]
        rename: Option<String>,
        /// New secret value
        #[arg(short, long)]
        value: Option<String>,
        /// Generate a new secret value
        #[arg(long)]
        generate: bool,
        /// Length of a generated secret
        #[arg(long, default_value = "32")]
        length: usize,
        #[arg(short, long)]
        environment: Option<String>,
        /// Replace the tag set (repeatable)
        #[arg(short, long)]
        tag: Option<Vec<String>>,
        /// Replace the domain set (repeatable)
        #[arg(short, long)]
        domain: Option<Vec<String>>,
        #[arg(long)]
        notes: Option<String>,
        /// Expire this credential N days from now
        #[arg(long)]
        expires_days: Option<u64>,
        /// Clear the expiry
        #[arg(long, conflicts_with = "expires_days")]
        no_expiry: bool,
        #[arg(long)]
        rate_limit: Option<String>,
        #[arg(long, conflicts_with = "no_favorite")]
        favorite: bool,
        #[arg(long)]
        no_favorite: bool,
    },

    /// Delete a credential
    Delete {
        /// Entry id or (unique) service name
        target: String,
    },

    /// Record a usage of a credential (bumps counters, stamps the time)
    Use {
        /// Entry id or (unique) service name
        target: String,
        /// Hostname to associate with this use
        #[arg(long)]
        domain: Option<String>,
    },

    /// Export the whole vault as an encrypted backup file
    Export {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Import an encrypted backup file into this vault
    Import {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,
        /// Collision policy: skip, overwrite, or rename
        #[arg(long, default_value = "skip")]
        policy: String,
    },

    /// Import plaintext credentials from a foreign JSON or CSV dump
    Restore {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,
        /// Input format: json or csv (auto-detected from the extension)
        #[arg(short, long)]
        format: Option<String>,
    },

    /// Show the most recent audit records
    Audit {
        /// How many records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Generate random secrets without storing anything
    Generate {
        /// Secret length
        #[arg(short, long, default_value = "32")]
        length: usize,
        /// How many secrets to generate
        #[arg(short, long, default_value = "1")]
        count: usize,
    },

    /// Change the master password (re-encrypts every entry)
    ChangePassword,

    /// Show or change vault settings
    Config {
        /// Idle minutes before auto-lock (0 disables)
        #[arg(long)]
        auto_lock_minutes: Option<u64>,
        /// Advisory clipboard clear delay in seconds (0 disables)
        #[arg(long)]
        clipboard_clear_seconds: Option<u64>,
        /// Enable or disable the audit log
        #[arg(long)]
        audit_log: Option<bool>,
        /// UI theme: light, dark, or auto
        #[arg(long)]
        theme: Option<String>,
        /// Days ahead to warn about expiring credentials
        #[arg(long)]
        expiration_warning_days: Option<u64>,
    },

    /// Scheduled backup management
    #[command(subcommand)]
    Backup(BackupCommand),
}

#[derive(Subcommand, Debug)]
pub enum BackupCommand {
    /// Run a backup right now
    Now,
    /// Show or change the backup schedule
    Configure {
        #[arg(long)]
        enable: bool,
        #[arg(long, conflicts_with = "enable")]
        disable: bool,
        /// Backup directory
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Minimum hours between scheduled backups
        #[arg(long)]
        interval_hours: Option<u64>,
        /// How many backups to retain
        #[arg(long)]
        max_backups: Option<usize>,
        /// Backup format: envelope, json, or csv
        #[arg(long)]
        format: Option<String>,
        /// Gzip plaintext backups
        #[arg(long)]
        compress: Option<bool>,
    },
    /// List existing backups, oldest first
    List,
}

/// Entry point for the binary: dispatches and maps failures onto the
/// documented exit codes (0 ok, 1 failure, 2 misuse, 3 auth, 4 not
/// initialized, 5 not found). Argument misuse exits 2 via clap itself.
#[must_use]
pub fn run(cli: Cli) -> ExitCode {
    init_tracing();
    match handle_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            eprintln!("error: {report:#}");
            let code = report
                .downcast_ref::<VaultError>()
                .map_or(1, keyvault_vault::VaultError::exit_code);
            ExitCode::from(code)
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    // Silent unless RUST_LOG asks otherwise; secrets never hit the log
    // stream, but hosts still should not chatter by default.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

/// # Errors
/// Any vault or I/O failure; the caller maps these to exit codes.
pub fn handle_command(cli: Cli) -> Result<()> {
    let ctx = HostContext::prepare(cli.vault.clone())?;
    match cli.command {
        Commands::Init { overwrite } => admin::handle_init(ctx, overwrite),
        Commands::Unlock => admin::handle_unlock(ctx),
        Commands::Lock => admin::handle_lock(ctx),
        Commands::Status => admin::handle_status(&ctx),
        Commands::Audit { limit } => admin::handle_audit(&ctx, limit),
        Commands::ChangePassword => admin::handle_change_password(ctx),
        Commands::Config {
            auto_lock_minutes,
            clipboard_clear_seconds,
            audit_log,
            theme,
            expiration_warning_days,
        } => admin::handle_config(
            ctx,
            auto_lock_minutes,
            clipboard_clear_seconds,
            audit_log,
            theme,
            expiration_warning_days,
        ),
        Commands::Add {
            name,
            value,
            generate,
            length,
            environment,
            tag,
            domain,
            notes,
            expires_days,
            rate_limit,
            favorite,
        } => entries::handle_add(
            ctx,
            entries::AddArgs {
                name,
                value,
                generate,
                length,
                environment,
                tags: tag,
                domains: domain,
                notes,
                expires_days,
                rate_limit,
                favorite,
            },
        ),
        Commands::Get { target, copy } => entries::handle_get(ctx, &target, copy),
        Commands::List {
            domain,
            environment,
            tag,
            favorites,
            expiring_days,
        } => entries::handle_list(ctx, domain, environment, tag, favorites, expiring_days),
        Commands::Search { query } => entries::handle_search(ctx, &query),
        Commands::Update {
            target,
            rename,
            value,
            generate,
            length,
            environment,
            tag,
            domain,
            notes,
            expires_days,
            no_expiry,
            rate_limit,
            favorite,
            no_favorite,
        } => entries::handle_update(
            ctx,
            &target,
            entries::UpdateArgs {
                rename,
                value,
                generate,
                length,
                environment,
                tags: tag,
                domains: domain,
                notes,
                expires_days,
                no_expiry,
                rate_limit,
                favorite,
                no_favorite,
            },
        ),
        Commands::Delete { target } => entries::handle_delete(ctx, &target),
        Commands::Use { target, domain } => entries::handle_use(ctx, &target, domain.as_deref()),
        Commands::Export { output } => transfer::handle_export(ctx, &output),
        Commands::Import { input, policy } => transfer::handle_import(ctx, &input, &policy),
        Commands::Restore { input, format } => transfer::handle_restore(ctx, &input, format.as_deref()),
        Commands::Generate { length, count } => entries::handle_generate(length, count),
        Commands::Backup(command) => transfer::handle_backup(ctx, command),
    }
}

/// Everything a command handler needs: the opened vault plus the host-side
/// file locations.
pub(crate) struct HostContext {
    pub vault: Vault,
    pub session_path: PathBuf,
}

impl HostContext {
    fn prepare(vault_override: Option<PathBuf>) -> Result<Self> {
        let host_dir = HostConfig::host_dir()?;
        let config_path = host_dir.join(CONFIG_FILE_NAME);
        let mut host_config = HostConfig::load(&config_path)?;

        let vault_path = vault_override
            .or_else(|| host_config.vault_path.clone())
            .unwrap_or_else(|| host_dir.join("vault.json"));

        let vault = Vault::open(vault_path)?;

        host_config.last_access = Some(now_ms());
        if let Err(e) = host_config.save(&config_path) {
            debug!(error = %e, "failed to update host config");
        }

        Ok(Self {
            vault,
            session_path: host_dir.join(SESSION_FILE_NAME),
        })
    }

    /// Ensures an unlocked session: resumes the file-backed token when it is
    /// still valid, otherwise prompts for the master password. Refreshes the
    /// token afterwards so activity extends the session.
    pub fn ensure_unlocked(&mut self) -> Result<()> {
        if let Some(token) = SessionToken::load(&self.session_path) {
            if self.vault.resume(&token).is_ok() {
                self.refresh_token()?;
                return Ok(());
            }
            SessionToken::delete(&self.session_path);
        }

        let password = rpassword::prompt_password("Master password: ")?;
        self.vault.unlock(&password)?;
        self.refresh_token()?;
        Ok(())
    }

    pub fn refresh_token(&self) -> Result<()> {
        let minutes = self.vault.settings().map(|s| s.auto_lock_minutes).unwrap_or(0);
        let ttl_ms = if minutes == 0 {
            FALLBACK_TOKEN_TTL_MS
        } else {
            i64::try_from(minutes.saturating_mul(60_000)).unwrap_or(FALLBACK_TOKEN_TTL_MS)
        };
        let token = self.vault.issue_token(ttl_ms)?;
        token.save(&self.session_path)?;
        Ok(())
    }

    pub fn drop_token(&self) {
        SessionToken::delete(&self.session_path);
    }
}

pub(crate) fn now_ms() -> i64 {
    #[allow(clippy::cast_possible_truncation)]
    {
        (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }
}

/// Prompts twice and insists the two entries match.
pub(crate) fn prompt_new_password(label: &str) -> Result<String> {
    let first = rpassword::prompt_password(format!("{label}: "))?;
    if first.is_empty() {
        return Err(VaultError::validation("password", "must not be empty").into());
    }
    let second = rpassword::prompt_password(format!("{label} (again): "))?;
    if first != second {
        return Err(color_eyre::eyre::eyre!("passwords do not match"));
    }
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_add_command() {
        let cli = Cli::try_parse_from([
            "keyvault", "add", "-n", "OpenAI", "--generate", "--length", "48", "-t", "ai", "-t", "llm",
        ])
        .expect("parse");
        match cli.command {
            Commands::Add {
                name,
                generate,
                length,
                tag,
                ..
            } => {
                assert_eq!(name, "OpenAI");
                assert!(generate);
                assert_eq!(length, 48);
                assert_eq!(tag, vec!["ai", "llm"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_conflicting_flags() {
        assert!(Cli::try_parse_from(["keyvault", "update", "x", "--favorite", "--no-favorite"]).is_err());
        assert!(Cli::try_parse_from(["keyvault", "update", "x", "--expires-days", "3", "--no-expiry"]).is_err());
    }

    #[test]
    fn test_global_vault_flag() {
        let cli = Cli::try_parse_from(["keyvault", "status", "--vault", "/tmp/alt.json"]).expect("parse");
        assert_eq!(cli.vault, Some(PathBuf::from("/tmp/alt.json")));
    }
}
