//! Encrypted vault engine: password-derived keys, sealed entries, the
//! locked/unlocked session state machine, metadata queries, and encrypted
//! full-vault backups.
//!
//! Hosts construct a [`Vault`] explicitly (no process-wide state) and drive
//! it through the synchronous API below. Plaintext secrets exist only inside
//! an unlocked session; locking, auto-lock, and drop all zeroize the cached
//! key.

pub mod audit;
pub mod backup;
pub mod crypto;
pub mod entry;
pub mod envelope;
pub mod error;
pub mod hex;
pub mod query;
pub mod session;
pub mod settings;
pub mod store;
pub mod verifier;

pub use audit::{AUDIT_LOG_CAPACITY, AuditLog, AuditRecord};
pub use backup::{BackupEntry, BackupSnapshot, ImportReport, MergePolicy};
pub use crypto::KeyMaterial;
pub use entry::{DecryptedEntry, Entry, EntryPatch, EntryView, Environment, NewEntryRecord};
pub use error::{Result, VaultError};
pub use query::EntryFilter;
pub use session::{Clock, SessionManager, SessionToken, SystemClock};
pub use settings::{SettingsPatch, Theme, VaultSettings};
pub use store::{VaultRoot, VaultStore};
pub use verifier::PasswordVerifier;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entry::{normalize_set, random_color};

/// Answer to `status()`: safe to expose to any host, locked or not.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VaultStatus {
    pub initialized: bool,
    pub unlocked: bool,
    pub entry_count: usize,
    pub last_activity: Option<i64>,
    pub read_only: bool,
}

/// The host-facing vault handle. Owns the store, the loaded root record, and
/// the session; every public operation runs to completion or returns a
/// discriminated [`VaultError`].
pub struct Vault<C: Clock = SystemClock> {
    store: VaultStore,
    root: Option<VaultRoot>,
    session: SessionManager<C>,
    read_only: bool,
    corrupt: Option<String>,
}

impl Vault<SystemClock> {
    /// Opens (or prepares to create) a vault at `path`.
    ///
    /// # Errors
    /// I/O failures reading an existing root. An unreadable root does not
    /// error here; the handle comes up in read-only rescue mode instead.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::from_store(VaultStore::new(path), SystemClock)
    }

    /// Opens the conventional `~/.keyvault/vault.json` store.
    ///
    /// # Errors
    /// As [`Vault::open`], plus failure to resolve the home directory.
    pub fn open_default() -> Result<Self> {
        Self::from_store(VaultStore::open_default()?, SystemClock)
    }
}

impl<C: Clock> Vault<C> {
    /// Opens a vault with an explicit clock; tests drive auto-lock with a
    /// manual one.
    ///
    /// # Errors
    /// As [`Vault::open`].
    pub fn with_clock(path: impl Into<PathBuf>, clock: C) -> Result<Self> {
        Self::from_store(VaultStore::new(path), clock)
    }

    fn from_store(store: VaultStore, clock: C) -> Result<Self> {
        let session = SessionManager::new(clock);
        match store.load() {
            Ok(root) => Ok(Self {
                store,
                root,
                session,
                read_only: false,
                corrupt: None,
            }),
            Err(VaultError::Corrupt(msg)) => {
                warn!(error = %msg, "vault root is corrupt; entering read-only rescue mode");
                Ok(Self {
                    store,
                    root: None,
                    session,
                    read_only: true,
                    corrupt: Some(msg),
                })
            }
            Err(e) => Err(e),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.store.path()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.root.as_ref().is_some_and(|r| r.initialized)
    }

    #[must_use]
    pub const fn is_unlocked(&self) -> bool {
        self.session.is_unlocked()
    }

    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub fn status(&self) -> VaultStatus {
        VaultStatus {
            initialized: self.is_initialized() || (self.corrupt.is_some() && self.store.exists()),
            unlocked: self.session.is_unlocked(),
            entry_count: self.root.as_ref().map_or(0, |r| r.entries.len()),
            last_activity: self.root.as_ref().map(|r| r.last_activity),
            read_only: self.read_only,
        }
    }

    /// Creates a fresh vault root protected by `password`.
    ///
    /// # Errors
    /// [`VaultError::AlreadyInitialized`] when a vault exists at this path.
    pub fn initialize(&mut self, password: &str) -> Result<()> {
        self.initialize_with(password, false)
    }

    /// As [`Vault::initialize`], but `overwrite` explicitly discards any
    /// existing vault, including a corrupt one.
    ///
    /// # Errors
    /// As [`Vault::initialize`].
    pub fn initialize_with(&mut self, password: &str, overwrite: bool) -> Result<()> {
        if !overwrite && (self.root.is_some() || self.store.exists()) {
            return Err(VaultError::AlreadyInitialized);
        }
        if password.is_empty() {
            return Err(VaultError::validation("password", "must not be empty"));
        }
        let (verifier, _key) = PasswordVerifier::install(password)?;
        let now = self.session.now_ms();
        let mut root = VaultRoot::new(verifier, now);
        if root.settings.enable_audit_log {
            root.audit_log.push("vault.initialized", now);
        }
        self.store.commit(&root)?;
        self.root = Some(root);
        self.read_only = false;
        self.corrupt = None;
        self.session.lock();
        info!(path = %self.store.path().display(), "vault initialized");
        Ok(())
    }

    /// Verifies `password` and caches the derived key for the session.
    /// Returns the entry count on success.
    ///
    /// After [`session::FAILED_UNLOCK_THRESHOLD`] consecutive failures an
    /// advisory backoff delay is inserted before responding.
    ///
    /// # Errors
    /// [`VaultError::BadPassword`], [`VaultError::NotInitialized`], or
    /// [`VaultError::Corrupt`] in rescue mode.
    pub fn unlock(&mut self, password: &str) -> Result<usize> {
        self.guard_corrupt()?;
        let root = self.root.as_ref().ok_or(VaultError::NotInitialized)?;
        let verifier = root.verifier.as_ref().ok_or(VaultError::NotInitialized)?;

        if let Some(delay) = self.session.penalty() {
            debug!(?delay, "delaying unlock response after repeated failures");
            std::thread::sleep(delay);
        }

        let Some(key) = verifier.check(password)? else {
            let failures = self.session.record_failure();
            warn!(failures, "unlock failed: bad master password");
            return Err(VaultError::BadPassword);
        };

        self.session.begin(key);
        let now = self.session.now_ms();
        let root = self.root.as_mut().ok_or(VaultError::NotInitialized)?;
        if root.settings.enable_audit_log {
            root.audit_log.push("vault.unlocked", now);
        }
        root.last_activity = now;
        let count = root.entries.len();
        if !self.read_only {
            self.commit()?;
        }
        info!(entries = count, "vault unlocked");
        Ok(count)
    }

    /// Locks the session and zeroizes the cached key. Idempotent.
    ///
    /// # Errors
    /// Persisting the audit record can fail; the session is locked regardless.
    pub fn lock(&mut self) -> Result<()> {
        if !self.session.is_unlocked() {
            return Ok(());
        }
        self.session.lock();
        let now = self.session.now_ms();
        let mut commit_needed = false;
        if let Some(root) = self.root.as_mut() {
            if root.settings.enable_audit_log {
                root.audit_log.push("vault.locked", now);
            }
            root.last_activity = now;
            commit_needed = true;
        }
        if commit_needed && !self.read_only {
            self.commit()?;
        }
        info!("vault locked");
        Ok(())
    }

    /// Periodic auto-lock check; hosts call this from their tick (≤ 60 s).
    /// Authenticated calls also enforce it, so a host that never ticks still
    /// cannot use an expired session. Returns whether the vault locked.
    ///
    /// # Errors
    /// Persisting the audit record can fail; the session locks regardless.
    pub fn tick(&mut self) -> Result<bool> {
        let minutes = self.root.as_ref().map_or(0, |r| r.settings.auto_lock_minutes);
        if !self.session.enforce_auto_lock(minutes) {
            return Ok(false);
        }
        let now = self.session.now_ms();
        let mut commit_needed = false;
        if let Some(root) = self.root.as_mut() {
            if root.settings.enable_audit_log {
                root.audit_log.push("vault.autolocked", now);
            }
            commit_needed = true;
        }
        if commit_needed && !self.read_only {
            self.commit()?;
        }
        Ok(true)
    }

    /// Resumes a session from a file-backed token, revalidating the key
    /// against the stored verifier. Returns the entry count.
    ///
    /// # Errors
    /// [`VaultError::Locked`] for an expired token, [`VaultError::BadPassword`]
    /// when the token key does not match this vault.
    pub fn resume(&mut self, token: &SessionToken) -> Result<usize> {
        self.guard_corrupt()?;
        let root = self.root.as_ref().ok_or(VaultError::NotInitialized)?;
        let verifier = root.verifier.as_ref().ok_or(VaultError::NotInitialized)?;
        if token.is_expired(self.session.now_ms()) {
            return Err(VaultError::Locked);
        }
        let key = token.key_material()?;
        if !verifier.matches_key(&key) {
            return Err(VaultError::BadPassword);
        }
        let count = root.entries.len();
        self.session.begin(key);
        debug!("session resumed from token");
        Ok(count)
    }

    /// Issues a session token expiring `ttl_ms` from now.
    ///
    /// # Errors
    /// [`VaultError::Locked`] when no session is active.
    pub fn issue_token(&self, ttl_ms: i64) -> Result<SessionToken> {
        let key = self.session.unlocked_key()?;
        Ok(SessionToken::issue(key, self.session.now_ms().saturating_add(ttl_ms)))
    }

    /// Adds an entry, sealing its secret under the session key. Duplicate
    /// service names (case-insensitive) are advisory: logged, not rejected.
    /// Returns the new entry id.
    ///
    /// # Errors
    /// [`VaultError::Locked`], [`VaultError::Validation`], or persistence
    /// failures.
    pub fn add(&mut self, record: NewEntryRecord) -> Result<String> {
        self.ensure_unlocked()?;
        self.ensure_writable()?;
        record.validate()?;

        let key = self.session.unlocked_key()?.clone();
        let now = self.session.now_ms();
        let root = self.root.as_mut().ok_or(VaultError::NotInitialized)?;
        let salt = root.verifier.as_ref().ok_or_else(missing_verifier)?.salt_array()?;

        let service_name = record.service_name.trim().to_string();
        if has_duplicate_name(&root.entries, &service_name, None) {
            warn!(service = %service_name, "service name already present (advisory uniqueness)");
        }

        let ciphertext = envelope::seal_with_key(&key, &salt, record.secret.as_bytes(), b"")?;
        let id = Uuid::new_v4().to_string();
        let entry = Entry {
            id: id.clone(),
            service_name,
            ciphertext,
            environment: record.environment,
            tags: normalize_set(&record.tags),
            domains: normalize_set(&record.domains),
            notes: record.notes,
            color: random_color(),
            favorite: record.favorite,
            created_at: now,
            last_used_at: None,
            expires_at: record.expires_at,
            usage_count: 0,
            rate_limit: record.rate_limit,
            extra: serde_json::Map::new(),
        };
        root.entries.insert(id.clone(), entry);
        if root.settings.enable_audit_log {
            root.audit_log.push("entry.added", now);
        }
        self.commit()?;
        Ok(id)
    }

    /// Applies a partial update to an entry; a new secret is re-sealed under
    /// the session key.
    ///
    /// # Errors
    /// [`VaultError::Locked`], [`VaultError::NotFound`],
    /// [`VaultError::Validation`], or persistence failures.
    pub fn update(&mut self, id: &str, patch: EntryPatch) -> Result<()> {
        self.ensure_unlocked()?;
        self.ensure_writable()?;
        if patch.is_empty() {
            return Err(VaultError::validation("patch", "no fields to update"));
        }
        if let Some(name) = &patch.service_name {
            if name.trim().is_empty() {
                return Err(VaultError::validation("service_name", "must not be empty"));
            }
        }
        if let Some(secret) = &patch.secret {
            if secret.is_empty() {
                return Err(VaultError::validation("secret", "must not be empty"));
            }
        }

        let key = self.session.unlocked_key()?.clone();
        let now = self.session.now_ms();
        let root = self.root.as_mut().ok_or(VaultError::NotInitialized)?;
        let salt = root.verifier.as_ref().ok_or_else(missing_verifier)?.salt_array()?;

        if let Some(name) = &patch.service_name {
            let candidate = name.trim().to_string();
            if has_duplicate_name(&root.entries, &candidate, Some(id)) {
                warn!(service = %candidate, "service name already present (advisory uniqueness)");
            }
        }

        let entry = root
            .entries
            .get_mut(id)
            .ok_or_else(|| VaultError::NotFound(id.to_string()))?;

        if let Some(name) = patch.service_name {
            entry.service_name = name.trim().to_string();
        }
        if let Some(secret) = patch.secret {
            entry.ciphertext = envelope::seal_with_key(&key, &salt, secret.as_bytes(), b"")?;
        }
        if let Some(environment) = patch.environment {
            entry.environment = environment;
        }
        if let Some(tags) = patch.tags {
            entry.tags = normalize_set(&tags);
        }
        if let Some(domains) = patch.domains {
            entry.domains = normalize_set(&domains);
        }
        if let Some(notes) = patch.notes {
            entry.notes = notes;
        }
        if let Some(expires_at) = patch.expires_at {
            entry.expires_at = expires_at;
        }
        if let Some(rate_limit) = patch.rate_limit {
            entry.rate_limit = rate_limit;
        }
        if let Some(favorite) = patch.favorite {
            entry.favorite = favorite;
        }

        if root.settings.enable_audit_log {
            root.audit_log.push("entry.updated", now);
        }
        self.commit()
    }

    /// Removes an entry.
    ///
    /// # Errors
    /// [`VaultError::Locked`], [`VaultError::NotFound`], or persistence
    /// failures.
    pub fn delete(&mut self, id: &str) -> Result<()> {
        self.ensure_unlocked()?;
        self.ensure_writable()?;
        let now = self.session.now_ms();
        let root = self.root.as_mut().ok_or(VaultError::NotInitialized)?;
        root.entries
            .remove(id)
            .ok_or_else(|| VaultError::NotFound(id.to_string()))?;
        if root.settings.enable_audit_log {
            root.audit_log.push("entry.deleted", now);
        }
        self.commit()
    }

    /// Decrypts one entry and returns its plaintext alongside the metadata
    /// view. The plaintext is the caller's responsibility from here on.
    ///
    /// # Errors
    /// [`VaultError::Locked`], [`VaultError::NotFound`], or
    /// [`VaultError::Corrupt`] when a stored envelope fails to open (the
    /// vault then refuses further writes).
    pub fn get(&mut self, id: &str) -> Result<DecryptedEntry> {
        self.ensure_unlocked()?;
        let key = self.session.unlocked_key()?.clone();
        let root = self.root.as_ref().ok_or(VaultError::NotInitialized)?;
        let entry = root.entries.get(id).ok_or_else(|| VaultError::NotFound(id.to_string()))?;
        let view = entry.view();
        let plaintext = match envelope::open_with_key(&key, &entry.ciphertext, b"") {
            Ok(plaintext) => plaintext,
            Err(e) => return Err(self.promote_entry_failure(id, e)),
        };
        let secret = String::from_utf8(plaintext)
            .map_err(|_| VaultError::Corrupt(format!("entry '{id}' plaintext is not valid UTF-8")))?;
        Ok(DecryptedEntry { view, secret })
    }

    /// Metadata-only listing in the default order (favorites first, then by
    /// recency of use, then by creation). Never decrypts.
    ///
    /// # Errors
    /// [`VaultError::Locked`].
    pub fn list(&mut self, filter: &EntryFilter) -> Result<Vec<EntryView>> {
        self.ensure_unlocked()?;
        let now = self.session.now_ms();
        let root = self.root.as_ref().ok_or(VaultError::NotInitialized)?;
        let mut views: Vec<EntryView> = root
            .entries
            .values()
            .filter(|e| filter.matches(e, now))
            .map(Entry::view)
            .collect();
        query::sort_views(&mut views);
        Ok(views)
    }

    /// Case-insensitive substring search over service names, tags,
    /// environments, and notes. Never decrypts.
    ///
    /// # Errors
    /// [`VaultError::Locked`].
    pub fn search(&mut self, needle: &str) -> Result<Vec<EntryView>> {
        self.ensure_unlocked()?;
        let root = self.root.as_ref().ok_or(VaultError::NotInitialized)?;
        let mut views: Vec<EntryView> = root
            .entries
            .values()
            .filter(|e| query::search_matches(e, needle))
            .map(Entry::view)
            .collect();
        query::sort_views(&mut views);
        Ok(views)
    }

    /// Marks an entry as used now: bumps the monotone usage counter, stamps
    /// `last_used_at`, and unions a non-empty `domain` into its domain set.
    ///
    /// # Errors
    /// [`VaultError::Locked`], [`VaultError::NotFound`], or persistence
    /// failures.
    pub fn record_usage(&mut self, id: &str, domain: Option<&str>) -> Result<()> {
        self.ensure_unlocked()?;
        self.ensure_writable()?;
        let now = self.session.now_ms();
        let root = self.root.as_mut().ok_or(VaultError::NotInitialized)?;
        let entry = root
            .entries
            .get_mut(id)
            .ok_or_else(|| VaultError::NotFound(id.to_string()))?;
        // Clamp so last_used_at never precedes created_at on a skewed clock.
        entry.last_used_at = Some(now.max(entry.created_at));
        entry.usage_count = entry.usage_count.saturating_add(1);
        if let Some(domain) = domain {
            let domain = domain.trim();
            if !domain.is_empty() {
                entry.domains.insert(domain.to_string());
            }
        }
        if root.settings.enable_audit_log {
            root.audit_log.push("entry.used", now);
        }
        self.commit()
    }

    /// Exports the whole vault as an envelope sealed under
    /// `backup_password` (which may differ from the master password).
    ///
    /// # Errors
    /// [`VaultError::Locked`], [`VaultError::Validation`], or
    /// [`VaultError::Corrupt`] when a stored envelope fails to open.
    pub fn export(&mut self, backup_password: &str) -> Result<Vec<u8>> {
        self.ensure_unlocked()?;
        if backup_password.is_empty() {
            return Err(VaultError::validation("backup_password", "must not be empty"));
        }
        let key = self.session.unlocked_key()?.clone();
        let now = self.session.now_ms();

        let root = self.root.as_ref().ok_or(VaultError::NotInitialized)?;
        let mut entries = Vec::with_capacity(root.entries.len());
        let mut corrupt_id = None;
        for entry in root.entries.values() {
            let secret = match envelope::open_with_key(&key, &entry.ciphertext, b"") {
                Ok(plaintext) => match String::from_utf8(plaintext) {
                    Ok(secret) => secret,
                    Err(_) => {
                        corrupt_id = Some(entry.id.clone());
                        break;
                    }
                },
                Err(_) => {
                    corrupt_id = Some(entry.id.clone());
                    break;
                }
            };
            entries.push(BackupEntry {
                id: entry.id.clone(),
                service_name: entry.service_name.clone(),
                secret,
                environment: entry.environment,
                tags: entry.tags.clone(),
                domains: entry.domains.clone(),
                notes: entry.notes.clone(),
                color: entry.color.clone(),
                favorite: entry.favorite,
                created_at: entry.created_at,
                last_used_at: entry.last_used_at,
                expires_at: entry.expires_at,
                usage_count: entry.usage_count,
                rate_limit: entry.rate_limit.clone(),
            });
        }
        let settings = root.settings.clone();

        if let Some(id) = corrupt_id {
            return Err(self.promote_entry_failure(&id, VaultError::AuthFailure));
        }

        let snapshot = BackupSnapshot {
            format_version: backup::SNAPSHOT_VERSION,
            exported_at: now,
            entry_count: entries.len(),
            entries,
            settings,
        };
        let sealed = backup::seal_snapshot(backup_password, &snapshot)?;

        if let Some(root) = self.root.as_mut() {
            if root.settings.enable_audit_log {
                root.audit_log.push("backup.exported", now);
            }
            root.last_activity = now;
        }
        if !self.read_only {
            self.commit()?;
        }
        info!(entries = snapshot.entry_count, "vault exported");
        Ok(sealed)
    }

    /// Imports a backup envelope, re-sealing every incoming secret under the
    /// current master key in a single atomic commit. Incoming ids are kept
    /// when free; collisions mint fresh ones.
    ///
    /// # Errors
    /// [`VaultError::BadBackupPassword`], [`VaultError::InvalidEnvelope`],
    /// [`VaultError::Locked`], or persistence failures.
    pub fn import(&mut self, bytes: &[u8], backup_password: &str, policy: MergePolicy) -> Result<ImportReport> {
        self.ensure_unlocked()?;
        self.ensure_writable()?;
        let snapshot = backup::open_snapshot(backup_password, bytes)?;

        let key = self.session.unlocked_key()?.clone();
        let now = self.session.now_ms();
        let root = self.root.as_ref().ok_or(VaultError::NotInitialized)?;
        let salt = root.verifier.as_ref().ok_or_else(missing_verifier)?.salt_array()?;

        // Stage on a copy so a failure mid-merge leaves both memory and disk
        // untouched.
        let mut staged = root.clone();
        let mut report = ImportReport::default();

        for incoming in snapshot.entries {
            let duplicate_id = staged
                .entries
                .values()
                .find(|e| e.service_name.to_lowercase() == incoming.service_name.to_lowercase())
                .map(|e| e.id.clone());

            let (target_id, service_name) = match (duplicate_id, policy) {
                (Some(_), MergePolicy::SkipDuplicate) => {
                    report.skipped += 1;
                    continue;
                }
                (Some(existing_id), MergePolicy::Overwrite) => {
                    report.overwritten += 1;
                    (existing_id, incoming.service_name.clone())
                }
                (Some(_), MergePolicy::Rename) => {
                    report.renamed += 1;
                    (
                        available_id(&staged.entries, &incoming.id),
                        renamed_service(&staged.entries, &incoming.service_name),
                    )
                }
                (None, _) => {
                    report.inserted += 1;
                    (available_id(&staged.entries, &incoming.id), incoming.service_name.clone())
                }
            };

            let ciphertext = envelope::seal_with_key(&key, &salt, incoming.secret.as_bytes(), b"")?;
            let created_at = if incoming.created_at > 0 { incoming.created_at } else { now };
            let entry = Entry {
                id: target_id.clone(),
                service_name,
                ciphertext,
                environment: incoming.environment,
                tags: incoming.tags,
                domains: incoming.domains,
                notes: incoming.notes,
                color: if incoming.color.is_empty() {
                    random_color()
                } else {
                    incoming.color
                },
                favorite: incoming.favorite,
                created_at,
                last_used_at: incoming.last_used_at.map(|t| t.max(created_at)),
                expires_at: incoming.expires_at,
                usage_count: incoming.usage_count,
                rate_limit: incoming.rate_limit,
                extra: serde_json::Map::new(),
            };
            staged.entries.insert(target_id, entry);
        }

        if staged.settings.enable_audit_log {
            staged.audit_log.push("backup.imported", now);
        }
        staged.last_activity = now;
        self.store.commit(&staged)?;
        self.root = Some(staged);
        info!(
            inserted = report.inserted,
            skipped = report.skipped,
            overwritten = report.overwritten,
            renamed = report.renamed,
            "backup imported"
        );
        Ok(report)
    }

    /// Changes the master password, re-encrypting every entry under the new
    /// key and persisting in a single atomic commit. The session ends up
    /// unlocked under the new key.
    ///
    /// # Errors
    /// [`VaultError::BadPassword`] for a wrong current password (counted
    /// toward unlock backoff), [`VaultError::Validation`], or persistence
    /// failures.
    pub fn change_master_password(&mut self, current: &str, new: &str) -> Result<()> {
        self.guard_corrupt()?;
        self.ensure_writable()?;
        if new.is_empty() {
            return Err(VaultError::validation("password", "must not be empty"));
        }
        let root = self.root.as_ref().ok_or(VaultError::NotInitialized)?;
        let verifier = root.verifier.as_ref().ok_or(VaultError::NotInitialized)?;

        if let Some(delay) = self.session.penalty() {
            debug!(?delay, "delaying re-key response after repeated failures");
            std::thread::sleep(delay);
        }
        let Some(old_key) = verifier.check(current)? else {
            self.session.record_failure();
            return Err(VaultError::BadPassword);
        };

        let (new_verifier, new_key) = PasswordVerifier::install(new)?;
        let new_salt = new_verifier.salt_array()?;
        let now = self.session.now_ms();

        // Re-key a copy; swap in only after the commit lands.
        let mut staged = root.clone();
        let mut corrupt_id = None;
        for entry in staged.entries.values_mut() {
            let plaintext = match envelope::open_with_key(&old_key, &entry.ciphertext, b"") {
                Ok(plaintext) => plaintext,
                Err(_) => {
                    corrupt_id = Some(entry.id.clone());
                    break;
                }
            };
            entry.ciphertext = envelope::seal_with_key(&new_key, &new_salt, &plaintext, b"")?;
        }
        if let Some(id) = corrupt_id {
            return Err(self.promote_entry_failure(&id, VaultError::AuthFailure));
        }

        staged.verifier = Some(new_verifier);
        if staged.settings.enable_audit_log {
            staged.audit_log.push("vault.rekeyed", now);
        }
        staged.last_activity = now;
        self.store.commit(&staged)?;
        self.root = Some(staged);
        self.session.begin(new_key);
        info!("master password changed");
        Ok(())
    }

    /// The `n` most recent audit records, newest first. Available while
    /// locked: the log never carries secret data.
    #[must_use]
    pub fn audit_tail(&self, n: usize) -> Vec<AuditRecord> {
        self.root.as_ref().map(|r| r.audit_log.tail(n)).unwrap_or_default()
    }

    /// # Errors
    /// [`VaultError::NotInitialized`].
    pub fn settings(&self) -> Result<&VaultSettings> {
        self.root
            .as_ref()
            .map(|r| &r.settings)
            .ok_or(VaultError::NotInitialized)
    }

    /// Applies a partial settings update.
    ///
    /// # Errors
    /// [`VaultError::Locked`] or persistence failures.
    pub fn update_settings(&mut self, patch: &SettingsPatch) -> Result<()> {
        self.ensure_unlocked()?;
        self.ensure_writable()?;
        let now = self.session.now_ms();
        let root = self.root.as_mut().ok_or(VaultError::NotInitialized)?;
        patch.apply(&mut root.settings);
        if root.settings.enable_audit_log {
            root.audit_log.push("settings.updated", now);
        }
        self.commit()
    }

    fn guard_corrupt(&self) -> Result<()> {
        match &self.corrupt {
            Some(msg) => Err(VaultError::Corrupt(msg.clone())),
            None => Ok(()),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(VaultError::Corrupt(
                self.corrupt
                    .clone()
                    .unwrap_or_else(|| "vault is read-only after a corruption was detected".into()),
            ));
        }
        Ok(())
    }

    /// Gate for every authenticated operation: enforces auto-lock, rejects
    /// locked sessions, and touches the activity timestamp.
    fn ensure_unlocked(&mut self) -> Result<()> {
        self.guard_corrupt()?;
        if self.root.is_none() {
            return Err(VaultError::NotInitialized);
        }
        let minutes = self.root.as_ref().map_or(0, |r| r.settings.auto_lock_minutes);
        if self.session.enforce_auto_lock(minutes) {
            let now = self.session.now_ms();
            if let Some(root) = self.root.as_mut() {
                if root.settings.enable_audit_log {
                    root.audit_log.push("vault.autolocked", now);
                }
            }
            if !self.read_only {
                if let Err(e) = self.commit() {
                    warn!(error = %e, "failed to persist auto-lock audit record");
                }
            }
            return Err(VaultError::Locked);
        }
        if !self.session.is_unlocked() {
            return Err(VaultError::Locked);
        }
        self.session.touch();
        let last = self.session.last_activity();
        if let Some(root) = self.root.as_mut() {
            root.last_activity = last;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let root = self.root.as_ref().ok_or(VaultError::NotInitialized)?;
        self.store.commit(root)
    }

    /// Promotes an AEAD/framing failure on a stored envelope to
    /// [`VaultError::Corrupt`] and stops accepting writes: a vault whose own
    /// entries no longer open must be rescued, not mutated.
    fn promote_entry_failure(&mut self, id: &str, e: VaultError) -> VaultError {
        match e {
            VaultError::AuthFailure | VaultError::InvalidEnvelope(_) => {
                warn!(entry = id, "stored envelope failed to open; entering read-only mode");
                self.read_only = true;
                VaultError::Corrupt(format!("entry '{id}' cannot be decrypted"))
            }
            other => other,
        }
    }
}

fn missing_verifier() -> VaultError {
    VaultError::Corrupt("initialized vault has no verifier".into())
}

fn has_duplicate_name(entries: &BTreeMap<String, Entry>, candidate: &str, exclude_id: Option<&str>) -> bool {
    let needle = candidate.to_lowercase();
    entries
        .values()
        .filter(|e| exclude_id != Some(e.id.as_str()))
        .any(|e| e.service_name.to_lowercase() == needle)
}

fn available_id(entries: &BTreeMap<String, Entry>, wanted: &str) -> String {
    if !wanted.is_empty() && !entries.contains_key(wanted) {
        wanted.to_string()
    } else {
        Uuid::new_v4().to_string()
    }
}

fn renamed_service(entries: &BTreeMap<String, Entry>, base: &str) -> String {
    let mut candidate = format!("{base} (imported)");
    let mut n = 2;
    while has_duplicate_name(entries, &candidate, None) {
        candidate = format!("{base} (imported {n})");
        n += 1;
    }
    candidate
}

#[cfg(test)]
mod vault_tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn tmp_vault(name: &str) -> Vault {
        let now = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
        let pid = std::process::id();
        let dir = std::env::temp_dir().join(format!("keyvault_lib_{name}_{pid}_{now}"));
        Vault::open(dir.join("vault.json")).unwrap()
    }

    fn cleanup(vault: &Vault) {
        if let Some(dir) = vault.path().parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    fn record(service_name: &str, secret: &str) -> NewEntryRecord {
        NewEntryRecord {
            service_name: service_name.into(),
            secret: secret.into(),
            ..NewEntryRecord::default()
        }
    }

    #[test]
    fn test_initialize_then_status() {
        let mut vault = tmp_vault("init");
        let status = vault.status();
        assert!(!status.initialized);

        vault.initialize("correct horse battery staple").unwrap();
        let status = vault.status();
        assert!(status.initialized);
        assert!(!status.unlocked);
        assert_eq!(status.entry_count, 0);

        assert!(matches!(
            vault.initialize("again").unwrap_err(),
            VaultError::AlreadyInitialized
        ));
        cleanup(&vault);
    }

    #[test]
    fn test_unlock_paths() {
        let mut vault = tmp_vault("unlock");
        assert!(matches!(vault.unlock("pw").unwrap_err(), VaultError::NotInitialized));

        vault.initialize("pw").unwrap();
        assert!(matches!(vault.unlock("wrong").unwrap_err(), VaultError::BadPassword));
        assert!(!vault.is_unlocked());
        assert!(matches!(vault.get("anything").unwrap_err(), VaultError::Locked));

        assert_eq!(vault.unlock("pw").unwrap(), 0);
        assert!(vault.is_unlocked());
        cleanup(&vault);
    }

    #[test]
    fn test_add_get_list_round_trip() {
        let mut vault = tmp_vault("crud");
        vault.initialize("pw").unwrap();
        vault.unlock("pw").unwrap();

        let mut rec = record("OpenAI", "sk-AAA");
        rec.environment = Environment::Development;
        rec.tags = vec!["ai".into()];
        let id = vault.add(rec).unwrap();

        let got = vault.get(&id).unwrap();
        assert_eq!(got.secret, "sk-AAA");
        assert_eq!(got.view.service_name, "OpenAI");

        let filter = EntryFilter {
            environment: Some(Environment::Development),
            ..EntryFilter::default()
        };
        let views = vault.list(&filter).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].service_name, "OpenAI");

        assert!(matches!(vault.get("no-such-id").unwrap_err(), VaultError::NotFound(_)));
        cleanup(&vault);
    }

    #[test]
    fn test_entries_survive_reopen() {
        let mut vault = tmp_vault("persist");
        let path = vault.path().to_path_buf();
        vault.initialize("pw").unwrap();
        vault.unlock("pw").unwrap();
        let id = vault.add(record("Stripe", "sk_live_x")).unwrap();
        drop(vault);

        let mut vault = Vault::open(&path).unwrap();
        vault.unlock("pw").unwrap();
        assert_eq!(vault.get(&id).unwrap().secret, "sk_live_x");
        cleanup(&vault);
    }

    #[test]
    fn test_lock_boundary() {
        let mut vault = tmp_vault("lockb");
        vault.initialize("pw").unwrap();
        vault.unlock("pw").unwrap();
        let id = vault.add(record("Stripe", "sk")).unwrap();

        vault.lock().unwrap();
        assert!(matches!(vault.get(&id).unwrap_err(), VaultError::Locked));
        assert!(matches!(
            vault.list(&EntryFilter::default()).unwrap_err(),
            VaultError::Locked
        ));
        assert!(matches!(vault.add(record("X", "y")).unwrap_err(), VaultError::Locked));

        vault.unlock("pw").unwrap();
        assert_eq!(vault.get(&id).unwrap().secret, "sk");
        cleanup(&vault);
    }

    #[test]
    fn test_update_and_delete() {
        let mut vault = tmp_vault("update");
        vault.initialize("pw").unwrap();
        vault.unlock("pw").unwrap();
        let id = vault.add(record("Stripe", "old-secret")).unwrap();

        vault
            .update(
                &id,
                EntryPatch {
                    secret: Some("new-secret".into()),
                    favorite: Some(true),
                    tags: Some(vec!["payments".into(), "payments".into()]),
                    ..EntryPatch::default()
                },
            )
            .unwrap();

        let got = vault.get(&id).unwrap();
        assert_eq!(got.secret, "new-secret");
        assert!(got.view.favorite);
        assert_eq!(got.view.tags.len(), 1);

        assert!(matches!(
            vault.update(&id, EntryPatch::default()).unwrap_err(),
            VaultError::Validation { field: "patch", .. }
        ));

        vault.delete(&id).unwrap();
        assert!(matches!(vault.get(&id).unwrap_err(), VaultError::NotFound(_)));
        assert!(matches!(vault.delete(&id).unwrap_err(), VaultError::NotFound(_)));
        cleanup(&vault);
    }

    #[test]
    fn test_record_usage_monotone() {
        let mut vault = tmp_vault("usage");
        vault.initialize("pw").unwrap();
        vault.unlock("pw").unwrap();
        let id = vault.add(record("Stripe", "sk")).unwrap();

        let mut previous = 0;
        for _ in 0..3 {
            vault.record_usage(&id, Some("api.stripe.com")).unwrap();
            let view = &vault.get(&id).unwrap().view;
            assert!(view.usage_count > previous);
            previous = view.usage_count;
            assert!(view.last_used_at.unwrap() >= view.created_at);
        }
        let view = &vault.get(&id).unwrap().view;
        assert_eq!(view.usage_count, 3);
        assert!(view.domains.contains("api.stripe.com"));
        assert_eq!(view.domains.len(), 1);

        // Empty domain is ignored.
        vault.record_usage(&id, Some("  ")).unwrap();
        assert_eq!(vault.get(&id).unwrap().view.domains.len(), 1);
        cleanup(&vault);
    }

    #[test]
    fn test_search_across_fields() {
        let mut vault = tmp_vault("search");
        vault.initialize("pw").unwrap();
        vault.unlock("pw").unwrap();
        vault.add(record("Stripe Test", "a")).unwrap();
        vault.add(record("Stripe Live", "b")).unwrap();
        let mut ai = record("OpenAI", "c");
        ai.tags = vec!["ai".into()];
        vault.add(ai).unwrap();

        let hits = vault.search("stripe").unwrap();
        assert_eq!(hits.len(), 2);

        let hits = vault.search("ai").unwrap();
        assert!(hits.iter().any(|v| v.service_name == "OpenAI"));

        assert!(vault.search("nonexistent").unwrap().is_empty());
        cleanup(&vault);
    }

    #[test]
    fn test_change_master_password_rekeys_entries() {
        let mut vault = tmp_vault("rekey");
        let path = vault.path().to_path_buf();
        vault.initialize("old-master").unwrap();
        vault.unlock("old-master").unwrap();
        let id = vault.add(record("Stripe", "token-123")).unwrap();

        vault.change_master_password("old-master", "new-master").unwrap();
        // Session stays usable under the new key.
        assert_eq!(vault.get(&id).unwrap().secret, "token-123");
        drop(vault);

        let mut vault = Vault::open(&path).unwrap();
        assert!(matches!(vault.unlock("old-master").unwrap_err(), VaultError::BadPassword));
        vault.unlock("new-master").unwrap();
        assert_eq!(vault.get(&id).unwrap().secret, "token-123");
        cleanup(&vault);
    }

    #[test]
    fn test_change_master_password_wrong_current() {
        let mut vault = tmp_vault("rekeybad");
        vault.initialize("pw").unwrap();
        assert!(matches!(
            vault.change_master_password("nope", "new").unwrap_err(),
            VaultError::BadPassword
        ));
        cleanup(&vault);
    }

    #[test]
    fn test_export_import_round_trip_under_new_master() {
        let mut v1 = tmp_vault("exp1");
        v1.initialize("master-one").unwrap();
        v1.unlock("master-one").unwrap();
        let id_a = v1.add(record("Alpha", "α-secret")).unwrap();
        v1.add(record("Beta", "β-secret")).unwrap();
        let bytes = v1.export("backup-pw").unwrap();

        let mut v2 = tmp_vault("exp2");
        v2.initialize("master-two").unwrap();
        v2.unlock("master-two").unwrap();
        let report = v2.import(&bytes, "backup-pw", MergePolicy::SkipDuplicate).unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.skipped, 0);

        // Ids preserved into the empty vault; secrets open under master-two.
        assert_eq!(v2.get(&id_a).unwrap().secret, "α-secret");

        assert!(matches!(
            v2.import(&bytes, "wrong-backup-pw", MergePolicy::SkipDuplicate)
                .unwrap_err(),
            VaultError::BadBackupPassword
        ));
        cleanup(&v1);
        cleanup(&v2);
    }

    #[test]
    fn test_import_merge_policies() {
        let mut source = tmp_vault("merge_src");
        source.initialize("m1").unwrap();
        source.unlock("m1").unwrap();
        source.add(record("Shared", "incoming")).unwrap();
        source.add(record("Fresh", "fresh")).unwrap();
        let bytes = source.export("bp").unwrap();

        // Skip.
        let mut target = tmp_vault("merge_skip");
        target.initialize("m2").unwrap();
        target.unlock("m2").unwrap();
        let kept_id = target.add(record("shared", "existing")).unwrap();
        let report = target.import(&bytes, "bp", MergePolicy::SkipDuplicate).unwrap();
        assert_eq!((report.inserted, report.skipped), (1, 1));
        assert_eq!(target.get(&kept_id).unwrap().secret, "existing");
        cleanup(&target);

        // Overwrite keeps the existing id but replaces the secret.
        let mut target = tmp_vault("merge_over");
        target.initialize("m2").unwrap();
        target.unlock("m2").unwrap();
        let kept_id = target.add(record("SHARED", "existing")).unwrap();
        let report = target.import(&bytes, "bp", MergePolicy::Overwrite).unwrap();
        assert_eq!((report.inserted, report.overwritten), (1, 1));
        assert_eq!(target.get(&kept_id).unwrap().secret, "incoming");
        cleanup(&target);

        // Rename leaves the existing entry alone and adds a suffixed copy.
        let mut target = tmp_vault("merge_ren");
        target.initialize("m2").unwrap();
        target.unlock("m2").unwrap();
        let kept_id = target.add(record("Shared", "existing")).unwrap();
        let report = target.import(&bytes, "bp", MergePolicy::Rename).unwrap();
        assert_eq!((report.inserted, report.renamed), (1, 1));
        assert_eq!(target.get(&kept_id).unwrap().secret, "existing");
        let renamed = target.search("imported").unwrap();
        assert_eq!(renamed.len(), 1);
        assert!(renamed[0].service_name.starts_with("Shared (imported"));
        cleanup(&target);
        cleanup(&source);
    }

    #[test]
    fn test_audit_trail_records_actions() {
        let mut vault = tmp_vault("audit");
        vault.initialize("pw").unwrap();
        vault.unlock("pw").unwrap();
        let id = vault.add(record("Stripe", "sk")).unwrap();
        vault.delete(&id).unwrap();
        vault.lock().unwrap();

        let actions: Vec<String> = vault.audit_tail(10).into_iter().map(|r| r.action).collect();
        assert_eq!(
            actions,
            vec![
                "vault.locked",
                "entry.deleted",
                "entry.added",
                "vault.unlocked",
                "vault.initialized"
            ]
        );
        cleanup(&vault);
    }

    #[test]
    fn test_audit_disabled_records_nothing_new() {
        let mut vault = tmp_vault("audit_off");
        vault.initialize("pw").unwrap();
        vault.unlock("pw").unwrap();
        vault
            .update_settings(&SettingsPatch {
                enable_audit_log: Some(false),
                ..SettingsPatch::default()
            })
            .unwrap();
        let before = vault.audit_tail(100).len();
        vault.add(record("Stripe", "sk")).unwrap();
        vault.lock().unwrap();
        assert_eq!(vault.audit_tail(100).len(), before);
        cleanup(&vault);
    }

    #[test]
    fn test_session_token_resume() {
        let mut vault = tmp_vault("token");
        let path = vault.path().to_path_buf();
        vault.initialize("pw").unwrap();
        vault.unlock("pw").unwrap();
        vault.add(record("Stripe", "sk")).unwrap();
        let token = vault.issue_token(60_000).unwrap();
        drop(vault);

        let mut vault = Vault::open(&path).unwrap();
        assert_eq!(vault.resume(&token).unwrap(), 1);
        assert!(vault.is_unlocked());

        // A token from some other vault must not unlock this one.
        let foreign = SessionToken::issue(&KeyMaterial::random(), i64::MAX);
        let mut vault2 = Vault::open(&path).unwrap();
        assert!(matches!(vault2.resume(&foreign).unwrap_err(), VaultError::BadPassword));
        cleanup(&vault);
    }

    #[test]
    fn test_corrupt_root_enters_rescue_mode() {
        let mut vault = tmp_vault("rescue");
        let path = vault.path().to_path_buf();
        vault.initialize("pw").unwrap();
        drop(vault);
        std::fs::write(&path, b"{ definitely not a vault").unwrap();

        let mut vault = Vault::open(&path).unwrap();
        assert!(vault.is_read_only());
        assert!(vault.status().initialized);
        assert!(matches!(vault.unlock("pw").unwrap_err(), VaultError::Corrupt(_)));
        assert!(matches!(vault.initialize("pw").unwrap_err(), VaultError::AlreadyInitialized));

        // Explicit overwrite is the documented way out.
        vault.initialize_with("pw", true).unwrap();
        assert_eq!(vault.unlock("pw").unwrap(), 0);
        cleanup(&vault);
    }

    #[test]
    fn test_tampered_entry_promotes_to_corrupt_and_read_only() {
        let mut vault = tmp_vault("tamper");
        let path = vault.path().to_path_buf();
        vault.initialize("pw").unwrap();
        vault.unlock("pw").unwrap();
        let id = vault.add(record("Stripe", "sk")).unwrap();
        drop(vault);

        // Flip a ciphertext bit directly in the stored JSON.
        let content = std::fs::read_to_string(&path).unwrap();
        let mut root: serde_json::Value = serde_json::from_str(&content).unwrap();
        let ciphertext = root["entries"][id.as_str()]["ciphertext"].as_str().unwrap().to_string();
        let mut bytes = crate::hex::decode(&ciphertext).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        root["entries"][id.as_str()]["ciphertext"] = serde_json::Value::String(crate::hex::encode(&bytes));
        std::fs::write(&path, serde_json::to_string(&root).unwrap()).unwrap();

        let mut vault = Vault::open(&path).unwrap();
        vault.unlock("pw").unwrap();
        assert!(matches!(vault.get(&id).unwrap_err(), VaultError::Corrupt(_)));
        assert!(vault.is_read_only());
        assert!(matches!(vault.add(record("X", "y")).unwrap_err(), VaultError::Corrupt(_)));
        cleanup(&vault);
    }

    #[test]
    fn test_validation_errors() {
        let mut vault = tmp_vault("validation");
        vault.initialize("pw").unwrap();
        vault.unlock("pw").unwrap();

        assert!(matches!(
            vault.add(record("", "secret")).unwrap_err(),
            VaultError::Validation { field: "service_name", .. }
        ));
        assert!(matches!(
            vault.add(record("Stripe", "")).unwrap_err(),
            VaultError::Validation { field: "secret", .. }
        ));
        assert!(matches!(
            vault.export("").unwrap_err(),
            VaultError::Validation { field: "backup_password", .. }
        ));
        cleanup(&vault);
    }
}
