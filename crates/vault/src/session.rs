//! Session manager: the locked/unlocked state machine that owns the derived
//! key for the lifetime of an unlocked session, tracks activity for
//! auto-lock, and throttles repeated unlock failures.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crypto::KeyMaterial;
use crate::error::{Result, VaultError};

/// Consecutive failed unlocks before an advisory backoff delay kicks in.
pub const FAILED_UNLOCK_THRESHOLD: u32 = 5;
/// Upper bound on the backoff delay.
const BACKOFF_CAP_SECS: u64 = 8;

/// Millisecond wall clock. Abstracted so auto-lock behavior is testable with
/// a manual clock; production code uses [`SystemClock`].
pub trait Clock {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> i64 {
        (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }
}

/// Advisory delay before responding to an unlock attempt, given the number
/// of consecutive failures so far. One second per failure past the
/// threshold, capped; the KDF itself is the real brake.
#[must_use]
pub fn backoff_delay(consecutive_failures: u32) -> Option<Duration> {
    if consecutive_failures < FAILED_UNLOCK_THRESHOLD {
        return None;
    }
    let steps = u64::from(consecutive_failures - FAILED_UNLOCK_THRESHOLD + 1);
    Some(Duration::from_secs(steps.min(BACKOFF_CAP_SECS)))
}

/// Two-state machine: `key.is_some()` is Unlocked, otherwise Locked.
///
/// The cached key is the sole sensitive in-memory state; it is dropped (and
/// thereby zeroized) on every transition to Locked.
#[derive(Debug)]
pub struct SessionManager<C: Clock = SystemClock> {
    key: Option<KeyMaterial>,
    last_activity: i64,
    failed_attempts: u32,
    clock: C,
}

impl<C: Clock> SessionManager<C> {
    pub fn new(clock: C) -> Self {
        let last_activity = clock.now_ms();
        Self {
            key: None,
            last_activity,
            failed_attempts: 0,
            clock,
        }
    }

    #[must_use]
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    #[must_use]
    pub const fn is_unlocked(&self) -> bool {
        self.key.is_some()
    }

    /// The cached derived key.
    ///
    /// # Errors
    /// [`VaultError::Locked`] when no session is active.
    pub fn unlocked_key(&self) -> Result<&KeyMaterial> {
        self.key.as_ref().ok_or(VaultError::Locked)
    }

    /// Transitions to Unlocked with a freshly verified key and resets the
    /// failure counter.
    pub fn begin(&mut self, key: KeyMaterial) {
        self.key = Some(key);
        self.failed_attempts = 0;
        self.touch();
        debug!("session unlocked");
    }

    /// Transitions to Locked; the cached key is zeroized by its drop.
    pub fn lock(&mut self) {
        if self.key.take().is_some() {
            debug!("session locked");
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = self.clock.now_ms();
    }

    #[must_use]
    pub const fn last_activity(&self) -> i64 {
        self.last_activity
    }

    pub fn record_failure(&mut self) -> u32 {
        self.failed_attempts += 1;
        self.failed_attempts
    }

    #[must_use]
    pub const fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Delay to apply before answering the next unlock attempt, if any.
    #[must_use]
    pub fn penalty(&self) -> Option<Duration> {
        backoff_delay(self.failed_attempts)
    }

    /// Whether the idle timeout has elapsed. Zero minutes disables auto-lock.
    #[must_use]
    pub fn auto_lock_due(&self, auto_lock_minutes: u64) -> bool {
        if auto_lock_minutes == 0 || !self.is_unlocked() {
            return false;
        }
        let timeout_ms = i64::try_from(auto_lock_minutes.saturating_mul(60_000)).unwrap_or(i64::MAX);
        self.clock.now_ms() - self.last_activity > timeout_ms
    }

    /// Locks the session when the idle timeout has elapsed. Returns whether a
    /// transition happened.
    pub fn enforce_auto_lock(&mut self, auto_lock_minutes: u64) -> bool {
        if self.auto_lock_due(auto_lock_minutes) {
            info!("auto-lock fired after inactivity");
            self.lock();
            true
        } else {
            false
        }
    }
}

/// Short-lived, file-backed session token for hosts that cannot hold process
/// memory between invocations (the CLI). Holds the derived key and an
/// absolute expiry; callers must revalidate the key against the vault's
/// verifier before trusting it.
#[derive(Serialize, Deserialize)]
pub struct SessionToken {
    #[serde(with = "crate::hex::serde_hex")]
    key: Vec<u8>,
    pub expires_at: i64,
}

impl SessionToken {
    #[must_use]
    pub fn issue(key: &KeyMaterial, expires_at: i64) -> Self {
        Self {
            key: key.0.to_vec(),
            expires_at,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }

    /// # Errors
    /// [`VaultError::Corrupt`] when the stored key has the wrong length.
    pub fn key_material(&self) -> Result<KeyMaterial> {
        KeyMaterial::from_bytes(&self.key)
    }

    /// Reads a token from `path`. A missing or unreadable token is treated as
    /// absent (the host simply has to prompt again), never as an error.
    #[must_use]
    pub fn load(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(token) => Some(token),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "discarding unreadable session token");
                std::fs::remove_file(path).ok();
                None
            }
        }
    }

    /// Writes the token with owner-only permissions on Unix.
    ///
    /// # Errors
    /// I/O and serialization failures.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string(self)?;
        std::fs::write(path, content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn delete(path: &Path) {
        std::fs::remove_file(path).ok();
    }
}

impl Drop for SessionToken {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.key.zeroize();
    }
}
