//! Vault settings: persisted alongside the entries, distinct from any
//! host-side preference file.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    Auto,
}

impl Theme {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
            Theme::Auto => "auto",
        }
    }
}

impl FromStr for Theme {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "light" => Ok(Theme::Light),
            "dark" => Ok(Theme::Dark),
            "auto" => Ok(Theme::Auto),
            other => Err(VaultError::validation("theme", format!("unknown theme '{other}'"))),
        }
    }
}

/// Configuration stored in the vault root. Timeout fields are non-negative
/// by construction; zero disables the corresponding behavior.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultSettings {
    /// Idle minutes before auto-lock; 0 disables.
    pub auto_lock_minutes: u64,
    /// Advisory to hosts; the core never touches the clipboard.
    pub clipboard_clear_seconds: u64,
    /// Display hint: hosts should mask key values by default.
    pub mask_keys: bool,
    pub enable_audit_log: bool,
    /// Host hint.
    pub enable_auto_fill: bool,
    /// Host hint.
    pub show_usage_stats: bool,
    /// Host hint.
    pub show_expiration_warnings: bool,
    pub expiration_warning_days: u64,
    pub theme: Theme,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            auto_lock_minutes: 15,
            clipboard_clear_seconds: 30,
            mask_keys: true,
            enable_audit_log: true,
            enable_auto_fill: true,
            show_usage_stats: true,
            show_expiration_warnings: true,
            expiration_warning_days: 14,
            theme: Theme::Auto,
            extra: serde_json::Map::new(),
        }
    }
}

/// Partial settings update; `None` leaves a field untouched.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Default)]
pub struct SettingsPatch {
    pub auto_lock_minutes: Option<u64>,
    pub clipboard_clear_seconds: Option<u64>,
    pub mask_keys: Option<bool>,
    pub enable_audit_log: Option<bool>,
    pub enable_auto_fill: Option<bool>,
    pub show_usage_stats: Option<bool>,
    pub show_expiration_warnings: Option<bool>,
    pub expiration_warning_days: Option<u64>,
    pub theme: Option<Theme>,
}

impl SettingsPatch {
    pub fn apply(&self, settings: &mut VaultSettings) {
        if let Some(v) = self.auto_lock_minutes {
            settings.auto_lock_minutes = v;
        }
        if let Some(v) = self.clipboard_clear_seconds {
            settings.clipboard_clear_seconds = v;
        }
        if let Some(v) = self.mask_keys {
            settings.mask_keys = v;
        }
        if let Some(v) = self.enable_audit_log {
            settings.enable_audit_log = v;
        }
        if let Some(v) = self.enable_auto_fill {
            settings.enable_auto_fill = v;
        }
        if let Some(v) = self.show_usage_stats {
            settings.show_usage_stats = v;
        }
        if let Some(v) = self.show_expiration_warnings {
            settings.show_expiration_warnings = v;
        }
        if let Some(v) = self.expiration_warning_days {
            settings.expiration_warning_days = v;
        }
        if let Some(v) = self.theme {
            settings.theme = v;
        }
    }
}
