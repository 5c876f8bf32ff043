//! Entry data model: the stored record, its metadata-only view, and the
//! normalized input/patch shapes hosts hand to the vault API.

use std::collections::BTreeSet;
use std::str::FromStr;

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

/// Deployment environment an API credential belongs to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
    Staging,
    Testing,
}

impl Environment {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Testing => "testing",
        }
    }

    #[must_use]
    pub const fn all() -> &'static [Environment] {
        &[
            Environment::Production,
            Environment::Development,
            Environment::Staging,
            Environment::Testing,
        ]
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            "staging" | "stage" => Ok(Environment::Staging),
            "testing" | "test" => Ok(Environment::Testing),
            other => Err(VaultError::validation(
                "environment",
                format!("unknown environment '{other}'"),
            )),
        }
    }
}

/// Display-hint palette entries are assigned from at creation.
pub const COLOR_PALETTE: [&str; 8] = [
    "#e74c3c", "#e67e22", "#f1c40f", "#2ecc71", "#1abc9c", "#3498db", "#9b59b6", "#e84393",
];

#[must_use]
pub fn random_color() -> String {
    COLOR_PALETTE
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(COLOR_PALETTE[0])
        .to_string()
}

/// One stored secret. The plaintext only ever exists inside `ciphertext`,
/// an envelope produced by the entry codec; everything else is metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub service_name: String,
    #[serde(with = "crate::hex::serde_hex")]
    pub ciphertext: Vec<u8>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub domains: BTreeSet<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub favorite: bool,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    #[serde(default)]
    pub last_used_at: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub rate_limit: String,
    /// Fields written by newer versions survive a round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Entry {
    /// Metadata-only projection, safe to surface to any host UI.
    #[must_use]
    pub fn view(&self) -> EntryView {
        EntryView {
            id: self.id.clone(),
            service_name: self.service_name.clone(),
            environment: self.environment,
            tags: self.tags.clone(),
            domains: self.domains.clone(),
            notes: self.notes.clone(),
            color: self.color.clone(),
            favorite: self.favorite,
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            expires_at: self.expires_at,
            usage_count: self.usage_count,
            rate_limit: self.rate_limit.clone(),
        }
    }
}

/// An [`Entry`] minus its ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryView {
    pub id: String,
    pub service_name: String,
    pub environment: Environment,
    pub tags: BTreeSet<String>,
    pub domains: BTreeSet<String>,
    pub notes: String,
    pub color: String,
    pub favorite: bool,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub usage_count: u64,
    pub rate_limit: String,
}

/// A decrypted entry as returned by `get`: the metadata view plus the secret.
/// The plaintext is the caller's responsibility once handed off.
#[derive(Debug, Clone)]
pub struct DecryptedEntry {
    pub view: EntryView,
    pub secret: String,
}

/// Normalized input record for `add` (and for the import boundary adapters).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewEntryRecord {
    pub service_name: String,
    pub secret: String,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub rate_limit: String,
    #[serde(default)]
    pub favorite: bool,
}

impl NewEntryRecord {
    /// # Errors
    /// Returns [`VaultError::Validation`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(VaultError::validation("service_name", "must not be empty"));
        }
        if self.secret.is_empty() {
            return Err(VaultError::validation("secret", "must not be empty"));
        }
        Ok(())
    }
}

/// Partial update for `update`; `None` leaves a field untouched.
///
/// `expires_at` is doubly optional so a patch can distinguish "leave alone"
/// from "clear the expiry".
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    pub service_name: Option<String>,
    pub secret: Option<String>,
    pub environment: Option<Environment>,
    pub tags: Option<Vec<String>>,
    pub domains: Option<Vec<String>>,
    pub notes: Option<String>,
    pub expires_at: Option<Option<i64>>,
    pub rate_limit: Option<String>,
    pub favorite: Option<bool>,
}

impl EntryPatch {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.service_name.is_none()
            && self.secret.is_none()
            && self.environment.is_none()
            && self.tags.is_none()
            && self.domains.is_none()
            && self.notes.is_none()
            && self.expires_at.is_none()
            && self.rate_limit.is_none()
            && self.favorite.is_none()
    }
}

/// Collapses duplicates and trims whitespace; empty items are dropped.
#[must_use]
pub fn normalize_set(items: &[String]) -> BTreeSet<String> {
    items
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
