//! Bounded audit log: an advisory ring of timestamped action tags.

use serde::{Deserialize, Serialize};

/// Maximum records retained; older records are dropped first.
pub const AUDIT_LOG_CAPACITY: usize = 1000;

/// One audit record. `action` is a short, stable, machine-readable tag such
/// as `"vault.unlocked"` or `"entry.added"`; it never carries secret data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditRecord {
    pub action: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Ordered record sequence, oldest first, capped at [`AUDIT_LOG_CAPACITY`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditLog {
    records: Vec<AuditRecord>,
}

impl AuditLog {
    pub fn push(&mut self, action: &str, timestamp: i64) {
        self.records.push(AuditRecord {
            action: action.to_string(),
            timestamp,
        });
        if self.records.len() > AUDIT_LOG_CAPACITY {
            let excess = self.records.len() - AUDIT_LOG_CAPACITY;
            self.records.drain(..excess);
        }
    }

    /// The `n` most recent records, newest first.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<AuditRecord> {
        self.records.iter().rev().take(n).cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
