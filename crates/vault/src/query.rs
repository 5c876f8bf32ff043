//! Metadata-only views over the entry map: filtering, fuzzy search, and the
//! default ordering. Nothing in this module touches ciphertext.

use std::cmp::Ordering;

use crate::entry::{Entry, EntryView, Environment};

const DAY_MS: i64 = 86_400_000;

/// Filter criteria for `list`. All present criteria must match.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    /// Keep entries whose `domains` contains this hostname.
    pub domain: Option<String>,
    pub environment: Option<Environment>,
    pub tag: Option<String>,
    /// `true` keeps only favorites; `false` applies no favorite filter.
    pub favorite: bool,
    /// Keep entries expiring within this many days of `now`.
    pub expired_within_days: Option<u64>,
}

impl EntryFilter {
    #[must_use]
    pub fn matches(&self, entry: &Entry, now_ms: i64) -> bool {
        if let Some(domain) = &self.domain {
            if !entry.domains.iter().any(|d| d.eq_ignore_ascii_case(domain)) {
                return false;
            }
        }
        if let Some(environment) = self.environment {
            if entry.environment != environment {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !entry.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
                return false;
            }
        }
        if self.favorite && !entry.favorite {
            return false;
        }
        if let Some(days) = self.expired_within_days {
            let horizon = now_ms.saturating_add(i64::try_from(days).unwrap_or(i64::MAX).saturating_mul(DAY_MS));
            match entry.expires_at {
                Some(expires_at) if expires_at <= horizon => {}
                _ => return false,
            }
        }
        true
    }
}

/// Case-insensitive substring match over `service_name`, `tags`,
/// `environment`, and `notes`.
#[must_use]
pub fn search_matches(entry: &Entry, query: &str) -> bool {
    let needle = query.to_lowercase();
    if needle.is_empty() {
        return false;
    }
    entry.service_name.to_lowercase().contains(&needle)
        || entry.tags.iter().any(|t| t.to_lowercase().contains(&needle))
        || entry.environment.as_str().contains(&needle)
        || entry.notes.to_lowercase().contains(&needle)
}

/// Default listing order: favorites first, then `last_used_at` descending
/// with never-used entries last, then `created_at` descending; ties break
/// lexicographically on id.
pub fn sort_views(views: &mut [EntryView]) {
    views.sort_by(compare_views);
}

fn compare_views(a: &EntryView, b: &EntryView) -> Ordering {
    b.favorite
        .cmp(&a.favorite)
        .then_with(|| match (a.last_used_at, b.last_used_at) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::collections::BTreeSet;

    fn entry(id: &str, service_name: &str) -> Entry {
        Entry {
            id: id.into(),
            service_name: service_name.into(),
            ciphertext: vec![0; 47],
            environment: Environment::Production,
            tags: BTreeSet::new(),
            domains: BTreeSet::new(),
            notes: String::new(),
            color: String::new(),
            favorite: false,
            created_at: 0,
            last_used_at: None,
            expires_at: None,
            usage_count: 0,
            rate_limit: String::new(),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_filter_domain_case_insensitive() {
        let mut e = entry("a", "Stripe");
        e.domains.insert("API.Stripe.com".into());

        let filter = EntryFilter {
            domain: Some("api.stripe.com".into()),
            ..EntryFilter::default()
        };
        assert!(filter.matches(&e, 0));

        let filter = EntryFilter {
            domain: Some("api.github.com".into()),
            ..EntryFilter::default()
        };
        assert!(!filter.matches(&e, 0));
    }

    #[test]
    fn test_filter_environment_and_tag() {
        let mut e = entry("a", "OpenAI");
        e.environment = Environment::Development;
        e.tags.insert("ai".into());

        let filter = EntryFilter {
            environment: Some(Environment::Development),
            tag: Some("AI".into()),
            ..EntryFilter::default()
        };
        assert!(filter.matches(&e, 0));

        let filter = EntryFilter {
            environment: Some(Environment::Production),
            ..EntryFilter::default()
        };
        assert!(!filter.matches(&e, 0));
    }

    #[test]
    fn test_filter_favorite() {
        let mut e = entry("a", "Stripe");
        let filter = EntryFilter {
            favorite: true,
            ..EntryFilter::default()
        };
        assert!(!filter.matches(&e, 0));
        e.favorite = true;
        assert!(filter.matches(&e, 0));
    }

    #[test]
    fn test_filter_expired_within_days() {
        let now = 1_000 * DAY_MS;
        let mut e = entry("a", "Stripe");
        let filter = EntryFilter {
            expired_within_days: Some(3),
            ..EntryFilter::default()
        };

        // No expiry never matches the expiring filter.
        assert!(!filter.matches(&e, now));

        e.expires_at = Some(now + 2 * DAY_MS);
        assert!(filter.matches(&e, now));

        e.expires_at = Some(now + 4 * DAY_MS);
        assert!(!filter.matches(&e, now));

        // Already expired still counts as "expiring within".
        e.expires_at = Some(now - DAY_MS);
        assert!(filter.matches(&e, now));
    }

    #[test]
    fn test_search_over_all_fields() {
        let mut e = entry("a", "Stripe Test");
        e.tags.insert("payments".into());
        e.notes = "Rotate quarterly".into();
        e.environment = Environment::Staging;

        assert!(search_matches(&e, "stripe"));
        assert!(search_matches(&e, "PAYMENTS"));
        assert!(search_matches(&e, "rotate"));
        assert!(search_matches(&e, "staging"));
        assert!(!search_matches(&e, "github"));
        assert!(!search_matches(&e, ""));
    }

    #[test]
    fn test_default_ordering() {
        let mut favorite_old = entry("d", "favorite-old").view();
        favorite_old.favorite = true;
        favorite_old.created_at = 10;

        let mut used_recently = entry("c", "used-recently").view();
        used_recently.created_at = 20;
        used_recently.last_used_at = Some(500);

        let mut used_earlier = entry("b", "used-earlier").view();
        used_earlier.created_at = 30;
        used_earlier.last_used_at = Some(100);

        let mut never_used_new = entry("a", "never-used-new").view();
        never_used_new.created_at = 40;

        let mut views = vec![used_earlier, never_used_new, favorite_old, used_recently];
        sort_views(&mut views);

        let ids: Vec<&str> = views.iter().map(|v| v.id.as_str()).collect();
        // Favorite first, then by recency of use, then unused by creation.
        assert_eq!(ids, vec!["d", "c", "b", "a"]);
    }

    #[test]
    fn test_ordering_ties_break_on_id() {
        let mut x = entry("x", "same").view();
        x.created_at = 10;
        let mut w = entry("w", "same").view();
        w.created_at = 10;

        let mut views = vec![x, w];
        sort_views(&mut views);
        assert_eq!(views[0].id, "w");
        assert_eq!(views[1].id, "x");
    }
}
