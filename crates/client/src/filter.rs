//! Subscription filters.
//!
//! A filter describes which events a caller wants. The same value drives
//! both sides of the data flow: serialized into REQ frames for relays, and
//! evaluated locally against cached events via [`Filter::matches`], so local
//! and remote result sets are directly comparable.

use chateau_core::Event;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Query descriptor for events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event ids
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Author pubkeys
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Events at or after this timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events at or before this timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Referenced-tag queries, keyed `#<name>` as on the wire
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    /// An empty filter matches every event.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a referenced-tag condition. `name` is the bare tag letter.
    pub fn tag(
        mut self,
        name: &str,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let key = if name.starts_with('#') {
            name.to_string()
        } else {
            format!("#{name}")
        };
        self.tags
            .insert(key, values.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by `#e` (referenced event) tags.
    pub fn event_refs(self, event_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag("e", event_ids)
    }

    /// Filter by `#p` (referenced pubkey) tags.
    pub fn pubkey_refs(self, pubkeys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag("p", pubkeys)
    }

    /// Evaluate this filter against a single event. `limit` is a query-time
    /// bound, not a per-event predicate, so it plays no part here.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref ids) = self.ids {
            if !ids.iter().any(|id| *id == event.id) {
                return false;
            }
        }

        if let Some(ref authors) = self.authors {
            if !authors.iter().any(|a| *a == event.pubkey) {
                return false;
            }
        }

        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }

        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }

        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }

        for (key, wanted) in &self.tags {
            let Some(name) = key.strip_prefix('#') else {
                continue;
            };
            let mut values = event.tag_values(name);
            if !values.any(|v| wanted.iter().any(|w| w == v)) {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: u16, pubkey: &str, created_at: u64, tags: Vec<Vec<String>>) -> Event {
        Event {
            id: format!("{kind}-{pubkey}-{created_at}"),
            pubkey: pubkey.to_string(),
            created_at,
            kind,
            tags,
            content: String::new(),
            sig: "00".repeat(64),
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(Filter::new().matches(&event(1, "alice", 100, vec![])));
    }

    #[test]
    fn kind_author_and_time_bounds() {
        let filter = Filter::new()
            .kinds([1, 11])
            .authors(["alice"])
            .since(50)
            .until(150);

        assert!(filter.matches(&event(11, "alice", 100, vec![])));
        assert!(!filter.matches(&event(7, "alice", 100, vec![])));
        assert!(!filter.matches(&event(11, "bob", 100, vec![])));
        assert!(!filter.matches(&event(11, "alice", 49, vec![])));
        assert!(!filter.matches(&event(11, "alice", 151, vec![])));
    }

    #[test]
    fn tag_conditions_require_a_matching_value() {
        let filter = Filter::new().tag("h", ["communityX"]);
        let tagged = event(
            11,
            "alice",
            100,
            vec![vec!["h".to_string(), "communityX".to_string()]],
        );
        let untagged = event(11, "alice", 100, vec![]);
        let wrong = event(
            11,
            "alice",
            100,
            vec![vec!["h".to_string(), "communityY".to_string()]],
        );

        assert!(filter.matches(&tagged));
        assert!(!filter.matches(&untagged));
        assert!(!filter.matches(&wrong));
    }

    #[test]
    fn serializes_like_the_wire_format() {
        let filter = Filter::new()
            .kinds([9735])
            .event_refs(["abc"])
            .limit(10);
        let json = serde_json::to_string(&filter).unwrap();

        assert!(json.contains("\"kinds\":[9735]"));
        assert!(json.contains("\"#e\":[\"abc\"]"));
        assert!(json.contains("\"limit\":10"));
        assert!(!json.contains("authors"));

        // And round-trips: the local and relay-side views stay comparable.
        let back: Filter = serde_json::from_str(&json).unwrap();
        assert_eq!(filter, back);
    }

    #[test]
    fn limit_does_not_reject_events() {
        let filter = Filter::new().limit(1);
        assert!(filter.matches(&event(1, "a", 1, vec![])));
        assert!(filter.matches(&event(1, "b", 2, vec![])));
    }
}
