//! Filter model and the shared filter store.
//!
//! Clients submit filters as URL-encoded query lines (`label=k%3Dv&name=svc`).
//! A [`Filter`] is the canonicalized form: each key mapped to its set of
//! values, with a deterministic JSON serialization that doubles as the
//! identity for deduplication and as the payload handed to the container
//! runtime.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::errors::FilterError;

/// A predicate over runtime resources: filter keys mapped to value sets.
///
/// Two filters with the same keys and values compare equal regardless of
/// the order they arrived in on the wire.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Filter {
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl Filter {
    /// Parse a URL-encoded query line (`key=value&key=value`).
    ///
    /// Percent-escapes are decoded; values are opaque, so `label=k=v`
    /// yields the value `k=v` under `label`. Lines without any `=` are
    /// rejected as malformed.
    pub fn parse(line: &str) -> Result<Self, FilterError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(FilterError::Empty);
        }
        if !line.contains('=') {
            return Err(FilterError::Malformed(line.to_string()));
        }

        let mut entries: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (key, value) in url::form_urlencoded::parse(line.as_bytes()) {
            if key.is_empty() {
                continue;
            }
            entries
                .entry(key.into_owned())
                .or_default()
                .insert(value.into_owned());
        }
        if entries.is_empty() {
            return Err(FilterError::Malformed(line.to_string()));
        }

        Ok(Self { entries })
    }

    /// Clone of this filter with `value` added under `key`.
    ///
    /// The original filter is left untouched; the clone has its own
    /// canonical identity.
    pub fn with(&self, key: &str, value: &str) -> Self {
        let mut augmented = self.clone();
        augmented
            .entries
            .entry(key.to_string())
            .or_default()
            .insert(value.to_string());
        augmented
    }

    /// Values registered under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.entries.get(key)
    }

    /// Canonical JSON form, e.g. `{"label":{"foo=bar":true},"name":{"svc":true}}`.
    ///
    /// Keys and inner keys are emitted in sorted order; equal filters
    /// produce byte-identical output.
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Filter payload in the shape the runtime's list APIs expect.
    pub fn to_args(&self) -> HashMap<String, Vec<String>> {
        self.entries
            .iter()
            .map(|(key, values)| (key.clone(), values.iter().cloned().collect()))
            .collect()
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, values) in &self.entries {
            let inner: BTreeMap<&str, bool> =
                values.iter().map(|value| (value.as_str(), true)).collect();
            map.serialize_entry(key, &inner)?;
        }
        map.end()
    }
}

/// Thread-safe set of canonicalized filters.
///
/// Client sessions call [`add`](FilterStore::add) concurrently; the pruner
/// takes a [`snapshot`](FilterStore::snapshot) once the listener is closed.
/// The lock is held only for the duration of an insert or a copy.
#[derive(Debug, Default)]
pub struct FilterStore {
    filters: Mutex<BTreeSet<Filter>>,
}

impl FilterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and insert a filter line.
    ///
    /// Returns `Ok(true)` when the canonical form was new, `Ok(false)` for
    /// a duplicate (a no-op).
    pub async fn add(&self, line: &str) -> Result<bool, FilterError> {
        let filter = Filter::parse(line)?;
        Ok(self.filters.lock().await.insert(filter))
    }

    /// Copy of the current filter set, in canonical order.
    pub async fn snapshot(&self) -> Vec<Filter> {
        self.filters.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.filters.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.filters.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- Parsing and canonicalization ---

    #[test]
    fn parses_single_pair() {
        let filter = Filter::parse("label=k=v").unwrap();
        assert_eq!(filter.canonical(), r#"{"label":{"k=v":true}}"#);
    }

    #[test]
    fn canonical_form_sorts_keys_and_values() {
        let filter = Filter::parse("name=svc&label=foo=bar").unwrap();
        assert_eq!(
            filter.canonical(),
            r#"{"label":{"foo=bar":true},"name":{"svc":true}}"#
        );
    }

    #[test]
    fn canonicalization_is_order_insensitive() {
        let a = Filter::parse("a=1&b=2").unwrap();
        let b = Filter::parse("b=2&a=1").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn repeated_keys_collect_into_a_value_set() {
        let filter = Filter::parse("label=a&label=b&label=a").unwrap();
        assert_eq!(filter.canonical(), r#"{"label":{"a":true,"b":true}}"#);
    }

    #[test]
    fn percent_escapes_are_decoded() {
        let filter = Filter::parse("label=k%3Dv").unwrap();
        assert_eq!(filter.canonical(), r#"{"label":{"k=v":true}}"#);
    }

    #[test]
    fn empty_line_is_rejected() {
        assert!(matches!(Filter::parse(""), Err(FilterError::Empty)));
        assert!(matches!(Filter::parse("   "), Err(FilterError::Empty)));
    }

    #[test]
    fn line_without_pairs_is_malformed() {
        assert!(matches!(
            Filter::parse("just some text"),
            Err(FilterError::Malformed(_))
        ));
    }

    #[test]
    fn with_augments_a_clone_only() {
        let filter = Filter::parse("label=a").unwrap();
        let augmented = filter.with("all", "true");
        assert_eq!(filter.canonical(), r#"{"label":{"a":true}}"#);
        assert_eq!(
            augmented.canonical(),
            r#"{"all":{"true":true},"label":{"a":true}}"#
        );
    }

    #[test]
    fn to_args_exposes_all_values() {
        let filter = Filter::parse("label=a&label=b&name=svc").unwrap();
        let args = filter.to_args();
        assert_eq!(args["label"], vec!["a".to_string(), "b".to_string()]);
        assert_eq!(args["name"], vec!["svc".to_string()]);
    }

    // --- Store semantics ---

    #[tokio::test]
    async fn add_is_idempotent() {
        let store = FilterStore::new();
        assert!(store.add("label=a").await.unwrap());
        assert!(!store.add("label=a").await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn add_deduplicates_reordered_pairs() {
        let store = FilterStore::new();
        assert!(store.add("a=1&b=2").await.unwrap());
        assert!(!store.add("b=2&a=1").await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn snapshot_is_a_copy() {
        let store = FilterStore::new();
        store.add("label=a").await.unwrap();
        let snapshot = store.snapshot().await;
        store.add("label=b").await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn bad_lines_leave_the_store_untouched() {
        let store = FilterStore::new();
        assert!(store.add("").await.is_err());
        assert!(store.add("nonsense").await.is_err());
        assert!(store.is_empty().await);
    }
}
