//! Last-writer-wins register map.
//!
//! Entries are totally ordered by `(logical_timestamp, replica_id, value)`,
//! where the value is compared by its canonical JSON encoding. Merging keeps
//! the greater entry per key, so merge is commutative, associative and
//! idempotent.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lamport logical clock.
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> u64 {
        self.counter.load(AtomicOrdering::SeqCst)
    }

    /// Advance for a local write and return the new timestamp.
    pub fn tick(&self) -> u64 {
        self.counter.fetch_add(1, AtomicOrdering::SeqCst) + 1
    }

    /// Advance to at least `seen`.
    pub fn observe(&self, seen: u64) {
        self.counter.fetch_max(seen, AtomicOrdering::SeqCst);
    }
}

/// One replicated key. Also the federation wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergentEntry {
    pub key: String,
    pub value: Value,
    pub logical_timestamp: u64,
    pub replica_id: String,
}

impl ConvergentEntry {
    pub fn new(
        key: impl Into<String>,
        value: Value,
        logical_timestamp: u64,
        replica_id: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            logical_timestamp,
            replica_id: replica_id.into(),
        }
    }

    /// Total order used by the merge.
    pub fn precedence(&self, other: &Self) -> Ordering {
        self.logical_timestamp
            .cmp(&other.logical_timestamp)
            .then_with(|| self.replica_id.cmp(&other.replica_id))
            .then_with(|| canonical_json(&self.value).cmp(&canonical_json(&other.value)))
    }
}

/// serde_json maps are sorted by key, so this encoding is canonical.
fn canonical_json(value: &Value) -> String {
    value.to_string()
}

/// Pure merge of two entries for the same key.
pub fn merge_entries(a: &ConvergentEntry, b: &ConvergentEntry) -> ConvergentEntry {
    debug_assert_eq!(a.key, b.key);
    if b.precedence(a) == Ordering::Greater {
        b.clone()
    } else {
        a.clone()
    }
}

/// Map of last-writer-wins registers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LwwMap {
    entries: BTreeMap<String, ConvergentEntry>,
}

impl LwwMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one entry. Returns true if it replaced or created the key.
    pub fn merge_entry(&mut self, entry: ConvergentEntry) -> bool {
        match self.entries.get(&entry.key) {
            Some(current) if entry.precedence(current) != Ordering::Greater => false,
            _ => {
                self.entries.insert(entry.key.clone(), entry);
                true
            }
        }
    }

    /// Pointwise maximum of `self` and `other`, stored in `self`.
    pub fn merge(&mut self, other: &LwwMap) {
        for entry in other.entries.values() {
            self.merge_entry(entry.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn entry(&self, key: &str) -> Option<&ConvergentEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ConvergentEntry> {
        self.entries.values()
    }
}

impl FromIterator<ConvergentEntry> for LwwMap {
    fn from_iter<I: IntoIterator<Item = ConvergentEntry>>(iter: I) -> Self {
        let mut map = LwwMap::new();
        for entry in iter {
            map.merge_entry(entry);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn later_timestamp_wins() {
        let a = ConvergentEntry::new("k", json!(1), 1, "z");
        let b = ConvergentEntry::new("k", json!(2), 2, "a");
        assert_eq!(merge_entries(&a, &b), b);
        assert_eq!(merge_entries(&b, &a), b);
    }

    #[test]
    fn replica_id_breaks_timestamp_ties() {
        let a = ConvergentEntry::new("k", json!("x"), 5, "cluster-a");
        let b = ConvergentEntry::new("k", json!("y"), 5, "cluster-b");
        assert_eq!(merge_entries(&a, &b).value, json!("y"));
        assert_eq!(merge_entries(&b, &a).value, json!("y"));
    }

    #[test]
    fn value_breaks_full_ties() {
        let a = ConvergentEntry::new("k", json!({"w": 0.2}), 5, "r");
        let b = ConvergentEntry::new("k", json!({"w": 0.8}), 5, "r");
        assert_eq!(merge_entries(&a, &b), merge_entries(&b, &a));
    }

    #[test]
    fn absent_side_takes_present() {
        let mut left = LwwMap::new();
        let right: LwwMap = [ConvergentEntry::new("k", json!(true), 1, "r")]
            .into_iter()
            .collect();
        left.merge(&right);
        assert_eq!(left.get("k"), Some(&json!(true)));
        assert_eq!(left.get("missing"), None);
    }

    #[test]
    fn lamport_observe_never_goes_back() {
        let clock = LamportClock::new();
        assert_eq!(clock.tick(), 1);
        clock.observe(10);
        assert_eq!(clock.tick(), 11);
        clock.observe(3);
        assert_eq!(clock.now(), 11);
    }
}
