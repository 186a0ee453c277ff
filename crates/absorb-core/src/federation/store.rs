//! Concurrent replicated store.
//!
//! Holds one [`ConvergentEntry`] per key in a `DashMap`; each merge is an
//! atomic read-modify-write under that key's shard lock. Local writes are
//! stamped from a Lamport clock that also advances past every timestamp
//! observed from peers, so a local write always supersedes what this
//! replica has already seen.

use std::cmp::Ordering;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use super::lww::{ConvergentEntry, LamportClock, LwwMap};
use crate::domain::Result;
use crate::metrics::METRICS;
use crate::obs;

#[derive(Debug)]
pub struct ReplicatedStore {
    replica_id: String,
    clock: LamportClock,
    entries: DashMap<String, ConvergentEntry>,
}

impl ReplicatedStore {
    pub fn new(replica_id: impl Into<String>) -> Self {
        Self {
            replica_id: replica_id.into(),
            clock: LamportClock::new(),
            entries: DashMap::new(),
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn logical_time(&self) -> u64 {
        self.clock.now()
    }

    /// Local write.
    pub fn put(&self, key: impl Into<String>, value: Value) -> ConvergentEntry {
        let entry = ConvergentEntry::new(key, value, self.clock.tick(), self.replica_id.clone());
        self.merge_entry(entry.clone());
        entry
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|e| e.value.clone())
    }

    pub fn entry(&self, key: &str) -> Option<ConvergentEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge one remote or local entry. Returns true if local state changed.
    pub fn merge_entry(&self, incoming: ConvergentEntry) -> bool {
        self.clock.observe(incoming.logical_timestamp);
        match self.entries.entry(incoming.key.clone()) {
            Entry::Occupied(mut current) => {
                if incoming.precedence(current.get()) == Ordering::Greater {
                    current.insert(incoming);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(incoming);
                true
            }
        }
    }

    /// Merge a batch received from a peer. Returns how many keys changed.
    pub fn apply(&self, entries: impl IntoIterator<Item = ConvergentEntry>) -> usize {
        let mut received = 0;
        let mut applied = 0;
        for entry in entries {
            received += 1;
            if self.merge_entry(entry) {
                applied += 1;
            }
        }
        METRICS.add_federation_merges(applied as u64);
        obs::emit_federation_merge(&self.replica_id, received, applied);
        applied
    }

    /// Every entry, sorted by key.
    pub fn snapshot(&self) -> Vec<ConvergentEntry> {
        let mut out: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Pull everything `other` knows.
    pub fn merge_from(&self, other: &ReplicatedStore) -> usize {
        self.apply(other.snapshot())
    }

    pub fn to_map(&self) -> LwwMap {
        self.snapshot().into_iter().collect()
    }

    pub fn encode_snapshot(&self) -> Result<String> {
        encode_entries(&self.snapshot())
    }

    pub fn apply_encoded(&self, wire: &str) -> Result<usize> {
        Ok(self.apply(decode_entries(wire)?))
    }
}

/// JSON wire form: an array of `{key, value, logical_timestamp, replica_id}`.
pub fn encode_entries(entries: &[ConvergentEntry]) -> Result<String> {
    Ok(serde_json::to_string(entries)?)
}

pub fn decode_entries(wire: &str) -> Result<Vec<ConvergentEntry>> {
    Ok(serde_json::from_str(wire)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn local_write_supersedes_observed_remote() {
        let store = ReplicatedStore::new("a");
        store.apply([ConvergentEntry::new("k", json!("remote"), 41, "z")]);
        let written = store.put("k", json!("local"));
        assert_eq!(written.logical_timestamp, 42);
        assert_eq!(store.get("k"), Some(json!("local")));
    }

    #[test]
    fn stale_entry_is_ignored() {
        let store = ReplicatedStore::new("a");
        store.put("k", json!(1));
        store.put("k", json!(2));
        assert!(!store.merge_entry(ConvergentEntry::new("k", json!(0), 1, "a")));
        assert_eq!(store.get("k"), Some(json!(2)));
    }

    #[test]
    fn wire_round_trip_preserves_fields() {
        let store = ReplicatedStore::new("east");
        store.put("router/summarize", json!({"a": 0.5, "b": 0.5}));
        let wire = store.encode_snapshot().unwrap();
        assert!(wire.contains("\"logical_timestamp\":1"));
        assert!(wire.contains("\"replica_id\":\"east\""));

        let peer = ReplicatedStore::new("west");
        assert_eq!(peer.apply_encoded(&wire).unwrap(), 1);
        assert_eq!(peer.snapshot(), store.snapshot());
        // replay is idempotent
        assert_eq!(peer.apply_encoded(&wire).unwrap(), 0);
    }

    #[test]
    fn malformed_wire_is_an_error() {
        let store = ReplicatedStore::new("a");
        assert!(store.apply_encoded("{not json").is_err());
    }
}
