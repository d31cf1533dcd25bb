//! The coordinator's copy of the cache.
//!
//! Single writer. Workers' discoveries are folded in once per finished
//! chunk; the insertion order doubles as a log so each worker can be sent
//! only what it has not seen yet.

use std::collections::HashMap;

use tracing::warn;

use super::{CacheEntry, OrgKey};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub added: usize,
    pub conflicts: usize,
}

#[derive(Debug, Default, Clone)]
pub struct CanonicalOrgCache {
    entries: HashMap<OrgKey, CacheEntry>,
    order: Vec<OrgKey>,
}

impl CanonicalOrgCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = CacheEntry>) -> Self {
        let mut cache = Self::new();
        cache.merge(entries);
        cache
    }

    /// Fold entries in. Keys already present keep their first value.
    pub fn merge(&mut self, entries: impl IntoIterator<Item = CacheEntry>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for entry in entries {
            match self.entries.get(&entry.key) {
                Some(existing) if existing.org_id != entry.org_id => {
                    warn!(
                        key = %entry.key,
                        kept = %existing.org_id,
                        discarded = %entry.org_id,
                        "conflicting organization cache entry, keeping the earliest"
                    );
                    outcome.conflicts += 1;
                }
                Some(_) => {}
                None => {
                    self.order.push(entry.key.clone());
                    self.entries.insert(entry.key.clone(), entry);
                    outcome.added += 1;
                }
            }
        }
        outcome
    }

    pub fn get(&self, key: &OrgKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Entries added at or after position `cursor`, in insertion order.
    pub fn since(&self, cursor: usize) -> Vec<CacheEntry> {
        self.order
            .iter()
            .skip(cursor)
            .filter_map(|key| self.entries.get(key).cloned())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.since(0)
    }
}
