//! Bounded entry storage: LRU eviction plus optional TTL.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use super::{CacheEntry, OrgKey};

#[derive(Debug, Clone)]
struct Stored {
    entry: CacheEntry,
    inserted_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Lookup {
    Hit(CacheEntry),
    Expired,
    Miss,
}

/// What an insert displaced, if anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Inserted {
    New,
    Replaced,
    Evicted(OrgKey),
}

#[derive(Debug)]
pub(crate) struct EntryStore {
    entries: LruCache<OrgKey, Stored>,
    ttl: Option<Duration>,
}

impl EntryStore {
    /// `max_entries = None` means unbounded (the in-job configuration).
    pub(crate) fn new(max_entries: Option<NonZeroUsize>, ttl: Option<Duration>) -> Self {
        let entries = match max_entries {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self { entries, ttl }
    }

    pub(crate) fn get(&mut self, key: &OrgKey) -> Lookup {
        let ttl = self.ttl;
        match self.entries.get(key) {
            None => return Lookup::Miss,
            Some(stored) => {
                if !ttl.is_some_and(|ttl| stored.inserted_at.elapsed() >= ttl) {
                    return Lookup::Hit(stored.entry.clone());
                }
            }
        }
        self.entries.pop(key);
        Lookup::Expired
    }

    pub(crate) fn peek(&self, key: &OrgKey) -> Option<&CacheEntry> {
        self.entries.peek(key).map(|stored| &stored.entry)
    }

    pub(crate) fn contains(&self, key: &OrgKey) -> bool {
        self.entries.contains(key)
    }

    pub(crate) fn insert(&mut self, entry: CacheEntry) -> Inserted {
        let key = entry.key.clone();
        let stored = Stored {
            entry,
            inserted_at: Instant::now(),
        };
        match self.entries.push(key.clone(), stored) {
            None => Inserted::New,
            Some((old_key, _)) if old_key == key => Inserted::Replaced,
            Some((evicted, _)) => Inserted::Evicted(evicted),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries from least to most recently used.
    pub(crate) fn snapshot(&self) -> Vec<CacheEntry> {
        self.entries.iter().rev().map(|(_, s)| s.entry.clone()).collect()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
