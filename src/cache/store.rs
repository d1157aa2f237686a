//! Cache Store Module
//!
//! In-memory tier: recency-ordered entries, adaptive expiry and
//! memory-pressure eviction. Purely synchronous; every time-dependent method
//! takes `now` in Unix milliseconds.

use std::collections::HashSet;

use chrono::Utc;

use crate::cache::policy::{compute_ttl, eviction_score};
use crate::cache::{CacheEntry, CacheStats, RecencyMap};
use crate::config::CacheConfig;

/// Fraction of `max_size` evicted once memory pressure is reached.
const EVICTION_FRACTION: f64 = 0.2;

// == Lookup Result ==
/// Outcome of a memory-tier lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<V> {
    /// Fresh entry, already touched; carries the updated copy
    Hit(CacheEntry<V>),
    /// Entry was present but past its TTL and has been removed
    Expired,
    /// No entry for the key
    Missing,
}

// == Insertion Result ==
/// What an insert did to the tier.
#[derive(Debug, Clone)]
pub struct Insertion<V> {
    /// Copy of the entry now stored
    pub entry: CacheEntry<V>,
    /// Keys evicted to make room, lowest score first
    pub evicted: Vec<String>,
}

/// Removals made while the startup restore is still pending.
#[derive(Debug, Default)]
struct PendingRestore {
    /// Keys deleted since startup
    removed: HashSet<String>,
    /// Set once `clear()` ran
    cleared: bool,
}

// == Cache Store ==
/// In-memory cache tier with adaptive TTL and pressure-based eviction.
#[derive(Debug)]
pub struct CacheStore<V> {
    /// Entries in recency order
    entries: RecencyMap<V>,
    /// Performance statistics
    stats: CacheStats,
    /// Instance configuration
    config: CacheConfig,
    /// Removals to honor in the next `restore`, `None` when none is pending
    pending_restore: Option<PendingRestore>,
}

impl<V: Clone> CacheStore<V> {
    // == Constructor ==
    /// Creates an empty store governed by `config`.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RecencyMap::new(),
            stats: CacheStats::new(),
            config,
            pending_restore: None,
        }
    }

    /// Returns the configuration of this store.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // == Lookup ==
    /// Looks up `key` without touching the hit/miss counters.
    ///
    /// A fresh entry is touched (access count, last access, recency tail).
    /// An expired entry is removed before returning [`Lookup::Expired`].
    pub fn lookup(&mut self, key: &str, now: i64) -> Lookup<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.is_expired(compute_ttl(&self.config, entry), now),
            None => return Lookup::Missing,
        };

        if expired {
            self.entries.remove(key);
            self.note_removed(key);
            self.refresh_occupancy();
            return Lookup::Expired;
        }

        let snapshot = match self.entries.get_mut(key) {
            Some(entry) => {
                entry.touch(now);
                entry.clone()
            }
            None => return Lookup::Missing,
        };
        self.entries.touch(key);
        Lookup::Hit(snapshot)
    }

    /// Returns true if `entry` is still fresh at `now`.
    pub fn is_fresh(&self, entry: &CacheEntry<V>, now: i64) -> bool {
        !entry.is_expired(compute_ttl(&self.config, entry), now)
    }

    // == Counters ==
    /// Counts one successful `get`.
    pub fn record_hit(&mut self) {
        self.stats.record_hit();
    }

    /// Counts one failed `get`.
    pub fn record_miss(&mut self) {
        self.stats.record_miss();
    }

    // == Insert ==
    /// Stores a fresh entry for `key`, relieving memory pressure first.
    ///
    /// # Arguments
    /// * `key` - The key to store
    /// * `value` - The value to store
    /// * `size` - Estimated size of `value` in bytes
    /// * `version` - Version tag of the value
    /// * `now` - Current time in Unix milliseconds
    pub fn insert(
        &mut self,
        key: String,
        value: V,
        size: usize,
        version: &str,
        now: i64,
    ) -> Insertion<V> {
        let evicted = self.relieve_pressure(&key);
        let entry = CacheEntry::new(value, size, version, now);
        self.entries.insert(key, entry.clone());
        self.refresh_occupancy();
        Insertion { entry, evicted }
    }

    // == Promote ==
    /// Brings an entry loaded from the backend into memory as a hit.
    ///
    /// Returns `None` when the key was written to memory in the meantime; the
    /// in-memory copy is newer and wins.
    pub fn promote(
        &mut self,
        key: &str,
        mut entry: CacheEntry<V>,
        now: i64,
    ) -> Option<Insertion<V>> {
        if self.entries.contains(key) {
            return None;
        }

        let evicted = self.relieve_pressure(key);
        entry.touch(now);
        self.entries.insert(key.to_string(), entry.clone());
        self.refresh_occupancy();
        Some(Insertion { entry, evicted })
    }

    // == Restore ==
    /// Marks a startup restore as pending.
    ///
    /// Until [`restore`](Self::restore) runs, deleted keys are remembered and
    /// a `clear()` cancels the restore, so loaded backend rows cannot bring
    /// back what was removed in the meantime.
    pub fn begin_restore(&mut self) {
        self.pending_restore = Some(PendingRestore::default());
    }

    /// Bulk-loads entries read from the backend at startup.
    ///
    /// Keys already in memory win over loaded ones. Removals made since
    /// [`begin_restore`](Self::begin_restore) are honored: deleted keys are
    /// skipped, and after a clear nothing is loaded. At most the `max_size`
    /// most recently accessed entries are restored, oldest first so recency
    /// order follows `last_access`. Returns the number of restored entries.
    pub fn restore(&mut self, loaded: Vec<(String, CacheEntry<V>)>) -> usize {
        let pending = self.pending_restore.take().unwrap_or_default();
        if pending.cleared {
            return 0;
        }

        let mut candidates: Vec<_> = loaded
            .into_iter()
            .filter(|(key, _)| !self.entries.contains(key) && !pending.removed.contains(key))
            .collect();
        candidates.sort_by_key(|(_, entry)| entry.last_access);

        let room = self.config.max_size.saturating_sub(self.entries.len());
        let skip = candidates.len().saturating_sub(room);

        let mut restored = 0;
        for (key, entry) in candidates.into_iter().skip(skip) {
            if self.entries.insert(key, entry).is_none() {
                restored += 1;
            }
        }

        self.refresh_occupancy();
        restored
    }

    // == Delete ==
    /// Removes an entry; returns whether it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        self.note_removed(key);
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.refresh_occupancy();
        }
        removed
    }

    // == Clear ==
    /// Removes every entry and zeroes the counters.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.stats.reset();
        if let Some(pending) = self.pending_restore.as_mut() {
            pending.cleared = true;
            pending.removed.clear();
        }
    }

    // == Sweep Expired ==
    /// Removes every entry whose age exceeds its adaptive TTL.
    ///
    /// Returns the removed keys.
    pub fn sweep_expired(&mut self, now: i64) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(compute_ttl(&self.config, entry), now))
            .map(|(key, _)| key.to_string())
            .collect();

        for key in &expired {
            self.entries.remove(key);
            self.note_removed(key);
        }

        self.refresh_occupancy();
        self.stats.record_cleanup(Utc::now());
        expired
    }

    // == Accessors ==
    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.clone()
    }

    /// Returns the entry for `key` without touching it.
    pub fn peek(&self, key: &str) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }

    /// Returns keys from least to most recently touched.
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(key, _)| key.to_string()).collect()
    }

    /// Returns the sum of entry sizes in bytes.
    pub fn memory_usage(&self) -> usize {
        self.entries.total_size()
    }

    /// Returns the current number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // == Memory Pressure ==
    /// Evicts lowest-scored entries when the pressure threshold is reached.
    ///
    /// Evicts `floor(max_size * 0.2)` entries under pressure, and in any case
    /// enough to keep the map within `max_size` once a new `incoming` key is
    /// added. Ties in score keep recency order.
    fn relieve_pressure(&mut self, incoming: &str) -> Vec<String> {
        let len = self.entries.len();
        let max_size = self.config.max_size;

        let mut count = 0;
        if len > 0 && len as f64 / max_size as f64 >= self.config.memory_pressure_threshold {
            count = (max_size as f64 * EVICTION_FRACTION).floor() as usize;
        }
        if !self.entries.contains(incoming) && len >= max_size {
            count = count.max(len + 1 - max_size);
        }
        if count == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<(i64, &str)> = self
            .entries
            .iter()
            .map(|(key, entry)| (eviction_score(entry), key))
            .collect();
        candidates.sort_by_key(|(score, _)| *score);

        let victims: Vec<String> = candidates
            .into_iter()
            .take(count)
            .map(|(_, key)| key.to_string())
            .collect();

        for key in &victims {
            self.entries.remove(key);
        }
        self.stats.record_evictions(victims.len());
        victims
    }

    fn note_removed(&mut self, key: &str) {
        if let Some(pending) = self.pending_restore.as_mut() {
            if !pending.cleared {
                pending.removed.insert(key.to_string());
            }
        }
    }

    fn refresh_occupancy(&mut self) {
        self.stats
            .set_occupancy(self.entries.len(), self.entries.total_size());
    }
}
