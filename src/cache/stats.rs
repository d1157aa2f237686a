//! Cache Statistics Module
//!
//! Tracks hits, misses and memory usage of one cache instance.

use chrono::{DateTime, Utc};
use serde::Serialize;

// == Cache Stats ==
/// Snapshot of cache performance metrics. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Number of successful cache retrievals
    pub hits: u64,
    /// Number of failed retrievals (missing or expired)
    pub misses: u64,
    /// Current number of in-memory entries
    pub size: usize,
    /// hits / (hits + misses), 0 when no request was made
    pub hit_rate: f64,
    /// Sum of estimated entry sizes in bytes
    pub memory_usage: usize,
    /// Entries evicted under memory pressure
    pub evictions: u64,
    /// Time of the last expiry sweep (or creation)
    pub last_cleanup: DateTime<Utc>,
}

impl CacheStats {
    // == Constructor ==
    /// Creates zeroed stats whose last cleanup is now.
    pub fn new() -> Self {
        Self {
            last_cleanup: Utc::now(),
            ..Self::default()
        }
    }

    // == Record Hit ==
    /// Increments the hit counter.
    pub fn record_hit(&mut self) {
        self.hits += 1;
        self.refresh_hit_rate();
    }

    // == Record Miss ==
    /// Increments the miss counter.
    pub fn record_miss(&mut self) {
        self.misses += 1;
        self.refresh_hit_rate();
    }

    /// Adds `count` evictions.
    pub fn record_evictions(&mut self, count: usize) {
        self.evictions += count as u64;
    }

    /// Stamps the sweep time.
    pub fn record_cleanup(&mut self, at: DateTime<Utc>) {
        self.last_cleanup = at;
    }

    // == Update Occupancy ==
    /// Updates the entry count and memory usage after a mutation.
    pub fn set_occupancy(&mut self, size: usize, memory_usage: usize) {
        self.size = size;
        self.memory_usage = memory_usage;
    }

    // == Reset ==
    /// Zeroes counters and occupancy, keeping the cleanup timestamp.
    pub fn reset(&mut self) {
        *self = Self {
            last_cleanup: self.last_cleanup,
            ..Self::default()
        };
    }

    fn refresh_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        };
    }
}
