//! Cache Entry Module
//!
//! Defines one cached value together with its access metadata.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Version stamped on entries when the caller does not supply one.
pub const DEFAULT_VERSION: &str = "1.0";

// == Cache Entry ==
/// A single cached value and its access metadata.
///
/// Serialized with camelCase field names; this is the layout stored by both
/// persistence backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<V> {
    /// The stored value
    pub value: V,
    /// Creation timestamp (Unix milliseconds)
    pub timestamp: i64,
    /// Number of successful reads plus the initial write, always >= 1
    pub access_count: u32,
    /// Last read or write (Unix milliseconds)
    pub last_access: i64,
    /// Estimated payload size in bytes
    pub size: usize,
    /// Caller-supplied version tag
    pub version: String,
}

impl<V> CacheEntry<V> {
    // == Constructor ==
    /// Creates a fresh entry written at `now`.
    ///
    /// # Arguments
    /// * `value` - The value to store
    /// * `size` - Estimated size in bytes
    /// * `version` - Version tag
    /// * `now` - Current time in Unix milliseconds
    pub fn new(value: V, size: usize, version: impl Into<String>, now: i64) -> Self {
        Self {
            value,
            timestamp: now,
            access_count: 1,
            last_access: now,
            size,
            version: version.into(),
        }
    }

    // == Touch ==
    /// Records one successful read at `now`.
    pub fn touch(&mut self, now: i64) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_access = now;
    }

    // == Age ==
    /// Returns milliseconds elapsed since creation, zero if the clock moved back.
    pub fn age_ms(&self, now: i64) -> u64 {
        u64::try_from(now - self.timestamp).unwrap_or(0)
    }

    // == Is Expired ==
    /// Checks whether the entry outlived `ttl` at `now`.
    ///
    /// An entry whose age equals the TTL exactly is still fresh.
    pub fn is_expired(&self, ttl: Duration, now: i64) -> bool {
        u128::from(self.age_ms(now)) > ttl.as_millis()
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_creation() {
        let entry = CacheEntry::new("test_value".to_string(), 12, DEFAULT_VERSION, 1_000);

        assert_eq!(entry.value, "test_value");
        assert_eq!(entry.access_count, 1);
        assert_eq!(entry.timestamp, 1_000);
        assert_eq!(entry.last_access, 1_000);
        assert_eq!(entry.version, "1.0");
    }

    #[test]
    fn test_touch_bumps_count_and_last_access() {
        let mut entry = CacheEntry::new(1u32, 4, DEFAULT_VERSION, 1_000);
        entry.touch(1_500);
        entry.touch(2_000);

        assert_eq!(entry.access_count, 3);
        assert_eq!(entry.last_access, 2_000);
        assert_eq!(entry.timestamp, 1_000, "Touch must not change creation time");
    }

    #[test]
    fn test_expiration_boundary_condition() {
        let entry = CacheEntry::new(1u32, 4, DEFAULT_VERSION, 1_000);
        let ttl = Duration::from_millis(500);

        assert!(!entry.is_expired(ttl, 1_500), "Age equal to TTL is still fresh");
        assert!(entry.is_expired(ttl, 1_501));
    }

    #[test]
    fn test_age_with_clock_skew() {
        let entry = CacheEntry::new(1u32, 4, DEFAULT_VERSION, 1_000);
        assert_eq!(entry.age_ms(900), 0);
        assert!(!entry.is_expired(Duration::ZERO, 900));
    }

    #[test]
    fn test_serialized_field_names() {
        let entry = CacheEntry::new("v".to_string(), 3, "2.0", 42);
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["accessCount"], 1);
        assert_eq!(json["lastAccess"], 42);
        assert_eq!(json["version"], "2.0");
    }

    #[test]
    fn test_current_timestamp_is_recent() {
        let now = current_timestamp_ms();
        // 2020-01-01 in milliseconds
        assert!(now > 1_577_836_800_000);
    }
}
