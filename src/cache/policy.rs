//! TTL and Size Policy
//!
//! Pure functions deciding how long an entry lives, how large it is and in
//! which order entries are evicted under memory pressure.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::cache::CacheEntry;
use crate::config::CacheConfig;

/// Size assumed for values that cannot be serialized.
pub const FALLBACK_SIZE_ESTIMATE: usize = 1024;

/// Weight of one access relative to one millisecond of recency.
const ACCESS_SCORE_WEIGHT: i64 = 1000;

/// Computes the time-to-live of `entry` under `config`.
///
/// Frequently accessed entries get `default_ttl * frequent_access_multiplier`,
/// everything else `default_ttl`; the adaptive result is clamped to
/// `[min_ttl, max_ttl]`. A multiplier below 1 is treated as 1 so hot entries
/// never live shorter than cold ones.
pub fn compute_ttl<V>(config: &CacheConfig, entry: &CacheEntry<V>) -> Duration {
    if !config.enable_adaptive_ttl {
        return config.default_ttl;
    }

    let ttl = if entry.access_count >= config.frequent_access_threshold {
        let multiplier = config.frequent_access_multiplier.max(1.0);
        Duration::try_from_secs_f64(config.default_ttl.as_secs_f64() * multiplier)
            .unwrap_or(config.max_ttl)
    } else {
        config.default_ttl
    };

    ttl.max(config.min_ttl).min(config.max_ttl)
}

/// Estimates the payload size of `value` as its JSON byte length.
///
/// Never fails: values that refuse to serialize are charged
/// [`FALLBACK_SIZE_ESTIMATE`].
pub fn estimate_size<V: Serialize + ?Sized>(value: &V) -> usize {
    match serde_json::to_vec(value) {
        Ok(bytes) => bytes.len(),
        Err(err) => {
            debug!("Size estimation failed, using fallback: {}", err);
            FALLBACK_SIZE_ESTIMATE
        }
    }
}

/// Eviction score; the lowest scores are evicted first.
pub fn eviction_score<V>(entry: &CacheEntry<V>) -> i64 {
    i64::from(entry.access_count)
        .saturating_mul(ACCESS_SCORE_WEIGHT)
        .saturating_add(entry.last_access)
}
