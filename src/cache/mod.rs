//! Cache Module
//!
//! Adaptive two-tier cache: recency-ordered in-memory entries with adaptive
//! TTL and pressure-based eviction, mirrored to a persistence backend.

mod engine;
mod entry;
pub mod policy;
mod recency;
mod stats;
mod store;


// Re-export public types
pub use engine::{CacheEngine, CacheValue, WeakEngine};
pub use entry::{current_timestamp_ms, CacheEntry, DEFAULT_VERSION};
pub use recency::RecencyMap;
pub use stats::CacheStats;
pub use store::{CacheStore, Insertion, Lookup};
