//! repo_cache - Adaptive persistent cache engine
//!
//! Two-tier cache for a repository viewer: in-memory entries with adaptive
//! TTL and memory-pressure eviction, mirrored best-effort to a SQLite store
//! or, when that fails, a flat JSON key-value store.

pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod persistence;
mod tasks;

pub use cache::{CacheEngine, CacheEntry, CacheStats, CacheValue};
pub use config::{CacheConfig, ManagerConfig};
pub use error::CacheError;
pub use manager::{content_cache_key, CacheManager, ManagerStats};
pub use persistence::BackendKind;
