//! Persistence Module
//!
//! Durable mirror of the in-memory tier. Two interchangeable backends share
//! the [`StorageBackend`] trait:
//! - [`DurableStore`]: SQLite database per namespace, schema-versioned and
//!   indexed on `timestamp` and `last_access`
//! - [`FlatStore`]: namespaced keys in a shared string-keyed JSON file
//!
//! [`PersistenceAdapter`] wraps either one and never reports failures to the
//! caller; persistence is advisory.

mod adapter;
mod durable;
mod flat;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::CacheEntry;
use crate::error::Result;

pub use adapter::PersistenceAdapter;
pub use durable::{database_name, DurableStore, StorePhase};
pub use flat::{FlatStorage, FlatStore, FLAT_STORAGE_FILE};

/// Current backend of an engine, swapped in once initialization finishes
/// and taken out on destroy.
pub(crate) type SharedAdapter = Arc<RwLock<Option<Arc<PersistenceAdapter>>>>;

// == Backend Kind ==
/// Identifies which backend a cache is mirroring to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Transactional SQLite store
    Durable,
    /// Flat string-keyed store
    Flat,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Durable => write!(f, "durable"),
            BackendKind::Flat => write!(f, "flat"),
        }
    }
}

// == Persisted Record ==
/// One row as stored by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRecord {
    /// Cache key without namespace prefix
    pub key: String,
    /// JSON-serialized [`CacheEntry`]
    pub data: String,
    /// Creation time of the entry (Unix milliseconds)
    pub timestamp: i64,
    /// Last access of the entry (Unix milliseconds)
    pub last_access: i64,
}

impl PersistedRecord {
    // == Encode ==
    /// Serializes an entry into a record.
    pub fn encode<V: Serialize>(key: &str, entry: &CacheEntry<V>) -> Result<Self> {
        Ok(Self {
            key: key.to_string(),
            data: serde_json::to_string(entry)?,
            timestamp: entry.timestamp,
            last_access: entry.last_access,
        })
    }

    // == Decode ==
    /// Parses the stored entry back.
    pub fn decode<V: DeserializeOwned>(&self) -> Result<CacheEntry<V>> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

// == Storage Backend Trait ==
/// Operations every persistence backend provides.
///
/// Implementations report failures as errors; [`PersistenceAdapter`] decides
/// how to log and swallow them. After [`close`](StorageBackend::close) every
/// operation fails with [`CacheError::Closed`](crate::error::CacheError::Closed).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Loads the record for `key`, `None` if absent.
    async fn load(&self, key: &str) -> Result<Option<PersistedRecord>>;

    /// Inserts or replaces a record.
    async fn save(&self, record: PersistedRecord) -> Result<()>;

    /// Deletes the record for `key`; deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Deletes every record of this namespace.
    async fn clear(&self) -> Result<()>;

    /// Loads every record of this namespace.
    async fn load_all(&self) -> Result<Vec<PersistedRecord>>;

    /// Releases the underlying handle. Idempotent.
    async fn close(&self);
}
