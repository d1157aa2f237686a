//! Persistence Adapter
//!
//! Wraps a [`StorageBackend`] so that no backend failure ever reaches the
//! cache: failed loads read as absent, failed writes as no-ops, and every
//! failure is logged.

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::cache::CacheEntry;
use crate::error::CacheError;
use crate::persistence::{BackendKind, PersistedRecord, StorageBackend};

// == Persistence Adapter ==
/// Best-effort front of a persistence backend.
pub struct PersistenceAdapter {
    backend: Box<dyn StorageBackend>,
}

impl PersistenceAdapter {
    /// Wraps `backend`.
    pub fn new(backend: impl StorageBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    /// Which backend is wrapped.
    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    // == Load ==
    /// Loads the record for `key`; failures read as absent.
    pub async fn load(&self, key: &str) -> Option<PersistedRecord> {
        match self.backend.load(key).await {
            Ok(record) => record,
            Err(err) => {
                self.report("load", key, &err);
                None
            }
        }
    }

    /// Loads and decodes the entry for `key`.
    ///
    /// A record that does not decode as `CacheEntry<V>` reads as absent.
    pub async fn load_entry<V: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<V>> {
        let record = self.load(key).await?;
        decode_logged(&record)
    }

    /// Loads every record; failures read as an empty backend.
    pub async fn load_all(&self) -> Vec<PersistedRecord> {
        match self.backend.load_all().await {
            Ok(records) => records,
            Err(err) => {
                self.report("load_all", "*", &err);
                Vec::new()
            }
        }
    }

    /// Loads and decodes every entry, skipping malformed records.
    pub async fn load_all_entries<V: DeserializeOwned>(&self) -> Vec<(String, CacheEntry<V>)> {
        self.load_all()
            .await
            .into_iter()
            .filter_map(|record| {
                let entry = decode_logged(&record)?;
                Some((record.key, entry))
            })
            .collect()
    }

    // == Writes ==
    /// Saves a record; failures are logged and dropped.
    pub async fn save(&self, record: PersistedRecord) {
        let key = record.key.clone();
        if let Err(err) = self.backend.save(record).await {
            self.report("save", &key, &err);
        }
    }

    /// Deletes the record for `key`; failures are logged and dropped.
    pub async fn delete(&self, key: &str) {
        if let Err(err) = self.backend.delete(key).await {
            self.report("delete", key, &err);
        }
    }

    /// Deletes every record; failures are logged and dropped.
    pub async fn clear(&self) {
        if let Err(err) = self.backend.clear().await {
            self.report("clear", "*", &err);
        }
    }

    /// Closes the backend handle.
    pub async fn close(&self) {
        self.backend.close().await;
    }

    fn report(&self, operation: &str, key: &str, err: &CacheError) {
        if err.is_closed() {
            debug!(
                "Skipped {} of '{}' on closed {} backend",
                operation,
                key,
                self.kind()
            );
        } else {
            warn!(
                "Persistence {} of '{}' failed on {} backend: {}",
                operation,
                key,
                self.kind(),
                err
            );
        }
    }
}

fn decode_logged<V: DeserializeOwned>(record: &PersistedRecord) -> Option<CacheEntry<V>> {
    match record.decode() {
        Ok(entry) => Some(entry),
        Err(err) => {
            debug!("Ignoring malformed persisted entry '{}': {}", record.key, err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DEFAULT_VERSION;
    use crate::error::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Backend whose every operation fails.
    struct BrokenBackend;

    #[async_trait]
    impl StorageBackend for BrokenBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Durable
        }
        async fn load(&self, _key: &str) -> Result<Option<PersistedRecord>> {
            Err(CacheError::Storage("disk on fire".to_string()))
        }
        async fn save(&self, _record: PersistedRecord) -> Result<()> {
            Err(CacheError::Storage("disk on fire".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            Err(CacheError::Closed)
        }
        async fn clear(&self) -> Result<()> {
            Err(CacheError::Storage("disk on fire".to_string()))
        }
        async fn load_all(&self) -> Result<Vec<PersistedRecord>> {
            Err(CacheError::Storage("disk on fire".to_string()))
        }
        async fn close(&self) {}
    }

    /// In-memory backend.
    #[derive(Default)]
    struct MemoryBackend {
        rows: Mutex<HashMap<String, PersistedRecord>>,
    }

    #[async_trait]
    impl StorageBackend for MemoryBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Flat
        }
        async fn load(&self, key: &str) -> Result<Option<PersistedRecord>> {
            Ok(self.rows.lock().get(key).cloned())
        }
        async fn save(&self, record: PersistedRecord) -> Result<()> {
            self.rows.lock().insert(record.key.clone(), record);
            Ok(())
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.rows.lock().remove(key);
            Ok(())
        }
        async fn clear(&self) -> Result<()> {
            self.rows.lock().clear();
            Ok(())
        }
        async fn load_all(&self) -> Result<Vec<PersistedRecord>> {
            Ok(self.rows.lock().values().cloned().collect())
        }
        async fn close(&self) {}
    }

    #[test]
    fn test_failures_read_as_absent() {
        let adapter = PersistenceAdapter::new(BrokenBackend);

        tokio_test::block_on(async {
            assert_eq!(adapter.load("key").await, None);
            assert!(adapter.load_all().await.is_empty());
            assert!(adapter.load_entry::<String>("key").await.is_none());

            let entry = CacheEntry::new(1u8, 1, DEFAULT_VERSION, 0);
            adapter
                .save(PersistedRecord::encode("key", &entry).unwrap())
                .await;
            adapter.delete("key").await;
            adapter.clear().await;
        });
    }

    #[tokio::test]
    async fn test_malformed_records_skipped() {
        let adapter = PersistenceAdapter::new(MemoryBackend::default());
        let entry = CacheEntry::new("good".to_string(), 6, DEFAULT_VERSION, 0);

        adapter
            .save(PersistedRecord::encode("good", &entry).unwrap())
            .await;
        adapter
            .save(PersistedRecord {
                key: "bad".to_string(),
                data: "{\"value\":".to_string(),
                timestamp: 0,
                last_access: 0,
            })
            .await;

        assert!(adapter.load_entry::<String>("bad").await.is_none());
        assert_eq!(adapter.load_entry::<String>("good").await, Some(entry));

        let all = adapter.load_all_entries::<String>().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "good");
    }
}
