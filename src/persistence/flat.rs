//! Flat Store
//!
//! String-keyed persistence in the style of a browser local store: one
//! [`FlatStorage`] map per file, shared by every namespace in the process,
//! with each cache prefixing its keys by `namespace + "_"`.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::warn;

use crate::error::{CacheError, Result};
use crate::persistence::{BackendKind, PersistedRecord, StorageBackend};

/// File name of the flat storage document inside the storage directory.
pub const FLAT_STORAGE_FILE: &str = "flat_store.json";

type Registry = Mutex<HashMap<PathBuf, Weak<FlatStorage>>>;

/// Live storages by file path, so two caches never overwrite each other's file.
static REGISTRY: OnceLock<Registry> = OnceLock::new();

// == Flat Storage ==
/// Process-wide string map persisted as a single JSON document.
#[derive(Debug)]
pub struct FlatStorage {
    path: PathBuf,
    items: Mutex<BTreeMap<String, String>>,
}

impl FlatStorage {
    // == Shared Handle ==
    /// Returns the storage for `path`, loading it on first use.
    ///
    /// Performs blocking file I/O the first time a path is opened.
    pub fn shared(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        let mut handles = REGISTRY.get_or_init(Registry::default).lock();

        if let Some(existing) = handles.get(&path).and_then(Weak::upgrade) {
            return existing;
        }

        let storage = Arc::new(Self::load(path.clone()));
        handles.retain(|_, handle| handle.strong_count() > 0);
        handles.insert(path, Arc::downgrade(&storage));
        storage
    }

    /// Reads the document; a missing or corrupt file yields an empty map.
    fn load(path: PathBuf) -> Self {
        let items = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("Flat storage {} is corrupt, starting empty: {}", path.display(), err);
                BTreeMap::new()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                warn!("Flat storage {} unreadable, starting empty: {}", path.display(), err);
                BTreeMap::new()
            }
        };

        Self {
            path,
            items: Mutex::new(items),
        }
    }

    /// Returns the document path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // == Item Access ==
    /// Returns the value stored under `key`.
    pub fn get_item(&self, key: &str) -> Option<String> {
        self.items.lock().get(key).cloned()
    }

    /// Stores `value` under `key` and writes the document.
    ///
    /// The in-memory map is rolled back when the write fails.
    pub fn set_item(&self, key: &str, value: String) -> Result<()> {
        let mut items = self.items.lock();
        let previous = items.insert(key.to_string(), value);

        if let Err(err) = self.persist(&items) {
            match previous {
                Some(previous) => items.insert(key.to_string(), previous),
                None => items.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    /// Removes the given keys and writes the document once.
    pub fn remove_items(&self, keys: &[String]) -> Result<()> {
        let mut items = self.items.lock();
        let before = items.len();
        for key in keys {
            items.remove(key);
        }
        if items.len() == before {
            return Ok(());
        }
        self.persist(&items)
    }

    /// Returns every key in the storage, across all namespaces.
    pub fn keys(&self) -> Vec<String> {
        self.items.lock().keys().cloned().collect()
    }

    /// Writes the document atomically (temp file + rename).
    fn persist(&self, items: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec(items)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Timestamps extracted from a stored entry without knowing its value type.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryMeta {
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    last_access: i64,
}

fn record_from_item(key: String, data: String) -> PersistedRecord {
    let meta: EntryMeta = serde_json::from_str(&data).unwrap_or_default();
    PersistedRecord {
        key,
        data,
        timestamp: meta.timestamp,
        last_access: meta.last_access,
    }
}

// == Flat Store ==
/// Namespaced view over a shared [`FlatStorage`].
pub struct FlatStore {
    storage: Arc<FlatStorage>,
    prefix: String,
    closed: AtomicBool,
}

impl FlatStore {
    // == Open ==
    /// Opens the flat store for `namespace` under `dir`.
    pub async fn open(dir: &Path, namespace: &str) -> Result<Self> {
        let path = dir.join(FLAT_STORAGE_FILE);
        let storage = tokio::task::spawn_blocking(move || FlatStorage::shared(path)).await?;
        Ok(Self::with_storage(storage, namespace))
    }

    /// Creates a namespaced view over an already opened storage.
    pub fn with_storage(storage: Arc<FlatStorage>, namespace: &str) -> Self {
        Self {
            storage,
            prefix: format!("{}_", namespace),
            closed: AtomicBool::new(false),
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Clones the storage handle unless the store was closed.
    fn handle(&self) -> Result<Arc<FlatStorage>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(self.storage.clone())
    }

    /// Keys of this namespace, prefix included.
    fn namespaced_keys(storage: &FlatStorage, prefix: &str) -> Vec<String> {
        storage
            .keys()
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl StorageBackend for FlatStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Flat
    }

    async fn load(&self, key: &str) -> Result<Option<PersistedRecord>> {
        let storage = self.handle()?;
        let storage_key = self.storage_key(key);
        let key = key.to_string();
        let data = tokio::task::spawn_blocking(move || storage.get_item(&storage_key)).await?;
        Ok(data.map(|data| record_from_item(key, data)))
    }

    async fn save(&self, record: PersistedRecord) -> Result<()> {
        let storage = self.handle()?;
        let storage_key = self.storage_key(&record.key);
        tokio::task::spawn_blocking(move || storage.set_item(&storage_key, record.data)).await?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let storage = self.handle()?;
        let keys = vec![self.storage_key(key)];
        tokio::task::spawn_blocking(move || storage.remove_items(&keys)).await?
    }

    async fn clear(&self) -> Result<()> {
        let storage = self.handle()?;
        let prefix = self.prefix.clone();
        tokio::task::spawn_blocking(move || {
            let keys = Self::namespaced_keys(&storage, &prefix);
            storage.remove_items(&keys)
        })
        .await?
    }

    async fn load_all(&self) -> Result<Vec<PersistedRecord>> {
        let storage = self.handle()?;
        let prefix = self.prefix.clone();
        let records = tokio::task::spawn_blocking(move || {
            Self::namespaced_keys(&storage, &prefix)
                .into_iter()
                .filter_map(|storage_key| {
                    let data = storage.get_item(&storage_key)?;
                    let key = storage_key[prefix.len()..].to_string();
                    Some(record_from_item(key, data))
                })
                .collect::<Vec<_>>()
        })
        .await?;
        Ok(records)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(key: &str) -> PersistedRecord {
        PersistedRecord {
            key: key.to_string(),
            data: r#"{"value":1,"timestamp":10,"accessCount":1,"lastAccess":20,"size":1,"version":"1.0"}"#
                .to_string(),
            timestamp: 10,
            last_access: 20,
        }
    }

    #[test]
    fn test_shared_storage_is_reused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(FLAT_STORAGE_FILE);

        let first = FlatStorage::shared(&path);
        let second = FlatStorage::shared(&path);

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_storage_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(FLAT_STORAGE_FILE);
        {
            let storage = FlatStorage::shared(&path);
            storage.set_item("k", "v".to_string()).unwrap();
        }

        // Last handle dropped, so this reads the file again
        let storage = FlatStorage::shared(&path);
        assert_eq!(storage.get_item("k"), Some("v".to_string()));
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(FLAT_STORAGE_FILE);
        std::fs::write(&path, "not json at all").unwrap();

        let storage = FlatStorage::shared(&path);
        assert!(storage.keys().is_empty());
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let dir = TempDir::new().unwrap();
        let content = FlatStore::open(dir.path(), "content").await.unwrap();
        let files = FlatStore::open(dir.path(), "files").await.unwrap();

        content.save(record("a")).await.unwrap();
        content.save(record("b")).await.unwrap();
        files.save(record("a")).await.unwrap();

        let mut keys: Vec<_> = content
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);

        content.clear().await.unwrap();
        assert!(content.load_all().await.unwrap().is_empty());
        assert_eq!(files.load("a").await.unwrap(), Some(record("a")));
    }

    #[tokio::test]
    async fn test_prefixed_keys_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = FlatStore::open(dir.path(), "ns").await.unwrap();
        store.save(record("key")).await.unwrap();

        let contents = std::fs::read_to_string(dir.path().join(FLAT_STORAGE_FILE)).unwrap();
        let document: BTreeMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert!(document.contains_key("ns_key"));
    }

    #[tokio::test]
    async fn test_load_extracts_timestamps() {
        let dir = TempDir::new().unwrap();
        let store = FlatStore::open(dir.path(), "ns").await.unwrap();
        store.save(record("key")).await.unwrap();

        let loaded = store.load("key").await.unwrap().unwrap();
        assert_eq!(loaded.timestamp, 10);
        assert_eq!(loaded.last_access, 20);

        store.delete("key").await.unwrap();
        assert_eq!(store.load("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let store = FlatStore::open(dir.path(), "ns").await.unwrap();

        store.close().await;

        assert!(matches!(store.save(record("a")).await, Err(CacheError::Closed)));
        assert!(matches!(store.load_all().await, Err(CacheError::Closed)));
    }
}
