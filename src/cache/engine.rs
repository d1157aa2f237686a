//! Cache Engine Module
//!
//! Two-tier cache: the in-memory [`CacheStore`] is authoritative, the
//! persistence backend is a best-effort mirror that lets entries survive a
//! restart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::entry::{current_timestamp_ms, DEFAULT_VERSION};
use crate::cache::policy::estimate_size;
use crate::cache::store::{CacheStore, Lookup};
use crate::cache::{CacheEntry, CacheStats};
use crate::config::CacheConfig;
use crate::persistence::{
    BackendKind, DurableStore, FlatStore, PersistedRecord, PersistenceAdapter, SharedAdapter,
};
use crate::tasks::{spawn_mirror_worker, spawn_sweep_task, MirrorHandle, MirrorOp};

// == Cache Value ==
/// Values a cache engine can hold: serializable, cloneable and shareable
/// across tasks.
pub trait CacheValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

struct EngineInner<V> {
    config: CacheConfig,
    /// Authoritative in-memory tier
    store: tokio::sync::RwLock<CacheStore<V>>,
    /// Installed backend, `None` before init and after destroy
    adapter: SharedAdapter,
    /// Queue to the mirror worker, `None` without persistence or after destroy
    mirror: Mutex<Option<MirrorHandle>>,
    /// Turns true once persistence initialization finished
    ready: watch::Receiver<bool>,
    sweep: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl<V> Drop for EngineInner<V> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep.get_mut().take() {
            handle.abort();
        }
    }
}

// == Cache Engine ==
/// Adaptive two-tier cache.
///
/// Cloning is cheap and yields a handle to the same cache. Must be created
/// inside a Tokio runtime: construction spawns the sweep task and, with
/// persistence enabled, the backend initialization and mirror worker.
pub struct CacheEngine<V> {
    inner: Arc<EngineInner<V>>,
}

impl<V> Clone for CacheEngine<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Non-owning handle to a [`CacheEngine`], used by background tasks.
pub struct WeakEngine<V> {
    inner: Weak<EngineInner<V>>,
}

impl<V> WeakEngine<V> {
    /// Returns the engine if it is still alive.
    pub fn upgrade(&self) -> Option<CacheEngine<V>> {
        self.inner.upgrade().map(|inner| CacheEngine { inner })
    }
}

impl<V: CacheValue> CacheEngine<V> {
    // == Constructor ==
    /// Creates an engine and starts its background work.
    ///
    /// Persistence initialization runs in the background; use
    /// [`ready`](Self::ready) to wait for it.
    pub fn new(config: CacheConfig) -> Self {
        let persistent = config.enable_persistence;
        let (ready_tx, ready_rx) = watch::channel(!persistent);
        let adapter = SharedAdapter::default();

        let mirror = persistent.then(|| {
            let (handle, _worker) = spawn_mirror_worker(adapter.clone(), ready_rx.clone());
            handle
        });

        let mut store = CacheStore::new(config.clone());
        if persistent {
            store.begin_restore();
        }

        let engine = Self {
            inner: Arc::new(EngineInner {
                store: tokio::sync::RwLock::new(store),
                adapter,
                mirror: Mutex::new(mirror),
                ready: ready_rx,
                sweep: Mutex::new(None),
                destroyed: AtomicBool::new(false),
                config,
            }),
        };

        let sweep = spawn_sweep_task(engine.downgrade(), engine.inner.config.cleanup_interval);
        *engine.inner.sweep.lock() = Some(sweep);

        if persistent {
            let init = engine.clone();
            tokio::spawn(async move {
                init.initialize_persistence().await;
                let _ = ready_tx.send(true);
            });
        }

        engine
    }

    /// Returns a weak handle that does not keep the engine alive.
    pub fn downgrade(&self) -> WeakEngine<V> {
        WeakEngine {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Returns the configuration of this engine.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Returns the storage namespace, used to label log lines.
    pub fn namespace(&self) -> &str {
        &self.inner.config.storage_namespace
    }

    // == Get ==
    /// Retrieves a fresh value, consulting the backend on a memory miss.
    ///
    /// Expired entries are removed from both tiers and count as misses.
    pub async fn get(&self, key: &str) -> Option<V> {
        {
            let mut store = self.inner.store.write().await;
            let lookup = store.lookup(key, current_timestamp_ms());
            match lookup {
                Lookup::Hit(entry) => {
                    store.record_hit();
                    drop(store);
                    self.mirror_entry(key, &entry);
                    return Some(entry.value);
                }
                Lookup::Expired => {
                    store.record_miss();
                    drop(store);
                    debug!("Expired entry '{}' dropped on read", key);
                    self.mirror(MirrorOp::Delete(key.to_string()));
                    return None;
                }
                Lookup::Missing => {}
            }
        }

        let loaded = match self.adapter() {
            Some(adapter) => {
                // Deletes and clears queued earlier must land before the read
                self.flush().await;
                adapter.load_entry::<V>(key).await
            }
            None => None,
        };

        let now = current_timestamp_ms();
        let mut store = self.inner.store.write().await;
        match loaded {
            Some(entry) if store.is_fresh(&entry, now) => {
                let insertion = store.promote(key, entry, now);
                let promoted = match insertion {
                    Some(insertion) => Some(insertion.entry),
                    // Written to memory while the backend was loading
                    None => match store.lookup(key, now) {
                        Lookup::Hit(entry) => Some(entry),
                        Lookup::Expired | Lookup::Missing => None,
                    },
                };

                match promoted {
                    Some(entry) => {
                        store.record_hit();
                        drop(store);
                        self.mirror_entry(key, &entry);
                        Some(entry.value)
                    }
                    None => {
                        store.record_miss();
                        None
                    }
                }
            }
            Some(_) => {
                store.record_miss();
                drop(store);
                debug!("Stale persisted entry '{}' discarded", key);
                self.mirror(MirrorOp::Delete(key.to_string()));
                None
            }
            None => {
                store.record_miss();
                None
            }
        }
    }

    // == Set ==
    /// Stores `value` under `key` with the default version tag.
    pub async fn set(&self, key: &str, value: V) {
        self.set_with_version(key, value, DEFAULT_VERSION).await;
    }

    /// Stores `value` under `key`, evicting under memory pressure first.
    pub async fn set_with_version(&self, key: &str, value: V, version: &str) {
        let size = estimate_size(&value);
        let insertion = self.inner.store.write().await.insert(
            key.to_string(),
            value,
            size,
            version,
            current_timestamp_ms(),
        );

        if !insertion.evicted.is_empty() {
            debug!(
                "Memory pressure in '{}': evicted {} entries",
                self.namespace(),
                insertion.evicted.len()
            );
        }

        self.mirror_entry(key, &insertion.entry);
    }

    // == Delete ==
    /// Removes `key` from both tiers; returns whether it was in memory.
    pub async fn delete(&self, key: &str) -> bool {
        let removed = self.inner.store.write().await.remove(key);
        self.mirror(MirrorOp::Delete(key.to_string()));
        removed
    }

    // == Clear ==
    /// Empties both tiers and zeroes the hit/miss counters.
    pub async fn clear(&self) {
        self.inner.store.write().await.clear();
        self.mirror(MirrorOp::Clear);
    }

    // == Prefetch ==
    /// Schedules a background read of `keys` after the prefetch delay.
    ///
    /// Does nothing when prefetch is disabled. Reads populate memory from the
    /// backend; their outcomes are only logged.
    pub fn prefetch<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.inner.config.enable_prefetch || self.is_destroyed() {
            return;
        }

        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return;
        }

        let engine = self.clone();
        let delay = self.inner.config.prefetch_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if engine.is_destroyed() {
                debug!("Skipping prefetch of {} keys on destroyed cache", keys.len());
                return;
            }

            for key in keys {
                match engine.get(&key).await {
                    Some(_) => debug!("Prefetched '{}'", key),
                    None => debug!("Prefetch found nothing for '{}'", key),
                }
            }
        });
    }

    // == Stats ==
    /// Returns a snapshot of the statistics.
    pub async fn stats(&self) -> CacheStats {
        self.inner.store.read().await.stats()
    }

    // == Sweep ==
    /// Removes every expired entry from memory and the backend.
    ///
    /// Runs automatically every `cleanup_interval`; returns the number of
    /// removed entries.
    pub async fn sweep_expired(&self) -> usize {
        let removed = self
            .inner
            .store
            .write()
            .await
            .sweep_expired(current_timestamp_ms());

        for key in &removed {
            self.mirror(MirrorOp::Delete(key.clone()));
        }
        removed.len()
    }

    // == Readiness ==
    /// Waits until persistence initialization has finished.
    ///
    /// Returns immediately when persistence is disabled.
    pub async fn ready(&self) {
        let mut ready = self.inner.ready.clone();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Waits until every mirror operation queued so far has been applied.
    pub async fn flush(&self) {
        let Some(mirror) = self.inner.mirror.lock().clone() else {
            return;
        };

        let (tx, rx) = oneshot::channel();
        if mirror.send(MirrorOp::Flush(tx)) {
            let _ = rx.await;
        }
    }

    /// Returns the backend in use, `None` before initialization, without
    /// persistence, or after destroy.
    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.adapter().map(|adapter| adapter.kind())
    }

    /// Returns true once [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    // == Destroy ==
    /// Stops background work, closes the backend and clears memory.
    ///
    /// Idempotent. Mirror operations still queued are discarded.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let sweep = self.inner.sweep.lock().take();
        if let Some(handle) = sweep {
            handle.abort();
        }
        self.inner.mirror.lock().take();

        let adapter = self.inner.adapter.write().take();
        if let Some(adapter) = adapter {
            adapter.close().await;
        }

        self.inner.store.write().await.clear();
        info!("Cache '{}' destroyed", self.namespace());
    }

    // == Persistence ==
    fn adapter(&self) -> Option<Arc<PersistenceAdapter>> {
        self.inner.adapter.read().clone()
    }

    fn mirror(&self, op: MirrorOp) {
        let mirror = self.inner.mirror.lock().clone();
        if let Some(mirror) = mirror {
            if !mirror.send(op) {
                debug!("Mirror worker of '{}' is gone", self.namespace());
            }
        }
    }

    /// Queues a save of `entry`; unencodable entries are skipped.
    fn mirror_entry(&self, key: &str, entry: &CacheEntry<V>) {
        if self.inner.mirror.lock().is_none() {
            return;
        }

        match PersistedRecord::encode(key, entry) {
            Ok(record) => self.mirror(MirrorOp::Save(record)),
            Err(err) => warn!("Skipping persistence of '{}': {}", key, err),
        }
    }

    /// Opens the backend and loads what it holds into memory.
    async fn initialize_persistence(&self) {
        let Some(adapter) = self.open_backend().await else {
            self.inner.store.write().await.restore(Vec::new());
            return;
        };
        let adapter = Arc::new(adapter);

        *self.inner.adapter.write() = Some(adapter.clone());
        if self.is_destroyed() {
            self.inner.adapter.write().take();
            adapter.close().await;
            self.inner.store.write().await.restore(Vec::new());
            return;
        }

        let config = &self.inner.config;
        let now = current_timestamp_ms();
        let (fresh, stale): (Vec<_>, Vec<_>) = adapter
            .load_all_entries::<V>()
            .await
            .into_iter()
            .partition(|(_, entry)| !entry.is_expired(config.default_ttl, now));

        for (key, _) in &stale {
            self.mirror(MirrorOp::Delete(key.clone()));
        }

        let restored = self.inner.store.write().await.restore(fresh);
        info!(
            "Cache '{}' using {} backend: restored {} entries, discarded {} expired",
            config.storage_namespace,
            adapter.kind(),
            restored,
            stale.len()
        );
    }

    /// Opens the durable store, falling back to the flat store when it fails.
    ///
    /// Decided once per engine; a rebuilt engine tries the durable store
    /// again.
    async fn open_backend(&self) -> Option<PersistenceAdapter> {
        let config = &self.inner.config;

        if config.use_durable_store {
            match DurableStore::open_with_recovery(
                &config.storage_dir,
                &config.storage_namespace,
                config.durable_busy_timeout,
            )
            .await
            {
                Ok(store) => return Some(PersistenceAdapter::new(store)),
                Err(err) => {
                    warn!(
                        "Durable store unavailable for '{}', falling back to flat store: {}",
                        config.storage_namespace, err
                    );
                }
            }
        }

        match FlatStore::open(&config.storage_dir, &config.storage_namespace).await {
            Ok(store) => Some(PersistenceAdapter::new(store)),
            Err(err) => {
                warn!(
                    "No persistence backend for '{}', running memory-only: {}",
                    config.storage_namespace, err
                );
                None
            }
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn memory_config() -> CacheConfig {
        CacheConfig {
            default_ttl: Duration::from_secs(300),
            min_ttl: Duration::from_millis(1),
            max_ttl: Duration::from_secs(3600),
            prefetch_delay: Duration::from_millis(10),
            ..CacheConfig::default().in_memory()
        }
    }

    fn persistent_config(dir: &TempDir) -> CacheConfig {
        CacheConfig {
            enable_persistence: true,
            storage_namespace: "engine_test".to_string(),
            ..memory_config().with_storage_dir(dir.path())
        }
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let engine: CacheEngine<String> = CacheEngine::new(memory_config());

        engine.set("key1", "value1".to_string()).await;

        assert_eq!(engine.get("key1").await, Some("value1".to_string()));
        assert_eq!(engine.get("missing").await, None);

        let stats = engine.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.memory_usage, "\"value1\"".len());
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let config = CacheConfig {
            default_ttl: Duration::from_millis(50),
            ..memory_config()
        };
        let engine: CacheEngine<u32> = CacheEngine::new(config);

        engine.set("key", 7).await;
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(engine.get("key").await, None);
        let stats = engine.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let engine: CacheEngine<u32> = CacheEngine::new(memory_config());
        engine.set("a", 1).await;
        engine.set("b", 2).await;
        engine.get("a").await;

        assert!(engine.delete("a").await);
        assert!(!engine.delete("a").await);

        engine.clear().await;
        let stats = engine.stats().await;
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.size, 0);
        assert_eq!(engine.get("b").await, None);
    }

    #[tokio::test]
    async fn test_pressure_scenario() {
        let config = CacheConfig {
            default_ttl: Duration::from_millis(300_000),
            max_size: 2,
            memory_pressure_threshold: 0.5,
            ..memory_config()
        };
        let engine: CacheEngine<u32> = CacheEngine::new(config);

        engine.set("a", 1).await;
        engine.set("b", 2).await;
        engine.set("c", 3).await;

        assert_eq!(engine.stats().await.size, 2);
        assert_eq!(engine.get("a").await, None);
        assert_eq!(engine.get("c").await, Some(3));
    }

    #[tokio::test]
    async fn test_prefetch_populates_from_backend() {
        let dir = TempDir::new().unwrap();
        {
            let engine: CacheEngine<String> = CacheEngine::new(persistent_config(&dir));
            engine.ready().await;
            engine.set("warm", "value".to_string()).await;
            engine.flush().await;
            engine.destroy().await;
        }

        let engine: CacheEngine<String> = CacheEngine::new(persistent_config(&dir));
        engine.ready().await;
        // Restored at startup; drop it from memory so only the backend has it
        engine.inner.store.write().await.remove("warm");

        engine.prefetch(["warm"]);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stats = engine.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.size, 1);
        engine.destroy().await;
    }

    #[tokio::test]
    async fn test_prefetch_disabled() {
        let config = CacheConfig {
            enable_prefetch: false,
            ..memory_config()
        };
        let engine: CacheEngine<u32> = CacheEngine::new(config);

        engine.prefetch(vec!["a".to_string(), "b".to_string()]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(engine.stats().await.misses, 0);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let engine: CacheEngine<u32> = CacheEngine::new(persistent_config(&dir));
        engine.ready().await;
        engine.set("a", 1).await;

        engine.destroy().await;
        engine.destroy().await;

        assert!(engine.is_destroyed());
        assert_eq!(engine.backend_kind(), None);
        assert_eq!(engine.stats().await.size, 0);

        // Prefetch after destroy is ignored
        engine.prefetch(["a"]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.stats().await.misses, 0);
    }

    /// Writes `key -> value` through a first engine and shuts it down.
    async fn seed_backend(config: CacheConfig, key: &str, value: u32) {
        let engine: CacheEngine<u32> = CacheEngine::new(config);
        engine.ready().await;
        engine.set(key, value).await;
        engine.flush().await;
        engine.destroy().await;
    }

    #[tokio::test]
    async fn test_delete_before_ready_is_not_restored() {
        let dir = TempDir::new().unwrap();
        seed_backend(persistent_config(&dir), "k", 1).await;

        let engine: CacheEngine<u32> = CacheEngine::new(persistent_config(&dir));
        engine.delete("k").await;
        engine.ready().await;

        assert_eq!(engine.stats().await.size, 0);
        assert_eq!(engine.get("k").await, None);

        engine.flush().await;
        let adapter = engine.adapter().unwrap();
        assert!(adapter.load("k").await.is_none());
        engine.destroy().await;
    }

    #[tokio::test]
    async fn test_clear_before_ready_is_not_restored() {
        let dir = TempDir::new().unwrap();
        seed_backend(persistent_config(&dir), "k", 1).await;

        let engine: CacheEngine<u32> = CacheEngine::new(persistent_config(&dir));
        engine.clear().await;
        engine.set("new", 2).await;
        engine.ready().await;

        assert_eq!(engine.get("k").await, None);
        assert_eq!(engine.get("new").await, Some(2));

        engine.flush().await;
        let adapter = engine.adapter().unwrap();
        assert!(adapter.load("k").await.is_none());
        assert!(adapter.load("new").await.is_some());
        engine.destroy().await;
    }

    #[tokio::test]
    async fn test_sweep_removes_backend_copy() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig {
            default_ttl: Duration::from_millis(100),
            ..persistent_config(&dir)
        };

        let engine: CacheEngine<u32> = CacheEngine::new(config);
        engine.ready().await;
        engine.set("short", 1).await;
        engine.flush().await;

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(engine.sweep_expired().await, 1);
        engine.flush().await;

        let adapter = engine.adapter().unwrap();
        assert!(adapter.load("short").await.is_none());
        engine.destroy().await;
    }

    #[tokio::test]
    async fn test_stale_backend_entry_removed_from_both_tiers() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig {
            default_ttl: Duration::from_millis(100),
            ..persistent_config(&dir)
        };

        let engine: CacheEngine<u32> = CacheEngine::new(config);
        engine.ready().await;
        engine.set("key", 1).await;
        engine.flush().await;
        engine.inner.store.write().await.remove("key");

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(engine.get("key").await, None);
        engine.flush().await;

        let adapter = engine.adapter().unwrap();
        assert!(adapter.load("key").await.is_none());
        engine.destroy().await;
    }
}
