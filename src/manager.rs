//! Cache Manager
//!
//! Owns the two named caches of the repository viewer: the content cache
//! (directory listings and metadata keyed by branch and path) and the file
//! cache (raw downloads keyed by URL). Created once at startup and passed to
//! whoever needs it.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::cache::{CacheEngine, CacheStats};
use crate::config::{CacheConfig, ManagerConfig};

/// Cache of repository content listings.
pub type ContentCache = CacheEngine<serde_json::Value>;

/// Cache of raw file contents.
pub type FileCache = CacheEngine<String>;

const CONTENT_KEY_PREFIX: &str = "contents_";
const ROOT_PATH_MARKER: &str = "__root__";

/// Builds the content cache key for `path` on `branch`.
///
/// Surrounding slashes are ignored; the repository root maps to `__root__`.
pub fn content_cache_key(branch: &str, path: &str) -> String {
    let path = path.trim_matches('/');
    let path = if path.is_empty() { ROOT_PATH_MARKER } else { path };
    format!("{}{}__{}", CONTENT_KEY_PREFIX, branch, path)
}

// == Manager Stats ==
/// Statistics of both caches.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagerStats {
    pub content: CacheStats,
    pub file: CacheStats,
}

// == Cache Manager ==
/// Owner of the content and file caches.
///
/// Caches are built lazily on first access; every method that may build one
/// must run inside a Tokio runtime.
pub struct CacheManager {
    config: ManagerConfig,
    content: Mutex<Option<ContentCache>>,
    file: Mutex<Option<FileCache>>,
    initialized: AtomicBool,
}

impl CacheManager {
    // == Constructor ==
    /// Creates a manager; no cache is built yet.
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            content: Mutex::new(None),
            file: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    // == Initialize ==
    /// Builds both caches and waits for their persistence to load.
    ///
    /// Idempotent; concurrent calls share the same instances.
    pub async fn initialize(&self) {
        if self.is_initialized() {
            return;
        }

        let content = self.content_cache();
        let file = self.file_cache();
        tokio::join!(content.ready(), file.ready());

        if !self.initialized.swap(true, Ordering::AcqRel) {
            info!("Cache manager initialized");
        }
    }

    /// Returns true once `initialize` completed and `destroy` was not called
    /// since.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    // == Cache Accessors ==
    /// Returns the content cache, building it on first access.
    pub fn content_cache(&self) -> ContentCache {
        Self::get_or_build(&self.content, &self.config.content)
    }

    /// Returns the file cache, building it on first access.
    pub fn file_cache(&self) -> FileCache {
        Self::get_or_build(&self.file, &self.config.file)
    }

    fn get_or_build<V: crate::cache::CacheValue>(
        slot: &Mutex<Option<CacheEngine<V>>>,
        config: &CacheConfig,
    ) -> CacheEngine<V> {
        slot.lock()
            .get_or_insert_with(|| CacheEngine::new(config.clone()))
            .clone()
    }

    // == Clear ==
    /// Clears both caches, including what they persisted.
    pub async fn clear_all_caches(&self) {
        let content = self.content_cache();
        let file = self.file_cache();
        tokio::join!(content.clear(), file.clear());
        info!("All caches cleared");
    }

    // == Stats ==
    /// Returns statistics of both caches; a cache never built reports zeros.
    pub async fn cache_stats(&self) -> ManagerStats {
        let content = self.content.lock().clone();
        let file = self.file.lock().clone();

        ManagerStats {
            content: match content {
                Some(cache) => cache.stats().await,
                None => CacheStats::default(),
            },
            file: match file {
                Some(cache) => cache.stats().await,
                None => CacheStats::default(),
            },
        }
    }

    // == Prefetch ==
    /// Prefetches content listings of `paths` on `branch`.
    pub fn prefetch_content<S: AsRef<str>>(&self, branch: &str, paths: &[S]) {
        let keys: Vec<String> = paths
            .iter()
            .map(|path| content_cache_key(branch, path.as_ref()))
            .collect();
        self.content_cache().prefetch(keys);
    }

    /// Prefetches raw files by download URL.
    pub fn prefetch_files<S: AsRef<str>>(&self, urls: &[S]) {
        self.file_cache()
            .prefetch(urls.iter().map(|url| url.as_ref().to_string()));
    }

    // == Destroy ==
    /// Tears down both caches; a later `initialize` rebuilds them.
    pub async fn destroy(&self) {
        let content = self.content.lock().take();
        let file = self.file.lock().take();

        if let Some(cache) = content {
            cache.destroy().await;
        }
        if let Some(cache) = file {
            cache.destroy().await;
        }

        self.initialized.store(false, Ordering::Release);
        info!("Cache manager destroyed");
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}
