//! Configuration Module
//!
//! Per-instance cache configuration, the two named presets used by the
//! cache manager, and environment overrides.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default directory for backend files when none is configured.
pub const DEFAULT_STORAGE_DIR: &str = ".repo_cache";

/// Default period of the expiry sweep.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

// == Cache Config ==
/// Immutable configuration of one cache instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied to entries below the frequent-access threshold
    pub default_ttl: Duration,
    /// Lower clamp of the adaptive TTL
    pub min_ttl: Duration,
    /// Upper clamp of the adaptive TTL
    pub max_ttl: Duration,
    /// Extends the TTL of frequently read entries when enabled
    pub enable_adaptive_ttl: bool,
    /// Access count at which an entry counts as frequently accessed
    pub frequent_access_threshold: u32,
    /// TTL multiplier for frequently accessed entries
    pub frequent_access_multiplier: f64,
    /// Entry-count ceiling of the in-memory tier
    pub max_size: usize,
    /// Fraction of `max_size` that triggers eviction (0..=1)
    pub memory_pressure_threshold: f64,
    /// Mirrors entries to a persistence backend when enabled
    pub enable_persistence: bool,
    /// Prefers the durable store over the flat store
    pub use_durable_store: bool,
    /// Backend key prefix and durable database name
    pub storage_namespace: String,
    /// Directory holding the backend files
    pub storage_dir: PathBuf,
    /// Allows `prefetch` to schedule background reads
    pub enable_prefetch: bool,
    /// Delay before a prefetch batch runs
    pub prefetch_delay: Duration,
    /// Period of the expiry sweep
    pub cleanup_interval: Duration,
    /// How long opening the durable store may wait on a lock held elsewhere
    pub durable_busy_timeout: Duration,
}

impl CacheConfig {
    // == Presets ==
    /// Preset for repository content listings (directory trees, metadata).
    pub fn content() -> Self {
        Self {
            default_ttl: Duration::from_secs(10 * 60),
            min_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(60 * 60),
            max_size: 500,
            storage_namespace: "github_content_cache".to_string(),
            ..Self::default()
        }
    }

    /// Preset for raw file downloads, which change least often.
    pub fn file() -> Self {
        Self {
            default_ttl: Duration::from_secs(30 * 60),
            min_ttl: Duration::from_secs(5 * 60),
            max_ttl: Duration::from_secs(2 * 60 * 60),
            max_size: 200,
            storage_namespace: "github_file_cache".to_string(),
            ..Self::default()
        }
    }

    /// Returns a copy with persistence switched off.
    ///
    /// Handy for purely in-memory caches and tests.
    pub fn in_memory(mut self) -> Self {
        self.enable_persistence = false;
        self
    }

    /// Returns a copy storing backend files under `dir`.
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            min_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(30 * 60),
            enable_adaptive_ttl: true,
            frequent_access_threshold: 5,
            frequent_access_multiplier: 2.0,
            max_size: 1000,
            memory_pressure_threshold: 0.8,
            enable_persistence: true,
            use_durable_store: true,
            storage_namespace: "repo_cache".to_string(),
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            enable_prefetch: true,
            prefetch_delay: Duration::from_millis(100),
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            durable_busy_timeout: Duration::from_secs(5),
        }
    }
}

// == Manager Config ==
/// Configuration of the two named caches owned by the cache manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Cache for repository content listings
    pub content: CacheConfig,
    /// Cache for raw file downloads
    pub file: CacheConfig,
}

impl ManagerConfig {
    /// Creates a ManagerConfig from the presets overlaid with environment
    /// variables.
    ///
    /// # Environment Variables
    /// - `REPO_CACHE_DIR` - Directory for backend files (default: `.repo_cache`)
    /// - `REPO_CACHE_PERSISTENCE` - Enable persistence (default: true)
    /// - `REPO_CACHE_DURABLE` - Prefer the durable store (default: true)
    /// - `REPO_CACHE_PREFETCH` - Enable prefetch (default: true)
    /// - `REPO_CACHE_CLEANUP_INTERVAL` - Sweep period in seconds (default: 300)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = env::var("REPO_CACHE_DIR") {
            config.content.storage_dir = PathBuf::from(&dir);
            config.file.storage_dir = PathBuf::from(dir);
        }
        if let Some(enabled) = env_flag("REPO_CACHE_PERSISTENCE") {
            config.content.enable_persistence = enabled;
            config.file.enable_persistence = enabled;
        }
        if let Some(enabled) = env_flag("REPO_CACHE_DURABLE") {
            config.content.use_durable_store = enabled;
            config.file.use_durable_store = enabled;
        }
        if let Some(enabled) = env_flag("REPO_CACHE_PREFETCH") {
            config.content.enable_prefetch = enabled;
            config.file.enable_prefetch = enabled;
        }
        if let Some(secs) = env::var("REPO_CACHE_CLEANUP_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
        {
            config.content.cleanup_interval = Duration::from_secs(secs);
            config.file.cleanup_interval = Duration::from_secs(secs);
        }

        config
    }

    /// Returns a copy storing both caches' backend files under `dir`.
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.content.storage_dir = dir.clone();
        self.file.storage_dir = dir;
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            content: CacheConfig::content(),
            file: CacheConfig::file(),
        }
    }
}

/// Parses boolean-ish environment values; anything else is ignored.
fn env_flag(name: &str) -> Option<bool> {
    match env::var(name).ok()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = CacheConfig::default();
        assert_eq!(config.default_ttl, Duration::from_secs(300));
        assert_eq!(config.max_size, 1000);
        assert_eq!(config.cleanup_interval, DEFAULT_CLEANUP_INTERVAL);
        assert!(config.enable_persistence);
        assert!(config.use_durable_store);
    }

    #[test]
    fn test_presets_order_ttls() {
        let content = CacheConfig::content();
        let file = CacheConfig::file();

        assert!(file.default_ttl > content.default_ttl);
        assert!(content.default_ttl > CacheConfig::default().default_ttl);
        assert_ne!(content.storage_namespace, file.storage_namespace);
    }

    #[test]
    fn test_in_memory_disables_persistence() {
        let config = CacheConfig::content().in_memory();
        assert!(!config.enable_persistence);
    }

    #[test]
    fn test_manager_with_storage_dir() {
        let config = ManagerConfig::default().with_storage_dir("/tmp/somewhere");
        assert_eq!(config.content.storage_dir, PathBuf::from("/tmp/somewhere"));
        assert_eq!(config.file.storage_dir, PathBuf::from("/tmp/somewhere"));
    }

    #[test]
    fn test_manager_from_env() {
        env::set_var("REPO_CACHE_DIR", "/tmp/repo_cache_env");
        env::set_var("REPO_CACHE_DURABLE", "off");
        env::set_var("REPO_CACHE_CLEANUP_INTERVAL", "not-a-number");

        let config = ManagerConfig::from_env();
        assert_eq!(
            config.content.storage_dir,
            PathBuf::from("/tmp/repo_cache_env")
        );
        assert!(!config.file.use_durable_store);
        assert_eq!(config.content.cleanup_interval, DEFAULT_CLEANUP_INTERVAL);

        env::remove_var("REPO_CACHE_DIR");
        env::remove_var("REPO_CACHE_DURABLE");
        env::remove_var("REPO_CACHE_CLEANUP_INTERVAL");
    }
}
