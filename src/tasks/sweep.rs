//! Expiry Sweep Task
//!
//! Background task that periodically removes expired entries from a cache
//! engine, so keys that are never read again still leave memory.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{CacheValue, WeakEngine};

/// Spawns a task that sweeps `engine` every `interval`.
///
/// The task holds only a weak reference and stops on its own once the
/// engine is gone. The returned handle is aborted by `destroy()`.
///
/// # Arguments
/// * `engine` - Weak reference to the engine to sweep
/// * `interval` - Time between sweeps
pub fn spawn_sweep_task<V: CacheValue>(engine: WeakEngine<V>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Starting expiry sweep task with interval of {:?}", interval);

        loop {
            tokio::time::sleep(interval).await;

            let Some(engine) = engine.upgrade() else {
                debug!("Cache engine dropped, stopping expiry sweep");
                break;
            };

            let removed = engine.sweep_expired().await;
            if removed > 0 {
                info!(
                    "Expiry sweep: removed {} entries from '{}'",
                    removed,
                    engine.namespace()
                );
            } else {
                debug!("Expiry sweep: no expired entries in '{}'", engine.namespace());
            }
        }
    })
}
