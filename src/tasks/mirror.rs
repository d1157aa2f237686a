//! Mirror Worker
//!
//! Applies in-memory mutations to the persistence backend in the
//! background. Callers enqueue and return immediately; the worker waits for
//! backend initialization, then applies operations in issuance order.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::persistence::{PersistedRecord, SharedAdapter};

// == Mirror Operation ==
/// One queued backend write.
#[derive(Debug)]
pub enum MirrorOp {
    /// Insert or replace a record
    Save(PersistedRecord),
    /// Delete the record of a key
    Delete(String),
    /// Delete every record of the namespace
    Clear,
    /// Acknowledge once every earlier operation has been applied
    Flush(oneshot::Sender<()>),
}

// == Mirror Handle ==
/// Sending side of a mirror worker. Dropping every handle stops the worker
/// after it drains the queue.
#[derive(Debug, Clone)]
pub struct MirrorHandle {
    tx: mpsc::UnboundedSender<MirrorOp>,
}

impl MirrorHandle {
    /// Queues an operation; returns false if the worker is gone.
    pub fn send(&self, op: MirrorOp) -> bool {
        self.tx.send(op).is_ok()
    }
}

/// Spawns the worker mirroring to whatever backend `adapter` holds.
///
/// Nothing is applied until `ready` turns true (or its sender is dropped).
/// Operations arriving while no backend is installed are discarded, which is
/// how writes racing a `destroy()` end up as no-ops.
pub fn spawn_mirror_worker(
    adapter: SharedAdapter,
    mut ready: watch::Receiver<bool>,
) -> (MirrorHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        if ready.wait_for(|ready| *ready).await.is_err() {
            debug!("Persistence initialization ended without signalling readiness");
        }

        while let Some(op) = rx.recv().await {
            let current = adapter.read().clone();
            match (op, current) {
                (MirrorOp::Flush(done), _) => {
                    let _ = done.send(());
                }
                (op, None) => {
                    debug!("No persistence backend, dropping {:?}", op);
                }
                (MirrorOp::Save(record), Some(backend)) => backend.save(record).await,
                (MirrorOp::Delete(key), Some(backend)) => backend.delete(&key).await,
                (MirrorOp::Clear, Some(backend)) => backend.clear().await,
            }
        }

        debug!("Mirror worker stopped");
    });

    (MirrorHandle { tx }, handle)
}
