//! Durable Store
//!
//! SQLite-backed persistence: one database per cache namespace holding a
//! single `cache_entries` table indexed on `timestamp` and `last_access`.
//!
//! Opening walks an explicit state machine:
//!
//! ```text
//! Closed -> Opening -> Upgrading -> Open
//!                  \-> Open
//!                  \-> Blocked   (lock held elsewhere past the busy timeout)
//!                  \-> Failed
//! ```
//!
//! The schema version lives in `PRAGMA user_version`; it is bumped by one
//! each time the entry table has to be created.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};
use crate::persistence::{BackendKind, PersistedRecord, StorageBackend};

const CREATE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS cache_entries (
        key TEXT PRIMARY KEY NOT NULL,
        data TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        last_access INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_cache_entries_timestamp ON cache_entries(timestamp);
    CREATE INDEX IF NOT EXISTS idx_cache_entries_last_access ON cache_entries(last_access);
";

/// Returns the database name derived from a storage namespace.
///
/// Non-alphanumeric characters are replaced by `_`.
pub fn database_name(namespace: &str) -> String {
    let sanitized: String = namespace
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_db", sanitized)
}

// == Store Phase ==
/// Lifecycle phase of a durable store handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePhase {
    Closed,
    Opening,
    Upgrading,
    Open,
    Blocked,
    Failed,
}

struct StoreState {
    phase: StorePhase,
    conn: Option<Connection>,
}

// == Durable Store ==
/// SQLite persistence backend for one namespace.
pub struct DurableStore {
    path: PathBuf,
    state: Arc<Mutex<StoreState>>,
}

impl DurableStore {
    /// Returns the database file used for `namespace` under `dir`.
    pub fn path_for(dir: &Path, namespace: &str) -> PathBuf {
        dir.join(format!("{}.sqlite3", database_name(namespace)))
    }

    // == Open ==
    /// Opens (creating or upgrading when needed) the namespace database.
    pub async fn open(dir: &Path, namespace: &str, busy_timeout: Duration) -> Result<Self> {
        let store = Self {
            path: Self::path_for(dir, namespace),
            state: Arc::new(Mutex::new(StoreState {
                phase: StorePhase::Closed,
                conn: None,
            })),
        };

        let path = store.path.clone();
        let state = store.state.clone();
        tokio::task::spawn_blocking(move || open_blocking(&path, &state, busy_timeout)).await??;

        Ok(store)
    }

    // == Open With Recovery ==
    /// Opens the store; on failure deletes the namespace database and retries
    /// once.
    ///
    /// A [`CacheError::Blocked`] store is never deleted since another holder
    /// is still using it.
    pub async fn open_with_recovery(
        dir: &Path,
        namespace: &str,
        busy_timeout: Duration,
    ) -> Result<Self> {
        match Self::open(dir, namespace, busy_timeout).await {
            Ok(store) => Ok(store),
            Err(err @ CacheError::Blocked(_)) => Err(err),
            Err(err) => {
                warn!(
                    "Durable store '{}' failed to open ({}), deleting and retrying",
                    namespace, err
                );
                let path = Self::path_for(dir, namespace);
                let deleted =
                    tokio::task::spawn_blocking(move || delete_database_files(&path)).await?;
                if let Err(err) = deleted {
                    warn!("Could not delete durable store '{}': {}", namespace, err);
                }
                Self::open(dir, namespace, busy_timeout).await
            }
        }
    }

    // == Accessors ==
    /// Returns the current lifecycle phase.
    pub fn phase(&self) -> StorePhase {
        self.state.lock().phase
    }

    /// Returns the database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the schema version (`PRAGMA user_version`).
    pub async fn schema_version(&self) -> Result<u32> {
        self.with_conn(|conn| Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?))
            .await
    }

    /// Runs `f` against the open connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || {
            let guard = state.lock();
            let conn = guard.conn.as_ref().ok_or(CacheError::Closed)?;
            f(conn)
        })
        .await?
    }
}

#[async_trait]
impl StorageBackend for DurableStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Durable
    }

    async fn load(&self, key: &str) -> Result<Option<PersistedRecord>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT key, data, timestamp, last_access FROM cache_entries WHERE key = ?1",
                    params![key],
                    record_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn save(&self, record: PersistedRecord) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cache_entries (key, data, timestamp, last_access)
                 VALUES (?1, ?2, ?3, ?4)",
                params![record.key, record.data, record.timestamp, record.last_access],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM cache_entries", [])?;
            Ok(())
        })
        .await
    }

    async fn load_all(&self) -> Result<Vec<PersistedRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, data, timestamp, last_access FROM cache_entries ORDER BY last_access",
            )?;
            let records = stmt
                .query_map([], record_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }

    async fn close(&self) {
        let state = self.state.clone();
        let closed = tokio::task::spawn_blocking(move || {
            let mut guard = state.lock();
            guard.conn.take();
            guard.phase = StorePhase::Closed;
        })
        .await;
        if let Err(err) = closed {
            warn!("Closing durable store failed: {}", err);
        }
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<PersistedRecord> {
    Ok(PersistedRecord {
        key: row.get(0)?,
        data: row.get(1)?,
        timestamp: row.get(2)?,
        last_access: row.get(3)?,
    })
}

fn open_blocking(path: &Path, state: &Mutex<StoreState>, busy_timeout: Duration) -> Result<()> {
    state.lock().phase = StorePhase::Opening;

    let result = open_connection(path, state, busy_timeout);

    let mut guard = state.lock();
    match result {
        Ok(conn) => {
            guard.conn = Some(conn);
            guard.phase = StorePhase::Open;
            debug!("Durable store open at {}", path.display());
            Ok(())
        }
        Err(err) => {
            guard.phase = match err {
                CacheError::Blocked(_) => StorePhase::Blocked,
                _ => StorePhase::Failed,
            };
            Err(err)
        }
    }
}

fn open_connection(
    path: &Path,
    state: &Mutex<StoreState>,
    busy_timeout: Duration,
) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut conn = Connection::open(path).map_err(classify)?;
    conn.busy_timeout(busy_timeout).map_err(classify)?;

    let version: u32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(classify)?;

    if !has_entry_table(&conn)? {
        state.lock().phase = StorePhase::Upgrading;
        let target = version + 1;
        upgrade_schema(&mut conn, target)?;
        info!(
            "Durable store {} upgraded from schema v{} to v{}",
            path.display(),
            version,
            target
        );
    }

    Ok(conn)
}

fn has_entry_table(conn: &Connection) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'cache_entries'",
            [],
            |row| row.get(0),
        )
        .map_err(classify)?;
    Ok(count > 0)
}

fn upgrade_schema(conn: &mut Connection, target: u32) -> Result<()> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(classify)?;
    tx.execute_batch(CREATE_SCHEMA).map_err(classify)?;
    tx.pragma_update(None, "user_version", target)
        .map_err(classify)?;
    tx.commit().map_err(classify)
}

/// Maps lock contention to [`CacheError::Blocked`], everything else to
/// [`CacheError::Sqlite`].
fn classify(err: rusqlite::Error) -> CacheError {
    match &err {
        rusqlite::Error::SqliteFailure(ffi, _)
            if matches!(ffi.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            CacheError::Blocked(err.to_string())
        }
        _ => CacheError::Sqlite(err),
    }
}

/// Deletes the database file and its journal siblings.
fn delete_database_files(path: &Path) -> Result<()> {
    let mut targets = vec![path.to_path_buf()];
    for suffix in ["-journal", "-wal", "-shm"] {
        let mut sibling = path.as_os_str().to_owned();
        sibling.push(suffix);
        targets.push(PathBuf::from(sibling));
    }

    for target in targets {
        match std::fs::remove_file(&target) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
