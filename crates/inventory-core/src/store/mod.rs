//! Connection and lifecycle manager for the embedded SQLite store.
//!
//! Lifecycle: `Uninitialized -> Initializing -> Ready -> ShuttingDown -> Closed`.
//! Connections are handed out only in `Ready`.
//!
//! Lock order is always quiesce lock, then init lock. Writers hold the
//! quiesce lock shared; backup, restore and shutdown hold it exclusively.

pub mod recovery;
pub mod retry;
pub mod schema;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cipher::CipherService;
use crate::config::ConfigSource;
use crate::error::ErrorClass;
use crate::fsutil;
use crate::key_vault::CryptoError;
use crate::paths::Layout;

pub use recovery::{Probe, RecoveryOutcome};
pub use retry::{is_busy, RetryPolicy};

pub type SqlitePool = r2d2::Pool<SqliteConnectionManager>;
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store is disabled by configuration")]
    Disabled,

    #[error("encryption subsystem unavailable: {0}")]
    EncryptionUnavailable(#[source] CryptoError),

    #[error("store I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot open connection pool: {0}")]
    Connection(#[source] r2d2::Error),

    #[error("no pooled connection available: {0}")]
    PoolExhausted(#[source] r2d2::Error),

    #[error("store {path} is unusable after recovery: {reason}")]
    Unrecoverable { path: PathBuf, reason: String },

    #[error("store has been shut down")]
    Closed,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Disabled | StoreError::Closed => ErrorClass::Configuration,
            StoreError::EncryptionUnavailable(_) => ErrorClass::Crypto,
            StoreError::Io { .. } | StoreError::Connection(_) => ErrorClass::Io,
            StoreError::PoolExhausted(_) => ErrorClass::Contention,
            StoreError::Unrecoverable { .. } => ErrorClass::Integrity,
            StoreError::Sqlite(e) if retry::is_busy(e) => ErrorClass::Contention,
            StoreError::Sqlite(e) if recovery::is_corruption(e) => ErrorClass::Integrity,
            StoreError::Sqlite(_) => ErrorClass::Io,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, StoreError::Sqlite(e) if retry::is_busy(e))
    }

    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StoreState {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
    Closed,
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub pool_size: u32,
    /// How long `get_connection` waits for a free pooled connection.
    pub acquire_timeout: Duration,
    /// SQLite busy handler timeout per statement.
    pub busy_timeout: Duration,
    /// `PRAGMA cache_size`; negative values are KiB.
    pub cache_size: i64,
    pub retry: RetryPolicy,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            pool_size: 8,
            acquire_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_secs(5),
            cache_size: -16_000,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointResult {
    /// SQLite could not finish because a reader or writer was active.
    pub busy: bool,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub ok: bool,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalStatus {
    pub journal_mode: String,
    pub wal_file_bytes: u64,
    pub page_size: i64,
    pub page_count: i64,
    pub freelist_count: i64,
}

/// Exclusive write window. New transactions block until it is dropped.
pub struct QuiesceGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

/// Held by a restore between closing the pool and re-opening it. Writers and
/// lazy initialisation both wait on it.
pub struct RestoreLease<'a> {
    manager: &'a StoreManager,
    _init: MutexGuard<'a, ()>,
    _quiesce: RwLockWriteGuard<'a, ()>,
}

impl<'a> RestoreLease<'a> {
    pub fn layout(&self) -> &Layout {
        &self.manager.layout
    }

    /// Re-run the full initialisation sequence against the replaced file.
    pub fn reopen(self) -> Result<(), StoreError> {
        self.manager.initialize_locked()
    }
}

/// Owns the pool. Construct one per process and share it by `Arc`.
pub struct StoreManager {
    layout: Layout,
    cipher: CipherService,
    config: Arc<dyn ConfigSource>,
    options: StoreOptions,
    state: Mutex<StoreState>,
    pool: RwLock<Option<SqlitePool>>,
    init_lock: Mutex<()>,
    quiesce_lock: RwLock<()>,
    shutdown_hook: AtomicBool,
}

impl StoreManager {
    /// The store path from configuration, when set, overrides the layout's.
    pub fn new(
        layout: Layout,
        cipher: CipherService,
        config: Arc<dyn ConfigSource>,
        options: StoreOptions,
    ) -> Self {
        let layout = match config.settings().store_path {
            Some(path) => layout.with_store_file(path),
            None => layout,
        };
        Self {
            layout,
            cipher,
            config,
            options,
            state: Mutex::new(StoreState::Uninitialized),
            pool: RwLock::new(None),
            init_lock: Mutex::new(()),
            quiesce_lock: RwLock::new(()),
            shutdown_hook: AtomicBool::new(false),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn store_file(&self) -> &Path {
        self.layout.store_file()
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn state(&self) -> StoreState {
        *self.state.lock()
    }

    /// Whether `Drop` will checkpoint and close the pool.
    pub fn shutdown_hook_armed(&self) -> bool {
        self.shutdown_hook.load(Ordering::SeqCst)
    }

    /// Bring the store to `Ready`. A second call in `Ready` does nothing.
    pub fn initialize(&self) -> Result<(), StoreError> {
        let _init = self.init_lock.lock();
        self.initialize_locked()
    }

    fn initialize_locked(&self) -> Result<(), StoreError> {
        {
            let mut state = self.state.lock();
            match *state {
                StoreState::Ready => return Ok(()),
                StoreState::ShuttingDown | StoreState::Closed => return Err(StoreError::Closed),
                StoreState::Uninitialized | StoreState::Initializing => {
                    *state = StoreState::Initializing;
                }
            }
        }
        match self.open() {
            Ok(pool) => {
                *self.pool.write() = Some(pool);
                *self.state.lock() = StoreState::Ready;
                // armed once per manager, however often it re-opens
                if !self.shutdown_hook.swap(true, Ordering::SeqCst) {
                    debug!("shutdown checkpoint armed");
                }
                info!(path = %self.layout.store_file().display(), "store ready");
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = StoreState::Uninitialized;
                error!(error = %e, "store initialisation failed");
                Err(e)
            }
        }
    }

    fn open(&self) -> Result<SqlitePool, StoreError> {
        if !self.config.settings().store_enabled {
            return Err(StoreError::Disabled);
        }

        // the key must round-trip before any encrypted column is read
        self.cipher
            .self_test()
            .map_err(StoreError::EncryptionUnavailable)?;

        let store_dir = self.layout.store_dir();
        fs::create_dir_all(store_dir).map_err(|e| StoreError::io(store_dir, e))?;

        // staged now, promoted only if the file probes clean
        let staged = recovery::stage_snapshot(&self.layout);

        // probed on a dedicated connection before the pool opens, so a
        // corrupt file never reaches the pool's connection initialiser
        let store_file = self.layout.store_file();
        match recovery::probe_file(store_file)? {
            Probe::Healthy => {
                if let Some(snapshot) = staged {
                    snapshot.promote(&self.layout);
                }
            }
            Probe::Corrupt(reason) => {
                if let Some(snapshot) = staged {
                    snapshot.discard();
                }
                recovery::recover(&self.layout, &reason)
                    .map_err(|e| StoreError::io(store_file, e))?;
                if let Probe::Corrupt(reason) = recovery::probe_file(store_file)? {
                    return Err(StoreError::Unrecoverable {
                        path: store_file.to_path_buf(),
                        reason,
                    });
                }
            }
        }

        let pool = self.build_pool()?;
        let conn = pool.get().map_err(StoreError::PoolExhausted)?;
        if let Probe::Corrupt(reason) = recovery::probe_connection(&conn)? {
            return Err(StoreError::Unrecoverable {
                path: store_file.to_path_buf(),
                reason,
            });
        }

        schema::apply(&conn)?;
        drop(conn);

        info!(
            path = %store_file.display(),
            pool_size = self.options.pool_size,
            "connection pool opened"
        );
        Ok(pool)
    }

    fn build_pool(&self) -> Result<SqlitePool, StoreError> {
        let busy_timeout = self.options.busy_timeout;
        let cache_size = self.options.cache_size;
        let manager = SqliteConnectionManager::file(self.layout.store_file()).with_init(
            move |conn: &mut Connection| {
                conn.busy_timeout(busy_timeout)?;
                let mode: String =
                    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
                if !mode.eq_ignore_ascii_case("wal") {
                    warn!(journal_mode = %mode, "WAL journal mode not accepted");
                }
                conn.pragma_update(None, "synchronous", "FULL")?;
                conn.pragma_update(None, "foreign_keys", true)?;
                conn.pragma_update(None, "cache_size", cache_size)?;
                Ok(())
            },
        );
        r2d2::Pool::builder()
            .max_size(self.options.pool_size)
            .connection_timeout(self.options.acquire_timeout)
            .build(manager)
            .map_err(StoreError::Connection)
    }

    fn current_pool(&self) -> Option<SqlitePool> {
        self.pool.read().clone()
    }

    /// A pooled connection, initialising the store first if needed.
    pub fn get_connection(&self) -> Result<PooledConnection, StoreError> {
        if self.state() != StoreState::Ready {
            self.initialize()?;
        }
        let pool = self.current_pool().ok_or(StoreError::Closed)?;
        pool.get().map_err(StoreError::PoolExhausted)
    }

    /// Flush every WAL frame into the main file and truncate the log.
    pub fn checkpoint(&self) -> Result<CheckpointResult, StoreError> {
        let conn = self.get_connection()?;
        self.checkpoint_on(&conn)
    }

    fn checkpoint_on(&self, conn: &Connection) -> Result<CheckpointResult, StoreError> {
        let policy = self.options.retry;
        let attempts = policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            let (busy, log_frames, checkpointed_frames): (i64, i64, i64) =
                conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
            let result = CheckpointResult {
                busy: busy != 0,
                log_frames,
                checkpointed_frames,
            };
            if !result.busy {
                debug!(frames = checkpointed_frames, "checkpoint complete");
                return Ok(result);
            }
            if attempt >= attempts {
                warn!(
                    log_frames,
                    checkpointed_frames,
                    "checkpoint could not complete while the store was busy"
                );
                return Ok(result);
            }
            thread::sleep(policy.backoff(attempt));
            attempt += 1;
        }
    }

    /// Write a transactionally consistent copy of the store to `dest` with
    /// `VACUUM INTO`. Frames still in the WAL are included, so the copy holds
    /// every commit that finished before the call even when an open reader
    /// keeps a checkpoint from completing. `dest` is replaced if present.
    pub fn snapshot_into(&self, dest: &Path) -> Result<(), StoreError> {
        let target = dest.to_str().ok_or_else(|| {
            StoreError::io(
                dest,
                io::Error::new(io::ErrorKind::InvalidInput, "snapshot path is not UTF-8"),
            )
        })?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        retry::with_retry(self.options.retry, "snapshot", StoreError::is_busy, |_| {
            // VACUUM INTO refuses an existing target, including a partial one
            fsutil::remove_if_exists(dest).map_err(|e| StoreError::io(dest, e))?;
            let conn = self.get_connection()?;
            conn.execute("VACUUM INTO ?1", [target])?;
            Ok(())
        })?;
        debug!(path = %dest.display(), "store snapshot written");
        Ok(())
    }

    /// Run `op` in an immediate transaction: commit on `Ok`, roll back on
    /// `Err`. Busy errors are retried per [`StoreOptions::retry`].
    pub fn run_in_transaction<T, F>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut(&Transaction<'_>) -> rusqlite::Result<T>,
    {
        let _writers = self.quiesce_lock.read_recursive();
        retry::with_retry(
            self.options.retry,
            "transaction",
            StoreError::is_busy,
            |attempt| {
                let mut conn = self.get_connection()?;
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                match op(&tx) {
                    Ok(value) => {
                        tx.commit()?;
                        Ok(value)
                    }
                    Err(e) => {
                        if let Err(rb) = tx.rollback() {
                            warn!(attempt, error = %rb, "rollback failed");
                        }
                        Err(e.into())
                    }
                }
            },
        )
    }

    /// Single-statement variant in autocommit mode, same retry policy.
    pub fn run_with_retry<T, F>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut(&Connection) -> rusqlite::Result<T>,
    {
        let _writers = self.quiesce_lock.read_recursive();
        retry::with_retry(self.options.retry, "statement", StoreError::is_busy, |_| {
            let conn = self.get_connection()?;
            Ok(op(&conn)?)
        })
    }

    /// Block new writers until the guard drops. In-flight writers finish first.
    pub fn quiesce(&self) -> QuiesceGuard<'_> {
        QuiesceGuard {
            _guard: self.quiesce_lock.write(),
        }
    }

    /// Exhaustive `PRAGMA integrity_check`. Diagnostic only.
    pub fn full_integrity_check(&self) -> Result<IntegrityReport, StoreError> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare("PRAGMA integrity_check")?;
        let messages = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let ok = messages.len() == 1 && messages[0].eq_ignore_ascii_case("ok");
        if !ok {
            warn!(problems = messages.len(), "integrity check reported problems");
        }
        Ok(IntegrityReport { ok, messages })
    }

    pub fn wal_status(&self) -> Result<WalStatus, StoreError> {
        let conn = self.get_connection()?;
        let pragma = |name: &str| -> rusqlite::Result<i64> {
            conn.query_row(&format!("PRAGMA {name}"), [], |row| row.get(0))
        };
        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let wal_file_bytes = fs::metadata(self.layout.wal_file())
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(WalStatus {
            journal_mode,
            wal_file_bytes,
            page_size: pragma("page_size")?,
            page_count: pragma("page_count")?,
            freelist_count: pragma("freelist_count")?,
        })
    }

    /// Checkpoint and close the pool so the live file can be replaced. The
    /// returned lease keeps writers and re-initialisation out until dropped
    /// or [`RestoreLease::reopen`]ed.
    pub fn release_for_restore(&self) -> Result<RestoreLease<'_>, StoreError> {
        let quiesce = self.quiesce_lock.write();
        let init = self.init_lock.lock();
        {
            let state = *self.state.lock();
            if matches!(state, StoreState::ShuttingDown | StoreState::Closed) {
                return Err(StoreError::Closed);
            }
        }
        self.close_pool("restore");
        *self.state.lock() = StoreState::Uninitialized;
        Ok(RestoreLease {
            manager: self,
            _init: init,
            _quiesce: quiesce,
        })
    }

    /// Final checkpoint and pool close. Idempotent.
    pub fn shutdown(&self) {
        let _quiesce = self.quiesce_lock.write();
        let _init = self.init_lock.lock();
        {
            let mut state = self.state.lock();
            match *state {
                StoreState::Closed | StoreState::ShuttingDown => return,
                _ => *state = StoreState::ShuttingDown,
            }
        }
        self.close_pool("shutdown");
        *self.state.lock() = StoreState::Closed;
        self.shutdown_hook.store(false, Ordering::SeqCst);
        info!("store closed");
    }

    fn close_pool(&self, reason: &str) {
        let Some(pool) = self.pool.write().take() else {
            return;
        };
        match pool.get() {
            Ok(conn) => {
                if let Err(e) = self.checkpoint_on(&conn) {
                    error!(reason, error = %e, "final checkpoint failed");
                }
            }
            Err(e) => error!(reason, error = %e, "no connection for final checkpoint"),
        }
        drop(pool);
        debug!(reason, "connection pool released");
    }
}

impl Drop for StoreManager {
    fn drop(&mut self) {
        if self.shutdown_hook.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}
