// Chorus Core — SQLite Store
// Chat history, connection checkpoints and the durable flush queue, all in
// one SQLite database behind a small bounded connection pool.
//
// Module layout:
//   schema      — idempotent migrations
//   messages    — idempotent batch insert, retention trimming, history queries
//   checkpoints — TTL'd connection checkpoints (CheckpointStore)
//   work_queue  — leased at-least-once unit queue (WorkQueue)
//   memory      — in-process CheckpointStore / WorkQueue for tests and
//                 memory-only deployments
//
// Blocking SQLite calls run on tokio's blocking pool. Callers wait for a pool
// permit for at most `timeout`; running out surfaces as the retryable
// `PoolExhausted`, never as a hang.

pub mod checkpoints;
pub mod memory;
pub mod messages;
mod schema;
pub mod work_queue;

pub use checkpoints::SqliteCheckpointStore;
pub use memory::{MemoryCheckpointStore, MemoryWorkQueue};
pub use messages::{MessageStore, RetentionPolicy};
pub use work_queue::SqliteWorkQueue;

use crate::atoms::constants::DEFAULT_POOL_TIMEOUT_MS;
use crate::atoms::error::{EngineError, EngineResult};
use log::info;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Bounded pool of SQLite connections.
pub struct StorePool {
    conns: Vec<Mutex<Connection>>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    path: Option<PathBuf>,
}

fn configure(conn: &Connection) -> EngineResult<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
    conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
    Ok(())
}

impl StorePool {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path, size: usize, timeout: Duration) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!("[store] Opening {:?} (pool of {})", path, size.max(1));

        let mut conns = Vec::with_capacity(size.max(1));
        for i in 0..size.max(1) {
            let conn = Connection::open(path)?;
            configure(&conn)?;
            if i == 0 {
                schema::run_migrations(&conn)?;
            }
            conns.push(Mutex::new(conn));
        }
        Ok(Self::from_connections(conns, timeout, Some(path.to_path_buf())))
    }

    /// A single in-memory connection. Each in-memory connection is its own
    /// database, so the pool cannot be wider than one.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::run_migrations(&conn)?;
        Ok(Self::from_connections(
            vec![Mutex::new(conn)],
            Duration::from_millis(DEFAULT_POOL_TIMEOUT_MS),
            None,
        ))
    }

    fn from_connections(conns: Vec<Mutex<Connection>>, timeout: Duration, path: Option<PathBuf>) -> Self {
        let permits = Arc::new(Semaphore::new(conns.len()));
        StorePool { conns, permits, timeout, path }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn size(&self) -> usize {
        self.conns.len()
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `f` against a pooled connection on the blocking pool.
    pub async fn run<T, F>(self: &Arc<Self>, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> EngineResult<T> + Send + 'static,
    {
        let permit = tokio::time::timeout(self.timeout, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| EngineError::PoolExhausted { waited_ms: self.timeout.as_millis() as u64 })?
            .map_err(|_| EngineError::Other("storage pool closed".into()))?;

        let pool = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            pool.with_conn(f)
        })
        .await
        .map_err(|e| EngineError::Other(format!("storage task failed: {}", e)))?
    }

    /// Run `f` on the calling thread. Holders of a permit always find a free
    /// slot; callers without one block on the first slot.
    pub fn with_conn<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&mut Connection) -> EngineResult<T>,
    {
        for slot in &self.conns {
            if let Some(mut conn) = slot.try_lock() {
                return f(&mut *conn);
            }
        }
        let mut conn = self.conns[0].lock();
        f(&mut *conn)
    }
}
