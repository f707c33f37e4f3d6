//! Durable Offline Queue
//!
//! Payloads whose delivery failed transiently are buffered in SQLite so they
//! survive a restart. The queue is a bounded FIFO: ids come from an
//! `AUTOINCREMENT` column and are never reused, so ascending id order is
//! insertion order.
//!
//! Every operation runs under one connection mutex. `enqueue` additionally
//! wraps the size check and insert in an `IMMEDIATE` transaction so the
//! capacity can never be overshot. On disk the connection holds an exclusive
//! SQLite lock from `open` until drop: a second opener, in this process or
//! another, gets [`QueueError::Locked`].

pub mod processor;

pub use processor::{DrainReport, QueueProcessor};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::metrics;

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("queue database {path:?} is held by another process (is the agent running?)")]
    Locked { path: PathBuf },

    #[error("queue storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// A buffered payload awaiting redelivery
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedMessage {
    pub id: i64,
    pub tenant_key: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// Redelivery attempts made by the queue processor
    pub attempts: u32,
}

/// Capacity-bounded FIFO persisted in SQLite
pub struct PersistentQueue {
    conn: Mutex<Connection>,
    capacity: usize,
}

impl PersistentQueue {
    /// Open or create the queue database at `path`
    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Could not create queue directory {}: {}", parent.display(), e);
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA locking_mode = EXCLUSIVE;
             PRAGMA synchronous = FULL;",
        )?;

        // Take the file lock now and keep it for the life of the connection,
        // so only one process ever drains a given queue
        conn.busy_timeout(Duration::ZERO)?;
        conn.execute_batch("BEGIN EXCLUSIVE; COMMIT;")
            .map_err(|e| match e.sqlite_error_code() {
                Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                    QueueError::Locked {
                        path: path.to_path_buf(),
                    }
                }
                _ => QueueError::Storage(e),
            })?;

        let queue = Self::with_connection(conn, capacity)?;
        info!(
            path = %path.display(),
            capacity,
            pending = queue.size()?,
            "Offline queue opened"
        );
        Ok(queue)
    }

    /// In-memory queue for tests and dry runs
    pub fn open_in_memory(capacity: usize) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, capacity)
    }

    fn with_connection(conn: Connection, capacity: usize) -> Result<Self> {
        migrate(&conn)?;
        let queue = Self {
            conn: Mutex::new(conn),
            capacity,
        };
        queue.refresh_depth(&queue.conn.lock())?;
        Ok(queue)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a payload, returning its id
    ///
    /// Fails with [`QueueError::Full`] when the queue already holds
    /// `capacity` messages.
    pub fn enqueue(&self, tenant_key: &str, payload: &Value) -> Result<i64> {
        let body = serde_json::to_string(payload)?;
        let created_at = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let size = count(&tx)?;
        if size >= self.capacity {
            drop(tx);
            metrics::QUEUE_REJECTED_TOTAL.inc();
            warn!(tenant_key, capacity = self.capacity, "Offline queue full, rejecting message");
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }

        tx.execute(
            "INSERT INTO messages (tenant_key, payload, created_at, attempts)
             VALUES (?1, ?2, ?3, 0)",
            params![tenant_key, body, created_at],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        metrics::QUEUE_ENQUEUED_TOTAL.inc();
        metrics::QUEUE_DEPTH.set(size as i64 + 1);
        debug!(tenant_key, id, "Message buffered");
        Ok(id)
    }

    /// Peek at the oldest message without removing it
    ///
    /// A head row that no longer decodes is deleted and counted as dropped
    /// so it cannot block the queue.
    pub fn dequeue(&self) -> Result<Option<QueuedMessage>> {
        let conn = self.conn.lock();
        loop {
            let row = conn
                .query_row(
                    "SELECT id, tenant_key, payload, created_at, attempts
                     FROM messages ORDER BY id ASC LIMIT 1",
                    [],
                    StoredRow::from_row,
                )
                .optional()?;

            let Some(row) = row else {
                return Ok(None);
            };

            let id = row.id;
            match row.decode() {
                Ok(message) => return Ok(Some(message)),
                Err(reason) => {
                    conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
                    metrics::QUEUE_DROPPED_TOTAL.with_label_values(&["corrupt"]).inc();
                    warn!(id, "Dropping undecodable queued message: {}", reason);
                    self.refresh_depth(&conn)?;
                }
            }
        }
    }

    /// Delete a message. Removing an unknown id is a no-op.
    pub fn remove(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        if removed > 0 {
            debug!(id, "Message removed from queue");
        }
        self.refresh_depth(&conn)?;
        Ok(())
    }

    /// Record one more redelivery attempt for `id`
    pub fn increment_attempts(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE messages SET attempts = attempts + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn size(&self) -> Result<usize> {
        let conn = self.conn.lock();
        count(&conn)
    }

    fn refresh_depth(&self, conn: &Connection) -> Result<()> {
        metrics::QUEUE_DEPTH.set(count(conn)? as i64);
        Ok(())
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        [],
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current < 1 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 tenant_key TEXT NOT NULL,
                 payload TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 attempts INTEGER NOT NULL DEFAULT 0
             );",
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
    }

    Ok(())
}

fn count(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
    Ok(n as usize)
}

/// A `messages` row before its text columns are decoded
struct StoredRow {
    id: i64,
    tenant_key: String,
    payload: String,
    created_at: String,
    attempts: u32,
}

impl StoredRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_key: row.get(1)?,
            payload: row.get(2)?,
            created_at: row.get(3)?,
            attempts: row.get(4)?,
        })
    }

    fn decode(self) -> std::result::Result<QueuedMessage, String> {
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| format!("payload is not JSON: {}", e))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| format!("bad created_at {:?}: {}", self.created_at, e))?
            .with_timezone(&Utc);

        Ok(QueuedMessage {
            id: self.id,
            tenant_key: self.tenant_key,
            payload,
            created_at,
            attempts: self.attempts,
        })
    }
}
