//! Shared work store: a FIFO queue of run identifiers plus short-TTL keys
//! used for advisory locks and attempt counters.
//!
//! Backed by SQLite in WAL mode so several worker processes on one host
//! can share a file. All mutual exclusion is "set if absent with TTL"; it
//! is advisory, not consensus.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tokio_rusqlite::Connection;

use crate::types::{ProjectId, RunId, DEFAULT_PROJECT_ID};

/// Poll interval used by [`WorkStore::pop_front_wait`].
const POP_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("work store error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("work store path: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(tokio_rusqlite::Error::Rusqlite(e))
    }
}

// ---------------------------------------------------------------------------
// QueueItem
// ---------------------------------------------------------------------------

/// A queued run reference, `"<project_id>:<run_id>"` or legacy `"<run_id>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueItem {
    pub project_id: ProjectId,
    pub run_id: RunId,
}

impl QueueItem {
    pub fn new(project_id: ProjectId, run_id: RunId) -> Self {
        Self { project_id, run_id }
    }

    /// Parse a queue entry. Returns `None` for anything that is not one or
    /// two integers separated by a colon.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        match raw.split_once(':') {
            Some((pid, rid)) => Some(Self {
                project_id: pid.trim().parse().ok()?,
                run_id: rid.trim().parse().ok()?,
            }),
            None => Some(Self {
                project_id: DEFAULT_PROJECT_ID,
                run_id: raw.parse().ok()?,
            }),
        }
    }
}

impl fmt::Display for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project_id, self.run_id)
    }
}

// ---------------------------------------------------------------------------
// WorkStore
// ---------------------------------------------------------------------------

pub struct WorkStore {
    conn: Connection,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

impl WorkStore {
    /// Open (or create) a store at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema(true).await?;
        Ok(store)
    }

    /// Create a purely in-memory store (useful for tests).
    pub async fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema(false).await?;
        Ok(store)
    }

    async fn init_schema(&self, wal: bool) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                if wal {
                    conn.execute_batch(
                        "
                        PRAGMA journal_mode=WAL;
                        PRAGMA synchronous=NORMAL;
                        PRAGMA busy_timeout=5000;
                        ",
                    )?;
                }
                conn.execute_batch(
                    "
                    CREATE TABLE IF NOT EXISTS queue_items (
                        position INTEGER PRIMARY KEY,
                        item     TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS ttl_keys (
                        key        TEXT PRIMARY KEY,
                        value      INTEGER NOT NULL DEFAULT 0,
                        expires_at INTEGER NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_ttl_keys_expires ON ttl_keys(expires_at);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queue
    // -----------------------------------------------------------------------

    pub async fn push_back(&self, item: impl Into<String>) -> Result<(), StoreError> {
        let item = item.into();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO queue_items (position, item)
                     VALUES ((SELECT COALESCE(MAX(position), 0) + 1 FROM queue_items), ?1)",
                    rusqlite::params![item],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn push_front(&self, item: impl Into<String>) -> Result<(), StoreError> {
        let item = item.into();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO queue_items (position, item)
                     VALUES ((SELECT COALESCE(MIN(position), 1) - 1 FROM queue_items), ?1)",
                    rusqlite::params![item],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn pop_front(&self) -> Result<Option<String>, StoreError> {
        let item = self
            .conn
            .call(|conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let head: Option<(i64, String)> = {
                    let mut stmt = tx.prepare(
                        "SELECT position, item FROM queue_items ORDER BY position ASC LIMIT 1",
                    )?;
                    let mut rows = stmt.query([])?;
                    match rows.next()? {
                        Some(row) => Some((row.get(0)?, row.get(1)?)),
                        None => None,
                    }
                };
                if let Some((position, _)) = &head {
                    tx.execute(
                        "DELETE FROM queue_items WHERE position = ?1",
                        rusqlite::params![position],
                    )?;
                }
                tx.commit()?;
                Ok(head.map(|(_, item)| item))
            })
            .await?;
        Ok(item)
    }

    /// Pop the head of the queue, waiting up to `timeout` for an item.
    pub async fn pop_front_wait(&self, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(item) = self.pop_front().await? {
                return Ok(Some(item));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POP_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        let n = self
            .conn
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM queue_items", [], |r| r.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Snapshot of the queue contents, head first.
    pub async fn items(&self) -> Result<Vec<String>, StoreError> {
        let items = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT item FROM queue_items ORDER BY position ASC")?;
                let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;
        Ok(items)
    }

    // -----------------------------------------------------------------------
    // TTL keys
    // -----------------------------------------------------------------------

    /// Set `key` if it is absent or expired. Returns `true` when this call
    /// acquired the key.
    pub async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let key = key.to_string();
        let now = now_millis();
        let expires_at = now.saturating_add(ttl_millis(ttl));
        let acquired = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                tx.execute(
                    "DELETE FROM ttl_keys WHERE key = ?1 AND expires_at <= ?2",
                    rusqlite::params![key, now],
                )?;
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO ttl_keys (key, value, expires_at) VALUES (?1, 1, ?2)",
                    rusqlite::params![key, expires_at],
                )?;
                tx.commit()?;
                Ok(inserted == 1)
            })
            .await?;
        Ok(acquired)
    }

    /// Increment a counter, (re)arming its TTL. An expired counter restarts
    /// from zero.
    pub async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let key = key.to_string();
        let now = now_millis();
        let expires_at = now.saturating_add(ttl_millis(ttl));
        let value = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                tx.execute(
                    "DELETE FROM ttl_keys WHERE key = ?1 AND expires_at <= ?2",
                    rusqlite::params![key, now],
                )?;
                let value: i64 = tx.query_row(
                    "INSERT INTO ttl_keys (key, value, expires_at) VALUES (?1, 1, ?2)
                     ON CONFLICT(key) DO UPDATE SET
                        value = value + 1, expires_at = excluded.expires_at
                     RETURNING value",
                    rusqlite::params![key, expires_at],
                    |r| r.get(0),
                )?;
                tx.commit()?;
                Ok(value)
            })
            .await?;
        Ok(value)
    }

    /// Current counter value; absent or expired keys read as `0`.
    pub async fn get_counter(&self, key: &str) -> Result<i64, StoreError> {
        let key = key.to_string();
        let now = now_millis();
        let value = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT value FROM ttl_keys WHERE key = ?1 AND expires_at > ?2")?;
                let mut rows = stmt.query(rusqlite::params![key, now])?;
                match rows.next()? {
                    Some(row) => Ok(row.get::<_, i64>(0)?),
                    None => Ok(0),
                }
            })
            .await?;
        Ok(value)
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        let now = now_millis();
        let found = self
            .conn
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM ttl_keys WHERE key = ?1 AND expires_at > ?2",
                    rusqlite::params![key, now],
                    |r| r.get(0),
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(found)
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM ttl_keys WHERE key = ?1", rusqlite::params![key])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Drop expired keys. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = now_millis();
        let n = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM ttl_keys WHERE expires_at <= ?1",
                    rusqlite::params![now],
                )?;
                Ok(n)
            })
            .await?;
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
