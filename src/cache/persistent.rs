//! Persistent cache tier
//!
//! A single SQLite blob table holding (key, value, size, expires, created).
//! Entries expire by wall clock; when the store outgrows its byte budget the
//! oldest-inserted rows are deleted in batches until it fits. The file format
//! is not a contract and can be rebuilt from scratch at any time.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};

use super::memory::CacheStats;

const EVICTION_BATCH: usize = 100;

#[derive(Clone)]
pub struct PersistentCache {
    conn: Arc<Mutex<Connection>>,
    max_bytes: u64,
}

impl PersistentCache {
    pub fn open<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, max_bytes)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(max_bytes: u64) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, max_bytes)
    }

    fn init(conn: Connection, max_bytes: u64) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blobs (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                size INTEGER NOT NULL,
                expires INTEGER NOT NULL,
                created INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_blobs_expires ON blobs(expires);
            CREATE INDEX IF NOT EXISTS idx_blobs_created ON blobs(created);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_bytes,
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.lock()?;
        let row: Option<(Vec<u8>, i64)> = conn
            .query_row(
                "SELECT value, expires FROM blobs WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((value, expires)) if expires > now_millis() => Ok(Some(value)),
            Some(_) => {
                conn.execute("DELETE FROM blobs WHERE key = ?1", params![key])?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let now = now_millis();
        let size = (key.len() + value.len()) as i64;
        let conn = self.lock()?;

        conn.execute("DELETE FROM blobs WHERE expires <= ?1", params![now])?;
        conn.execute(
            "INSERT OR REPLACE INTO blobs (key, value, size, expires, created)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key, value, size, now + ttl.as_millis() as i64, now],
        )?;

        // Evict oldest-inserted rows until within budget.
        loop {
            let total: i64 =
                conn.query_row("SELECT COALESCE(SUM(size), 0) FROM blobs", [], |row| {
                    row.get(0)
                })?;
            if total as u64 <= self.max_bytes {
                break;
            }
            let deleted = conn.execute(
                "DELETE FROM blobs WHERE key IN
                 (SELECT key FROM blobs ORDER BY created ASC LIMIT ?1)",
                params![EVICTION_BATCH as i64],
            )?;
            if deleted == 0 {
                break;
            }
        }
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM blobs WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Delete by SQL LIKE pattern (`%` wildcard).
    pub fn delete_like(&self, pattern: &str) -> Result<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM blobs WHERE key LIKE ?1", params![pattern])?;
        Ok(deleted)
    }

    pub fn prune(&self) -> Result<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM blobs WHERE expires <= ?1",
            params![now_millis()],
        )?;
        Ok(deleted)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let conn = self.lock()?;
        let (entries, bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM blobs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(CacheStats {
            entries: entries as usize,
            bytes: bytes as usize,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("persistent cache lock poisoned".to_string()))
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
