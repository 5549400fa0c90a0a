//! Durable set of documents whose processing pipeline has not finished
//!
//! Backed by SQLite so entries survive restarts. An address is added before
//! its sidecar becomes visible and removed once every action is terminal;
//! startup recovery walks the set in keyset-paginated batches.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::types::ContentAddress;

/// SQLite-backed pending set
#[derive(Clone)]
pub struct PendingSet {
    conn: Arc<Mutex<Connection>>,
}

impl PendingSet {
    /// Create or open the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let set = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        set.migrate()?;
        Ok(set)
    }

    /// Create an in-memory set (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let set = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        set.migrate()?;
        Ok(set)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;

            CREATE TABLE IF NOT EXISTS pending_documents (
                address TEXT PRIMARY KEY,
                added_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Add an address. Returns `false` if it was already pending.
    pub fn add(&self, address: &ContentAddress) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO pending_documents (address, added_at) VALUES (?1, ?2)",
            params![address.as_str(), chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(inserted == 1)
    }

    /// Remove an address. Returns `false` if it was not pending.
    pub fn remove(&self, address: &ContentAddress) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM pending_documents WHERE address = ?1",
            params![address.as_str()],
        )?;
        Ok(removed == 1)
    }

    pub fn contains(&self, address: &ContentAddress) -> Result<bool> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM pending_documents WHERE address = ?1",
                params![address.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM pending_documents", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Up to `limit` addresses ordered after `after` (keyset pagination).
    pub fn scan_after(&self, after: Option<&ContentAddress>, limit: usize) -> Result<Vec<ContentAddress>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT address FROM pending_documents WHERE address > ?1 ORDER BY address LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![after.map(|a| a.as_str()).unwrap_or(""), limit as i64],
            |row| row.get::<_, String>(0),
        )?;

        let mut addresses = Vec::new();
        for row in rows {
            let raw = row?;
            match ContentAddress::parse(&raw) {
                Ok(address) => addresses.push(address),
                Err(_) => tracing::warn!("Ignoring malformed pending entry '{}'", raw),
            }
        }
        Ok(addresses)
    }

    /// Every pending address, read in batches of `batch_size`
    pub fn all(&self, batch_size: usize) -> Result<Vec<ContentAddress>> {
        let batch_size = batch_size.max(1);
        let mut all = Vec::new();
        let mut cursor: Option<ContentAddress> = None;

        loop {
            let batch = self.scan_after(cursor.as_ref(), batch_size)?;
            let done = batch.len() < batch_size;
            cursor = batch.last().cloned();
            all.extend(batch);
            if done || cursor.is_none() {
                break;
            }
        }
        Ok(all)
    }
}
