//! Durable SQLite queue for accepted log events.
//!
//! # Schema
//! - `queue`: one row per accepted frame, keyed by the relay-assigned
//!   entry id; payload is the frame body exactly as received.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000.
//! PRAGMA integrity_check runs at open; returns error if it fails.
//!
//! A successful `put` return means the row survives process death; the
//! frame server relies on that to uphold durability-before-ack.

use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Error type for queue operations.
#[derive(Debug)]
pub enum QueueError {
    Sqlite(rusqlite::Error),
    IntegrityCheckFailed(String),
    InvalidData(String),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Sqlite(e) => write!(f, "SQLite error: {}", e),
            QueueError::IntegrityCheckFailed(s) => write!(f, "Integrity check failed: {}", s),
            QueueError::InvalidData(s) => write!(f, "Invalid data: {}", s),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Sqlite(e)
    }
}

// ---------------------------------------------------------------------------
// EventQueue
// ---------------------------------------------------------------------------

/// The durable on-disk queue for a single relay instance.
pub struct EventQueue {
    conn: Connection,
}

impl EventQueue {
    /// Open (or create) the queue database at the given path.
    ///
    /// Applies PRAGMAs, runs `PRAGMA integrity_check`, and creates the
    /// table if needed. Returns `Err` if integrity_check fails.
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        apply_schema(&conn)?;
        Ok(EventQueue { conn })
    }

    /// Store `payload` under `entry_id`.
    ///
    /// Idempotent by id: re-putting an existing id replaces the row.
    /// `payload` must be non-empty.
    pub fn put(&mut self, entry_id: &str, payload: &[u8]) -> Result<(), QueueError> {
        if payload.is_empty() {
            return Err(QueueError::InvalidData(
                "payload must not be empty".to_owned(),
            ));
        }

        self.conn.execute(
            "INSERT OR REPLACE INTO queue (entry_id, payload) VALUES (?1, ?2)",
            params![entry_id, payload],
        )?;
        Ok(())
    }

    /// Fetch the payload stored under `entry_id`, if any.
    pub fn get(&self, entry_id: &str) -> Result<Option<Vec<u8>>, QueueError> {
        let payload = self
            .conn
            .query_row(
                "SELECT payload FROM queue WHERE entry_id = ?1",
                params![entry_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(payload)
    }

    /// Delete the entry under `entry_id`.
    ///
    /// Returns `false` when no such row existed (a duplicate send already
    /// removed it).
    pub fn delete(&mut self, entry_id: &str) -> Result<bool, QueueError> {
        let deleted = self.conn.execute(
            "DELETE FROM queue WHERE entry_id = ?1",
            params![entry_id],
        )?;
        Ok(deleted > 0)
    }

    /// Return every stored entry id in ascending lexicographic order.
    ///
    /// Used at boot to re-seed the pending-ids buffer with entries that
    /// were accepted but not delivered before the previous exit.
    pub fn scan_ids(&self) -> Result<Vec<String>, QueueError> {
        let mut stmt = self
            .conn
            .prepare("SELECT entry_id FROM queue ORDER BY entry_id ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut ids = Vec::new();
        for r in rows {
            ids.push(r?);
        }
        Ok(ids)
    }

    /// Count stored entries.
    pub fn len(&self) -> Result<i64, QueueError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn apply_pragmas(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA wal_autocheckpoint=1000;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> Result<(), QueueError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(QueueError::IntegrityCheckFailed(result));
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch(include_str!("schema.sql"))?;
    Ok(())
}
