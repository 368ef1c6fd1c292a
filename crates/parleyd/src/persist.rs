//! Chat record persistence.
//!
//! The gateway appends one record per completed or aborted session and never
//! reads it back. [`RecordSink`] is the seam; the SQLite implementation is
//! the production sink, and tests swap in [`NullRecordSink`].

use anyhow::{Context, Result};
use parley_common::types::ChatRecord;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

/// Append-only sink for chat records.
pub trait RecordSink: Send + Sync {
    fn append(&self, record: &ChatRecord) -> Result<()>;
}

/// SQLite-backed sink. Single writer behind a mutex; WAL keeps appends cheap.
pub struct SqliteRecordSink {
    conn: Mutex<Connection>,
}

impl SqliteRecordSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening record db at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS chat_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                caller_id TEXT NOT NULL,
                input_text TEXT NOT NULL,
                concise_answer TEXT NOT NULL,
                full_answer TEXT,
                disposition TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Row count, for tests and operational checks.
    pub fn count(&self) -> Result<i64> {
        let conn = self.conn.lock().expect("record db lock poisoned");
        let count = conn.query_row("SELECT COUNT(*) FROM chat_records", [], |row| row.get(0))?;
        Ok(count)
    }
}

impl RecordSink for SqliteRecordSink {
    fn append(&self, record: &ChatRecord) -> Result<()> {
        let conn = self.conn.lock().expect("record db lock poisoned");
        conn.execute(
            "INSERT INTO chat_records
                (caller_id, input_text, concise_answer, full_answer, disposition, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.caller_id,
                record.input_text,
                record.concise_answer,
                record.full_answer,
                record.disposition.as_str(),
                record.timestamp.to_rfc3339(),
            ],
        )
        .context("appending chat record")?;
        Ok(())
    }
}

/// Sink that only logs. Used when persistence is disabled and in tests.
pub struct NullRecordSink;

impl RecordSink for NullRecordSink {
    fn append(&self, record: &ChatRecord) -> Result<()> {
        info!(
            "Chat record ({}): caller={} answer={:?}",
            record.disposition, record.caller_id, record.concise_answer
        );
        Ok(())
    }
}
