//! Append-only audit log.
//!
//! SQLite-backed in WAL mode, single writer behind a mutex. A null backend
//! hands out synthetic sequence numbers so callers never branch on whether
//! auditing is configured.

mod schema;

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};

/// Error type for audit operations
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit log is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, AuditError>;

/// One record to append. The sequence number is assigned by the log.
#[derive(Clone, Debug)]
pub struct AuditEntry {
    pub occurred_at: DateTime<Utc>,
    pub user_id: String,
    pub ssh_user: String,
    pub operation_id: String,
    pub success: bool,
    pub error: Option<String>,
}

impl AuditEntry {
    pub fn now(
        user_id: impl Into<String>,
        ssh_user: impl Into<String>,
        operation_id: impl Into<String>,
        success: bool,
        error: Option<String>,
    ) -> Self {
        Self {
            occurred_at: Utc::now(),
            user_id: user_id.into(),
            ssh_user: ssh_user.into(),
            operation_id: operation_id.into(),
            success,
            error,
        }
    }
}

/// One immutable line in the append-only log.
#[derive(Clone, Debug)]
pub struct AuditRecord {
    pub seq: i64,
    pub occurred_at: DateTime<Utc>,
    pub user_id: String,
    pub ssh_user: String,
    pub operation_id: String,
    pub success: bool,
    pub error: Option<String>,
}

enum Backend {
    Sqlite(Mutex<Option<Connection>>),
    Null(AtomicI64),
}

/// Durable, append-only record of every operation and task step.
pub struct AuditLog {
    backend: Backend,
}

impl AuditLog {
    /// Open (creating if needed) the audit database at `path` in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(schema::CREATE_TABLES)?;

        Ok(Self {
            backend: Backend::Sqlite(Mutex::new(Some(conn))),
        })
    }

    /// In-memory log (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(schema::CREATE_TABLES)?;
        Ok(Self {
            backend: Backend::Sqlite(Mutex::new(Some(conn))),
        })
    }

    /// Log with no backing store: `append` is a no-op returning a synthetic
    /// sequence number, `recent` is empty.
    pub fn null() -> Self {
        Self {
            backend: Backend::Null(AtomicI64::new(0)),
        }
    }

    /// Append one record. Persisted before this returns; the assigned
    /// sequence number is strictly increasing.
    pub fn append(&self, entry: &AuditEntry) -> Result<i64> {
        match &self.backend {
            Backend::Sqlite(conn) => {
                let guard = conn.lock().unwrap_or_else(|err| err.into_inner());
                let conn = guard.as_ref().ok_or(AuditError::Closed)?;
                conn.execute(
                    schema::INSERT_RECORD,
                    params![
                        entry
                            .occurred_at
                            .to_rfc3339_opts(SecondsFormat::Nanos, true),
                        entry.user_id,
                        entry.ssh_user,
                        entry.operation_id,
                        entry.success as i64,
                        entry.error,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            }
            Backend::Null(seq) => Ok(seq.fetch_add(1, Ordering::Relaxed) + 1),
        }
    }

    /// The most recent `limit` records, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        match &self.backend {
            Backend::Sqlite(conn) => {
                let guard = conn.lock().unwrap_or_else(|err| err.into_inner());
                let conn = guard.as_ref().ok_or(AuditError::Closed)?;
                let mut stmt = conn.prepare(schema::SELECT_RECENT)?;
                let rows = stmt.query_map(params![limit as i64], |row| {
                    let ts: String = row.get(1)?;
                    let occurred_at = DateTime::parse_from_rfc3339(&ts)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_default();
                    Ok(AuditRecord {
                        seq: row.get(0)?,
                        occurred_at,
                        user_id: row.get(2)?,
                        ssh_user: row.get(3)?,
                        operation_id: row.get(4)?,
                        success: row.get::<_, i64>(5)? == 1,
                        error: row.get(6)?,
                    })
                })?;
                Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
            }
            Backend::Null(_) => Ok(Vec::new()),
        }
    }

    /// Close the log. Idempotent; later appends fail with [`AuditError::Closed`].
    pub fn close(&self) {
        if let Backend::Sqlite(conn) = &self.backend {
            let mut guard = conn.lock().unwrap_or_else(|err| err.into_inner());
            guard.take();
        }
    }
}
