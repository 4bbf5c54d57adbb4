//! Backends that actually run statements.
//!
//! Everything here is blocking; the gateway calls it from
//! `spawn_blocking`.

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use serde::Serialize;

use crate::analysis::StatementKind;

/// Per-call execution limits.
#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    /// Zero means unlimited.
    pub max_rows: usize,
    pub statement_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
}

pub trait Backend: Send + Sync {
    /// Run one statement. `kind` decides whether `rows_affected` means anything.
    fn execute(
        &self,
        sql: &str,
        params: &[String],
        kind: StatementKind,
        limits: QueryLimits,
    ) -> Result<ResultSet, BackendError>;
}

// ── SQLite ────────────────────────────────────────────────────────────────────

/// Instructions between progress-handler checks.
const PROGRESS_STEP: i32 = 1_000;

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: &Path, read_only: bool) -> Result<Self, BackendError> {
        let flags = if read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI
        } else {
            OpenFlags::default()
        };
        let conn = Connection::open_with_flags(path, flags)
            .map_err(|e| BackendError::Open(format!("{}: {e}", path.display())))?;
        if read_only {
            conn.pragma_update(None, "query_only", true)
                .map_err(|e| BackendError::Open(e.to_string()))?;
        }
        tracing::debug!(path = %path.display(), read_only, "sqlite backend opened");
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn: Mutex::new(conn) }
    }

    fn run(
        conn: &Connection,
        sql: &str,
        params: &[String],
        kind: StatementKind,
        max_rows: usize,
    ) -> rusqlite::Result<ResultSet> {
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();

        let mut out = ResultSet { columns, ..Default::default() };
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        while let Some(row) = rows.next()? {
            if max_rows > 0 && out.rows.len() == max_rows {
                out.truncated = true;
                break;
            }
            let mut cells = Vec::with_capacity(width);
            for i in 0..width {
                cells.push(cell_text(row.get_ref(i)?));
            }
            out.rows.push(cells);
        }
        drop(rows);
        drop(stmt);

        // sqlite3_changes keeps the last DML count across DDL, so only trust it for writes.
        if width == 0 {
            out.rows_affected = Some(match kind {
                StatementKind::Write => conn.changes() as u64,
                StatementKind::Read | StatementKind::Admin => 0,
            });
        }
        Ok(out)
    }
}

impl Backend for SqliteBackend {
    fn execute(
        &self,
        sql: &str,
        params: &[String],
        kind: StatementKind,
        limits: QueryLimits,
    ) -> Result<ResultSet, BackendError> {
        let conn = self.conn.lock().map_err(|_| BackendError::Unavailable)?;

        if let Some(timeout) = limits.statement_timeout {
            let deadline = Instant::now() + timeout;
            conn.progress_handler(PROGRESS_STEP, Some(move || Instant::now() >= deadline));
        }
        let result = Self::run(&conn, sql, params, kind, limits.max_rows);
        conn.progress_handler(0, None::<fn() -> bool>);

        result.map_err(|e| match e.sqlite_error_code() {
            Some(ErrorCode::OperationInterrupted) => BackendError::Timeout,
            _ => BackendError::Sql(e.to_string()),
        })
    }
}

fn cell_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(hex::encode(b)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("cannot open database: {0}")]
    Open(String),
    #[error("{0}")]
    Sql(String),
    #[error("statement timed out")]
    Timeout,
    #[error("backend unavailable")]
    Unavailable,
}
