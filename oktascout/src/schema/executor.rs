//! Bounded SELECT executor over the snapshot database.
//!
//! Connections are opened read-only per call on the blocking pool; a
//! watchdog holds the connection's interrupt handle and aborts statements
//! that outlive the deadline, so a runaway query cannot pin a blocking
//! thread.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::types::ValueRef;
use rusqlite::OpenFlags;
use serde::Serialize;
use thiserror::Error;

/// Name plus type inferred from the first non-null value (`TEXT` when every
/// row is null).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ColumnMeta {
    pub name: String,
    pub inferred_type: String,
}

/// Result of one bounded SELECT.
#[derive(Clone, Debug, Serialize)]
pub struct RowSet {
    pub columns: Vec<ColumnMeta>,
    /// Rows as JSON objects keyed by column name.
    pub rows: Vec<serde_json::Value>,
    /// True when the row cap cut the result short.
    pub truncated: bool,
    pub execution_ms: u64,
}

#[derive(Debug, Error)]
pub enum SqlExecError {
    #[error("snapshot open failed: {0}")]
    Open(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("query exceeded {0:?}")]
    Timeout(Duration),
}

/// Read-only executor bound to one snapshot file.
#[derive(Clone, Debug)]
pub struct SqlExecutor {
    db_path: PathBuf,
    row_cap: usize,
    timeout: Duration,
}

impl SqlExecutor {
    pub fn new(db_path: impl AsRef<Path>, row_cap: usize, timeout: Duration) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            row_cap,
            timeout,
        }
    }

    /// Runs one validated SELECT. `max_rows` further restricts the
    /// executor-wide cap (used for preview executions).
    pub async fn query(
        &self,
        sql: &str,
        max_rows: Option<usize>,
    ) -> Result<RowSet, SqlExecError> {
        let row_cap = max_rows.map_or(self.row_cap, |m| m.min(self.row_cap));
        let expired = Arc::new(AtomicBool::new(false));
        let timeout = self.timeout;

        let (handle_tx, handle_rx) = tokio::sync::oneshot::channel::<rusqlite::InterruptHandle>();
        let watchdog_flag = Arc::clone(&expired);
        let watchdog = tokio::spawn(async move {
            let Ok(handle) = handle_rx.await else { return };
            tokio::time::sleep(timeout).await;
            watchdog_flag.store(true, Ordering::SeqCst);
            handle.interrupt();
        });

        let db_path = self.db_path.clone();
        let sql = sql.to_string();
        let result =
            tokio::task::spawn_blocking(move || run_query(&db_path, &sql, row_cap, handle_tx))
                .await
                .map_err(|e| SqlExecError::Query(format!("executor task failed: {e}")))?;

        watchdog.abort();
        match result {
            Err(SqlExecError::Query(_)) if expired.load(Ordering::SeqCst) => {
                Err(SqlExecError::Timeout(timeout))
            }
            other => other,
        }
    }
}

fn run_query(
    db_path: &Path,
    sql: &str,
    row_cap: usize,
    handle_tx: tokio::sync::oneshot::Sender<rusqlite::InterruptHandle>,
) -> Result<RowSet, SqlExecError> {
    let conn = rusqlite::Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| SqlExecError::Open(e.to_string()))?;

    let _ = handle_tx.send(conn.get_interrupt_handle());

    let started = Instant::now();
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| SqlExecError::Query(e.to_string()))?;
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    let mut rows = stmt
        .query([])
        .map_err(|e| SqlExecError::Query(e.to_string()))?;
    let mut out_rows = Vec::new();
    let mut inferred: Vec<Option<&'static str>> = vec![None; names.len()];
    let mut truncated = false;

    while let Some(row) = rows.next().map_err(|e| SqlExecError::Query(e.to_string()))? {
        if out_rows.len() == row_cap {
            truncated = true;
            break;
        }
        let mut obj = serde_json::Map::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let value = row
                .get_ref(i)
                .map_err(|e| SqlExecError::Query(e.to_string()))?;
            if inferred[i].is_none() {
                inferred[i] = type_name_of(&value);
            }
            obj.insert(name.clone(), value_to_json(value));
        }
        out_rows.push(serde_json::Value::Object(obj));
    }

    let columns = names
        .into_iter()
        .enumerate()
        .map(|(i, name)| ColumnMeta {
            inferred_type: inferred[i].unwrap_or("TEXT").to_string(),
            name,
        })
        .collect();

    Ok(RowSet {
        columns,
        rows: out_rows,
        truncated,
        execution_ms: started.elapsed().as_millis() as u64,
    })
}

fn type_name_of(value: &ValueRef<'_>) -> Option<&'static str> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(_) => Some("INTEGER"),
        ValueRef::Real(_) => Some("REAL"),
        ValueRef::Text(_) => Some("TEXT"),
        ValueRef::Blob(_) => Some("BLOB"),
    }
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<blob {} bytes>", b.len())),
    }
}
