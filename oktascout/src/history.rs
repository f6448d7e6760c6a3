//! Query history: the only state that outlives a process.
//!
//! One SQLite table keyed by user: question, last status, last run time,
//! favorite flag. Connections are opened per call on the blocking pool.

use std::path::{Path, PathBuf};

use rusqlite::params;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history store: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for HistoryError {
    fn from(e: rusqlite::Error) -> Self {
        HistoryError::Storage(e.to_string())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub user_id: String,
    pub query: String,
    pub status: String,
    pub last_run_at: String,
    pub favorite: bool,
}

/// SQLite-backed history store; cheap to clone a path-holder per process.
#[derive(Clone, Debug)]
pub struct HistoryStore {
    db_path: PathBuf,
}

impl HistoryStore {
    /// Creates the store and ensures the table exists.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = rusqlite::Connection::open(&db_path)?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS query_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                query TEXT NOT NULL,
                status TEXT NOT NULL,
                last_run_at TEXT NOT NULL,
                favorite INTEGER NOT NULL DEFAULT 0
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_query_history_user ON query_history(user_id)",
            [],
        )?;
        Ok(Self { db_path })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, HistoryError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, HistoryError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path)?;
            f(&conn)
        })
        .await
        .map_err(|e| HistoryError::Storage(format!("task failed: {e}")))?
    }

    /// Records a new run of `query`; re-running an identical question for
    /// the same user updates its row instead of inserting a twin.
    pub async fn record_start(
        &self,
        user_id: &str,
        query: &str,
        started_at: &str,
    ) -> Result<i64, HistoryError> {
        let (user_id, query, started_at) =
            (user_id.to_string(), query.to_string(), started_at.to_string());
        self.with_conn(move |conn| {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM query_history WHERE user_id = ?1 AND query = ?2",
                    params![user_id, query],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            match existing {
                Some(id) => {
                    conn.execute(
                        "UPDATE query_history SET status = 'running', last_run_at = ?2 WHERE id = ?1",
                        params![id, started_at],
                    )?;
                    Ok(id)
                }
                None => {
                    conn.execute(
                        "INSERT INTO query_history (user_id, query, status, last_run_at) \
                         VALUES (?1, ?2, 'running', ?3)",
                        params![user_id, query, started_at],
                    )?;
                    Ok(conn.last_insert_rowid())
                }
            }
        })
        .await
    }

    pub async fn record_outcome(&self, id: i64, status: &str) -> Result<(), HistoryError> {
        let status = status.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE query_history SET status = ?2 WHERE id = ?1",
                params![id, status],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_favorite(&self, id: i64, favorite: bool) -> Result<(), HistoryError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE query_history SET favorite = ?2 WHERE id = ?1",
                params![id, favorite as i64],
            )?;
            Ok(())
        })
        .await
    }

    /// Entries for one user, most recent first.
    pub async fn list(&self, user_id: &str) -> Result<Vec<HistoryEntry>, HistoryError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, query, status, last_run_at, favorite \
                 FROM query_history WHERE user_id = ?1 ORDER BY last_run_at DESC, id DESC",
            )?;
            let rows = stmt
                .query_map(params![user_id], |row| {
                    Ok(HistoryEntry {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        query: row.get(2)?,
                        status: row.get(3)?,
                        last_run_at: row.get(4)?,
                        favorite: row.get::<_, i64>(5)? != 0,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (HistoryStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.db")).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn start_then_outcome_round_trips() {
        let (store, _dir) = store();
        let id = store
            .record_start("alice", "locked users?", "2026-01-01T10:00:00Z")
            .await
            .unwrap();
        store.record_outcome(id, "completed").await.unwrap();
        let entries = store.list("alice").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, "completed");
        assert!(!entries[0].favorite);
    }

    #[tokio::test]
    async fn rerun_updates_instead_of_duplicating() {
        let (store, _dir) = store();
        let first = store
            .record_start("alice", "q", "2026-01-01T10:00:00Z")
            .await
            .unwrap();
        let second = store
            .record_start("alice", "q", "2026-01-02T10:00:00Z")
            .await
            .unwrap();
        assert_eq!(first, second);
        let entries = store.list("alice").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].last_run_at, "2026-01-02T10:00:00Z");
    }

    #[tokio::test]
    async fn favorites_and_user_scoping() {
        let (store, _dir) = store();
        let id = store
            .record_start("alice", "q1", "2026-01-01T10:00:00Z")
            .await
            .unwrap();
        store
            .record_start("bob", "q2", "2026-01-01T11:00:00Z")
            .await
            .unwrap();
        store.set_favorite(id, true).await.unwrap();

        let alice = store.list("alice").await.unwrap();
        assert_eq!(alice.len(), 1);
        assert!(alice[0].favorite);
        assert_eq!(store.list("bob").await.unwrap().len(), 1);
        assert!(store.list("carol").await.unwrap().is_empty());
    }
}
