//! Shared SQLite plumbing for the queue, ledger and lead store backends.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::common::error::{Dependency, DependencyError};

const BUSY_TIMEOUT_MS: u32 = 5_000;

/// A single connection guarded by a mutex; calls are short and never held across an await
pub struct SqliteDb {
    dependency: Dependency,
    conn: Mutex<Connection>,
}

impl SqliteDb {
    /// Open (creating parent directories) and apply `schema`
    pub fn open<P: AsRef<Path>>(
        path: P,
        dependency: Dependency,
        schema: &str,
    ) -> Result<Self, DependencyError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DependencyError::permanent(
                    dependency,
                    format!("cannot create {}: {}", parent.display(), e),
                )
            })?;
        }
        let conn = Connection::open(path).map_err(|e| tag(e, dependency))?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\nPRAGMA busy_timeout={BUSY_TIMEOUT_MS};\n{schema}"
        ))
        .map_err(|e| tag(e, dependency))?;
        Ok(Self {
            dependency,
            conn: Mutex::new(conn),
        })
    }

    pub fn dependency(&self) -> Dependency {
        self.dependency
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the connection, tagging SQLite errors with this backend's dependency
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, DependencyError> {
        let mut conn = self.conn();
        f(&mut conn).map_err(|e| tag(e, self.dependency))
    }
}

fn tag(err: rusqlite::Error, dependency: Dependency) -> DependencyError {
    DependencyError::from(err).for_dependency(dependency)
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Map a JSON column that failed to decode into a permanent failure of this backend
pub fn corrupt_row(dependency: Dependency, what: &str, err: impl std::fmt::Display) -> DependencyError {
    DependencyError::permanent(dependency, format!("corrupt {what} row: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_parent_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("db.sqlite");
        let db = SqliteDb::open(
            &path,
            Dependency::Storage,
            "CREATE TABLE IF NOT EXISTS t (k TEXT PRIMARY KEY);",
        )
        .unwrap();
        let mode: String = db
            .with_conn(|c| c.query_row("PRAGMA journal_mode", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert!(path.exists());
    }

    #[test]
    fn test_millis_round_trip() {
        let now = Utc::now();
        let back = from_millis(now.timestamp_millis());
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
