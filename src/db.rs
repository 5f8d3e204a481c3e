//! Embedded SQLite handle and schema.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use thiserror::Error;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("name already in use: {0}")]
    DuplicateName(String),

    #[error("invalid row: {0}")]
    InvalidRow(String),
}

/// Shared connection handle. Cloning is cheap; all row stores go through
/// the same connection, serialized by the inner lock.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the store at `path`, running schema setup.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// In-memory store for tests and throwaway runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Run a closure against the connection under the lock.
    pub(crate) fn with<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock();
        Ok(f(&conn)?)
    }

    /// Run a closure needing a mutable connection (transactions).
    pub(crate) fn with_mut<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        Ok(f(&mut conn)?)
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            name            TEXT NOT NULL UNIQUE,
            task_type       TEXT NOT NULL DEFAULT 'main',
            paths_mapping   TEXT NOT NULL DEFAULT '[]',
            include         TEXT NOT NULL DEFAULT '[]',
            exclude         TEXT NOT NULL DEFAULT '[]',
            save_mode       INTEGER NOT NULL DEFAULT 0,
            open_cache      INTEGER NOT NULL DEFAULT 0,
            mkdir_if_single INTEGER NOT NULL DEFAULT 0,
            delete_dir      INTEGER NOT NULL DEFAULT 0,
            keep_dir_struct INTEGER NOT NULL DEFAULT 1,
            schedule_type   TEXT NOT NULL DEFAULT '',
            schedule_value  TEXT NOT NULL DEFAULT '',
            reverse         INTEGER NOT NULL DEFAULT 0,
            config_name     TEXT NOT NULL DEFAULT '',
            config_id       INTEGER NOT NULL DEFAULT 0,
            is_watching     INTEGER NOT NULL DEFAULT 0,
            watch_error     TEXT NOT NULL DEFAULT '',
            created_at      TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS configs (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            name       TEXT NOT NULL UNIQUE,
            detail     TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS cache_files (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id    INTEGER NOT NULL,
            file_path  TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(task_id, file_path)
        );

        CREATE INDEX IF NOT EXISTS idx_cache_files_task_created
            ON cache_files(task_id, created_at DESC);
        "#,
    )
}

/// Map a UNIQUE-constraint violation onto [`StoreError::DuplicateName`].
pub(crate) fn map_unique_violation(err: StoreError, name: &str) -> StoreError {
    if let StoreError::Sqlite(rusqlite::Error::SqliteFailure(code, _)) = &err
        && code.code == rusqlite::ErrorCode::ConstraintViolation
    {
        return StoreError::DuplicateName(name.to_string());
    }
    err
}
