//! Persistent per-task set of already-processed source paths.
//!
//! Membership makes repeat runs and replayed filesystem events idempotent.
//! Rows are only removed by explicit operator action; a cleared cache
//! guarantees the next run re-attempts the full set.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use crate::db::{Db, StoreError};
use crate::model::TaskId;

/// Batch inserts and deletes are chunked so one call never builds an
/// unbounded statement; each chunk commits atomically.
const BATCH_CHUNK: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub id: i64,
    pub task_id: TaskId,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
}

/// Stateless facade over the `cache_files` table.
#[derive(Clone)]
pub struct CacheStore {
    db: Db,
}

impl CacheStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Membership test; called on every event in a hot loop, so it stays a
    /// single indexed lookup.
    pub fn has(&self, task_id: TaskId, path: &str) -> Result<bool, StoreError> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM cache_files WHERE task_id = ?1 AND file_path = ?2)",
                params![task_id, path],
                |row| row.get(0),
            )
        })
    }

    /// Upsert a batch of paths. Duplicates are silently ignored, so the
    /// operation is idempotent.
    pub fn add(&self, task_id: TaskId, paths: &[String]) -> Result<(), StoreError> {
        if paths.is_empty() {
            return Ok(());
        }
        self.db.with_mut(|conn| {
            for chunk in paths.chunks(BATCH_CHUNK) {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT OR IGNORE INTO cache_files (task_id, file_path, created_at)
                         VALUES (?1, ?2, ?3)",
                    )?;
                    let now = Utc::now();
                    for path in chunk {
                        stmt.execute(params![task_id, path, now])?;
                    }
                }
                tx.commit()?;
            }
            Ok(())
        })
    }

    /// Delete the named rows; returns how many were removed.
    pub fn remove(&self, task_id: TaskId, paths: &[String]) -> Result<usize, StoreError> {
        if paths.is_empty() {
            return Ok(0);
        }
        self.db.with_mut(|conn| {
            let mut removed = 0;
            for chunk in paths.chunks(BATCH_CHUNK) {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(
                        "DELETE FROM cache_files WHERE task_id = ?1 AND file_path = ?2",
                    )?;
                    for path in chunk {
                        removed += stmt.execute(params![task_id, path])?;
                    }
                }
                tx.commit()?;
            }
            Ok(removed)
        })
    }

    /// Drop every row for the task; returns the removed count.
    pub fn clear(&self, task_id: TaskId) -> Result<usize, StoreError> {
        self.db
            .with(|conn| conn.execute("DELETE FROM cache_files WHERE task_id = ?1", params![task_id]))
    }

    /// Page through a task's entries, newest first, optionally filtered by
    /// a path substring. Returns the page plus the filtered total.
    pub fn list_paged(
        &self,
        task_id: TaskId,
        page: u32,
        page_size: u32,
        search: &str,
    ) -> Result<(Vec<CacheEntry>, u64), StoreError> {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let offset = (page - 1) as i64 * page_size as i64;
        let pattern = format!("%{}%", search.replace('%', "\\%").replace('_', "\\_"));

        self.db.with(|conn| {
            let total: u64 = conn.query_row(
                "SELECT COUNT(*) FROM cache_files
                 WHERE task_id = ?1 AND file_path LIKE ?2 ESCAPE '\\'",
                params![task_id, pattern],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare_cached(
                "SELECT id, task_id, file_path, created_at FROM cache_files
                 WHERE task_id = ?1 AND file_path LIKE ?2 ESCAPE '\\'
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3 OFFSET ?4",
            )?;
            let entries = stmt
                .query_map(params![task_id, pattern, page_size, offset], |row| {
                    Ok(CacheEntry {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        file_path: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok((entries, total))
        })
    }
}
