//! SQLite-backed staleness store: one row per clone URL with its last sync time.

use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::types::StalenessRecord;

/// Errors returned by the staleness store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Persistent staleness records, shared across worker threads.
///
/// The connection sits behind a mutex so concurrent upserts from the sync
/// workers are serialized here rather than by the caller.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the database at `path` and make sure the schema exists.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the schema. This is idempotent.
    ///
    /// Tables created by older versions lack the uniqueness constraint on
    /// `url`; duplicates are collapsed onto the newest row before the unique
    /// index is added.
    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS repositories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                last_updated INTEGER NOT NULL
            );

            DELETE FROM repositories
            WHERE EXISTS (
                SELECT 1 FROM repositories AS newer
                WHERE newer.url = repositories.url
                  AND (newer.last_updated > repositories.last_updated
                       OR (newer.last_updated = repositories.last_updated
                           AND newer.id > repositories.id))
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_repositories_url ON repositories(url);
            CREATE INDEX IF NOT EXISTS idx_repositories_updated ON repositories(last_updated);
            ",
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // Statements are atomic, so a poisoned lock still guards a sound connection.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `now` as the last sync time of `url`, replacing any previous value.
    pub fn upsert(&self, url: &str, now: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO repositories (url, last_updated) VALUES (?1, ?2)
             ON CONFLICT(url) DO UPDATE SET last_updated = excluded.last_updated",
            params![url, now],
        )?;
        Ok(())
    }

    /// Insert `url` with timestamp `ts` unless it is already tracked.
    ///
    /// Returns true if a new record was created.
    pub fn insert_if_absent(&self, url: &str, ts: i64) -> Result<bool, StoreError> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO repositories (url, last_updated) VALUES (?1, ?2)",
            params![url, ts],
        )?;
        Ok(inserted > 0)
    }

    /// Records last synced strictly before `threshold`, oldest first.
    pub fn list_stale_before(&self, threshold: i64) -> Result<Vec<StalenessRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT url, last_updated FROM repositories
             WHERE last_updated < ?1
             ORDER BY last_updated ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![threshold], row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Every record, oldest first.
    pub fn list_all(&self) -> Result<Vec<StalenessRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT url, last_updated FROM repositories ORDER BY last_updated ASC, id ASC",
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get(&self, url: &str) -> Result<Option<StalenessRecord>, StoreError> {
        let record = self
            .conn()
            .query_row(
                "SELECT url, last_updated FROM repositories WHERE url = ?1",
                params![url],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Close the underlying connection, surfacing any error from SQLite.
    pub fn close(self) -> Result<(), StoreError> {
        let conn = self.conn.into_inner().unwrap_or_else(|e| e.into_inner());
        conn.close().map_err(|(_, e)| StoreError::Sqlite(e))
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<StalenessRecord> {
    Ok(StalenessRecord {
        url: row.get(0)?,
        last_synced_at: row.get(1)?,
    })
}
