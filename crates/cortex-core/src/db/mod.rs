//! Persistent store.
//!
//! One SQLite file per installation is the source of truth for every
//! memory record. Entity operations live in the submodules as `impl
//! Database` blocks; row-level helpers that take a `&Connection` are
//! shared so several writes can be composed into one transaction.

pub mod episodic;
pub mod experiments;
pub mod facts;
pub mod learning_log;
pub mod migrations;
pub mod sessions;
pub mod skills;
pub mod stats;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Pause before the single retry of a contended write.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Database connection wrapper.
///
/// Thread-safe via internal Mutex. Every operation holds the lock for one
/// statement or one transaction, never longer.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the store at `path` and migrate it forward.
    pub fn open_path(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let db = Self::init(conn, Some(path.to_path_buf()))?;
        info!(path = %path.display(), "opened memory store");
        Ok(db)
    }

    /// Private in-memory store, used by tests and throwaway brains.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(mut conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        // journal_mode returns a row, so it is queried rather than executed.
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!(journal_mode = %mode, "configured journal");
        conn.execute_batch(
            "PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )?;
        migrations::run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// File backing this store, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn schema_version(&self) -> Result<i64> {
        self.with_conn(|conn| migrations::current_version(conn))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    /// Run `f` against the connection. Transient contention is retried once.
    pub fn with_conn<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Connection) -> Result<T>,
    {
        self.with_retry(|| {
            let conn = self.lock()?;
            f(&*conn)
        })
    }

    /// Run `f` inside an IMMEDIATE transaction. Either every write in `f`
    /// commits or none does. Transient contention is retried once.
    pub fn transaction<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Transaction<'_>) -> Result<T>,
    {
        self.with_retry(|| {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    fn with_retry<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        match op() {
            Err(e) if e.is_transient() => {
                warn!(error = %e, "database contention, retrying once");
                std::thread::sleep(RETRY_BACKOFF);
                op()
            }
            other => other,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Demote every HOT row to WARM. Called on open, when the cache is empty.
    pub fn reset_hot_tiers(&self) -> Result<usize> {
        self.transaction(|tx| {
            let mut total = 0;
            for table in ["episodic_records", "semantic_facts", "skills"] {
                total += tx.execute(
                    &format!("UPDATE {table} SET tier = 'warm' WHERE tier = 'hot'"),
                    [],
                )?;
            }
            Ok(total)
        })
    }

    /// Reclaim free pages.
    pub fn vacuum(&self) -> Result<()> {
        self.with_conn(|conn| Ok(conn.execute_batch("VACUUM")?))
    }

    /// Read a value from `system_metadata`.
    pub fn metadata(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| read_metadata(conn, key))
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| write_metadata(conn, key, value))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// System metadata
// ─────────────────────────────────────────────────────────────────────────────

/// Epoch millis at which the last complete consolidation run finished.
pub const LAST_CONSOLIDATION_KEY: &str = "last_consolidation_at";

pub(crate) fn read_metadata(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM system_metadata WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?)
}

pub(crate) fn write_metadata(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO system_metadata (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        rusqlite::params![key, value, crate::utils::now_millis()],
    )?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Parse a TEXT column through `FromStr` (tiers, statuses).
pub(crate) fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Decode a JSON TEXT column.
pub(crate) fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Non-negative INTEGER column as u32.
pub(crate) fn count_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(idx)?;
    Ok(raw.clamp(0, u32::MAX as i64) as u32)
}

/// Nullable INTEGER column as an optional u64.
pub(crate) fn opt_u64_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    let raw: Option<i64> = row.get(idx)?;
    Ok(raw.map(|v| v.max(0) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_migrates() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), migrations::latest_version());
        assert!(db.path().is_none());
    }

    #[test]
    fn test_open_path_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("brain.db");
        let db = Database::open_path(&path).unwrap();
        assert!(path.exists());
        assert_eq!(db.path(), Some(path.as_path()));
        drop(db);

        // Reopen keeps the schema
        let db = Database::open_path(&path).unwrap();
        assert_eq!(db.schema_version().unwrap(), 2);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<()> = db.transaction(|tx| {
            tx.execute(
                "INSERT INTO system_metadata (key, value, updated_at) VALUES ('k', 'v', 0)",
                [],
            )?;
            Err(Error::validation("abort"))
        });
        assert!(result.is_err());
        assert_eq!(db.metadata("k").unwrap(), None);
    }

    #[test]
    fn test_metadata_upsert() {
        let db = Database::open_in_memory().unwrap();
        db.set_metadata("last_run", "a").unwrap();
        db.set_metadata("last_run", "b").unwrap();
        assert_eq!(db.metadata("last_run").unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_retry_runs_transient_op_twice() {
        let db = Database::open_in_memory().unwrap();
        let mut calls = 0;
        let result: Result<()> = db.with_retry(|| {
            calls += 1;
            Err(Error::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                None,
            )))
        });
        assert!(result.is_err());
        assert_eq!(calls, 2);

        let mut calls = 0;
        let _: Result<()> = db.with_retry(|| {
            calls += 1;
            Err(Error::validation("bad"))
        });
        assert_eq!(calls, 1);
    }
}
