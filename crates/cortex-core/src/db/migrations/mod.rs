//! Schema migrations.
//!
//! SQL is embedded at compile time and applied in order. The applied
//! version is tracked in `PRAGMA user_version`; each migration commits
//! in its own transaction together with the version bump.

use rusqlite::Connection;
use tracing::info;

use crate::error::{Error, Result};

/// (version, sql) in application order.
pub const MIGRATIONS: &[(i64, &str)] = &[
    (1, include_str!("001_core_tables.sql")),
    (2, include_str!("002_learning_log.sql")),
];

/// Newest schema version this build understands.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|(v, _)| *v).unwrap_or(0)
}

pub fn current_version(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Bring the schema forward to [`latest_version`].
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let found = current_version(conn)?;
    let supported = latest_version();
    if found > supported {
        return Err(Error::SchemaVersion { found, supported });
    }

    for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > found) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        info!(version, "applied schema migration");
    }
    Ok(())
}
