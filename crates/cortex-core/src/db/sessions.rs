//! Session rows.

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use super::{count_column, Database};
use crate::error::Result;
use crate::types::Session;
use crate::utils::{from_millis, now_millis, opt_from_millis};

const SESSION_COLUMNS: &str = "session_id, start_time, end_time, summary, context, event_count";

pub(crate) fn map_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        session_id: row.get(0)?,
        start_time: from_millis(row.get(1)?),
        end_time: opt_from_millis(row.get(2)?),
        summary: row.get(3)?,
        context: row.get(4)?,
        event_count: count_column(row, 5)?,
    })
}

pub(crate) fn load_session(conn: &Connection, session_id: &str) -> Result<Option<Session>> {
    Ok(conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
            [session_id],
            map_session,
        )
        .optional()?)
}

pub(crate) fn increment_event_count(conn: &Connection, session_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET event_count = event_count + 1 WHERE session_id = ?1",
        [session_id],
    )?;
    Ok(())
}

/// Ended sessions older than `cutoff` still waiting for a summary.
pub(crate) fn unsummarized_sessions(conn: &Connection, cutoff: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT session_id FROM sessions
         WHERE end_time IS NOT NULL AND end_time <= ?1 AND summary IS NULL
         ORDER BY end_time",
    )?;
    let ids = stmt
        .query_map([cutoff], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(ids)
}

pub(crate) fn set_summary(conn: &Connection, session_id: &str, summary: &str) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET summary = ?2 WHERE session_id = ?1",
        params![session_id, summary],
    )?;
    Ok(())
}

impl Database {
    /// Insert a new open session.
    pub fn create_session(&self, context: Option<&str>) -> Result<Session> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let now = now_millis();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (session_id, start_time, context) VALUES (?1, ?2, ?3)",
                params![session_id, now, context],
            )?;
            Ok(())
        })?;
        debug!(session_id = %session_id, "created session");
        Ok(Session {
            session_id,
            start_time: from_millis(now),
            end_time: None,
            summary: None,
            context: context.map(str::to_string),
            event_count: 0,
        })
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.with_conn(|conn| load_session(conn, session_id))
    }

    /// Close an open session. Returns false when it was already closed.
    pub fn end_session(&self, session_id: &str, summary: Option<&str>) -> Result<bool> {
        let now = now_millis();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET end_time = ?2, summary = COALESCE(?3, summary)
                 WHERE session_id = ?1 AND end_time IS NULL",
                params![session_id, now, summary],
            )?;
            Ok(changed > 0)
        })
    }

    /// Close sessions a previous process left open.
    pub fn close_orphan_sessions(&self) -> Result<usize> {
        let now = now_millis();
        let closed = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE sessions SET end_time = ?1 WHERE end_time IS NULL",
                [now],
            )?)
        })?;
        if closed > 0 {
            warn!(closed, "closed sessions left open by a previous process");
        }
        Ok(closed)
    }

    /// Most recent sessions first.
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY start_time DESC, rowid DESC LIMIT ?1"
            ))?;
            let sessions = stmt
                .query_map([limit as i64], map_session)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(sessions)
        })
    }

    /// Sessions that consolidation has summarized.
    pub fn summarized_sessions(&self) -> Result<Vec<Session>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE summary IS NOT NULL ORDER BY start_time"
            ))?;
            let sessions = stmt
                .query_map([], map_session)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(sessions)
        })
    }
}
