//! Episodic records. Append-only; only the tier label changes after insert.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{opt_u64_column, parse_column, Database};
use crate::error::Result;
use crate::types::{EpisodicRecord, NewEpisode, Tier};
use crate::utils::{from_millis, now_millis};

const EPISODE_COLUMNS: &str =
    "id, timestamp, event_type, command, result, duration_ms, context, session_id, tier";

pub(crate) fn map_episode(row: &Row<'_>) -> rusqlite::Result<EpisodicRecord> {
    Ok(EpisodicRecord {
        id: row.get(0)?,
        timestamp: from_millis(row.get(1)?),
        event_type: row.get(2)?,
        command: row.get(3)?,
        result: row.get(4)?,
        duration_ms: opt_u64_column(row, 5)?,
        context: row.get(6)?,
        session_id: row.get(7)?,
        tier: parse_column(row, 8)?,
    })
}

/// Insert one record. The caller has validated `episode` and owns the
/// transaction that also bumps the session's event count.
pub(crate) fn insert_episode(
    conn: &Connection,
    session_id: &str,
    episode: &NewEpisode,
    tier: Tier,
) -> Result<EpisodicRecord> {
    let now = now_millis();
    conn.execute(
        "INSERT INTO episodic_records
            (timestamp, event_type, command, result, duration_ms, context, session_id, tier)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            now,
            episode.event_type,
            episode.command,
            episode.result,
            episode.duration_ms.map(|d| d as i64),
            episode.context,
            session_id,
            tier.as_str(),
        ],
    )?;
    Ok(EpisodicRecord {
        id: conn.last_insert_rowid(),
        timestamp: from_millis(now),
        event_type: episode.event_type.clone(),
        command: episode.command.clone(),
        result: episode.result.clone(),
        duration_ms: episode.duration_ms,
        context: episode.context.clone(),
        session_id: session_id.to_string(),
        tier,
    })
}

/// Move records of summarized sessions to COLD. Cache-resident (HOT) rows
/// are left alone until they fall out of the cache.
pub(crate) fn archive_summarized(conn: &Connection, cutoff: i64) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE episodic_records SET tier = 'cold'
         WHERE tier = 'warm'
           AND session_id IN (
               SELECT session_id FROM sessions
               WHERE summary IS NOT NULL AND end_time IS NOT NULL AND end_time <= ?1
           )",
        [cutoff],
    )?)
}

/// COLD records of summarized sessions that may leave the store: never the
/// current session, never a record an open experiment points at.
pub(crate) fn purgeable_records(
    conn: &Connection,
    current_session: Option<&str>,
) -> Result<Vec<EpisodicRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EPISODE_COLUMNS} FROM episodic_records e
         WHERE e.tier = 'cold'
           AND e.session_id IN (SELECT session_id FROM sessions WHERE summary IS NOT NULL)
           AND (?1 IS NULL OR e.session_id != ?1)
           AND NOT EXISTS (
               SELECT 1 FROM sandbox_experiments x
               WHERE x.trigger_record_id = e.id AND x.status IN ('pending', 'running')
           )
         ORDER BY e.id"
    ))?;
    let records = stmt
        .query_map([current_session], map_episode)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(records)
}

pub(crate) fn delete_episodes(conn: &Connection, ids: &[i64]) -> Result<usize> {
    let mut stmt = conn.prepare("DELETE FROM episodic_records WHERE id = ?1")?;
    let mut deleted = 0;
    for id in ids {
        deleted += stmt.execute([id])?;
    }
    Ok(deleted)
}

/// Demote WARM records older than `cutoff` to COLD.
pub(crate) fn demote_stale_episodes(conn: &Connection, cutoff: i64) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE episodic_records SET tier = 'cold' WHERE tier = 'warm' AND timestamp < ?1",
        [cutoff],
    )?)
}

/// Event types and counts for a session, most frequent first.
pub(crate) fn event_type_counts(conn: &Connection, session_id: &str) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT event_type, COUNT(*) AS n FROM episodic_records
         WHERE session_id = ?1
         GROUP BY event_type
         ORDER BY n DESC, event_type",
    )?;
    let counts = stmt
        .query_map([session_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(counts)
}

/// Most frequent commands for a session.
pub(crate) fn top_commands(conn: &Connection, session_id: &str, limit: usize) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT command, COUNT(*) AS n FROM episodic_records
         WHERE session_id = ?1 AND command IS NOT NULL
         GROUP BY command
         ORDER BY n DESC, command
         LIMIT ?2",
    )?;
    let commands = stmt
        .query_map(params![session_id, limit as i64], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(commands)
}

impl Database {
    pub fn get_episode(&self, id: i64) -> Result<Option<EpisodicRecord>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {EPISODE_COLUMNS} FROM episodic_records WHERE id = ?1"),
                    [id],
                    map_episode,
                )
                .optional()?)
        })
    }

    /// Newest first, optionally scoped to one session.
    pub fn recent_episodes(&self, session_id: Option<&str>, limit: usize) -> Result<Vec<EpisodicRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EPISODE_COLUMNS} FROM episodic_records
                 WHERE (?1 IS NULL OR session_id = ?1)
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2"
            ))?;
            let records = stmt
                .query_map(params![session_id, limit as i64], map_episode)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    /// The last `limit` observed commands across all sessions, oldest first.
    pub fn recent_commands(&self, limit: usize) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT command FROM episodic_records
                 WHERE command IS NOT NULL
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?1",
            )?;
            let mut commands = stmt
                .query_map([limit as i64], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            commands.reverse();
            Ok(commands)
        })
    }

    /// Update the tier label. `only_if` restricts the change to rows that
    /// currently carry that tier.
    pub fn set_episode_tier(&self, id: i64, tier: Tier, only_if: Option<Tier>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE episodic_records SET tier = ?2 WHERE id = ?1 AND (?3 IS NULL OR tier = ?3)",
                params![id, tier.as_str(), only_if.map(|t| t.as_str())],
            )?;
            Ok(changed > 0)
        })
    }
}
