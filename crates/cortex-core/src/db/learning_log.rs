//! Reinforcement and consolidation history.

use rusqlite::{params, Connection};

use super::Database;
use crate::error::Result;
use crate::types::{ConsolidationLogEntry, ConsolidationPhase, Outcome};
use crate::utils::{from_millis, now_millis, opt_from_millis};

/// One confidence change, written in the same transaction as the change.
pub(crate) struct ReinforcementEntry<'a> {
    pub entity_type: &'static str,
    pub entity_id: i64,
    pub outcome: Outcome,
    pub duration_ms: Option<u64>,
    pub source: Option<&'a str>,
    pub confidence_before: f64,
    pub confidence_after: f64,
}

pub(crate) fn insert_reinforcement(conn: &Connection, entry: &ReinforcementEntry<'_>) -> Result<()> {
    conn.execute(
        "INSERT INTO reinforcement_log
            (entity_type, entity_id, outcome, duration_ms, source,
             confidence_before, confidence_after, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.entity_type,
            entry.entity_id,
            entry.outcome.as_str(),
            entry.duration_ms.map(|d| d as i64),
            entry.source,
            entry.confidence_before,
            entry.confidence_after,
            now_millis(),
        ],
    )?;
    Ok(())
}

/// Final row for one consolidation phase.
pub(crate) fn record_phase(
    conn: &Connection,
    run_id: &str,
    phase: ConsolidationPhase,
    started_at: i64,
    records_processed: usize,
    error: Option<&str>,
) -> Result<()> {
    let status = if error.is_some() { "failed" } else { "completed" };
    conn.execute(
        "INSERT INTO consolidation_log
            (run_id, phase, status, records_processed, error, started_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run_id,
            phase.as_str(),
            status,
            records_processed as i64,
            error,
            started_at,
            now_millis(),
        ],
    )?;
    Ok(())
}

impl Database {
    /// Consolidation log rows, newest first.
    pub fn consolidation_history(&self, limit: usize) -> Result<Vec<ConsolidationLogEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, phase, status, records_processed, error, started_at, completed_at
                 FROM consolidation_log ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([limit as i64], |row| {
                    Ok(ConsolidationLogEntry {
                        id: row.get(0)?,
                        run_id: row.get(1)?,
                        phase: row.get(2)?,
                        status: row.get(3)?,
                        records_processed: row.get::<_, i64>(4)?.max(0) as u64,
                        error: row.get(5)?,
                        started_at: from_millis(row.get(6)?),
                        completed_at: opt_from_millis(row.get(7)?),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Number of reinforcement entries for an entity.
    pub fn reinforcement_count(&self, entity_type: &str, entity_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM reinforcement_log WHERE entity_type = ?1 AND entity_id = ?2",
                params![entity_type, entity_id],
                |row| row.get(0),
            )?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_rows_newest_first() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|c| {
            record_phase(c, "run-1", ConsolidationPhase::SummarizingSessions, 0, 2, None)?;
            record_phase(c, "run-1", ConsolidationPhase::ArchivingEpisodic, 0, 0, Some("disk full"))
        })
        .unwrap();

        let history = db.consolidation_history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].phase, "archiving-episodic");
        assert_eq!(history[0].status, "failed");
        assert_eq!(history[0].error.as_deref(), Some("disk full"));
        assert_eq!(history[1].records_processed, 2);
        assert_eq!(db.consolidation_history(1).unwrap().len(), 1);
    }
}
