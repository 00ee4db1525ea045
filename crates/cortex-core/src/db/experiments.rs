//! Sandbox experiment rows.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{json_column, opt_u64_column, parse_column, Database};
use crate::error::{Error, Result};
use crate::types::{ExperimentStatus, SandboxExperiment};
use crate::utils::{from_millis, now_millis, opt_from_millis};

const EXPERIMENT_COLUMNS: &str = "id, plan, status, duration_ms, exit_summary, logs,
     linked_skill_id, trigger_record_id, created_at, finished_at";

pub(crate) fn map_experiment(row: &Row<'_>) -> rusqlite::Result<SandboxExperiment> {
    Ok(SandboxExperiment {
        id: row.get(0)?,
        plan: json_column(row, 1)?,
        status: parse_column(row, 2)?,
        duration_ms: opt_u64_column(row, 3)?,
        exit_summary: row.get(4)?,
        logs: row.get(5)?,
        linked_skill_id: row.get(6)?,
        trigger_record_id: row.get(7)?,
        created_at: from_millis(row.get(8)?),
        finished_at: opt_from_millis(row.get(9)?),
    })
}

pub(crate) fn load_experiment(conn: &Connection, id: i64) -> Result<SandboxExperiment> {
    conn.query_row(
        &format!("SELECT {EXPERIMENT_COLUMNS} FROM sandbox_experiments WHERE id = ?1"),
        [id],
        map_experiment,
    )
    .optional()?
    .ok_or_else(|| Error::not_found("experiment", id))
}

/// Terminal write for an experiment. Succeeds once; any later attempt
/// fails with [`Error::AlreadyFinalized`].
pub(crate) fn finalize_experiment(
    conn: &Connection,
    id: i64,
    status: ExperimentStatus,
    duration_ms: u64,
    exit_summary: &str,
    logs: &str,
) -> Result<()> {
    if !status.is_terminal() {
        return Err(Error::validation(format!("{status} is not a terminal status")));
    }
    let changed = conn.execute(
        "UPDATE sandbox_experiments
         SET status = ?2, duration_ms = ?3, exit_summary = ?4, logs = ?5, finished_at = ?6
         WHERE id = ?1 AND status IN ('pending', 'running')",
        params![id, status.as_str(), duration_ms as i64, exit_summary, logs, now_millis()],
    )?;
    if changed == 0 {
        load_experiment(conn, id)?;
        return Err(Error::AlreadyFinalized(id));
    }
    Ok(())
}

/// An experiment that never reached a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StaleExperiment {
    pub id: i64,
    pub linked_skill_id: Option<i64>,
    pub created_at: i64,
}

/// Open experiments created before `cutoff`.
pub(crate) fn stale_experiments(conn: &Connection, cutoff: i64) -> Result<Vec<StaleExperiment>> {
    let mut stmt = conn.prepare(
        "SELECT id, linked_skill_id, created_at FROM sandbox_experiments
         WHERE status IN ('pending', 'running') AND created_at < ?1
         ORDER BY id",
    )?;
    let rows = stmt
        .query_map([cutoff], |row| {
            Ok(StaleExperiment {
                id: row.get(0)?,
                linked_skill_id: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl Database {
    /// Record a plan before it runs. Status starts at pending.
    pub fn create_experiment(
        &self,
        plan: &[String],
        linked_skill_id: Option<i64>,
        trigger_record_id: Option<i64>,
    ) -> Result<i64> {
        let plan_json = serde_json::to_string(plan)?;
        let now = now_millis();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sandbox_experiments (plan, status, linked_skill_id, trigger_record_id, created_at)
                 VALUES (?1, 'pending', ?2, ?3, ?4)",
                params![plan_json, linked_skill_id, trigger_record_id, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// pending -> running. Returns false if the row was not pending.
    pub fn mark_experiment_running(&self, id: i64) -> Result<bool> {
        let now = now_millis();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sandbox_experiments SET status = 'running', started_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, now],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn get_experiment(&self, id: i64) -> Result<Option<SandboxExperiment>> {
        match self.with_conn(|conn| load_experiment(conn, id)) {
            Ok(experiment) => Ok(Some(experiment)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Newest first.
    pub fn list_experiments(&self, limit: usize) -> Result<Vec<SandboxExperiment>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXPERIMENT_COLUMNS} FROM sandbox_experiments ORDER BY id DESC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map([limit as i64], map_experiment)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalize_exactly_once() {
        let db = Database::open_in_memory().unwrap();
        let id = db.create_experiment(&["true".to_string()], None, None).unwrap();
        assert!(db.mark_experiment_running(id).unwrap());
        assert!(!db.mark_experiment_running(id).unwrap());

        db.with_conn(|c| finalize_experiment(c, id, ExperimentStatus::Passed, 12, "ok", ""))
            .unwrap();
        let err = db
            .with_conn(|c| finalize_experiment(c, id, ExperimentStatus::Failed, 1, "no", ""))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyFinalized(x) if x == id));

        let stored = db.get_experiment(id).unwrap().unwrap();
        assert_eq!(stored.status, ExperimentStatus::Passed);
        assert_eq!(stored.duration_ms, Some(12));
        assert!(stored.finished_at.is_some());
    }

    #[test]
    fn test_finalize_rejects_open_status_and_missing_rows() {
        let db = Database::open_in_memory().unwrap();
        let id = db.create_experiment(&["true".to_string()], None, None).unwrap();
        assert!(db
            .with_conn(|c| finalize_experiment(c, id, ExperimentStatus::Running, 0, "", ""))
            .unwrap_err()
            .is_validation());
        assert!(db
            .with_conn(|c| finalize_experiment(c, 404, ExperimentStatus::Passed, 0, "", ""))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_stale_selection() {
        let db = Database::open_in_memory().unwrap();
        let open = db.create_experiment(&["sleep 9".to_string()], None, None).unwrap();
        let done = db.create_experiment(&["true".to_string()], None, None).unwrap();
        db.with_conn(|c| finalize_experiment(c, done, ExperimentStatus::Passed, 0, "", ""))
            .unwrap();

        let stale = db.with_conn(|c| stale_experiments(c, now_millis() + 1)).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, open);
        assert_eq!(stale[0].linked_skill_id, None);
        assert!(db.with_conn(|c| stale_experiments(c, 0)).unwrap().is_empty());
        assert_eq!(db.list_experiments(10).unwrap().len(), 2);
    }
}
