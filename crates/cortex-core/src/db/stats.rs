//! Aggregate counts.

use rusqlite::Connection;
use std::collections::BTreeMap;

use super::{read_metadata, Database, LAST_CONSOLIDATION_KEY};
use crate::error::Result;
use crate::types::{CommandStats, Insights, MemoryStats, SandboxStats, Tier, TierCounts};
use crate::utils::from_millis;

/// Runs needed before a command is called reliable or problematic.
const MIN_RUNS_FOR_VERDICT: i64 = 3;
const RELIABLE_RATE: f64 = 0.8;
const PROBLEMATIC_RATE: f64 = 0.5;
const MOST_COMMON_LIMIT: usize = 5;

/// Result values read as a success or a failure.
const SUCCESS_RESULTS: &str = "('success', 'ok', 'passed')";
const FAILURE_RESULTS: &str = "('failure', 'failed', 'error')";

fn tier_counts(conn: &Connection, table: &str) -> Result<TierCounts> {
    let mut stmt = conn.prepare(&format!("SELECT tier, COUNT(*) FROM {table} GROUP BY tier"))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut counts = TierCounts::default();
    for (tier, n) in rows {
        counts.add(tier.parse::<Tier>()?, n);
    }
    Ok(counts)
}

fn count(conn: &Connection, table: &str) -> Result<i64> {
    Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
}

fn sandbox_stats(conn: &Connection) -> Result<SandboxStats> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM sandbox_experiments GROUP BY status")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut stats = SandboxStats::default();
    for (status, n) in rows {
        stats.total += n;
        match status.as_str() {
            "passed" => stats.passed += n,
            "failed" => stats.failed += n,
            "timed_out" => stats.timed_out += n,
            "error" => stats.errors += n,
            _ => stats.open += n,
        }
    }
    stats.avg_duration_ms = conn.query_row(
        "SELECT AVG(duration_ms) FROM sandbox_experiments WHERE duration_ms IS NOT NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(stats)
}

/// Reliable and problematic verdicts plus the most frequent commands.
pub(crate) fn summarize_commands(stats: &[CommandStats], learned_skills: i64) -> Insights {
    let mut by_frequency: Vec<&CommandStats> = stats.iter().collect();
    by_frequency.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.command.cmp(&b.command)));

    let verdict = |keep: fn(f64) -> bool| -> Vec<String> {
        by_frequency
            .iter()
            .filter(|s| s.total >= MIN_RUNS_FOR_VERDICT)
            .filter(|s| s.success_rate().is_some_and(keep))
            .map(|s| s.command.clone())
            .collect()
    };

    Insights {
        total_observations: stats.iter().map(|s| s.total).sum(),
        unique_commands: stats.len() as i64,
        learned_skills,
        most_common_commands: by_frequency
            .iter()
            .take(MOST_COMMON_LIMIT)
            .map(|s| (s.command.clone(), s.total))
            .collect(),
        reliable_commands: verdict(|rate| rate >= RELIABLE_RATE),
        problematic_commands: verdict(|rate| rate < PROBLEMATIC_RATE),
    }
}

impl Database {
    /// Store-side statistics. Cache figures are filled in by the caller.
    pub fn memory_stats(&self) -> Result<MemoryStats> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT event_type, COUNT(*) FROM episodic_records GROUP BY event_type",
            )?;
            let events_by_type = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;

            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

            Ok(MemoryStats {
                episodic: tier_counts(conn, "episodic_records")?,
                facts: tier_counts(conn, "semantic_facts")?,
                skills: tier_counts(conn, "skills")?,
                events_by_type,
                sessions: count(conn, "sessions")?,
                sandbox: sandbox_stats(conn)?,
                cache: Default::default(),
                db_size_bytes: (page_count * page_size).max(0) as u64,
                last_consolidation_at: read_metadata(conn, LAST_CONSOLIDATION_KEY)?
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .map(from_millis),
            })
        })
    }

    /// Per-command outcome counts, most frequent first. With `command`, only
    /// that command's row (if it was ever observed).
    pub fn command_stats(&self, command: Option<&str>) -> Result<Vec<CommandStats>> {
        let command = command.map(str::trim);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT command,
                        COUNT(*),
                        SUM(CASE WHEN lower(trim(result)) IN {SUCCESS_RESULTS} THEN 1 ELSE 0 END),
                        SUM(CASE WHEN lower(trim(result)) IN {FAILURE_RESULTS} THEN 1 ELSE 0 END),
                        AVG(duration_ms)
                 FROM episodic_records
                 WHERE command IS NOT NULL AND (?1 IS NULL OR command = ?1)
                 GROUP BY command
                 ORDER BY COUNT(*) DESC, command"
            ))?;
            let stats = stmt
                .query_map([command], |row| {
                    Ok(CommandStats {
                        command: row.get(0)?,
                        total: row.get(1)?,
                        successful: row.get(2)?,
                        failed: row.get(3)?,
                        avg_duration_ms: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(stats)
        })
    }

    /// What the observation history says about the user's commands.
    pub fn insights(&self) -> Result<Insights> {
        let stats = self.command_stats(None)?;
        let learned_skills = self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM skills WHERE archived_at IS NULL", [], |row| {
                row.get::<_, i64>(0)
            })?)
        })?;
        Ok(summarize_commands(&stats, learned_skills))
    }
}
