//! Consolidation scheduler.
//!
//! One run walks `idle -> summarizing-sessions -> archiving-episodic ->
//! deduplicating-facts -> tier-updating -> idle`. Every phase commits its
//! own short transaction together with its `consolidation_log` row, so a
//! failed phase leaves earlier phases committed and is simply retried by
//! the next run. A run can be aborted between phases.

use chrono::Duration;
use rusqlite::Connection;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::cache::CacheKey;
use crate::config::ConsolidationConfig;
use crate::db::episodic::{
    archive_summarized, delete_episodes, demote_stale_episodes, event_type_counts,
    purgeable_records, top_commands,
};
use crate::db::experiments::{finalize_experiment, stale_experiments};
use crate::db::facts::{apply_merge, demote_stale_facts, duplicate_groups};
use crate::db::learning_log::record_phase;
use crate::db::sessions::{set_summary, unsummarized_sessions};
use crate::db::skills::demote_stale_skills;
use crate::db::{Database, LAST_CONSOLIDATION_KEY};
use crate::error::{Error, Result};
use crate::reinforcement::{append_source, apply_skill_outcome};
use crate::types::{
    ConsolidationPhase, ConsolidationReport, EpisodicRecord, ExperimentStatus, Outcome,
    SemanticFact,
};
use crate::utils::{millis_ago, now_millis};

/// Phases of one run, in order.
const PHASES: [ConsolidationPhase; 4] = [
    ConsolidationPhase::SummarizingSessions,
    ConsolidationPhase::ArchivingEpisodic,
    ConsolidationPhase::DeduplicatingFacts,
    ConsolidationPhase::TierUpdating,
];

/// Parameters for one run.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationRequest {
    /// Override for `ConsolidationConfig::older_than_days`.
    pub older_than_days: Option<u32>,
    /// Directory to export archived records to before purging them.
    /// Without it, archival only changes tiers.
    pub export_dir: Option<PathBuf>,
    /// Session whose records must never be purged.
    pub current_session: Option<String>,
}

/// A run's report plus the cache entries it made stale.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationOutcome {
    pub report: ConsolidationReport,
    pub stale_keys: Vec<CacheKey>,
}

#[derive(Serialize)]
struct EpisodicExport<'a> {
    run_id: &'a str,
    exported_at: String,
    records: &'a [EpisodicRecord],
}

pub struct ConsolidationScheduler {
    db: Arc<Database>,
    config: ConsolidationConfig,
    abort: AtomicBool,
    phase: Mutex<ConsolidationPhase>,
}

impl ConsolidationScheduler {
    pub fn new(db: Arc<Database>, config: ConsolidationConfig) -> Self {
        Self {
            db,
            config,
            abort: AtomicBool::new(false),
            phase: Mutex::new(ConsolidationPhase::Idle),
        }
    }

    /// Phase currently executing, `Idle` between runs.
    pub fn phase(&self) -> ConsolidationPhase {
        self.phase
            .lock()
            .map(|p| *p)
            .unwrap_or(ConsolidationPhase::Idle)
    }

    /// Ask the running consolidation to stop before its next phase.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    fn set_phase(&self, phase: ConsolidationPhase) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
    }

    /// Mark open experiments older than `stale_experiment_secs` as timed
    /// out and charge their linked skill a failure. Each experiment is
    /// reconciled in its own transaction.
    pub fn reconcile_stale_experiments(&self, stale_keys: &mut Vec<CacheKey>) -> Result<usize> {
        let max_age = Duration::seconds(self.config.stale_experiment_secs as i64);
        let cutoff = millis_ago(max_age);
        let stale = self.db.with_conn(|conn| stale_experiments(conn, cutoff))?;

        let mut reconciled = 0;
        for experiment in stale {
            let age_ms = (now_millis() - experiment.created_at).max(0) as u64;
            let summary = format!(
                "no verdict after {}s; reconciled as timed out",
                age_ms / 1000
            );
            let result = self.db.transaction(|tx| {
                finalize_experiment(tx, experiment.id, ExperimentStatus::TimedOut, age_ms, &summary, "")?;
                match experiment.linked_skill_id {
                    Some(skill_id) => {
                        let skill = apply_skill_outcome(
                            tx,
                            skill_id,
                            Outcome::Failure,
                            None,
                            Some("stale-experiment"),
                        )?;
                        Ok(Some(skill.skill_name))
                    }
                    None => Ok(None),
                }
            });
            match result {
                Ok(skill_name) => {
                    warn!(experiment_id = experiment.id, age_ms, "reconciled stale experiment");
                    if let Some(name) = skill_name {
                        stale_keys.push(CacheKey::Skill(name));
                    }
                    reconciled += 1;
                }
                // Finished by its executor in the meantime.
                Err(Error::AlreadyFinalized(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reconciled)
    }

    /// Execute one consolidation run.
    ///
    /// A phase failure ends the run early; the returned report names the
    /// failed phase and carries the error. Only failures outside the
    /// phases (e.g. an unreadable store) are returned as `Err`.
    pub fn run(&self, request: &ConsolidationRequest) -> Result<ConsolidationOutcome> {
        self.abort.store(false, Ordering::SeqCst);
        self.execute(request)
    }

    fn execute(&self, request: &ConsolidationRequest) -> Result<ConsolidationOutcome> {
        let started = std::time::Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let older_than_days = request.older_than_days.unwrap_or(self.config.older_than_days);
        let cutoff = millis_ago(Duration::days(older_than_days as i64));

        let mut outcome = ConsolidationOutcome {
            report: ConsolidationReport {
                run_id: run_id.clone(),
                ..Default::default()
            },
            stale_keys: Vec::new(),
        };
        info!(run_id = %run_id, older_than_days, "consolidation started");

        match self.reconcile_stale_experiments(&mut outcome.stale_keys) {
            Ok(n) => outcome.report.experiments_reconciled = n,
            Err(e) => warn!(error = %e, "stale experiment sweep failed; retrying next run"),
        }

        for phase in PHASES {
            if self.abort.load(Ordering::SeqCst) {
                info!(run_id = %run_id, next_phase = %phase, "consolidation aborted");
                outcome.report.aborted = true;
                break;
            }
            self.set_phase(phase);
            let phase_started = now_millis();

            let result = self.db.transaction(|tx| {
                let processed = self.run_phase(tx, phase, cutoff, &run_id, request, &mut outcome)?;
                record_phase(tx, &run_id, phase, phase_started, processed, None)?;
                Ok(processed)
            });

            match result {
                Ok(processed) => {
                    info!(run_id = %run_id, phase = %phase, processed, "consolidation phase complete");
                }
                Err(e) => {
                    let failure = Error::consolidation_phase(phase, e.to_string());
                    error!(run_id = %run_id, error = %failure, "consolidation phase failed");
                    let message = e.to_string();
                    if let Err(log_err) = self.db.with_conn(|conn| {
                        record_phase(conn, &run_id, phase, phase_started, 0, Some(&message))
                    }) {
                        warn!(error = %log_err, "could not record failed phase");
                    }
                    outcome.report.failed_phase = Some(phase);
                    outcome.report.error = Some(failure.to_string());
                    break;
                }
            }
        }
        self.set_phase(ConsolidationPhase::Idle);

        if outcome.report.is_complete() {
            if let Err(e) = self.db.set_metadata(LAST_CONSOLIDATION_KEY, &now_millis().to_string()) {
                warn!(error = %e, "could not record consolidation time");
            }
        }

        let deleted = outcome.report.records_purged + outcome.report.facts_merged;
        if self.config.compact && deleted > 0 {
            match self.db.vacuum() {
                Ok(()) => debug!(deleted, "compacted store"),
                Err(e) => warn!(error = %e, "compaction failed"),
            }
        }

        outcome.report.duration_ms = started.elapsed().as_millis() as u64;
        let report = &outcome.report;
        info!(
            run_id = %run_id,
            sessions_summarized = report.sessions_summarized,
            records_archived = report.records_archived,
            records_purged = report.records_purged,
            facts_merged = report.facts_merged,
            records_demoted = report.records_demoted,
            complete = report.is_complete(),
            "consolidation finished"
        );
        Ok(outcome)
    }

    /// Body of one phase. Counters are only added to the report once the
    /// phase has produced them; a rolled-back phase is reported as failed.
    fn run_phase(
        &self,
        conn: &Connection,
        phase: ConsolidationPhase,
        cutoff: i64,
        run_id: &str,
        request: &ConsolidationRequest,
        outcome: &mut ConsolidationOutcome,
    ) -> Result<usize> {
        match phase {
            ConsolidationPhase::SummarizingSessions => {
                let n = summarize_sessions(conn, cutoff)?;
                outcome.report.sessions_summarized = n;
                Ok(n)
            }
            ConsolidationPhase::ArchivingEpisodic => {
                let archived = archive_summarized(conn, cutoff)?;
                let purged = match &request.export_dir {
                    Some(dir) => {
                        let ids = export_and_purge(conn, dir, run_id, request.current_session.as_deref())?;
                        outcome
                            .stale_keys
                            .extend(ids.iter().map(|id| CacheKey::Episode(*id)));
                        ids.len()
                    }
                    None => 0,
                };
                outcome.report.records_archived = archived;
                outcome.report.records_purged = purged;
                Ok(archived + purged)
            }
            ConsolidationPhase::DeduplicatingFacts => {
                let (merged, keys) = deduplicate_facts(conn)?;
                outcome.stale_keys.extend(keys);
                outcome.report.facts_merged = merged;
                Ok(merged)
            }
            ConsolidationPhase::TierUpdating => {
                let max_idle = Duration::days(self.config.demote_after_days as i64);
                let demoted = demote_idle_records(conn, millis_ago(max_idle))?;
                outcome.report.records_demoted = demoted;
                Ok(demoted)
            }
            ConsolidationPhase::Idle => Ok(0),
        }
    }
}

/// Summaries read like "12 command events; 3 note events. Top commands:
/// cargo test, git push".
fn summarize_sessions(conn: &Connection, cutoff: i64) -> Result<usize> {
    let sessions = unsummarized_sessions(conn, cutoff)?;
    for session_id in &sessions {
        let counts = event_type_counts(conn, session_id)?;
        let mut summary = if counts.is_empty() {
            "0 events".to_string()
        } else {
            counts
                .iter()
                .map(|(event_type, n)| format!("{n} {event_type} events"))
                .collect::<Vec<_>>()
                .join("; ")
        };
        let commands = top_commands(conn, session_id, 3)?;
        if !commands.is_empty() {
            summary.push_str(&format!(". Top commands: {}", commands.join(", ")));
        }
        set_summary(conn, session_id, &summary)?;
        debug!(session_id = %session_id, "summarized session");
    }
    Ok(sessions.len())
}

/// Write purgeable COLD records to `dir` as JSON, then delete them.
fn export_and_purge(
    conn: &Connection,
    dir: &Path,
    run_id: &str,
    current_session: Option<&str>,
) -> Result<Vec<i64>> {
    let records = purgeable_records(conn, current_session)?;
    if records.is_empty() {
        return Ok(Vec::new());
    }

    std::fs::create_dir_all(dir)?;
    let short_run = run_id.get(..8).unwrap_or(run_id);
    let file = dir.join(format!(
        "episodic_{}_{short_run}.json",
        chrono::Utc::now().format("%Y%m%d%H%M%S")
    ));
    let export = EpisodicExport {
        run_id,
        exported_at: chrono::Utc::now().to_rfc3339(),
        records: &records,
    };
    std::fs::write(&file, serde_json::to_vec_pretty(&export)?)?;

    let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
    delete_episodes(conn, &ids)?;
    info!(count = ids.len(), file = %file.display(), "exported and purged archived records");
    Ok(ids)
}

/// Merge each group of duplicate facts into its oldest row.
fn deduplicate_facts(conn: &Connection) -> Result<(usize, Vec<CacheKey>)> {
    let mut merged_count = 0;
    let mut keys = Vec::new();
    for group in duplicate_groups(conn)? {
        let Some(merged) = merge_group(&group) else {
            continue;
        };
        let absorbed: Vec<i64> = group.iter().skip(1).map(|f| f.id).collect();
        apply_merge(conn, &merged, &absorbed)?;

        keys.push(CacheKey::FactTopic(merged.topic.clone()));
        keys.extend(group.iter().map(|f| CacheKey::Fact(f.id)));
        merged_count += absorbed.len();
        debug!(fact_id = merged.id, absorbed = absorbed.len(), "merged duplicate facts");
    }
    Ok((merged_count, keys))
}

/// Combine duplicates: confidence is the evidence-weighted mean, counts
/// add up, reliability is the maximum and provenance is concatenated.
/// The first (lowest id) fact survives.
pub(crate) fn merge_group(group: &[SemanticFact]) -> Option<SemanticFact> {
    let (first, rest) = group.split_first()?;
    if rest.is_empty() {
        return None;
    }
    let mut merged = first.clone();

    let total_weight: f64 = group.iter().map(|f| f.evidence_count() as f64).sum();
    let weighted: f64 = group
        .iter()
        .map(|f| f.confidence * f.evidence_count() as f64)
        .sum();
    merged.confidence = (weighted / total_weight).clamp(0.0, 1.0);

    for fact in rest {
        merged.corroborations = merged.corroborations.saturating_add(fact.corroborations);
        merged.contradictions = merged.contradictions.saturating_add(fact.contradictions);
        merged.access_count = merged.access_count.saturating_add(fact.access_count);
        merged.reliability = merged.reliability.max(fact.reliability);
        if let Some(source) = &fact.source {
            merged.source = append_source(merged.source.take(), source);
        }
        merged.created_at = merged.created_at.min(fact.created_at);
        merged.last_confirmed_at = merged.last_confirmed_at.max(fact.last_confirmed_at);
    }
    Some(merged)
}

/// Demote WARM records idle since `cutoff`. HOT rows are cache-resident
/// and are left alone.
fn demote_idle_records(conn: &Connection, cutoff: i64) -> Result<usize> {
    Ok(demote_stale_episodes(conn, cutoff)?
        + demote_stale_facts(conn, cutoff)?
        + demote_stale_skills(conn, cutoff)?)
}
