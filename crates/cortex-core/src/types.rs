//! Core types for cortex memory records.
//!
//! Every entity here is an explicit record type. Inputs for new records
//! (`New*`) validate their invariants before anything reaches the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Tier
// ─────────────────────────────────────────────────────────────────────────────

/// Residency/representation hint carried by every memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Resident in the hot cache.
    Hot,
    /// Regular storage layout.
    Warm,
    /// Archived, read-mostly.
    Cold,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hot" => Ok(Tier::Hot),
            "warm" => Ok(Tier::Warm),
            "cold" => Ok(Tier::Cold),
            other => Err(Error::validation(format!("unknown tier: {other}"))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Episodic memory
// ─────────────────────────────────────────────────────────────────────────────

/// One observed event. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub command: Option<String>,
    pub result: Option<String>,
    pub duration_ms: Option<u64>,
    pub context: Option<String>,
    pub session_id: String,
    pub tier: Tier,
}

/// Input for a new episodic record.
#[derive(Debug, Clone, Default)]
pub struct NewEpisode {
    pub event_type: String,
    pub command: Option<String>,
    pub result: Option<String>,
    pub duration_ms: Option<u64>,
    pub context: Option<String>,
}

impl NewEpisode {
    /// A command observation.
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            event_type: "command".into(),
            command: Some(command.into()),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_type.trim().is_empty() {
            return Err(Error::validation("event_type cannot be empty"));
        }
        if let Some(cmd) = &self.command {
            if cmd.trim().is_empty() {
                return Err(Error::validation("command cannot be blank"));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Semantic memory
// ─────────────────────────────────────────────────────────────────────────────

/// A learned fact with an evolving confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticFact {
    pub id: i64,
    pub topic: String,
    pub fact_text: String,
    pub confidence: f64,
    /// Provenance; merged facts carry every source joined with "; ".
    pub source: Option<String>,
    pub source_type: Option<String>,
    pub reliability: f64,
    pub corroborations: u32,
    pub contradictions: u32,
    pub access_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_confirmed_at: DateTime<Utc>,
    pub tier: Tier,
}

impl SemanticFact {
    /// Evidence backing this fact: the original assertion plus every
    /// corroboration or contradiction since.
    pub fn evidence_count(&self) -> u32 {
        1 + self.corroborations + self.contradictions
    }
}

/// Input for a new fact.
#[derive(Debug, Clone)]
pub struct NewFact {
    pub topic: String,
    pub fact_text: String,
    pub confidence: f64,
    pub source: Option<String>,
    pub source_type: Option<String>,
    pub reliability: f64,
}

impl NewFact {
    pub fn new(topic: impl Into<String>, fact_text: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            fact_text: fact_text.into(),
            confidence: 0.5,
            source: None,
            source_type: None,
            reliability: 0.5,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>, source_type: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self.source_type = Some(source_type.into());
        self
    }

    pub fn with_reliability(mut self, reliability: f64) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(Error::validation("topic cannot be empty"));
        }
        if self.fact_text.trim().is_empty() {
            return Err(Error::validation("fact_text cannot be empty"));
        }
        validate_unit("confidence", self.confidence)?;
        validate_unit("reliability", self.reliability)
    }
}

/// Independent evidence about an existing fact.
#[derive(Debug, Clone, PartialEq)]
pub enum Evidence {
    /// Another source reports the same fact.
    Corroboration { source: String, reliability: f64 },
    /// Another source reports the opposite.
    Contradiction { source: String, reliability: f64 },
}

impl Evidence {
    pub fn is_success(&self) -> bool {
        matches!(self, Evidence::Corroboration { .. })
    }

    pub fn source(&self) -> &str {
        match self {
            Evidence::Corroboration { source, .. } | Evidence::Contradiction { source, .. } => source,
        }
    }

    pub fn reliability(&self) -> f64 {
        match self {
            Evidence::Corroboration { reliability, .. }
            | Evidence::Contradiction { reliability, .. } => *reliability,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Skill memory
// ─────────────────────────────────────────────────────────────────────────────

/// A reusable workflow with a reinforced confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillMemory {
    pub id: i64,
    pub skill_name: String,
    pub description: Option<String>,
    pub steps: Vec<String>,
    pub prerequisites: Vec<String>,
    pub confidence: f64,
    pub success_count: u32,
    pub failure_count: u32,
    pub avg_duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub tier: Tier,
}

/// Input for a new skill.
#[derive(Debug, Clone)]
pub struct NewSkill {
    pub skill_name: String,
    pub description: Option<String>,
    pub steps: Vec<String>,
    pub prerequisites: Vec<String>,
    pub confidence: f64,
}

impl NewSkill {
    pub fn new(skill_name: impl Into<String>, steps: Vec<String>) -> Self {
        Self {
            skill_name: skill_name.into(),
            description: None,
            steps,
            prerequisites: Vec::new(),
            confidence: 0.5,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_prerequisites(mut self, prerequisites: Vec<String>) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.skill_name.trim().is_empty() {
            return Err(Error::validation("skill_name cannot be empty"));
        }
        if self.steps.iter().any(|s| s.trim().is_empty()) {
            return Err(Error::validation("skill steps cannot be blank"));
        }
        validate_unit("confidence", self.confidence)
    }
}

/// Result of one skill execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

impl From<bool> for Outcome {
    fn from(success: bool) -> Self {
        if success { Outcome::Success } else { Outcome::Failure }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub context: Option<String>,
    pub event_count: u32,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sandbox experiments
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Passed,
    Failed,
    TimedOut,
    Error,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Pending => "pending",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Passed => "passed",
            ExperimentStatus::Failed => "failed",
            ExperimentStatus::TimedOut => "timed_out",
            ExperimentStatus::Error => "error",
        }
    }

    /// Pending and running experiments are still open.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExperimentStatus::Pending | ExperimentStatus::Running)
    }

    /// Outcome fed to reinforcement. Timeouts and errors count as failures.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            ExperimentStatus::Passed => Some(Outcome::Success),
            ExperimentStatus::Failed | ExperimentStatus::TimedOut | ExperimentStatus::Error => {
                Some(Outcome::Failure)
            }
            ExperimentStatus::Pending | ExperimentStatus::Running => None,
        }
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExperimentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ExperimentStatus::Pending),
            "running" => Ok(ExperimentStatus::Running),
            "passed" => Ok(ExperimentStatus::Passed),
            "failed" => Ok(ExperimentStatus::Failed),
            "timed_out" => Ok(ExperimentStatus::TimedOut),
            "error" => Ok(ExperimentStatus::Error),
            other => Err(Error::validation(format!("unknown experiment status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxExperiment {
    pub id: i64,
    pub plan: Vec<String>,
    pub status: ExperimentStatus,
    pub duration_ms: Option<u64>,
    pub exit_summary: Option<String>,
    pub logs: Option<String>,
    pub linked_skill_id: Option<i64>,
    /// Episodic record that prompted this experiment, if any.
    pub trigger_record_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Consolidation
// ─────────────────────────────────────────────────────────────────────────────

/// Consolidation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsolidationPhase {
    Idle,
    SummarizingSessions,
    ArchivingEpisodic,
    DeduplicatingFacts,
    TierUpdating,
}

impl ConsolidationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsolidationPhase::Idle => "idle",
            ConsolidationPhase::SummarizingSessions => "summarizing-sessions",
            ConsolidationPhase::ArchivingEpisodic => "archiving-episodic",
            ConsolidationPhase::DeduplicatingFacts => "deduplicating-facts",
            ConsolidationPhase::TierUpdating => "tier-updating",
        }
    }

    /// Phase that follows this one in a run.
    pub fn next(&self) -> ConsolidationPhase {
        match self {
            ConsolidationPhase::Idle => ConsolidationPhase::SummarizingSessions,
            ConsolidationPhase::SummarizingSessions => ConsolidationPhase::ArchivingEpisodic,
            ConsolidationPhase::ArchivingEpisodic => ConsolidationPhase::DeduplicatingFacts,
            ConsolidationPhase::DeduplicatingFacts => ConsolidationPhase::TierUpdating,
            ConsolidationPhase::TierUpdating => ConsolidationPhase::Idle,
        }
    }
}

impl std::fmt::Display for ConsolidationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one consolidation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub run_id: String,
    pub sessions_summarized: usize,
    pub records_archived: usize,
    pub records_purged: usize,
    pub facts_merged: usize,
    pub records_demoted: usize,
    pub experiments_reconciled: usize,
    /// Phase that failed; earlier phases stay committed.
    pub failed_phase: Option<ConsolidationPhase>,
    pub error: Option<String>,
    pub aborted: bool,
    pub duration_ms: u64,
}

impl ConsolidationReport {
    /// True when the run changed nothing.
    pub fn is_empty(&self) -> bool {
        self.sessions_summarized == 0
            && self.records_archived == 0
            && self.records_purged == 0
            && self.facts_merged == 0
            && self.records_demoted == 0
            && self.experiments_reconciled == 0
    }

    pub fn is_complete(&self) -> bool {
        self.failed_phase.is_none() && !self.aborted
    }
}

/// Row of the consolidation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationLogEntry {
    pub id: i64,
    pub run_id: String,
    pub phase: String,
    pub status: String,
    pub records_processed: u64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Row counts per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub hot: i64,
    pub warm: i64,
    pub cold: i64,
}

impl TierCounts {
    pub fn total(&self) -> i64 {
        self.hot + self.warm + self.cold
    }

    pub(crate) fn add(&mut self, tier: Tier, count: i64) {
        match tier {
            Tier::Hot => self.hot += count,
            Tier::Warm => self.warm += count,
            Tier::Cold => self.cold += count,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Sandbox experiments by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxStats {
    pub total: i64,
    /// Pending or running.
    pub open: i64,
    pub passed: i64,
    pub failed: i64,
    pub timed_out: i64,
    pub errors: i64,
    /// Mean over experiments that recorded a duration.
    pub avg_duration_ms: Option<f64>,
}

/// Aggregate statistics across the store and the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub episodic: TierCounts,
    pub facts: TierCounts,
    pub skills: TierCounts,
    pub events_by_type: BTreeMap<String, i64>,
    pub sessions: i64,
    pub sandbox: SandboxStats,
    pub cache: CacheStats,
    pub db_size_bytes: u64,
    /// When the last scheduled or manual consolidation pass finished.
    pub last_consolidation_at: Option<DateTime<Utc>>,
}

/// How one command has fared across every observation of it.
///
/// An observation counts as successful when its result reads "success",
/// "ok" or "passed", and as failed for "failure", "failed" or "error"
/// (case-insensitive). Other results count toward `total` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStats {
    pub command: String,
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub avg_duration_ms: Option<f64>,
}

impl CommandStats {
    /// Share of judged runs that succeeded; None before any verdict.
    pub fn success_rate(&self) -> Option<f64> {
        let judged = self.successful + self.failed;
        (judged > 0).then(|| self.successful as f64 / judged as f64)
    }
}

/// Summary of what the observation history says about the user's commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Insights {
    pub total_observations: i64,
    pub unique_commands: i64,
    pub learned_skills: i64,
    /// Up to five commands, most frequent first.
    pub most_common_commands: Vec<(String, i64)>,
    /// Seen often enough with a success rate of at least 80%.
    pub reliable_commands: Vec<String>,
    /// Seen often enough with a success rate below 50%.
    pub problematic_commands: Vec<String>,
}

/// Counts written by a knowledge export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportReport {
    pub fact_count: usize,
    pub skill_count: usize,
    pub session_count: usize,
}

fn validate_unit(field: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) || value.is_nan() {
        return Err(Error::validation(format!(
            "{field} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_roundtrip() {
        for tier in [Tier::Hot, Tier::Warm, Tier::Cold] {
            assert_eq!(tier.as_str().parse::<Tier>().unwrap(), tier);
        }
        assert!("lukewarm".parse::<Tier>().is_err());
    }

    #[test]
    fn test_new_fact_validation() {
        assert!(NewFact::new("python", "uses indentation").validate().is_ok());
        assert!(NewFact::new("", "x").validate().is_err());
        assert!(NewFact::new("python", "  ").validate().is_err());
        assert!(NewFact::new("python", "x").with_confidence(1.2).validate().is_err());
        assert!(NewFact::new("python", "x").with_reliability(-0.1).validate().is_err());
        assert!(NewFact::new("python", "x").with_confidence(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_new_skill_validation() {
        let ok = NewSkill::new("deploy", vec!["npm run build".into()]);
        assert!(ok.validate().is_ok());
        assert!(NewSkill::new(" ", vec![]).validate().is_err());
        assert!(NewSkill::new("x", vec!["".into()]).validate().is_err());
        assert!(ok.with_confidence(2.0).validate().is_err());
    }

    #[test]
    fn test_command_success_rate_ignores_unjudged_runs() {
        let stats = CommandStats {
            command: "make".into(),
            total: 5,
            successful: 3,
            failed: 1,
            avg_duration_ms: None,
        };
        assert_eq!(stats.success_rate(), Some(0.75));
        let unjudged = CommandStats {
            successful: 0,
            failed: 0,
            ..stats
        };
        assert_eq!(unjudged.success_rate(), None);
    }

    #[test]
    fn test_episode_validation() {
        assert!(NewEpisode::command("ls").validate().is_ok());
        assert!(NewEpisode::command(" ").validate().is_err());
        assert!(NewEpisode::default().validate().is_err());
    }

    #[test]
    fn test_experiment_status_outcome() {
        assert_eq!(ExperimentStatus::Passed.outcome(), Some(Outcome::Success));
        assert_eq!(ExperimentStatus::TimedOut.outcome(), Some(Outcome::Failure));
        assert_eq!(ExperimentStatus::Error.outcome(), Some(Outcome::Failure));
        assert_eq!(ExperimentStatus::Running.outcome(), None);
        assert!(!ExperimentStatus::Pending.is_terminal());
        assert_eq!("timed_out".parse::<ExperimentStatus>().unwrap(), ExperimentStatus::TimedOut);
    }

    #[test]
    fn test_phase_cycle() {
        let mut phase = ConsolidationPhase::Idle;
        let mut seen = vec![];
        loop {
            phase = phase.next();
            if phase == ConsolidationPhase::Idle {
                break;
            }
            seen.push(phase.as_str());
        }
        assert_eq!(
            seen,
            ["summarizing-sessions", "archiving-episodic", "deduplicating-facts", "tier-updating"]
        );
    }

    #[test]
    fn test_report_empty() {
        let mut report = ConsolidationReport::default();
        assert!(report.is_empty());
        report.facts_merged = 1;
        assert!(!report.is_empty());
    }
}
