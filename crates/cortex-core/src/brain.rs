//! Brain coordinator.
//!
//! The façade that callers talk to. It owns the store handle, the hot
//! cache, the pattern detector and the session state machine, and routes
//! every mutation through the component responsible for it:
//!
//! - observations are written through the cache to the store and the
//!   commands they carry are fed to the pattern detector;
//! - detected workflows become skills, or reinforce the skill that already
//!   has those exact steps;
//! - sandbox verdicts and explicit outcomes go through the reinforcement
//!   engine;
//! - consolidation runs phase by phase and its stale keys are dropped from
//!   the cache afterwards.
//!
//! Locks are always taken in the order session, detector, cache; the
//! store's own lock is innermost and never held across calls back into
//! the brain.

use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheKey, CachedRecord, HotCache};
use crate::config::CortexConfig;
use crate::consolidation::{ConsolidationRequest, ConsolidationScheduler};
use crate::db::episodic::insert_episode;
use crate::db::sessions::{increment_event_count, load_session};
use crate::db::skills::{find_skill_by_name, find_skill_by_steps, insert_skill_in, load_skill};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::pattern::PatternDetector;
use crate::reinforcement::{apply_skill_outcome, ReinforcementEngine};
use crate::sandbox::{SandboxExecutor, SandboxPlan};
use crate::types::{
    CommandStats, ConsolidationLogEntry, ConsolidationReport, EpisodicRecord, Evidence,
    ExportReport, Insights, MemoryStats, NewEpisode, NewFact, NewSkill, Outcome,
    SandboxExperiment, SemanticFact, Session, SkillMemory, Tier,
};
use crate::utils::steps_hash;

/// Facts and skills below this confidence are left out of exports.
const EXPORT_MIN_CONFIDENCE: f64 = 0.5;

/// Session lifecycle of one brain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    Open { session_id: String },
}

/// Result of turning a step sequence into a skill.
#[derive(Debug, Clone, PartialEq)]
pub struct Promotion {
    pub skill: SkillMemory,
    /// False when an existing skill with the same steps was reinforced.
    pub created: bool,
}

#[derive(Serialize)]
struct KnowledgeExport<'a> {
    exported_at: String,
    facts: &'a [SemanticFact],
    skills: &'a [SkillMemory],
    sessions: &'a [Session],
}

pub struct Brain {
    db: Arc<Database>,
    config: CortexConfig,
    cache: Mutex<HotCache>,
    detector: Mutex<PatternDetector>,
    session: Mutex<SessionState>,
    reinforcement: ReinforcementEngine,
    sandbox: SandboxExecutor,
    scheduler: ConsolidationScheduler,
}

impl Brain {
    /// Open the store named by `config` and bring it to a clean state.
    pub fn open(config: CortexConfig) -> Result<Self> {
        config.validate()?;
        let db = Arc::new(Database::open_path(&config.database_path)?);
        Self::with_database(db, config)
    }

    /// Brain over a private in-memory store.
    pub fn open_in_memory(config: CortexConfig) -> Result<Self> {
        config.validate()?;
        Self::with_database(Arc::new(Database::open_in_memory()?), config)
    }

    /// Assemble a brain around an already opened store.
    ///
    /// The cache starts empty, so every HOT label is reset to WARM. Sessions
    /// and experiments a previous process left open are closed. The pattern
    /// window is refilled from the latest observed commands so a workflow
    /// repeated across processes is still detected.
    pub fn with_database(db: Arc<Database>, config: CortexConfig) -> Result<Self> {
        let reset = db.reset_hot_tiers()?;
        let orphans = db.close_orphan_sessions()?;

        let mut detector = PatternDetector::new(&config.patterns);
        let seeded = detector.seed(db.recent_commands(config.patterns.window_size)?);
        for skill in db.list_skills(None)? {
            detector.mark_promoted(skill.steps);
        }

        let brain = Self {
            cache: Mutex::new(HotCache::new(config.cache.max_entries)),
            detector: Mutex::new(detector),
            session: Mutex::new(SessionState::NoSession),
            reinforcement: ReinforcementEngine::new(db.clone()),
            sandbox: SandboxExecutor::new(db.clone(), &config.sandbox),
            scheduler: ConsolidationScheduler::new(db.clone(), config.consolidation.clone()),
            db,
            config,
        };

        let mut stale = Vec::new();
        let reconciled = brain.scheduler.reconcile_stale_experiments(&mut stale)?;
        info!(
            hot_reset = reset,
            orphan_sessions = orphans,
            stale_experiments = reconciled,
            seeded_commands = seeded,
            "brain opened"
        );
        Ok(brain)
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn config(&self) -> &CortexConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &ConsolidationScheduler {
        &self.scheduler
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Locks
    // ─────────────────────────────────────────────────────────────────────────

    fn lock_session(&self) -> Result<MutexGuard<'_, SessionState>> {
        self.session.lock().map_err(|_| Error::LockPoisoned)
    }

    fn lock_detector(&self) -> Result<MutexGuard<'_, PatternDetector>> {
        self.detector.lock().map_err(|_| Error::LockPoisoned)
    }

    fn lock_cache(&self) -> Result<MutexGuard<'_, HotCache>> {
        self.cache.lock().map_err(|_| Error::LockPoisoned)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────────

    pub fn session_state(&self) -> Result<SessionState> {
        Ok(self.lock_session()?.clone())
    }

    /// Id of the open session, if any.
    pub fn current_session(&self) -> Result<Option<String>> {
        Ok(match &*self.lock_session()? {
            SessionState::Open { session_id } => Some(session_id.clone()),
            SessionState::NoSession => None,
        })
    }

    /// Open a new session. An already open session is closed first.
    pub fn start_session(&self, context: Option<&str>) -> Result<String> {
        let mut state = self.lock_session()?;
        self.close_session(&mut state, None)?;
        let session = self.db.create_session(context)?;
        info!(session_id = %session.session_id, "session started");
        *state = SessionState::Open {
            session_id: session.session_id.clone(),
        };
        Ok(session.session_id)
    }

    /// Close the open session. Returns the closed id, or None when no
    /// session was open.
    pub fn end_session(&self, summary: Option<&str>) -> Result<Option<String>> {
        let mut state = self.lock_session()?;
        self.close_session(&mut state, summary)
    }

    fn close_session(&self, state: &mut SessionState, summary: Option<&str>) -> Result<Option<String>> {
        let SessionState::Open { session_id } = state.clone() else {
            return Ok(None);
        };
        self.db.end_session(&session_id, summary)?;
        *state = SessionState::NoSession;
        info!(session_id = %session_id, "session ended");

        // A workflow held back for a longer match completes with the session.
        let pending = self.lock_detector()?.flush();
        if let Some(candidate) = pending {
            self.promote_pattern(&candidate.steps)?;
        }
        Ok(Some(session_id))
    }

    fn session_for_observation(&self, requested: Option<&str>) -> Result<String> {
        if let Some(session_id) = requested {
            let session = self
                .db
                .with_conn(|conn| load_session(conn, session_id))?
                .ok_or_else(|| Error::validation(format!("unknown session: {session_id}")))?;
            if !session.is_open() {
                return Err(Error::validation(format!("session {session_id} is closed")));
            }
            return Ok(session.session_id);
        }

        let mut state = self.lock_session()?;
        if let SessionState::Open { session_id } = &*state {
            return Ok(session_id.clone());
        }
        let session = self.db.create_session(None)?;
        info!(session_id = %session.session_id, "session opened implicitly");
        *state = SessionState::Open {
            session_id: session.session_id.clone(),
        };
        Ok(session.session_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Observation
    // ─────────────────────────────────────────────────────────────────────────

    /// Record one event and feed its command to the pattern detector.
    ///
    /// Without `session_id` the record joins the open session, opening one
    /// if needed. Returns the new record id.
    pub fn observe(&self, episode: NewEpisode, session_id: Option<&str>) -> Result<i64> {
        episode.validate()?;
        let session_id = self.session_for_observation(session_id)?;

        let record = self.db.transaction(|tx| {
            let record = insert_episode(tx, &session_id, &episode, Tier::Hot)?;
            increment_event_count(tx, &session_id)?;
            Ok(record)
        })?;
        let id = record.id;
        debug!(record_id = id, event_type = %record.event_type, "observed event");

        let command = record.command.clone();
        self.cache_put(CacheKey::Episode(id), CachedRecord::Episode(record))?;

        if let Some(command) = command {
            let candidates = self.lock_detector()?.push(&command);
            for candidate in candidates {
                info!(
                    steps = candidate.steps.len(),
                    occurrences = candidate.occurrences,
                    "workflow detected"
                );
                self.promote_pattern(&candidate.steps)?;
            }
        }
        Ok(id)
    }

    /// Newest records first. Every record served (up to the cache's
    /// capacity) is held in the cache and labelled HOT.
    pub fn recent_episodes(&self, session_id: Option<&str>, limit: usize) -> Result<Vec<EpisodicRecord>> {
        let records = self.db.recent_episodes(session_id, limit)?;
        let capacity = self.lock_cache()?.capacity();
        let mut served = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            served.push(if index < capacity { self.hold_episode(record)? } else { record });
        }
        Ok(served)
    }

    /// One record by id, served from the cache when resident.
    pub fn episode(&self, id: i64) -> Result<Option<EpisodicRecord>> {
        if let Some(CachedRecord::Episode(record)) = self.lock_cache()?.get(&CacheKey::Episode(id)) {
            return Ok(Some(record));
        }
        match self.db.get_episode(id)? {
            Some(record) => Ok(Some(self.promote_episode(record)?)),
            None => Ok(None),
        }
    }

    fn hold_episode(&self, record: EpisodicRecord) -> Result<EpisodicRecord> {
        if let Some(CachedRecord::Episode(cached)) = self.lock_cache()?.get(&CacheKey::Episode(record.id)) {
            return Ok(cached);
        }
        self.promote_episode(record)
    }

    fn promote_episode(&self, mut record: EpisodicRecord) -> Result<EpisodicRecord> {
        if record.tier != Tier::Hot {
            self.db.set_episode_tier(record.id, Tier::Hot, None)?;
            record.tier = Tier::Hot;
        }
        self.cache_put(CacheKey::Episode(record.id), CachedRecord::Episode(record.clone()))?;
        Ok(record)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Facts
    // ─────────────────────────────────────────────────────────────────────────

    pub fn learn_fact(&self, fact: NewFact) -> Result<i64> {
        let id = self.db.insert_fact(&fact)?;
        self.invalidate(&[CacheKey::FactTopic(fact.topic.trim().to_string())])?;
        info!(fact_id = id, topic = %fact.topic.trim(), "learned fact");
        Ok(id)
    }

    /// Best fact for `topic`: highest confidence, then most recently
    /// confirmed. Served from the cache when resident.
    pub fn recall_fact(&self, topic: &str) -> Result<Option<SemanticFact>> {
        let topic = topic.trim();
        let key = CacheKey::FactTopic(topic.to_string());
        if let Some(CachedRecord::Fact(fact)) = self.lock_cache()?.get(&key) {
            return Ok(Some(fact));
        }

        let Some(mut fact) = self.db.top_facts(topic, 1)?.into_iter().next() else {
            return Ok(None);
        };
        self.db.touch_fact(fact.id)?;
        fact.access_count = fact.access_count.saturating_add(1);
        fact.tier = Tier::Hot;
        self.cache_put(key, CachedRecord::Fact(fact.clone()))?;
        Ok(Some(fact))
    }

    /// Top `k` facts for `topic`, read from the store.
    pub fn recall_facts(&self, topic: &str, k: usize) -> Result<Vec<SemanticFact>> {
        self.db.top_facts(topic.trim(), k)
    }

    /// Report a second source agreeing (`agrees`) or disagreeing with a fact.
    pub fn corroborate_fact(
        &self,
        fact_id: i64,
        source: &str,
        agrees: bool,
        reliability: f64,
    ) -> Result<SemanticFact> {
        let source = source.to_string();
        let evidence = if agrees {
            Evidence::Corroboration { source, reliability }
        } else {
            Evidence::Contradiction { source, reliability }
        };
        let fact = self.reinforcement.reinforce_fact(fact_id, &evidence)?;
        self.invalidate(&[CacheKey::Fact(fact.id), CacheKey::FactTopic(fact.topic.clone())])?;
        Ok(fact)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Skills
    // ─────────────────────────────────────────────────────────────────────────

    /// Store an explicitly taught skill. Duplicate names are rejected.
    pub fn learn_skill(&self, skill: NewSkill) -> Result<i64> {
        let id = self.db.insert_skill(&skill)?;
        self.lock_detector()?.mark_promoted(skill.steps.clone());
        info!(skill_id = id, skill = %skill.skill_name, steps = skill.steps.len(), "learned skill");
        Ok(id)
    }

    /// Skill by name, served from the cache when resident.
    pub fn recall_skill(&self, name: &str) -> Result<Option<SkillMemory>> {
        let key = CacheKey::Skill(name.to_string());
        if let Some(CachedRecord::Skill(skill)) = self.lock_cache()?.get(&key) {
            return Ok(Some(skill));
        }

        let Some(mut skill) = self.db.get_skill_by_name(name)? else {
            return Ok(None);
        };
        // Archived skills are read-only history; they never become HOT.
        if skill.archived_at.is_none() {
            self.db.touch_skill(skill.id)?;
            skill.tier = Tier::Hot;
            self.cache_put(key, CachedRecord::Skill(skill.clone()))?;
        }
        Ok(Some(skill))
    }

    /// Active skills at or above `min_confidence`.
    pub fn list_skills(&self, min_confidence: Option<f64>) -> Result<Vec<SkillMemory>> {
        self.db.list_skills(min_confidence)
    }

    /// Apply one explicit outcome to a skill.
    pub fn reinforce_skill(&self, name: &str, success: bool, duration_ms: Option<u64>) -> Result<SkillMemory> {
        let skill = self
            .db
            .get_skill_by_name(name)?
            .ok_or_else(|| Error::not_found("skill", name))?;
        let skill = self
            .reinforcement
            .reinforce(skill.id, Outcome::from(success), duration_ms)?;
        self.refresh_skill(&skill)?;
        Ok(skill)
    }

    pub fn archive_skill(&self, name: &str) -> Result<SkillMemory> {
        let skill = self.db.archive_skill(name)?;
        self.lock_cache()?.evict(&CacheKey::Skill(skill.skill_name.clone()));
        Ok(skill)
    }

    /// Turn a step sequence into a skill.
    ///
    /// A sequence that already has a skill is not duplicated: that skill
    /// receives a success instead.
    pub fn promote_pattern(&self, steps: &[String]) -> Result<Promotion> {
        let promotion = self.db.transaction(|tx| {
            if let Some(existing) = find_skill_by_steps(tx, steps)? {
                let skill = apply_skill_outcome(tx, existing.id, Outcome::Success, None, Some("pattern"))?;
                return Ok(Promotion { skill, created: false });
            }

            let hash = steps_hash(steps);
            let base = format!("workflow_{}", hash.get(..8).unwrap_or(&hash));
            let mut name = base.clone();
            let mut suffix = 2;
            while find_skill_by_name(tx, &name)?.is_some() {
                name = format!("{base}_{suffix}");
                suffix += 1;
            }
            let new = NewSkill::new(name, steps.to_vec())
                .with_description(format!("Detected workflow: {}", steps.join(" -> ")));
            let id = insert_skill_in(tx, &new)?;
            Ok(Promotion {
                skill: load_skill(tx, id)?,
                created: true,
            })
        })?;

        self.lock_detector()?.mark_promoted(steps.to_vec());
        if promotion.created {
            info!(
                skill_id = promotion.skill.id,
                skill = %promotion.skill.skill_name,
                steps = steps.len(),
                "promoted workflow to skill"
            );
        } else {
            info!(
                skill_id = promotion.skill.id,
                skill = %promotion.skill.skill_name,
                confidence = promotion.skill.confidence,
                "workflow seen again, reinforced existing skill"
            );
            self.refresh_skill(&promotion.skill)?;
        }
        Ok(promotion)
    }

    /// Run a skill's steps in the sandbox; the verdict reinforces it.
    pub async fn validate_skill(&self, name: &str, timeout_ms: Option<u64>) -> Result<SandboxExperiment> {
        let skill = self
            .db
            .get_skill_by_name(name)?
            .ok_or_else(|| Error::not_found("skill", name))?;
        let plan = SandboxPlan::new(skill.steps).for_skill(skill.id);
        self.sandbox_run(&plan, timeout_ms).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sandbox
    // ─────────────────────────────────────────────────────────────────────────

    /// Re-run the command an observed record carries. The experiment points
    /// back at the record, which keeps it from being purged while the run is
    /// open.
    pub async fn replay_episode(&self, record_id: i64, timeout_ms: Option<u64>) -> Result<SandboxExperiment> {
        let record = self
            .db
            .get_episode(record_id)?
            .ok_or_else(|| Error::not_found("episodic record", record_id))?;
        let command = record
            .command
            .ok_or_else(|| Error::validation(format!("record {record_id} carries no command")))?;
        let plan = SandboxPlan::new(vec![command]).triggered_by(record_id);
        self.sandbox_run(&plan, timeout_ms).await
    }

    /// Execute `plan` under a deadline (the configured default when
    /// `timeout_ms` is None).
    pub async fn sandbox_run(&self, plan: &SandboxPlan, timeout_ms: Option<u64>) -> Result<SandboxExperiment> {
        let timeout_ms = timeout_ms.unwrap_or(self.config.sandbox.default_timeout_ms);
        let experiment = self.sandbox.run(plan, timeout_ms).await?;
        if let Some(skill_id) = experiment.linked_skill_id {
            if let Some(skill) = self.db.get_skill(skill_id)? {
                self.refresh_skill(&skill)?;
            }
        }
        Ok(experiment)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Consolidation
    // ─────────────────────────────────────────────────────────────────────────

    /// Run one consolidation pass. With `export_path`, archived records are
    /// exported there as JSON and purged.
    pub fn consolidate(&self, older_than_days: Option<u32>, export_path: Option<&Path>) -> Result<ConsolidationReport> {
        let request = ConsolidationRequest {
            older_than_days,
            export_dir: export_path.map(Path::to_path_buf),
            current_session: self.current_session()?,
        };
        let outcome = self.scheduler.run(&request)?;
        self.invalidate(&outcome.stale_keys)?;
        Ok(outcome.report)
    }

    pub fn consolidation_history(&self, limit: usize) -> Result<Vec<ConsolidationLogEntry>> {
        self.db.consolidation_history(limit)
    }

    /// Run consolidation every `interval` on a blocking thread until the
    /// returned handle is shut down. The first run happens one interval
    /// after the call.
    pub fn spawn_consolidation_loop(self: &Arc<Self>, interval: Duration) -> ConsolidationLoop {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let brain = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // interval() completes its first tick immediately
            ticker.tick().await;
            info!(interval_secs = interval.as_secs(), "consolidation loop started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {}
                }
                let worker = Arc::clone(&brain);
                match tokio::task::spawn_blocking(move || worker.consolidate(None, None)).await {
                    Ok(Ok(report)) if report.is_complete() => {
                        debug!(run_id = %report.run_id, "scheduled consolidation complete");
                    }
                    Ok(Ok(report)) => {
                        warn!(
                            run_id = %report.run_id,
                            failed_phase = ?report.failed_phase,
                            aborted = report.aborted,
                            "scheduled consolidation incomplete"
                        );
                    }
                    Ok(Err(e)) => error!(error = %e, "scheduled consolidation failed"),
                    Err(e) => error!(error = %e, "consolidation task panicked"),
                }
            }
            info!("consolidation loop stopped");
        });

        ConsolidationLoop {
            brain: Arc::clone(self),
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Statistics & export
    // ─────────────────────────────────────────────────────────────────────────

    pub fn stats(&self) -> Result<MemoryStats> {
        let mut stats = self.db.memory_stats()?;
        stats.cache = self.lock_cache()?.stats();
        Ok(stats)
    }

    /// Outcome counts per observed command, or for one command.
    pub fn command_stats(&self, command: Option<&str>) -> Result<Vec<CommandStats>> {
        self.db.command_stats(command)
    }

    pub fn insights(&self) -> Result<Insights> {
        self.db.insights()
    }

    /// Write confident facts and skills plus session summaries to `path`.
    pub fn export_knowledge(&self, path: &Path) -> Result<ExportReport> {
        let facts = self.db.facts_above(EXPORT_MIN_CONFIDENCE)?;
        let skills = self.db.list_skills(Some(EXPORT_MIN_CONFIDENCE))?;
        let sessions = self.db.summarized_sessions()?;

        let export = KnowledgeExport {
            exported_at: chrono::Utc::now().to_rfc3339(),
            facts: &facts,
            skills: &skills,
            sessions: &sessions,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_vec_pretty(&export)?)?;

        let report = ExportReport {
            fact_count: facts.len(),
            skill_count: skills.len(),
            session_count: sessions.len(),
        };
        info!(
            path = %path.display(),
            facts = report.fact_count,
            skills = report.skill_count,
            sessions = report.session_count,
            "exported knowledge"
        );
        Ok(report)
    }

    /// End the open session and release the brain.
    pub fn close(self) -> Result<()> {
        self.end_session(None)?;
        info!("brain closed");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cache maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Write-through insert. A record pushed out of the cache loses its HOT
    /// label unless another key still holds it.
    fn cache_put(&self, key: CacheKey, record: CachedRecord) -> Result<()> {
        let evicted = {
            let mut cache = self.lock_cache()?;
            match cache.put(key, record) {
                Some((_, evicted)) if !cache.is_resident(&evicted) => Some(evicted),
                _ => None,
            }
        };
        match evicted {
            Some(record) => self.demote_evicted(&record),
            None => Ok(()),
        }
    }

    /// Replace a resident skill entry with a fresher copy.
    fn refresh_skill(&self, skill: &SkillMemory) -> Result<()> {
        let key = CacheKey::Skill(skill.skill_name.clone());
        let mut cache = self.lock_cache()?;
        if cache.peek(&key).is_some() {
            let mut fresh = skill.clone();
            fresh.tier = Tier::Hot;
            cache.put(key, CachedRecord::Skill(fresh));
        }
        Ok(())
    }

    /// Drop `keys` from the cache and demote what is no longer resident.
    fn invalidate(&self, keys: &[CacheKey]) -> Result<()> {
        let dropped: Vec<CachedRecord> = {
            let mut cache = self.lock_cache()?;
            let removed: Vec<CachedRecord> = keys.iter().filter_map(|key| cache.evict(key)).collect();
            removed
                .into_iter()
                .filter(|record| !cache.is_resident(record))
                .collect()
        };
        for record in &dropped {
            self.demote_evicted(record)?;
        }
        Ok(())
    }

    fn demote_evicted(&self, record: &CachedRecord) -> Result<()> {
        let demoted = match record {
            CachedRecord::Episode(r) => self.db.set_episode_tier(r.id, Tier::Warm, Some(Tier::Hot))?,
            CachedRecord::Fact(f) => self.db.set_fact_tier(f.id, Tier::Warm, Some(Tier::Hot))?,
            CachedRecord::Skill(s) => self.db.set_skill_tier(s.id, Tier::Warm, Some(Tier::Hot))?,
        };
        if demoted {
            debug!(?record, "left the hot cache");
        }
        Ok(())
    }
}

/// Handle to a background consolidation loop.
pub struct ConsolidationLoop {
    brain: Arc<Brain>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl ConsolidationLoop {
    /// Stop the loop. A run in progress stops before its next phase.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.brain.scheduler.abort();
        if let Err(e) = (&mut self.handle).await {
            warn!(error = %e, "consolidation loop ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, SandboxConfig};
    use crate::types::{ConsolidationPhase, ExperimentStatus};
    use tokio_test::assert_err;

    const GIT: [&str; 3] = ["git add .", "git commit -m x", "git push"];

    fn brain() -> Brain {
        Brain::open_in_memory(CortexConfig::default()).unwrap()
    }

    fn git_steps() -> Vec<String> {
        GIT.iter().map(|s| s.to_string()).collect()
    }

    fn observe_git(brain: &Brain, times: usize) {
        for _ in 0..times {
            for command in GIT {
                brain.observe(NewEpisode::command(command), None).unwrap();
            }
        }
    }

    #[test]
    fn test_git_workflow_scenario() {
        let brain = brain();
        observe_git(&brain, 3);

        let skills = brain.list_skills(None).unwrap();
        assert_eq!(skills.len(), 1);
        let skill = &skills[0];
        assert_eq!(skill.steps, git_steps());
        assert_eq!(skill.confidence, 0.5);
        assert!(skill.skill_name.starts_with("workflow_"));

        let skill = brain.reinforce_skill(&skill.skill_name, true, Some(40)).unwrap();
        assert_eq!(skill.confidence, 2.0 / 3.0);
        let skill = brain.reinforce_skill(&skill.skill_name, false, None).unwrap();
        assert_eq!(skill.confidence, 0.5);
        assert_eq!((skill.success_count, skill.failure_count), (1, 1));
    }

    #[test]
    fn test_continued_observation_keeps_one_skill() {
        let brain = brain();
        observe_git(&brain, 8);
        brain.end_session(None).unwrap();
        assert_eq!(brain.list_skills(None).unwrap().len(), 1);
    }

    #[test]
    fn test_promotion_is_idempotent() {
        let brain = brain();
        let first = brain.promote_pattern(&git_steps()).unwrap();
        assert!(first.created);
        let second = brain.promote_pattern(&git_steps()).unwrap();
        assert!(!second.created);
        assert_eq!(second.skill.id, first.skill.id);
        assert_eq!(second.skill.success_count, 1);

        let skills = brain.list_skills(None).unwrap();
        assert_eq!(skills.len(), 1);
    }

    #[test]
    fn test_recall_skill_round_trip() {
        let brain = brain();
        let new = NewSkill::new("release", vec!["cargo test".into(), "cargo publish".into()])
            .with_prerequisites(vec!["cargo login".into()])
            .with_confidence(0.7);
        brain.learn_skill(new).unwrap();

        let from_store = brain.recall_skill("release").unwrap().unwrap();
        let from_cache = brain.recall_skill("release").unwrap().unwrap();
        assert_eq!(from_store, from_cache);
        assert_eq!(from_store.steps, vec!["cargo test".to_string(), "cargo publish".to_string()]);
        assert_eq!(from_store.confidence, 0.7);
        assert_eq!((from_store.success_count, from_store.failure_count), (0, 0));
        assert_eq!(from_store.tier, Tier::Hot);

        let stats = brain.stats().unwrap();
        assert_eq!(stats.cache.hits, 1);
        assert_eq!(stats.cache.misses, 1);

        assert!(brain.learn_skill(NewSkill::new("release", vec!["x".into()])).unwrap_err().is_validation());
        assert!(brain.recall_skill("missing").unwrap().is_none());
    }

    #[test]
    fn test_reinforcement_refreshes_cached_skill() {
        let brain = brain();
        brain.learn_skill(NewSkill::new("build", vec!["make".into()])).unwrap();
        brain.recall_skill("build").unwrap();
        brain.reinforce_skill("build", true, None).unwrap();
        let cached = brain.recall_skill("build").unwrap().unwrap();
        assert_eq!(cached.success_count, 1);
        assert!(brain.reinforce_skill("nope", true, None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_archived_skill_hidden_from_listing() {
        let brain = brain();
        brain.learn_skill(NewSkill::new("old", vec!["make".into()])).unwrap();
        brain.recall_skill("old").unwrap();
        let archived = brain.archive_skill("old").unwrap();
        assert_eq!(archived.tier, Tier::Cold);
        assert!(brain.list_skills(None).unwrap().is_empty());
        let recalled = brain.recall_skill("old").unwrap().unwrap();
        assert!(recalled.archived_at.is_some());
    }

    #[test]
    fn test_session_state_machine() {
        let brain = brain();
        assert_eq!(brain.session_state().unwrap(), SessionState::NoSession);

        let id = brain.observe(NewEpisode::command("ls"), None).unwrap();
        let SessionState::Open { session_id } = brain.session_state().unwrap() else {
            panic!("observation should open a session");
        };
        let record = brain.database().get_episode(id).unwrap().unwrap();
        assert_eq!(record.session_id, session_id);
        assert_eq!(record.tier, Tier::Hot);

        let next = brain.start_session(Some("second")).unwrap();
        assert_ne!(next, session_id);
        assert!(!brain.database().get_session(&session_id).unwrap().unwrap().is_open());

        assert_eq!(brain.end_session(None).unwrap(), Some(next));
        assert_eq!(brain.end_session(None).unwrap(), None);
        assert_eq!(brain.session_state().unwrap(), SessionState::NoSession);
    }

    #[test]
    fn test_observe_validates_session() {
        let brain = brain();
        let err = assert_err!(brain.observe(NewEpisode::command("ls"), Some("nope")));
        assert!(err.is_validation());

        let sid = brain.start_session(None).unwrap();
        brain.end_session(None).unwrap();
        assert!(brain.observe(NewEpisode::command("ls"), Some(&sid)).unwrap_err().is_validation());
        assert!(brain.observe(NewEpisode::command("  "), None).unwrap_err().is_validation());
        assert!(brain.recent_episodes(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_session_end_flushes_held_pattern() {
        let brain = brain();
        for command in ["a", "b", "c", "x", "a", "b", "c", "y", "a", "b"] {
            brain.observe(NewEpisode::command(command), None).unwrap();
        }
        assert!(brain.list_skills(None).unwrap().is_empty());
        brain.end_session(None).unwrap();

        let skills = brain.list_skills(None).unwrap();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].steps, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_fact_recall_and_corroboration() {
        let brain = brain();
        let low = brain
            .learn_fact(NewFact::new("rust", "Rust has a borrow checker").with_confidence(0.4))
            .unwrap();
        let high = brain
            .learn_fact(NewFact::new("rust", "Rust compiles to native code").with_confidence(0.8))
            .unwrap();
        assert_eq!(brain.recall_fact("rust").unwrap().unwrap().id, high);

        // Two agreeing sources lift the weaker fact to 3/4
        brain.corroborate_fact(low, "book", true, 0.9).unwrap();
        let fact = brain.corroborate_fact(low, "blog", true, 0.6).unwrap();
        assert_eq!(fact.confidence, 0.75);
        assert_eq!(fact.reliability, 0.9);
        assert_eq!(brain.recall_fact("rust").unwrap().unwrap().id, high);

        let top = brain.recall_facts("rust", 5).unwrap();
        assert_eq!(top.iter().map(|f| f.id).collect::<Vec<_>>(), vec![high, low]);
        assert!(brain.recall_fact("go").unwrap().is_none());
    }

    #[test]
    fn test_fact_recall_trims_topic() {
        let brain = brain();
        let id = brain.learn_fact(NewFact::new(" rust ", "Rust has traits")).unwrap();
        assert_eq!(brain.recall_fact(" rust ").unwrap().unwrap().id, id);
        // Padded and bare topics share one cache entry
        assert_eq!(brain.recall_fact("rust").unwrap().unwrap().id, id);
        assert_eq!(brain.stats().unwrap().cache.hits, 1);
        assert_eq!(brain.recall_facts("\trust\n", 3).unwrap().len(), 1);
    }

    #[test]
    fn test_reinforcement_revives_demoted_skill() {
        let brain = brain();
        let id = brain.learn_skill(NewSkill::new("deploy", vec!["make deploy".into()])).unwrap();
        let long_ago = crate::utils::now_millis() - 60 * 24 * 60 * 60 * 1000;
        brain
            .database()
            .with_conn(|conn| Ok(conn.execute("UPDATE skills SET created_at = ?1", [long_ago])?))
            .unwrap();
        brain.consolidate(Some(0), None).unwrap();
        assert_eq!(brain.database().get_skill(id).unwrap().unwrap().tier, Tier::Cold);

        let skill = brain.reinforce_skill("deploy", true, None).unwrap();
        assert_eq!(skill.tier, Tier::Warm);
        assert_eq!(brain.stats().unwrap().skills.cold, 0);
    }

    #[test]
    fn test_episode_reads_promote_through_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = CortexConfig::new(dir.path().join("brain.db"));
        let brain = Brain::open(config.clone()).unwrap();
        let id = brain.observe(NewEpisode::command("make"), None).unwrap();
        brain.close().unwrap();

        // A fresh process: the session gets summarized and its record archived
        let brain = Brain::open(config).unwrap();
        brain.consolidate(Some(0), None).unwrap();
        assert_eq!(brain.database().get_episode(id).unwrap().unwrap().tier, Tier::Cold);

        let listed = brain.recent_episodes(None, 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].tier, Tier::Hot);
        assert_eq!(brain.database().get_episode(id).unwrap().unwrap().tier, Tier::Hot);

        let again = brain.episode(id).unwrap().unwrap();
        assert_eq!(again, listed[0]);
        let stats = brain.stats().unwrap();
        assert_eq!((stats.cache.hits, stats.cache.misses), (1, 1));
        assert_eq!(stats.episodic.hot, 1);
        assert!(brain.episode(id + 100).unwrap().is_none());
    }

    #[test]
    fn test_workflow_detected_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let config = CortexConfig::new(dir.path().join("brain.db"));
        for _ in 0..3 {
            let brain = Brain::open(config.clone()).unwrap();
            observe_git(&brain, 1);
            brain.close().unwrap();
        }

        let brain = Brain::open(config).unwrap();
        let skills = brain.list_skills(None).unwrap();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].steps, git_steps());
        let insights = brain.insights().unwrap();
        assert_eq!(insights.total_observations, 9);
        assert_eq!(insights.unique_commands, 3);
        assert_eq!(insights.learned_skills, 1);
    }

    #[test]
    fn test_cache_eviction_demotes_tier() {
        let config = CortexConfig::default().with_cache(CacheConfig { max_entries: 2 });
        let brain = Brain::open_in_memory(config).unwrap();
        let first = brain.observe(NewEpisode::command("one"), None).unwrap();
        brain.observe(NewEpisode::command("two"), None).unwrap();
        brain.observe(NewEpisode::command("three"), None).unwrap();

        let db = brain.database();
        assert_eq!(db.get_episode(first).unwrap().unwrap().tier, Tier::Warm);
        let stats = brain.stats().unwrap();
        assert_eq!(stats.cache.entries, 2);
        assert_eq!(stats.episodic.hot, 2);
        assert_eq!(stats.episodic.warm, 1);
        assert_eq!(stats.events_by_type.get("command"), Some(&3));
    }

    #[test]
    fn test_consolidate_spares_current_session_and_merges_facts() {
        let dir = tempfile::tempdir().unwrap();
        let brain = brain();
        brain.observe(NewEpisode::command("make"), None).unwrap();
        brain.end_session(None).unwrap();
        brain.observe(NewEpisode::command("make test"), None).unwrap();
        brain.learn_fact(NewFact::new("python", "Python uses indentation")).unwrap();
        brain.learn_fact(NewFact::new("python", "python  uses indentation")).unwrap();
        brain.recall_fact("python").unwrap();

        let report = brain.consolidate(Some(0), Some(dir.path())).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.sessions_summarized, 1);
        assert_eq!(report.facts_merged, 1);
        assert_eq!(brain.recall_facts("python", 10).unwrap().len(), 1);
        // Cache-resident records are not archived, so nothing was purged
        assert_eq!(report.records_purged, 0);
        assert_eq!(brain.recent_episodes(None, 10).unwrap().len(), 2);

        let again = brain.consolidate(Some(0), Some(dir.path())).unwrap();
        assert!(again.is_empty(), "{again:?}");
        assert_eq!(brain.consolidation_history(1).unwrap()[0].phase, ConsolidationPhase::TierUpdating.as_str());
    }

    #[test]
    fn test_export_knowledge() {
        let dir = tempfile::tempdir().unwrap();
        let brain = brain();
        brain.learn_fact(NewFact::new("t", "kept").with_confidence(0.9)).unwrap();
        brain.learn_fact(NewFact::new("t", "dropped").with_confidence(0.1)).unwrap();
        brain.learn_skill(NewSkill::new("s", vec!["make".into()])).unwrap();

        let path = dir.path().join("out").join("knowledge.json");
        let report = brain.export_knowledge(&path).unwrap();
        assert_eq!(
            report,
            ExportReport {
                fact_count: 1,
                skill_count: 1,
                session_count: 0
            }
        );
        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["facts"][0]["fact_text"], "kept");
    }

    #[test]
    fn test_reopen_resets_hot_and_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let config = CortexConfig::new(dir.path().join("brain.db"));
        let session = {
            let brain = Brain::open(config.clone()).unwrap();
            brain.observe(NewEpisode::command("ls"), None).unwrap();
            brain.current_session().unwrap().unwrap()
        };

        let brain = Brain::open(config).unwrap();
        let stats = brain.stats().unwrap();
        assert_eq!(stats.episodic.hot, 0);
        assert_eq!(stats.episodic.warm, 1);
        assert!(!brain.database().get_session(&session).unwrap().unwrap().is_open());
        assert_eq!(brain.session_state().unwrap(), SessionState::NoSession);
    }

    #[test]
    fn test_existing_skills_not_promoted_again_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = CortexConfig::new(dir.path().join("brain.db"));
        Brain::open(config.clone()).unwrap().learn_skill(NewSkill::new("git", git_steps())).unwrap();

        let brain = Brain::open(config).unwrap();
        observe_git(&brain, 4);
        brain.end_session(None).unwrap();
        let skills = brain.list_skills(None).unwrap();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].skill_name, "git");
    }

    #[tokio::test]
    async fn test_validate_skill_reinforces() {
        let brain = brain();
        brain.learn_skill(NewSkill::new("ok", vec!["true".into()])).unwrap();
        brain.learn_skill(NewSkill::new("bad", vec!["true".into(), "false".into()])).unwrap();

        let passed = brain.validate_skill("ok", Some(5_000)).await.unwrap();
        assert_eq!(passed.status, ExperimentStatus::Passed);
        assert_eq!(brain.recall_skill("ok").unwrap().unwrap().confidence, 2.0 / 3.0);

        let failed = brain.validate_skill("bad", Some(5_000)).await.unwrap();
        assert_eq!(failed.status, ExperimentStatus::Failed);
        assert_eq!(brain.recall_skill("bad").unwrap().unwrap().failure_count, 1);

        assert!(brain.validate_skill("missing", None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_replay_links_experiment_to_record() {
        let brain = brain();
        let id = brain.observe(NewEpisode::command("true"), None).unwrap();
        let experiment = brain.replay_episode(id, Some(5_000)).await.unwrap();
        assert_eq!(experiment.status, ExperimentStatus::Passed);
        assert_eq!(experiment.trigger_record_id, Some(id));
        assert_eq!(experiment.linked_skill_id, None);
        assert_eq!(brain.stats().unwrap().sandbox.passed, 1);

        let note = NewEpisode {
            event_type: "note".into(),
            ..Default::default()
        };
        let note_id = brain.observe(note, None).unwrap();
        assert!(brain.replay_episode(note_id, None).await.unwrap_err().is_validation());
        assert!(brain.replay_episode(9_999, None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_sandbox_timeout_through_brain() {
        let config = CortexConfig::default().with_sandbox(SandboxConfig {
            use_shell: true,
            ..Default::default()
        });
        let brain = Brain::open_in_memory(config).unwrap();
        let started = std::time::Instant::now();
        let experiment = brain
            .sandbox_run(&SandboxPlan::new(vec!["sleep 5".into()]), Some(100))
            .await
            .unwrap();
        assert_eq!(experiment.status, ExperimentStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_consolidation_loop_runs_and_stops() {
        let brain = Arc::new(brain());
        brain.observe(NewEpisode::command("ls"), None).unwrap();
        brain.end_session(None).unwrap();

        let background = brain.spawn_consolidation_loop(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(200)).await;
        background.shutdown().await;

        assert!(!brain.consolidation_history(10).unwrap().is_empty());
    }
}
