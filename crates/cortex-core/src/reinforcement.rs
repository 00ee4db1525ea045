//! Reinforcement engine.
//!
//! Confidence after `s` successes and `f` failures is the Laplace estimate
//! `(s + 1) / (s + f + 2)`: 0.5 with no evidence, strictly inside (0, 1),
//! and independent of the order outcomes arrive in. This module is the
//! only writer of confidence after a record is created.

use rusqlite::Connection;
use std::sync::Arc;
use tracing::info;

use crate::db::facts::{load_fact, store_fact_evidence};
use crate::db::learning_log::{insert_reinforcement, ReinforcementEntry};
use crate::db::skills::{load_skill, store_skill_outcome};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{Evidence, Outcome, SemanticFact, SkillMemory, Tier};
use crate::utils::{from_millis, now_millis};

/// Laplace-smoothed success estimate.
pub fn laplace_confidence(successes: u32, failures: u32) -> f64 {
    (successes as f64 + 1.0) / (successes as f64 + failures as f64 + 2.0)
}

/// Apply one outcome to a skill inside the caller's transaction.
///
/// Increments the matching counter, recomputes confidence, folds the
/// duration into the running average and appends to the reinforcement log.
pub(crate) fn apply_skill_outcome(
    conn: &Connection,
    skill_id: i64,
    outcome: Outcome,
    duration_ms: Option<u64>,
    source: Option<&str>,
) -> Result<SkillMemory> {
    let mut skill = load_skill(conn, skill_id)?;
    let before = skill.confidence;

    match outcome {
        Outcome::Success => skill.success_count = skill.success_count.saturating_add(1),
        Outcome::Failure => skill.failure_count = skill.failure_count.saturating_add(1),
    }
    skill.confidence = laplace_confidence(skill.success_count, skill.failure_count);

    if let Some(duration) = duration_ms {
        let runs = (skill.success_count as u64 + skill.failure_count as u64).max(1);
        skill.avg_duration_ms = Some(match skill.avg_duration_ms {
            Some(avg) => (avg * (runs - 1) + duration) / runs,
            None => duration,
        });
    }
    skill.last_used_at = Some(from_millis(now_millis()));
    // A reinforcement is an access: idle records come back from COLD.
    if skill.tier == Tier::Cold && skill.archived_at.is_none() {
        skill.tier = Tier::Warm;
    }

    store_skill_outcome(conn, &skill)?;
    insert_reinforcement(
        conn,
        &ReinforcementEntry {
            entity_type: "skill",
            entity_id: skill.id,
            outcome,
            duration_ms,
            source,
            confidence_before: before,
            confidence_after: skill.confidence,
        },
    )?;
    Ok(skill)
}

/// Apply corroborating or contradicting evidence to a fact inside the
/// caller's transaction.
pub(crate) fn apply_fact_evidence(
    conn: &Connection,
    fact_id: i64,
    evidence: &Evidence,
) -> Result<SemanticFact> {
    let reliability = evidence.reliability();
    if !(0.0..=1.0).contains(&reliability) {
        return Err(Error::validation(format!(
            "reliability must be within [0, 1], got {reliability}"
        )));
    }
    let mut fact = load_fact(conn, fact_id)?;
    let before = fact.confidence;

    if evidence.is_success() {
        fact.corroborations = fact.corroborations.saturating_add(1);
        fact.last_confirmed_at = from_millis(now_millis());
    } else {
        fact.contradictions = fact.contradictions.saturating_add(1);
    }
    fact.confidence = laplace_confidence(fact.corroborations, fact.contradictions);
    fact.reliability = fact.reliability.max(reliability);
    fact.source = append_source(fact.source.take(), evidence.source());
    if fact.tier == Tier::Cold {
        fact.tier = Tier::Warm;
    }

    store_fact_evidence(conn, &fact)?;
    insert_reinforcement(
        conn,
        &ReinforcementEntry {
            entity_type: "fact",
            entity_id: fact.id,
            outcome: Outcome::from(evidence.is_success()),
            duration_ms: None,
            source: Some(evidence.source()),
            confidence_before: before,
            confidence_after: fact.confidence,
        },
    )?;
    Ok(fact)
}

/// Provenance list joined with "; ", without repeats.
pub(crate) fn append_source(existing: Option<String>, source: &str) -> Option<String> {
    let source = source.trim();
    match existing {
        _ if source.is_empty() => existing,
        None => Some(source.to_string()),
        Some(list) if list.split("; ").any(|s| s == source) => Some(list),
        Some(list) => Some(format!("{list}; {source}")),
    }
}

/// Transactional front door for confidence updates.
pub struct ReinforcementEngine {
    db: Arc<Database>,
}

impl ReinforcementEngine {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record one skill outcome atomically.
    pub fn reinforce(
        &self,
        skill_id: i64,
        outcome: Outcome,
        duration_ms: Option<u64>,
    ) -> Result<SkillMemory> {
        let skill = self
            .db
            .transaction(|tx| apply_skill_outcome(tx, skill_id, outcome, duration_ms, None))?;
        info!(
            skill_id,
            skill = %skill.skill_name,
            outcome = outcome.as_str(),
            confidence = skill.confidence,
            "reinforced skill"
        );
        Ok(skill)
    }

    /// Record corroboration or contradiction of a fact atomically.
    pub fn reinforce_fact(&self, fact_id: i64, evidence: &Evidence) -> Result<SemanticFact> {
        let fact = self
            .db
            .transaction(|tx| apply_fact_evidence(tx, fact_id, evidence))?;
        info!(
            fact_id,
            topic = %fact.topic,
            corroborated = evidence.is_success(),
            confidence = fact.confidence,
            "reinforced fact"
        );
        Ok(fact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewFact, NewSkill};

    fn engine_with_skill() -> (ReinforcementEngine, Arc<Database>, i64) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let id = db
            .insert_skill(&NewSkill::new("deploy", vec!["make deploy".into()]))
            .unwrap();
        (ReinforcementEngine::new(db.clone()), db, id)
    }

    #[test]
    fn test_laplace_values() {
        assert_eq!(laplace_confidence(0, 0), 0.5);
        assert_eq!(laplace_confidence(1, 0), 2.0 / 3.0);
        assert_eq!(laplace_confidence(2, 1), 0.6);
        assert!(laplace_confidence(1000, 0) < 1.0);
        assert!(laplace_confidence(0, 1000) > 0.0);
    }

    #[test]
    fn test_order_independence() {
        let (engine, _db, a) = engine_with_skill();
        let (engine_b, _db_b, b) = engine_with_skill();

        for outcome in [Outcome::Success, Outcome::Failure, Outcome::Success, Outcome::Success] {
            engine.reinforce(a, outcome, None).unwrap();
        }
        for outcome in [Outcome::Failure, Outcome::Success, Outcome::Success, Outcome::Success] {
            engine_b.reinforce(b, outcome, None).unwrap();
        }
        let first = engine.reinforce(a, Outcome::Success, None).unwrap();
        let second = engine_b.reinforce(b, Outcome::Success, None).unwrap();
        assert_eq!(first.confidence, second.confidence);
        assert_eq!(first.confidence, laplace_confidence(4, 1));
    }

    #[test]
    fn test_counts_duration_and_log() {
        let (engine, db, id) = engine_with_skill();
        engine.reinforce(id, Outcome::Success, Some(100)).unwrap();
        let skill = engine.reinforce(id, Outcome::Failure, Some(300)).unwrap();

        assert_eq!((skill.success_count, skill.failure_count), (1, 1));
        assert_eq!(skill.avg_duration_ms, Some(200));
        assert!(skill.last_used_at.is_some());
        assert_eq!(db.get_skill(id).unwrap().unwrap(), skill);
        assert_eq!(db.reinforcement_count("skill", id).unwrap(), 2);
    }

    #[test]
    fn test_unknown_skill() {
        let (engine, db, _) = engine_with_skill();
        assert!(engine.reinforce(999, Outcome::Success, None).unwrap_err().is_not_found());
        assert_eq!(db.reinforcement_count("skill", 999).unwrap(), 0);
    }

    #[test]
    fn test_fact_corroboration() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let engine = ReinforcementEngine::new(db.clone());
        let id = db
            .insert_fact(
                &NewFact::new("python", "uses indentation")
                    .with_source("docs.python.org", "documentation")
                    .with_reliability(0.6),
            )
            .unwrap();

        let fact = engine
            .reinforce_fact(
                id,
                &Evidence::Corroboration {
                    source: "stackoverflow".into(),
                    reliability: 0.9,
                },
            )
            .unwrap();
        assert_eq!(fact.confidence, 2.0 / 3.0);
        assert_eq!(fact.reliability, 0.9);
        assert_eq!(fact.source.as_deref(), Some("docs.python.org; stackoverflow"));

        let fact = engine
            .reinforce_fact(
                id,
                &Evidence::Contradiction {
                    source: "forum".into(),
                    reliability: 0.2,
                },
            )
            .unwrap();
        assert_eq!(fact.confidence, 0.5);
        assert_eq!(fact.reliability, 0.9);
        assert_eq!((fact.corroborations, fact.contradictions), (1, 1));

        let bad = Evidence::Corroboration {
            source: "x".into(),
            reliability: 3.0,
        };
        assert!(engine.reinforce_fact(id, &bad).unwrap_err().is_validation());
    }

    #[test]
    fn test_reinforcement_brings_idle_rows_back_from_cold() {
        let (engine, db, id) = engine_with_skill();
        db.set_skill_tier(id, Tier::Cold, None).unwrap();
        let skill = engine.reinforce(id, Outcome::Success, None).unwrap();
        assert_eq!(skill.tier, Tier::Warm);
        assert_eq!(db.get_skill(id).unwrap().unwrap().tier, Tier::Warm);

        let fact_id = db.insert_fact(&NewFact::new("git", "rebase rewrites history")).unwrap();
        db.set_fact_tier(fact_id, Tier::Cold, None).unwrap();
        let evidence = Evidence::Corroboration {
            source: "book".into(),
            reliability: 0.7,
        };
        assert_eq!(engine.reinforce_fact(fact_id, &evidence).unwrap().tier, Tier::Warm);
        assert_eq!(db.get_fact(fact_id).unwrap().unwrap().tier, Tier::Warm);
    }

    #[test]
    fn test_archived_skill_stays_cold_when_reinforced() {
        let (engine, db, id) = engine_with_skill();
        db.archive_skill("deploy").unwrap();
        let skill = engine.reinforce(id, Outcome::Failure, None).unwrap();
        assert_eq!(skill.tier, Tier::Cold);
        assert!(db.list_skills(None).unwrap().is_empty());
    }

    #[test]
    fn test_append_source_dedups() {
        assert_eq!(append_source(None, "a").as_deref(), Some("a"));
        assert_eq!(append_source(Some("a".into()), "a").as_deref(), Some("a"));
        assert_eq!(append_source(Some("a".into()), "b").as_deref(), Some("a; b"));
        assert_eq!(append_source(Some("a".into()), " ").as_deref(), Some("a"));
    }
}
