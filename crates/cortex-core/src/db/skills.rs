//! Skill rows. Counters and confidence change only through the
//! reinforcement engine; skills are archived, never deleted.

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::{count_column, json_column, opt_u64_column, parse_column, Database};
use crate::error::{Error, Result};
use crate::types::{NewSkill, SkillMemory, Tier};
use crate::utils::{from_millis, now_millis, opt_from_millis, steps_hash};

const SKILL_COLUMNS: &str = "id, skill_name, description, steps, prerequisites, confidence,
     success_count, failure_count, avg_duration_ms, created_at, last_used_at, archived_at, tier";

pub(crate) fn map_skill(row: &Row<'_>) -> rusqlite::Result<SkillMemory> {
    Ok(SkillMemory {
        id: row.get(0)?,
        skill_name: row.get(1)?,
        description: row.get(2)?,
        steps: json_column(row, 3)?,
        prerequisites: json_column(row, 4)?,
        confidence: row.get(5)?,
        success_count: count_column(row, 6)?,
        failure_count: count_column(row, 7)?,
        avg_duration_ms: opt_u64_column(row, 8)?,
        created_at: from_millis(row.get(9)?),
        last_used_at: opt_from_millis(row.get(10)?),
        archived_at: opt_from_millis(row.get(11)?),
        tier: parse_column(row, 12)?,
    })
}

pub(crate) fn load_skill(conn: &Connection, id: i64) -> Result<SkillMemory> {
    conn.query_row(
        &format!("SELECT {SKILL_COLUMNS} FROM skills WHERE id = ?1"),
        [id],
        map_skill,
    )
    .optional()?
    .ok_or_else(|| Error::not_found("skill", id))
}

pub(crate) fn find_skill_by_name(conn: &Connection, name: &str) -> Result<Option<SkillMemory>> {
    Ok(conn
        .query_row(
            &format!("SELECT {SKILL_COLUMNS} FROM skills WHERE skill_name = ?1"),
            [name],
            map_skill,
        )
        .optional()?)
}

pub(crate) fn find_skill_by_steps(conn: &Connection, steps: &[String]) -> Result<Option<SkillMemory>> {
    Ok(conn
        .query_row(
            &format!("SELECT {SKILL_COLUMNS} FROM skills WHERE steps_hash = ?1 ORDER BY id LIMIT 1"),
            [steps_hash(steps)],
            map_skill,
        )
        .optional()?)
}

/// Insert inside the caller's transaction. Duplicate names are rejected.
pub(crate) fn insert_skill_in(conn: &Connection, skill: &NewSkill) -> Result<i64> {
    skill.validate()?;
    let name = skill.skill_name.trim();
    if find_skill_by_name(conn, name)?.is_some() {
        return Err(Error::validation(format!("skill '{name}' already exists")));
    }
    conn.execute(
        "INSERT INTO skills
            (skill_name, description, steps, steps_hash, prerequisites, confidence, created_at, tier)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'warm')",
        params![
            name,
            skill.description,
            serde_json::to_string(&skill.steps)?,
            steps_hash(&skill.steps),
            serde_json::to_string(&skill.prerequisites)?,
            skill.confidence,
            now_millis(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Persist counters, confidence, usage and tier after a reinforcement.
pub(crate) fn store_skill_outcome(conn: &Connection, skill: &SkillMemory) -> Result<()> {
    let used_at = skill.last_used_at.map(|t| t.timestamp_millis());
    conn.execute(
        "UPDATE skills
         SET success_count = ?2, failure_count = ?3, confidence = ?4, avg_duration_ms = ?5,
             last_used_at = ?6, last_accessed_at = ?6, tier = ?7
         WHERE id = ?1",
        params![
            skill.id,
            skill.success_count,
            skill.failure_count,
            skill.confidence,
            skill.avg_duration_ms.map(|d| d as i64),
            used_at,
            skill.tier.as_str(),
        ],
    )?;
    Ok(())
}

/// Demote WARM skills untouched since `cutoff`.
pub(crate) fn demote_stale_skills(conn: &Connection, cutoff: i64) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE skills SET tier = 'cold'
         WHERE tier = 'warm'
           AND MAX(created_at, COALESCE(last_used_at, 0), COALESCE(last_accessed_at, 0)) < ?1",
        [cutoff],
    )?)
}

impl Database {
    /// Insert a validated skill. Returns the new id.
    pub fn insert_skill(&self, skill: &NewSkill) -> Result<i64> {
        let id = self.transaction(|tx| insert_skill_in(tx, skill))?;
        debug!(skill_id = id, skill = %skill.skill_name, "stored skill");
        Ok(id)
    }

    pub fn get_skill(&self, id: i64) -> Result<Option<SkillMemory>> {
        match self.with_conn(|conn| load_skill(conn, id)) {
            Ok(skill) => Ok(Some(skill)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn get_skill_by_name(&self, name: &str) -> Result<Option<SkillMemory>> {
        self.with_conn(|conn| find_skill_by_name(conn, name))
    }

    pub fn get_skill_by_steps(&self, steps: &[String]) -> Result<Option<SkillMemory>> {
        self.with_conn(|conn| find_skill_by_steps(conn, steps))
    }

    /// Active (non-archived) skills, most confident first.
    pub fn list_skills(&self, min_confidence: Option<f64>) -> Result<Vec<SkillMemory>> {
        let floor = min_confidence.unwrap_or(0.0);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SKILL_COLUMNS} FROM skills
                 WHERE archived_at IS NULL AND confidence >= ?1
                 ORDER BY confidence DESC, skill_name"
            ))?;
            let skills = stmt
                .query_map([floor], map_skill)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(skills)
        })
    }

    /// Record a read: mark the skill HOT.
    pub fn touch_skill(&self, id: i64) -> Result<()> {
        let now = now_millis();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE skills SET last_accessed_at = ?2,
                     tier = CASE WHEN archived_at IS NULL THEN 'hot' ELSE tier END
                 WHERE id = ?1",
                params![id, now],
            )?;
            Ok(())
        })
    }

    pub fn set_skill_tier(&self, id: i64, tier: Tier, only_if: Option<Tier>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE skills SET tier = ?2 WHERE id = ?1 AND (?3 IS NULL OR tier = ?3)",
                params![id, tier.as_str(), only_if.map(|t| t.as_str())],
            )?;
            Ok(changed > 0)
        })
    }

    /// Archive by name: tier COLD and `archived_at` set. Idempotent.
    pub fn archive_skill(&self, name: &str) -> Result<SkillMemory> {
        let now = now_millis();
        let skill = self.transaction(|tx| {
            let skill = find_skill_by_name(tx, name)?
                .ok_or_else(|| Error::not_found("skill", name))?;
            tx.execute(
                "UPDATE skills SET tier = 'cold', archived_at = COALESCE(archived_at, ?2) WHERE id = ?1",
                params![skill.id, now],
            )?;
            load_skill(tx, skill.id)
        })?;
        info!(skill = %name, "archived skill");
        Ok(skill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_insert_and_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let new = NewSkill::new("release", steps(&["cargo test", "cargo publish"]))
            .with_description("publish a crate")
            .with_prerequisites(vec!["cargo login".into()]);
        let id = db.insert_skill(&new).unwrap();

        let skill = db.get_skill_by_name("release").unwrap().unwrap();
        assert_eq!(skill.id, id);
        assert_eq!(skill.steps, new.steps);
        assert_eq!(skill.prerequisites, vec!["cargo login".to_string()]);
        assert_eq!(skill.confidence, 0.5);
        assert_eq!((skill.success_count, skill.failure_count), (0, 0));
        assert_eq!(db.get_skill_by_steps(&new.steps).unwrap().unwrap().id, id);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.insert_skill(&NewSkill::new("build", steps(&["make"]))).unwrap();
        let err = db
            .insert_skill(&NewSkill::new("build", steps(&["ninja"])))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_counters_cannot_decrease() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_skill(&NewSkill::new("build", steps(&["make"]))).unwrap();
        db.with_conn(|c| Ok(c.execute("UPDATE skills SET success_count = 2 WHERE id = ?1", [id])?))
            .unwrap();
        let result =
            db.with_conn(|c| Ok(c.execute("UPDATE skills SET success_count = 1 WHERE id = ?1", [id])?));
        assert!(result.is_err());
    }

    #[test]
    fn test_archive_excludes_from_listing() {
        let db = Database::open_in_memory().unwrap();
        db.insert_skill(&NewSkill::new("old", steps(&["a"]))).unwrap();
        db.insert_skill(&NewSkill::new("new", steps(&["b"])).with_confidence(0.8))
            .unwrap();

        let archived = db.archive_skill("old").unwrap();
        assert_eq!(archived.tier, Tier::Cold);
        assert!(archived.archived_at.is_some());

        let names: Vec<String> = db
            .list_skills(None)
            .unwrap()
            .into_iter()
            .map(|s| s.skill_name)
            .collect();
        assert_eq!(names, vec!["new".to_string()]);
        assert!(db.list_skills(Some(0.9)).unwrap().is_empty());

        // Still stored, and deletes are refused
        assert!(db.get_skill_by_name("old").unwrap().is_some());
        assert!(db.with_conn(|c| Ok(c.execute("DELETE FROM skills", [])?)).is_err());
        assert!(db.archive_skill("missing").unwrap_err().is_not_found());
    }
}
