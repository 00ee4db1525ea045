//! Semantic fact rows.

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use tracing::debug;

use super::{count_column, parse_column, Database};
use crate::error::{Error, Result};
use crate::types::{NewFact, SemanticFact, Tier};
use crate::utils::{fact_hash, from_millis, now_millis};

const FACT_COLUMNS: &str = "id, topic, fact_text, confidence, source, source_type, reliability,
     corroborations, contradictions, access_count, created_at, last_confirmed_at, tier";

pub(crate) fn map_fact(row: &Row<'_>) -> rusqlite::Result<SemanticFact> {
    Ok(SemanticFact {
        id: row.get(0)?,
        topic: row.get(1)?,
        fact_text: row.get(2)?,
        confidence: row.get(3)?,
        source: row.get(4)?,
        source_type: row.get(5)?,
        reliability: row.get(6)?,
        corroborations: count_column(row, 7)?,
        contradictions: count_column(row, 8)?,
        access_count: count_column(row, 9)?,
        created_at: from_millis(row.get(10)?),
        last_confirmed_at: from_millis(row.get(11)?),
        tier: parse_column(row, 12)?,
    })
}

pub(crate) fn load_fact(conn: &Connection, id: i64) -> Result<SemanticFact> {
    conn.query_row(
        &format!("SELECT {FACT_COLUMNS} FROM semantic_facts WHERE id = ?1"),
        [id],
        map_fact,
    )
    .optional()?
    .ok_or_else(|| Error::not_found("fact", id))
}

/// Write the evidence-derived fields of a fact. Only the reinforcement
/// engine calls this.
pub(crate) fn store_fact_evidence(conn: &Connection, fact: &SemanticFact) -> Result<()> {
    conn.execute(
        "UPDATE semantic_facts
         SET confidence = ?2, reliability = ?3, corroborations = ?4, contradictions = ?5,
             source = ?6, last_confirmed_at = ?7, tier = ?8
         WHERE id = ?1",
        params![
            fact.id,
            fact.confidence,
            fact.reliability,
            fact.corroborations,
            fact.contradictions,
            fact.source,
            fact.last_confirmed_at.timestamp_millis(),
            fact.tier.as_str(),
        ],
    )?;
    Ok(())
}

/// Facts sharing (topic, normalized text) with at least one other fact,
/// grouped and ordered by id.
pub(crate) fn duplicate_groups(conn: &Connection) -> Result<Vec<Vec<SemanticFact>>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FACT_COLUMNS}, fact_hash FROM semantic_facts f
         WHERE EXISTS (
             SELECT 1 FROM semantic_facts g
             WHERE g.topic = f.topic AND g.fact_hash = f.fact_hash AND g.id != f.id
         )
         ORDER BY topic, fact_hash, id"
    ))?;
    let rows = stmt
        .query_map([], |row| Ok(((row.get::<_, String>(1)?, row.get::<_, String>(13)?), map_fact(row)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut groups: BTreeMap<(String, String), Vec<SemanticFact>> = BTreeMap::new();
    for (key, fact) in rows {
        groups.entry(key).or_default().push(fact);
    }
    Ok(groups.into_values().collect())
}

/// Replace the survivor's merged fields and drop the absorbed rows.
pub(crate) fn apply_merge(conn: &Connection, merged: &SemanticFact, absorbed: &[i64]) -> Result<()> {
    conn.execute(
        "UPDATE semantic_facts
         SET confidence = ?2, reliability = ?3, corroborations = ?4, contradictions = ?5,
             access_count = ?6, source = ?7, created_at = ?8, last_confirmed_at = ?9
         WHERE id = ?1",
        params![
            merged.id,
            merged.confidence,
            merged.reliability,
            merged.corroborations,
            merged.contradictions,
            merged.access_count,
            merged.source,
            merged.created_at.timestamp_millis(),
            merged.last_confirmed_at.timestamp_millis(),
        ],
    )?;
    let mut stmt = conn.prepare("DELETE FROM semantic_facts WHERE id = ?1")?;
    for id in absorbed {
        stmt.execute([id])?;
    }
    Ok(())
}

/// Demote WARM facts not read or confirmed since `cutoff`.
pub(crate) fn demote_stale_facts(conn: &Connection, cutoff: i64) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE semantic_facts SET tier = 'cold'
         WHERE tier = 'warm'
           AND MAX(last_confirmed_at, COALESCE(last_accessed_at, 0)) < ?1",
        [cutoff],
    )?)
}

impl Database {
    /// Insert a validated fact. Returns the new id.
    pub fn insert_fact(&self, fact: &NewFact) -> Result<i64> {
        fact.validate()?;
        let now = now_millis();
        let hash = fact_hash(&fact.fact_text);
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO semantic_facts
                    (topic, fact_text, fact_hash, confidence, source, source_type, reliability,
                     created_at, last_confirmed_at, tier)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 'warm')",
                params![
                    fact.topic.trim(),
                    fact.fact_text,
                    hash,
                    fact.confidence,
                    fact.source,
                    fact.source_type,
                    fact.reliability,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        debug!(fact_id = id, topic = %fact.topic, "stored fact");
        Ok(id)
    }

    pub fn get_fact(&self, id: i64) -> Result<Option<SemanticFact>> {
        match self.with_conn(|conn| load_fact(conn, id)) {
            Ok(fact) => Ok(Some(fact)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Top-K facts for a topic by confidence, ties to the most recently
    /// confirmed.
    pub fn top_facts(&self, topic: &str, k: usize) -> Result<Vec<SemanticFact>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FACT_COLUMNS} FROM semantic_facts
                 WHERE topic = ?1
                 ORDER BY confidence DESC, last_confirmed_at DESC, id DESC
                 LIMIT ?2"
            ))?;
            let facts = stmt
                .query_map(params![topic.trim(), k as i64], map_fact)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(facts)
        })
    }

    /// Record a read: bump access stats and mark the fact HOT.
    pub fn touch_fact(&self, id: i64) -> Result<()> {
        let now = now_millis();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE semantic_facts
                 SET access_count = access_count + 1, last_accessed_at = ?2, tier = 'hot'
                 WHERE id = ?1",
                params![id, now],
            )?;
            Ok(())
        })
    }

    pub fn set_fact_tier(&self, id: i64, tier: Tier, only_if: Option<Tier>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE semantic_facts SET tier = ?2 WHERE id = ?1 AND (?3 IS NULL OR tier = ?3)",
                params![id, tier.as_str(), only_if.map(|t| t.as_str())],
            )?;
            Ok(changed > 0)
        })
    }

    /// Facts at or above `min_confidence`, by topic then confidence.
    pub fn facts_above(&self, min_confidence: f64) -> Result<Vec<SemanticFact>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FACT_COLUMNS} FROM semantic_facts
                 WHERE confidence >= ?1
                 ORDER BY topic, confidence DESC, id"
            ))?;
            let facts = stmt
                .query_map([min_confidence], map_fact)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(facts)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_rejects_invalid() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .insert_fact(&NewFact::new("python", "x").with_confidence(1.5))
            .unwrap_err();
        assert!(err.is_validation());
        assert!(db.top_facts("python", 10).unwrap().is_empty());
    }

    #[test]
    fn test_top_facts_ordering() {
        let db = Database::open_in_memory().unwrap();
        let low = db.insert_fact(&NewFact::new("rust", "low").with_confidence(0.2)).unwrap();
        let high = db.insert_fact(&NewFact::new("rust", "high").with_confidence(0.9)).unwrap();
        let tie_old = db.insert_fact(&NewFact::new("rust", "tie old").with_confidence(0.6)).unwrap();
        let tie_new = db.insert_fact(&NewFact::new("rust", "tie new").with_confidence(0.6)).unwrap();
        db.insert_fact(&NewFact::new("go", "other topic").with_confidence(1.0)).unwrap();

        // Make the newer tie strictly more recently confirmed
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE semantic_facts SET last_confirmed_at = last_confirmed_at + 1000 WHERE id = ?1",
                [tie_new],
            )?;
            Ok(())
        })
        .unwrap();

        let ids: Vec<i64> = db.top_facts("rust", 10).unwrap().iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![high, tie_new, tie_old, low]);
        assert_eq!(db.top_facts("rust", 1).unwrap()[0].id, high);
    }

    #[test]
    fn test_duplicate_groups_use_normalized_text() {
        let db = Database::open_in_memory().unwrap();
        db.insert_fact(&NewFact::new("python", "Uses indentation")).unwrap();
        db.insert_fact(&NewFact::new("python", "uses   indentation ")).unwrap();
        db.insert_fact(&NewFact::new("python", "is dynamic")).unwrap();
        db.insert_fact(&NewFact::new("ruby", "uses indentation")).unwrap();

        let groups = db.with_conn(duplicate_groups).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
        assert!(groups[0].iter().all(|f| f.topic == "python"));
    }

    #[test]
    fn test_touch_marks_hot() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_fact(&NewFact::new("git", "rebase rewrites history")).unwrap();
        db.touch_fact(id).unwrap();
        let fact = db.get_fact(id).unwrap().unwrap();
        assert_eq!(fact.tier, Tier::Hot);
        assert_eq!(fact.access_count, 1);
        assert!(db.get_fact(9999).unwrap().is_none());
    }
}
