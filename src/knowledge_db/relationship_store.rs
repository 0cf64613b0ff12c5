// src/knowledge_db/relationship_store.rs
//! Edges discovered offline by the relationship-discovery job, persisted so
//! the context builder and knowledge API can surface them without
//! recomputation.

use std::sync::Arc;

use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::knowledge_db::schema::{KnowledgeRelationship, RelationshipType};

#[derive(Clone)]
pub struct RelationshipStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl RelationshipStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("pool error: {}", e))
    }

    /// Upsert keyed on `(source_id, target_id, relationship_type)`: rerunning
    /// discovery over the same pair refreshes confidence/evidence rather than
    /// duplicating the edge — discovery is idempotent per pair.
    pub fn upsert(
        &self,
        source_id: &str,
        target_id: &str,
        relationship_type: RelationshipType,
        confidence: f32,
        evidence: &str,
        detected_by: &str,
    ) -> anyhow::Result<KnowledgeRelationship> {
        let existing_id: Option<String> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT id FROM knowledge_relationships
                 WHERE source_id = ?1 AND target_id = ?2 AND type = ?3",
                params![source_id, target_id, relationship_type.as_str()],
                |row| row.get(0),
            )
            .ok()
        };
        let id = existing_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Utc::now();
        self.conn()?.execute(
            "INSERT INTO knowledge_relationships
                (id, source_id, target_id, type, confidence, evidence, detected_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(source_id, target_id, type) DO UPDATE SET
                confidence = excluded.confidence,
                evidence = excluded.evidence,
                detected_by = excluded.detected_by,
                created_at = excluded.created_at",
            params![
                id,
                source_id,
                target_id,
                relationship_type.as_str(),
                confidence,
                evidence,
                detected_by,
                now.to_rfc3339(),
            ],
        )?;
        Ok(KnowledgeRelationship {
            id,
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            relationship_type,
            confidence,
            evidence: evidence.to_string(),
            detected_by: detected_by.to_string(),
            created_at: now,
        })
    }

    /// Edges touching `knowledge_object_id` in either direction, used by the
    /// context builder and the knowledge API's relationship listing.
    pub fn for_object(&self, knowledge_object_id: &str) -> anyhow::Result<Vec<KnowledgeRelationship>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, source_id, target_id, type, confidence, evidence, detected_by, created_at
             FROM knowledge_relationships WHERE source_id = ?1 OR target_id = ?1
             ORDER BY created_at DESC",
        )?;
        let mut rows = stmt.query(params![knowledge_object_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_relationship(row)?);
        }
        Ok(out)
    }

    pub fn by_type(
        &self,
        relationship_type: RelationshipType,
        limit: usize,
    ) -> anyhow::Result<Vec<KnowledgeRelationship>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, source_id, target_id, type, confidence, evidence, detected_by, created_at
             FROM knowledge_relationships WHERE type = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![relationship_type.as_str(), limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_relationship(row)?);
        }
        Ok(out)
    }

    pub fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let changed = self
            .conn()?
            .execute("DELETE FROM knowledge_relationships WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge_db::KnowledgeDatabase;

    #[test]
    fn rerunning_upsert_on_the_same_pair_updates_confidence_not_rows() {
        let db = KnowledgeDatabase::new_in_memory(8).unwrap();
        let first = db
            .relationships
            .upsert("a", "b", RelationshipType::Supports, 0.80, "cosine 0.80", "relationship_discovery")
            .unwrap();
        let second = db
            .relationships
            .upsert("a", "b", RelationshipType::Supports, 0.91, "cosine 0.91", "relationship_discovery")
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.confidence, 0.91);

        let edges = db.relationships.for_object("a").unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].confidence, 0.91);
    }

    #[test]
    fn distinct_relationship_types_between_the_same_pair_coexist() {
        let db = KnowledgeDatabase::new_in_memory(8).unwrap();
        db.relationships.upsert("a", "b", RelationshipType::Supports, 0.85, "ev", "job").unwrap();
        db.relationships.upsert("a", "b", RelationshipType::Contradicts, 0.75, "ev", "job").unwrap();
        let edges = db.relationships.for_object("a").unwrap();
        assert_eq!(edges.len(), 2);
    }
}

fn row_to_relationship(row: &rusqlite::Row) -> rusqlite::Result<KnowledgeRelationship> {
    let type_str: String = row.get(3)?;
    let created_at: String = row.get(7)?;
    Ok(KnowledgeRelationship {
        id: row.get(0)?,
        source_id: row.get(1)?,
        target_id: row.get(2)?,
        relationship_type: RelationshipType::parse(&type_str).unwrap_or(RelationshipType::References),
        confidence: row.get(4)?,
        evidence: row.get(5)?,
        detected_by: row.get(6)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
