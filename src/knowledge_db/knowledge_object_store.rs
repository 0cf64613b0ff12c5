// src/knowledge_db/knowledge_object_store.rs

use std::collections::HashMap;
use std::sync::Arc;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};

use crate::knowledge_db::schema::{KnowledgeObject, KnowledgeObjectType};

#[derive(Clone)]
pub struct KnowledgeObjectStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

/// Idempotency keying for the at-most-once-per-exchange guarantee: a
/// `(tenant_id, request_id, role)` unique index backs `insert_idempotent`,
/// using `INSERT OR IGNORE` so a replayed write is silently absorbed
/// instead of clobbering the original turn.
impl KnowledgeObjectStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("pool error: {}", e))
    }

    pub fn create(
        &self,
        tenant_id: &str,
        object_type: KnowledgeObjectType,
        session_id: Option<&str>,
        user_id: Option<&str>,
        parent_id: Option<&str>,
        tags: Vec<String>,
        metadata: HashMap<String, String>,
        original_tokens: i64,
    ) -> anyhow::Result<KnowledgeObject> {
        let object = KnowledgeObject {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            object_type,
            session_id: session_id.map(String::from),
            user_id: user_id.map(String::from),
            parent_id: parent_id.map(String::from),
            tags,
            metadata,
            archived: false,
            created_at: Utc::now(),
            original_tokens,
        };
        self.insert(&object, None, None)?;
        Ok(object)
    }

    /// Insert with idempotency: if `request_id`/`role` collide with an
    /// existing row for this tenant, the existing object is returned instead
    /// of erroring — replays must not duplicate turns.
    pub fn create_idempotent(
        &self,
        tenant_id: &str,
        object_type: KnowledgeObjectType,
        session_id: Option<&str>,
        user_id: Option<&str>,
        parent_id: Option<&str>,
        tags: Vec<String>,
        metadata: HashMap<String, String>,
        original_tokens: i64,
        request_id: &str,
        role: &str,
    ) -> anyhow::Result<KnowledgeObject> {
        if let Some(existing) = self.find_by_request_role(tenant_id, request_id, role)? {
            return Ok(existing);
        }
        let object = KnowledgeObject {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            object_type,
            session_id: session_id.map(String::from),
            user_id: user_id.map(String::from),
            parent_id: parent_id.map(String::from),
            tags,
            metadata,
            archived: false,
            created_at: Utc::now(),
            original_tokens,
        };
        let inserted = self.insert(&object, Some(request_id), Some(role))?;
        if inserted {
            Ok(object)
        } else {
            self.find_by_request_role(tenant_id, request_id, role)?
                .ok_or_else(|| anyhow::anyhow!("idempotent insert raced and lost the row"))
        }
    }

    fn insert(
        &self,
        object: &KnowledgeObject,
        request_id: Option<&str>,
        role: Option<&str>,
    ) -> anyhow::Result<bool> {
        let tags_json = serde_json::to_string(&object.tags)?;
        let metadata_json = serde_json::to_string(&object.metadata)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO knowledge_objects
             (id, tenant_id, type, session_id, user_id, parent_id, tags, metadata,
              archived, created_at, original_tokens, request_id, role)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                object.id,
                object.tenant_id,
                object.object_type.as_str(),
                object.session_id,
                object.user_id,
                object.parent_id,
                tags_json,
                metadata_json,
                object.archived,
                object.created_at.to_rfc3339(),
                object.original_tokens,
                request_id,
                role,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Exposed so callers can tell an idempotent insert apart from a replay
    /// *before* doing the insert — replays must not duplicate turns, facts,
    /// or usage rows, so the memory pipeline uses this to skip re-running
    /// fact extraction and dialogue-state updates on a replay.
    pub fn find_by_request_role(
        &self,
        tenant_id: &str,
        request_id: &str,
        role: &str,
    ) -> anyhow::Result<Option<KnowledgeObject>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, type, session_id, user_id, parent_id, tags, metadata,
                    archived, created_at, original_tokens
             FROM knowledge_objects WHERE tenant_id = ?1 AND request_id = ?2 AND role = ?3",
        )?;
        let mut rows = stmt.query(params![tenant_id, request_id, role])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_object(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn get(&self, tenant_id: &str, id: &str) -> anyhow::Result<Option<KnowledgeObject>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, type, session_id, user_id, parent_id, tags, metadata,
                    archived, created_at, original_tokens
             FROM knowledge_objects WHERE tenant_id = ?1 AND id = ?2",
        )?;
        let mut rows = stmt.query(params![tenant_id, id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_object(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list(
        &self,
        tenant_id: &str,
        object_type: Option<KnowledgeObjectType>,
        session_id: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<KnowledgeObject>> {
        let conn = self.conn()?;
        let mut sql = String::from(
            "SELECT id, tenant_id, type, session_id, user_id, parent_id, tags, metadata,
                    archived, created_at, original_tokens
             FROM knowledge_objects WHERE tenant_id = ?1",
        );
        if object_type.is_some() {
            sql.push_str(" AND type = ?2");
        }
        if session_id.is_some() {
            sql.push_str(if object_type.is_some() { " AND session_id = ?3" } else { " AND session_id = ?2" });
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");
        sql = sql.replacen("LIMIT ?", &format!("LIMIT {}", limit), 1);

        let mut stmt = conn.prepare(&sql)?;
        let type_str = object_type.map(|t| t.as_str());
        let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&tenant_id];
        if let Some(ref ts) = type_str {
            params_vec.push(ts);
        }
        if let Some(ref sid) = session_id {
            params_vec.push(sid);
        }
        let mut rows = stmt.query(rusqlite::params_from_iter(params_vec))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_object(row)?);
        }
        Ok(out)
    }

    pub fn archive(&self, tenant_id: &str, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE knowledge_objects SET archived = TRUE WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, id],
        )?;
        Ok(changed > 0)
    }

    pub fn update_tags(&self, tenant_id: &str, id: &str, tags: Vec<String>) -> anyhow::Result<bool> {
        let tags_json = serde_json::to_string(&tags)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE knowledge_objects SET tags = ?1 WHERE tenant_id = ?2 AND id = ?3",
            params![tags_json, tenant_id, id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete(&self, tenant_id: &str, id: &str) -> anyhow::Result<bool> {
        // The core never destroys data; archival is the only removal.
        // DELETE on this route is treated by the API layer as archive, kept
        // here only for the tenant-admin escape hatch over truly orphaned
        // rows.
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM knowledge_objects WHERE tenant_id = ?1 AND id = ?2 AND archived = TRUE",
            params![tenant_id, id],
        )?;
        Ok(changed > 0)
    }

    /// Children of `parent_id`, used by relationship traversal so archived
    /// parents are still reachable.
    pub fn children(&self, tenant_id: &str, parent_id: &str) -> anyhow::Result<Vec<KnowledgeObject>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, type, session_id, user_id, parent_id, tags, metadata,
                    archived, created_at, original_tokens
             FROM knowledge_objects WHERE tenant_id = ?1 AND parent_id = ?2",
        )?;
        let mut rows = stmt.query(params![tenant_id, parent_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_object(row)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge_db::KnowledgeDatabase;

    #[test]
    fn create_idempotent_returns_same_object_on_replay() {
        let db = KnowledgeDatabase::new_in_memory(8).unwrap();
        let tenant = db.tenants.create("acme", crate::knowledge_db::schema::Plan::Free).unwrap();
        let first = db
            .objects
            .create_idempotent(
                &tenant.tenant_id,
                KnowledgeObjectType::Turn,
                Some("s1"),
                Some("u1"),
                None,
                Vec::new(),
                Default::default(),
                5,
                "req-1",
                "user",
            )
            .unwrap();
        let second = db
            .objects
            .create_idempotent(
                &tenant.tenant_id,
                KnowledgeObjectType::Turn,
                Some("s1"),
                Some("u1"),
                None,
                Vec::new(),
                Default::default(),
                5,
                "req-1",
                "user",
            )
            .unwrap();
        assert_eq!(first.id, second.id);
        let all = db.objects.list(&tenant.tenant_id, Some(KnowledgeObjectType::Turn), None, 10).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn archive_hides_object_but_get_still_resolves_it() {
        let db = KnowledgeDatabase::new_in_memory(8).unwrap();
        let tenant = db.tenants.create("acme", crate::knowledge_db::schema::Plan::Free).unwrap();
        let object = db
            .objects
            .create(&tenant.tenant_id, KnowledgeObjectType::ExtractedFact, None, None, None, Vec::new(), Default::default(), 3)
            .unwrap();
        assert!(db.objects.archive(&tenant.tenant_id, &object.id).unwrap());
        let fetched = db.objects.get(&tenant.tenant_id, &object.id).unwrap().unwrap();
        assert!(fetched.archived);
    }

    #[test]
    fn objects_are_scoped_to_their_tenant() {
        let db = KnowledgeDatabase::new_in_memory(8).unwrap();
        let t1 = db.tenants.create("acme", crate::knowledge_db::schema::Plan::Free).unwrap();
        let t2 = db.tenants.create("globex", crate::knowledge_db::schema::Plan::Free).unwrap();
        let object = db
            .objects
            .create(&t1.tenant_id, KnowledgeObjectType::ExtractedFact, None, None, None, Vec::new(), Default::default(), 3)
            .unwrap();
        assert!(db.objects.get(&t2.tenant_id, &object.id).unwrap().is_none());
        assert!(db.objects.get(&t1.tenant_id, &object.id).unwrap().is_some());
    }
}

fn row_to_object(row: &Row) -> rusqlite::Result<KnowledgeObject> {
    let type_str: String = row.get(2)?;
    let tags_json: String = row.get(6)?;
    let metadata_json: String = row.get(7)?;
    let created_at: String = row.get(9)?;
    Ok(KnowledgeObject {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        object_type: KnowledgeObjectType::parse(&type_str).unwrap_or(KnowledgeObjectType::Turn),
        session_id: row.get(3)?,
        user_id: row.get(4)?,
        parent_id: row.get(5)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        archived: row.get(8)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        original_tokens: row.get(10)?,
    })
}
