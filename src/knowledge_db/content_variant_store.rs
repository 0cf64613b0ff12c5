// src/knowledge_db/content_variant_store.rs

use std::sync::Arc;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};

use crate::knowledge_db::schema::{ContentVariant, VariantType};

#[derive(Clone)]
pub struct ContentVariantStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl ContentVariantStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("pool error: {}", e))
    }

    /// Inline content (`SHORT`/`BULLET_FACTS`, or small `RAW`).
    pub fn create_inline(
        &self,
        knowledge_object_id: &str,
        variant: VariantType,
        content: &str,
        tokens: i64,
    ) -> anyhow::Result<ContentVariant> {
        let cv = ContentVariant {
            id: uuid::Uuid::new_v4().to_string(),
            knowledge_object_id: knowledge_object_id.to_string(),
            variant,
            content: Some(content.to_string()),
            tokens,
            embedding_id: None,
            storage_uri: None,
            created_at: Utc::now(),
        };
        self.insert(&cv)?;
        Ok(cv)
    }

    /// Blob-backed content (large `RAW`).
    pub fn create_blob_backed(
        &self,
        knowledge_object_id: &str,
        variant: VariantType,
        storage_uri: &str,
        tokens: i64,
    ) -> anyhow::Result<ContentVariant> {
        let cv = ContentVariant {
            id: uuid::Uuid::new_v4().to_string(),
            knowledge_object_id: knowledge_object_id.to_string(),
            variant,
            content: None,
            tokens,
            embedding_id: None,
            storage_uri: Some(storage_uri.to_string()),
            created_at: Utc::now(),
        };
        self.insert(&cv)?;
        Ok(cv)
    }

    fn insert(&self, cv: &ContentVariant) -> anyhow::Result<()> {
        if !cv.validate() {
            anyhow::bail!("ContentVariant must have exactly one of content/storage_uri");
        }
        self.conn()?.execute(
            "INSERT OR REPLACE INTO content_variants
             (id, knowledge_object_id, variant, content, tokens, embedding_id, storage_uri, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                cv.id,
                cv.knowledge_object_id,
                cv.variant.as_str(),
                cv.content,
                cv.tokens,
                cv.embedding_id,
                cv.storage_uri,
                cv.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn set_embedding_id(&self, variant_id: &str, embedding_id: &str) -> anyhow::Result<()> {
        self.conn()?.execute(
            "UPDATE content_variants SET embedding_id = ?1 WHERE id = ?2",
            params![embedding_id, variant_id],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> anyhow::Result<Option<ContentVariant>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, knowledge_object_id, variant, content, tokens, embedding_id, storage_uri, created_at
             FROM content_variants WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_variant(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn get_by_object_and_type(
        &self,
        knowledge_object_id: &str,
        variant: VariantType,
    ) -> anyhow::Result<Option<ContentVariant>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, knowledge_object_id, variant, content, tokens, embedding_id, storage_uri, created_at
             FROM content_variants WHERE knowledge_object_id = ?1 AND variant = ?2",
        )?;
        let mut rows = stmt.query(params![knowledge_object_id, variant.as_str()])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_variant(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_for_object(&self, knowledge_object_id: &str) -> anyhow::Result<Vec<ContentVariant>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, knowledge_object_id, variant, content, tokens, embedding_id, storage_uri, created_at
             FROM content_variants WHERE knowledge_object_id = ?1",
        )?;
        let mut rows = stmt.query(params![knowledge_object_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_variant(row)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_variant_has_content_and_no_storage_uri() {
        let cv = ContentVariant {
            id: "v1".to_string(),
            knowledge_object_id: "o1".to_string(),
            variant: VariantType::Short,
            content: Some("hello".to_string()),
            tokens: 1,
            embedding_id: None,
            storage_uri: None,
            created_at: Utc::now(),
        };
        assert!(cv.validate());
    }

    #[test]
    fn blob_backed_variant_has_storage_uri_and_no_content() {
        let cv = ContentVariant {
            id: "v1".to_string(),
            knowledge_object_id: "o1".to_string(),
            variant: VariantType::Raw,
            content: None,
            tokens: 1,
            embedding_id: None,
            storage_uri: Some("blob://o1/raw".to_string()),
            created_at: Utc::now(),
        };
        assert!(cv.validate());
    }

    #[test]
    fn variant_with_neither_content_nor_storage_uri_is_invalid() {
        let cv = ContentVariant {
            id: "v1".to_string(),
            knowledge_object_id: "o1".to_string(),
            variant: VariantType::Raw,
            content: None,
            tokens: 1,
            embedding_id: None,
            storage_uri: None,
            created_at: Utc::now(),
        };
        assert!(!cv.validate());
    }

    #[test]
    fn variant_with_both_content_and_storage_uri_is_invalid() {
        let cv = ContentVariant {
            id: "v1".to_string(),
            knowledge_object_id: "o1".to_string(),
            variant: VariantType::Raw,
            content: Some("hello".to_string()),
            tokens: 1,
            embedding_id: None,
            storage_uri: Some("blob://o1/raw".to_string()),
            created_at: Utc::now(),
        };
        assert!(!cv.validate());
    }

    #[test]
    fn create_blob_backed_rejects_when_validate_would_fail() {
        use crate::knowledge_db::KnowledgeDatabase;
        let db = KnowledgeDatabase::new_in_memory(8).unwrap();
        let tenant = db.tenants.create("acme", crate::knowledge_db::schema::Plan::Free).unwrap();
        let object = db
            .objects
            .create(
                &tenant.tenant_id,
                crate::knowledge_db::schema::KnowledgeObjectType::Turn,
                None,
                None,
                None,
                Vec::new(),
                Default::default(),
                10,
            )
            .unwrap();
        let stored = db.variants.create_inline(&object.id, VariantType::Short, "hi", 1).unwrap();
        assert!(stored.content.is_some());
        assert!(stored.storage_uri.is_none());
    }
}

fn row_to_variant(row: &Row) -> rusqlite::Result<ContentVariant> {
    let variant_str: String = row.get(2)?;
    let created_at: String = row.get(7)?;
    Ok(ContentVariant {
        id: row.get(0)?,
        knowledge_object_id: row.get(1)?,
        variant: VariantType::parse(&variant_str).unwrap_or(VariantType::Short),
        content: row.get(3)?,
        tokens: row.get(4)?,
        embedding_id: row.get(5)?,
        storage_uri: row.get(6)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
