// src/knowledge_db/api_key_store.rs

use std::sync::Arc;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tracing::debug;

use crate::knowledge_db::schema::ApiKey;

#[derive(Clone)]
pub struct ApiKeyStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl ApiKeyStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("pool error: {}", e))
    }

    /// Issue a new key for a tenant. The caller is handed `plaintext` once;
    /// only `blake3::hash(plaintext)` is persisted — plaintext is never
    /// stored.
    pub fn create(&self, tenant_id: &str, name: &str, plaintext: &str) -> anyhow::Result<ApiKey> {
        let key = ApiKey {
            id: uuid::Uuid::new_v4().to_string(),
            key_hash: hash_key(plaintext),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            active: true,
            created_at: Utc::now(),
            last_used_at: None,
        };
        self.conn()?.execute(
            "INSERT INTO api_keys (id, key_hash, tenant_id, name, active, created_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
            params![
                key.id,
                key.key_hash,
                key.tenant_id,
                key.name,
                key.active,
                key.created_at.to_rfc3339()
            ],
        )?;
        Ok(key)
    }

    /// `lookup(hash(presented))`.
    pub fn find_by_hash(&self, key_hash: &str) -> anyhow::Result<Option<ApiKey>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, key_hash, tenant_id, name, active, created_at, last_used_at
             FROM api_keys WHERE key_hash = ?1",
        )?;
        let mut rows = stmt.query(params![key_hash])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_key(row)?))
        } else {
            Ok(None)
        }
    }

    /// Best-effort, fire-and-forget update — a missed write is tolerable.
    pub fn touch_last_used(&self, id: &str) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        match self.conn() {
            Ok(conn) => {
                let _ = conn.execute(
                    "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
                    params![now, id],
                );
                Ok(())
            }
            Err(e) => {
                debug!("touch_last_used skipped, pool unavailable: {}", e);
                Ok(())
            }
        }
    }
}

pub fn hash_key(plaintext: &str) -> String {
    blake3::hash(plaintext.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge_db::KnowledgeDatabase;

    #[test]
    fn hash_key_is_deterministic_and_never_stores_plaintext() {
        assert_eq!(hash_key("sk-test-123"), hash_key("sk-test-123"));
        assert_ne!(hash_key("sk-test-123"), "sk-test-123");
    }

    #[test]
    fn find_by_hash_resolves_the_presented_plaintext_key() {
        let db = KnowledgeDatabase::new_in_memory(4).unwrap();
        let tenant = db.tenants.create("acme", crate::knowledge_db::schema::Plan::Free).unwrap();
        let created = db.api_keys.create(&tenant.tenant_id, "default", "sk-abc").unwrap();
        let found = db.api_keys.find_by_hash(&hash_key("sk-abc")).unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert!(db.api_keys.find_by_hash(&hash_key("sk-wrong")).unwrap().is_none());
    }
}

fn row_to_key(row: &rusqlite::Row) -> rusqlite::Result<ApiKey> {
    let created_at: String = row.get(5)?;
    let last_used_at: Option<String> = row.get(6)?;
    Ok(ApiKey {
        id: row.get(0)?,
        key_hash: row.get(1)?,
        tenant_id: row.get(2)?,
        name: row.get(3)?,
        active: row.get(4)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        last_used_at: last_used_at.and_then(|s| {
            chrono::DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|d| d.with_timezone(&Utc))
        }),
    })
}
