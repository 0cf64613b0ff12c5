// src/knowledge_db/tenant_store.rs

use std::sync::Arc;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::knowledge_db::schema::{Plan, Tenant};

#[derive(Clone)]
pub struct TenantStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl TenantStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("pool error: {}", e))
    }

    pub fn create(&self, name: &str, plan: Plan) -> anyhow::Result<Tenant> {
        let tenant = Tenant {
            tenant_id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            plan,
            active: true,
            created_at: Utc::now(),
        };
        self.conn()?.execute(
            "INSERT INTO tenants (tenant_id, name, plan, active, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tenant.tenant_id,
                tenant.name,
                tenant.plan.as_str(),
                tenant.active,
                tenant.created_at.to_rfc3339()
            ],
        )?;
        Ok(tenant)
    }

    pub fn get(&self, tenant_id: &str) -> anyhow::Result<Option<Tenant>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT tenant_id, name, plan, active, created_at FROM tenants WHERE tenant_id = ?1",
        )?;
        let mut rows = stmt.query(params![tenant_id])?;
        if let Some(row) = rows.next()? {
            let created_at: String = row.get(4)?;
            Ok(Some(Tenant {
                tenant_id: row.get(0)?,
                name: row.get(1)?,
                plan: Plan::parse(&row.get::<_, String>(2)?),
                active: row.get(3)?,
                created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            }))
        } else {
            Ok(None)
        }
    }

    pub fn is_active(&self, tenant_id: &str) -> anyhow::Result<bool> {
        Ok(self.get(tenant_id)?.map(|t| t.active).unwrap_or(false))
    }

    pub fn set_active(&self, tenant_id: &str, active: bool) -> anyhow::Result<bool> {
        let changed = self.conn()?.execute(
            "UPDATE tenants SET active = ?1 WHERE tenant_id = ?2",
            params![active, tenant_id],
        )?;
        Ok(changed > 0)
    }
}
