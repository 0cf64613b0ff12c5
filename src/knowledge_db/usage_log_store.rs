// src/knowledge_db/usage_log_store.rs
//! Per-request usage accounting: one row per `request_id`, written once the
//! orchestrator reaches USAGE_LOGGED.

use std::sync::Arc;

use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::knowledge_db::schema::UsageLog;

#[derive(Clone)]
pub struct UsageLogStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl UsageLogStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("pool error: {}", e))
    }

    /// `request_id` carries a UNIQUE constraint; a replayed write is
    /// silently absorbed so retried requests never double-bill a tenant.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        tenant_id: &str,
        user_id: &str,
        session_id: &str,
        request_id: &str,
        model: &str,
        knowledge_tokens_used: i64,
        llm_input_tokens: i64,
        llm_output_tokens: i64,
        cost_estimate: f64,
    ) -> anyhow::Result<UsageLog> {
        let log = UsageLog {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            request_id: request_id.to_string(),
            model: model.to_string(),
            knowledge_tokens_used,
            llm_input_tokens,
            llm_output_tokens,
            cost_estimate,
            timestamp: Utc::now(),
        };
        self.conn()?.execute(
            "INSERT OR IGNORE INTO usage_log
                (id, tenant_id, user_id, session_id, request_id, model,
                 knowledge_tokens_used, llm_input_tokens, llm_output_tokens, cost_estimate, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                log.id,
                log.tenant_id,
                log.user_id,
                log.session_id,
                log.request_id,
                log.model,
                log.knowledge_tokens_used,
                log.llm_input_tokens,
                log.llm_output_tokens,
                log.cost_estimate,
                log.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(log)
    }

    pub fn totals_for_tenant(
        &self,
        tenant_id: &str,
        since: chrono::DateTime<Utc>,
    ) -> anyhow::Result<(i64, i64, f64)> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COALESCE(SUM(llm_input_tokens), 0), COALESCE(SUM(llm_output_tokens), 0),
                    COALESCE(SUM(cost_estimate), 0.0)
             FROM usage_log WHERE tenant_id = ?1 AND timestamp >= ?2",
            params![tenant_id, since.to_rfc3339()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(|e| anyhow::anyhow!("usage totals query failed: {}", e))
    }

    pub fn list_for_session(&self, tenant_id: &str, session_id: &str) -> anyhow::Result<Vec<UsageLog>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, user_id, session_id, request_id, model,
                    knowledge_tokens_used, llm_input_tokens, llm_output_tokens, cost_estimate, timestamp
             FROM usage_log WHERE tenant_id = ?1 AND session_id = ?2 ORDER BY timestamp DESC",
        )?;
        let mut rows = stmt.query(params![tenant_id, session_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_log(row)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge_db::KnowledgeDatabase;

    #[test]
    fn replayed_request_id_does_not_duplicate_the_usage_row() {
        let db = KnowledgeDatabase::new_in_memory(8).unwrap();
        let tenant = db.tenants.create("acme", crate::knowledge_db::schema::Plan::Free).unwrap();
        db.usage_log.record(&tenant.tenant_id, "u1", "s1", "req-1", "gpt-gateway", 10, 20, 30, 0.01).unwrap();
        db.usage_log.record(&tenant.tenant_id, "u1", "s1", "req-1", "gpt-gateway", 999, 999, 999, 99.0).unwrap();

        let rows = db.usage_log.list_for_session(&tenant.tenant_id, "s1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].llm_input_tokens, 20);
    }

    #[test]
    fn totals_for_tenant_sum_across_sessions() {
        let db = KnowledgeDatabase::new_in_memory(8).unwrap();
        let tenant = db.tenants.create("acme", crate::knowledge_db::schema::Plan::Free).unwrap();
        db.usage_log.record(&tenant.tenant_id, "u1", "s1", "req-1", "m", 0, 10, 5, 0.1).unwrap();
        db.usage_log.record(&tenant.tenant_id, "u1", "s2", "req-2", "m", 0, 20, 15, 0.2).unwrap();
        let (input, output, cost) = db
            .usage_log
            .totals_for_tenant(&tenant.tenant_id, chrono::Utc::now() - chrono::Duration::days(1))
            .unwrap();
        assert_eq!(input, 30);
        assert_eq!(output, 20);
        assert!((cost - 0.3).abs() < 1e-9);
    }
}

fn row_to_log(row: &rusqlite::Row) -> rusqlite::Result<UsageLog> {
    let timestamp: String = row.get(10)?;
    Ok(UsageLog {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        session_id: row.get(3)?,
        request_id: row.get(4)?,
        model: row.get(5)?,
        knowledge_tokens_used: row.get(6)?,
        llm_input_tokens: row.get(7)?,
        llm_output_tokens: row.get(8)?,
        cost_estimate: row.get(9)?,
        timestamp: chrono::DateTime::parse_from_rfc3339(&timestamp)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
