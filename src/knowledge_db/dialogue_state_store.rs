// src/knowledge_db/dialogue_state_store.rs
//! Per-session running summary maintained by the memory pipeline:
//! short/bulleted summaries, topics, and running counters, one row per
//! `(tenant_id, session_id)`.

use std::sync::Arc;

use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::knowledge_db::schema::DialogueState;

#[derive(Clone)]
pub struct DialogueStateStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl DialogueStateStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("pool error: {}", e))
    }

    pub fn get(&self, tenant_id: &str, session_id: &str) -> anyhow::Result<Option<DialogueState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, session_id, user_id, summary_short, summary_bullets,
                    topics, cumulative_tokens, turn_count, last_updated_at
             FROM dialogue_states WHERE tenant_id = ?1 AND session_id = ?2",
        )?;
        let mut rows = stmt.query(params![tenant_id, session_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_state(row)?))
        } else {
            Ok(None)
        }
    }

    /// Fetch-or-create, the usual idiom for lazily materializing per-session
    /// state on first contact.
    pub fn get_or_create(
        &self,
        tenant_id: &str,
        session_id: &str,
        user_id: &str,
    ) -> anyhow::Result<DialogueState> {
        if let Some(existing) = self.get(tenant_id, session_id)? {
            return Ok(existing);
        }
        let state = DialogueState::empty(tenant_id, session_id, user_id);
        self.upsert(&state)?;
        Ok(state)
    }

    /// Whole-row replace on `(tenant_id, session_id)`, called after each
    /// memory-pipeline extraction pass to update the running summary.
    pub fn upsert(&self, state: &DialogueState) -> anyhow::Result<()> {
        let topics_json = serde_json::to_string(&state.topics)?;
        self.conn()?.execute(
            "INSERT INTO dialogue_states
                (id, tenant_id, session_id, user_id, summary_short, summary_bullets,
                 topics, cumulative_tokens, turn_count, last_updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(tenant_id, session_id) DO UPDATE SET
                summary_short = excluded.summary_short,
                summary_bullets = excluded.summary_bullets,
                topics = excluded.topics,
                cumulative_tokens = excluded.cumulative_tokens,
                turn_count = excluded.turn_count,
                last_updated_at = excluded.last_updated_at",
            params![
                state.id,
                state.tenant_id,
                state.session_id,
                state.user_id,
                state.summary_short,
                state.summary_bullets,
                topics_json,
                state.cumulative_tokens,
                state.turn_count,
                state.last_updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn touch_turn(&self, tenant_id: &str, session_id: &str, added_tokens: i64) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn()?.execute(
            "UPDATE dialogue_states SET turn_count = turn_count + 1,
                cumulative_tokens = cumulative_tokens + ?1, last_updated_at = ?2
             WHERE tenant_id = ?3 AND session_id = ?4",
            params![added_tokens, now, tenant_id, session_id],
        )?;
        Ok(())
    }

    /// Sessions whose `last_updated_at` precedes `cutoff`, used by the
    /// session-summarization job to find candidates without scanning turns.
    pub fn stale_sessions(
        &self,
        tenant_id: &str,
        cutoff: chrono::DateTime<Utc>,
    ) -> anyhow::Result<Vec<DialogueState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, session_id, user_id, summary_short, summary_bullets,
                    topics, cumulative_tokens, turn_count, last_updated_at
             FROM dialogue_states WHERE tenant_id = ?1 AND last_updated_at < ?2",
        )?;
        let mut rows = stmt.query(params![tenant_id, cutoff.to_rfc3339()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_state(row)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge_db::KnowledgeDatabase;

    #[test]
    fn get_or_create_is_lazy_and_stable_across_calls() {
        let db = KnowledgeDatabase::new_in_memory(4).unwrap();
        let tenant = db.tenants.create("acme", crate::knowledge_db::schema::Plan::Free).unwrap();
        assert!(db.dialogue_states.get(&tenant.tenant_id, "s1").unwrap().is_none());

        let first = db.dialogue_states.get_or_create(&tenant.tenant_id, "s1", "u1").unwrap();
        let second = db.dialogue_states.get_or_create(&tenant.tenant_id, "s1", "u1").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.turn_count, 0);
    }

    #[test]
    fn upsert_on_same_session_replaces_rather_than_duplicates() {
        let db = KnowledgeDatabase::new_in_memory(4).unwrap();
        let tenant = db.tenants.create("acme", crate::knowledge_db::schema::Plan::Free).unwrap();
        let mut state = db.dialogue_states.get_or_create(&tenant.tenant_id, "s1", "u1").unwrap();
        state.turn_count = 3;
        state.summary_short = "we discussed pricing".to_string();
        db.dialogue_states.upsert(&state).unwrap();

        let reloaded = db.dialogue_states.get(&tenant.tenant_id, "s1").unwrap().unwrap();
        assert_eq!(reloaded.turn_count, 3);
        assert_eq!(reloaded.summary_short, "we discussed pricing");
    }
}

fn row_to_state(row: &rusqlite::Row) -> rusqlite::Result<DialogueState> {
    let topics_json: String = row.get(6)?;
    let last_updated_at: String = row.get(9)?;
    Ok(DialogueState {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        session_id: row.get(2)?,
        user_id: row.get(3)?,
        summary_short: row.get(4)?,
        summary_bullets: row.get(5)?,
        topics: serde_json::from_str(&topics_json).unwrap_or_default(),
        cumulative_tokens: row.get(7)?,
        turn_count: row.get(8)?,
        last_updated_at: chrono::DateTime::parse_from_rfc3339(&last_updated_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
