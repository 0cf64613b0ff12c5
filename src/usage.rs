// src/usage.rs
//! Usage accounting glue: wraps `UsageLogStore` with cost computation via
//! `PricingTable` and exposes a per-tenant spend check the orchestrator and
//! rate limiter's plan-level caps can consult. Kept as a small struct owning
//! derived state alongside the stores it reads from, rather than folding
//! this logic directly into the orchestrator.

use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::config::PricingTable;
use crate::knowledge_db::KnowledgeDatabase;

pub struct UsageTracker {
    db: Arc<KnowledgeDatabase>,
    pricing: Arc<PricingTable>,
}

impl UsageTracker {
    pub fn new(db: Arc<KnowledgeDatabase>, pricing: Arc<PricingTable>) -> Self {
        Self { db, pricing }
    }

    /// Records one request's usage, keyed on `request_id` so retries never
    /// double-bill.
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
    ) -> anyhow::Result<f64> {
        let cost = self.pricing.cost(model, llm_input_tokens.max(0) as u64, llm_output_tokens.max(0) as u64);
        self.db.usage_log.record(
            tenant_id,
            user_id,
            session_id,
            request_id,
            model,
            knowledge_tokens_used,
            llm_input_tokens,
            llm_output_tokens,
            cost,
        )?;
        Ok(cost)
    }

    /// Rolling one-hour token/cost totals for a tenant, consulted by
    /// plan-level caps beyond the raw per-key token bucket.
    pub fn hourly_totals(&self, tenant_id: &str) -> anyhow::Result<(i64, i64, f64)> {
        self.db.usage_log.totals_for_tenant(tenant_id, Utc::now() - Duration::hours(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_yields_zero_cost_without_erroring() {
        let db = Arc::new(KnowledgeDatabase::new_in_memory(4).unwrap());
        let tenant = db.tenants.create("acme", crate::knowledge_db::schema::Plan::Free).unwrap();
        let tracker = UsageTracker::new(Arc::clone(&db), Arc::new(PricingTable::default()));
        let cost = tracker.record(&tenant.tenant_id, "u1", "s1", "req-1", "no-such-model", 5, 10, 20).unwrap();
        assert_eq!(cost, 0.0);
    }

    #[test]
    fn record_computes_cost_from_the_pricing_table() {
        let db = Arc::new(KnowledgeDatabase::new_in_memory(4).unwrap());
        let tenant = db.tenants.create("acme", crate::knowledge_db::schema::Plan::Free).unwrap();
        let mut rates = std::collections::HashMap::new();
        rates.insert("gpt-gateway".to_string(), (0.01, 0.02));
        let tracker = UsageTracker::new(Arc::clone(&db), Arc::new(PricingTable { rates }));
        let cost = tracker.record(&tenant.tenant_id, "u1", "s1", "req-1", "gpt-gateway", 0, 100, 50).unwrap();
        assert!((cost - (100.0 * 0.01 + 50.0 * 0.02)).abs() < 1e-9);
    }
}
