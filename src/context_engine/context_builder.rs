// src/context_engine/context_builder.rs
//! Assembles a tenant-scoped, token-budgeted context for a chat turn in six
//! steps: seed -> retrieve -> score -> MMR-pack -> micro-quote -> emit. The
//! builder itself is a `Clone`-able, side-effect-free struct with a
//! `build`-style entry point and a `*Config` companion, replacing a naive
//! single-pass threshold scoring approach with that staged pipeline.
//!
//! `ContextBuilder` stays provider-agnostic: it takes an already-computed
//! query embedding rather than calling out to an `EmbeddingProvider` itself,
//! so it can be constructed and unit-tested without network access. The
//! orchestrator owns the provider call and passes the vector in.

use std::sync::Arc;

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::warn;

use crate::context_engine::mmr::{self, MmrCandidate};
use crate::context_engine::token_budget::TokenBudget;
use crate::knowledge_db::schema::{KnowledgeObjectType, VariantType};
use crate::knowledge_db::{KnowledgeDatabase, SimilarityFilters};
use crate::metrics;
use crate::tokens::TokenCounter;

lazy_static! {
    /// Direct-quotation trigger: the user is asking for the source's own
    /// words, not a paraphrase.
    static ref QUOTE_TRIGGER_RE: Regex = Regex::new(
        r"(?i)\b(verbatim|word[- ]for[- ]word|exact(ly)?\s+(wording|words|quote)|quote\s+(it|that|them)|in\s+(their|his|her)\s+(own\s+)?words)\b"
    ).unwrap();
}

#[derive(Debug, Clone)]
pub struct ContextBuilderConfig {
    pub token_budget_default: usize,
    pub retrieval_k: usize,
    pub mmr_diversity_mu: f32,
    pub recency_decay_lambda: f32,
    pub relevance_alpha: f32,
    pub recency_beta: f32,
    pub micro_quote_max_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct ContextItem {
    pub knowledge_object_id: String,
    pub text: String,
    pub tokens: usize,
    pub mmr_score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct BuiltContext {
    pub items: Vec<ContextItem>,
    pub dialogue_summary: Option<String>,
    pub total_tokens: usize,
    /// Set when a failure forced a narrower context than requested; every
    /// degradation must be marked rather than silently served as if whole.
    pub degraded: bool,
}

impl BuiltContext {
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(summary) = &self.dialogue_summary {
            out.push_str("Conversation summary so far:\n");
            out.push_str(summary);
            out.push_str("\n\n");
        }
        if !self.items.is_empty() {
            out.push_str("Relevant context:\n");
            for item in &self.items {
                // Every cited fact carries a provenance marker resolvable back
                // to a knowledge_object.id.
                out.push_str(&format!("- [src:{}] ", item.knowledge_object_id));
                out.push_str(&item.text);
                out.push('\n');
            }
        }
        out
    }
}

pub struct ContextBuilder {
    db: Arc<KnowledgeDatabase>,
    token_counter: TokenCounter,
    config: ContextBuilderConfig,
}

impl Clone for ContextBuilder {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            token_counter: self.token_counter.clone(),
            config: self.config.clone(),
        }
    }
}

impl ContextBuilder {
    pub fn new(db: Arc<KnowledgeDatabase>, config: ContextBuilderConfig) -> Self {
        Self { db, token_counter: TokenCounter::default(), config }
    }

    /// Read-only with respect to the store: no writes happen here.
    /// `query_vector` is `None` when the caller's embedding call itself
    /// failed; the context then degrades to the dialogue summary alone
    /// rather than failing the whole turn.
    pub fn build(
        &self,
        tenant_id: &str,
        session_id: &str,
        user_prompt: &str,
        query_vector: Option<&[f32]>,
        token_budget: Option<usize>,
    ) -> BuiltContext {
        let start = std::time::Instant::now();
        let budget_limit = token_budget.unwrap_or(self.config.token_budget_default);

        let dialogue_summary = match self.db.dialogue_states.get(tenant_id, session_id) {
            Ok(Some(state)) if !state.summary_bullets.is_empty() => Some(state.summary_bullets),
            Ok(_) => None,
            Err(e) => {
                warn!("dialogue state lookup failed, degrading context: {}", e);
                None
            }
        };

        let mut budget = TokenBudget::new(budget_limit);
        if let Some(summary) = &dialogue_summary {
            let header = format!("Conversation summary so far:\n{}\n\n", summary);
            let header_tokens = self.token_counter.count(&header);
            budget.reserve(header_tokens.min(budget.remaining()));
        }

        // Reserve the "Relevant context:" section label up front so the
        // packer never fills the budget right up to the edge and leaves no
        // room for the header `render()` always adds once an item exists.
        let relevant_header_tokens = self.token_counter.count("Relevant context:\n");
        let retrieval_budget = budget.remaining().saturating_sub(relevant_header_tokens);

        let (mut items, degraded, degrade_reason) = match query_vector {
            None => {
                warn!("no query embedding available, context degraded to dialogue state only");
                (Vec::new(), true, "no_query_embedding")
            }
            Some(vector) => {
                let (items, degraded) = self.retrieve_and_select(tenant_id, vector, retrieval_budget);
                (items, degraded, "retrieval_failed")
            }
        };

        // Step 5: if the user prompt carries a direct-quotation trigger,
        // attach at most one RAW slice of <= micro_quote_max_tokens from the
        // single top-ranked item. Every other item keeps whatever variant
        // retrieval returned (SHORT/BULLET_FACTS), already budget-fitted by
        // `select_with_mmr`.
        if QUOTE_TRIGGER_RE.is_match(user_prompt) {
            if let Some(top) = items.iter().max_by(|a, b| a.mmr_score.total_cmp(&b.mmr_score)).cloned() {
                if let Some(quote) = self.micro_quote(&top.knowledge_object_id) {
                    if let Some(slot) = items.iter_mut().find(|i| i.knowledge_object_id == top.knowledge_object_id) {
                        slot.tokens = self.bullet_tokens(&top.knowledge_object_id, &quote);
                        slot.text = quote;
                    }
                }
            }
        }

        metrics::observe_context_build(start.elapsed().as_secs_f64());
        if degraded {
            metrics::inc_context_degraded(degrade_reason);
        }

        let mut built = BuiltContext { items, dialogue_summary, total_tokens: 0, degraded };
        // Count the rendered string itself, not a sum of its parts, so the
        // hard budget cap (spec §4.3/§8) covers the section headers and
        // `[src:...]` provenance markers `render()` adds, not just content.
        built.total_tokens = self.token_counter.count(&built.render());
        built
    }

    /// Steps 1-4: retrieve nearest knowledge objects for the query vector,
    /// score by relevance/recency, pack greedily with MMR under the
    /// remaining budget.
    fn retrieve_and_select(
        &self,
        tenant_id: &str,
        query_vector: &[f32],
        remaining_budget: usize,
    ) -> (Vec<ContextItem>, bool) {
        if remaining_budget == 0 {
            return (Vec::new(), false);
        }

        // Step 2: retrieval is scoped to the types a context bullet may
        // legitimately cite; TURN/RAW content only enters via the
        // micro-quote path below, never via direct retrieval.
        let filters = SimilarityFilters {
            types: Some(vec![
                KnowledgeObjectType::Summary,
                KnowledgeObjectType::ExtractedFact,
                KnowledgeObjectType::SessionMemory,
                KnowledgeObjectType::FileChunk,
            ]),
            archived: Some(false),
            ..Default::default()
        };
        let matches = match self.db.embeddings.find_similar(
            tenant_id,
            query_vector,
            self.config.retrieval_k,
            &filters,
        ) {
            Ok(m) => m,
            Err(e) => {
                warn!("retrieval failed, context degraded to dialogue state only: {}", e);
                return (Vec::new(), true);
            }
        };

        let now = Utc::now();
        let candidates: Vec<MmrCandidate> = matches
            .iter()
            .map(|m| {
                let age_days = (now - m.object.created_at).num_seconds() as f32 / 86_400.0;
                let relevance_raw = 1.0 - m.distance;
                let recency = mmr::recency_decay(age_days.max(0.0), self.config.recency_decay_lambda);
                let relevance = self.config.relevance_alpha * relevance_raw
                    + self.config.recency_beta * recency;
                let text = m
                    .variant
                    .content
                    .clone()
                    .unwrap_or_else(|| "[content stored externally]".to_string());
                MmrCandidate {
                    id: m.object.id.clone(),
                    relevance,
                    embedding: m.vector.clone(),
                    // Token cost is the whole rendered bullet line — the
                    // `- [src:<id>] ` provenance marker and trailing
                    // newline, not just the bare content — so the packer's
                    // budget cap matches what render() actually emits.
                    tokens: self.bullet_tokens(&m.object.id, &text),
                }
            })
            .collect();

        let picks = mmr::select_with_mmr(&candidates, self.config.mmr_diversity_mu, remaining_budget);

        let items = picks
            .into_iter()
            .filter_map(|pick| {
                matches.iter().find(|m| m.object.id == pick.id).map(|m| {
                    let text = m
                        .variant
                        .content
                        .clone()
                        .unwrap_or_else(|| "[content stored externally]".to_string());
                    let tokens = self.bullet_tokens(&m.object.id, &text);
                    ContextItem {
                        knowledge_object_id: m.object.id.clone(),
                        text,
                        tokens,
                        mmr_score: pick.mmr_score,
                    }
                })
            })
            .collect();

        (items, false)
    }

    /// Token cost of one rendered bullet line (`- [src:<id>] <text>\n`),
    /// matching `BuiltContext::render()`'s exact formatting so packing
    /// decisions and the final budget check agree.
    fn bullet_tokens(&self, knowledge_object_id: &str, text: &str) -> usize {
        self.token_counter.count(&format!("- [src:{}] {}\n", knowledge_object_id, text))
    }

    /// Fetches the top item's `RAW` variant and truncates it to
    /// `micro_quote_max_tokens`. Returns `None` if no `RAW` variant exists
    /// (e.g. the object is an `EXTRACTED_FACT`, which has no raw form to
    /// quote from).
    fn micro_quote(&self, knowledge_object_id: &str) -> Option<String> {
        let raw = self
            .db
            .variants
            .get_by_object_and_type(knowledge_object_id, VariantType::Raw)
            .ok()
            .flatten()?;
        let content = raw.content?;
        Some(self.token_counter.truncate_to(&content, self.config.micro_quote_max_tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge_db::schema::{KnowledgeObjectType, Plan, VariantType};
    use crate::knowledge_db::KnowledgeDatabase;

    fn test_config(token_budget_default: usize) -> ContextBuilderConfig {
        ContextBuilderConfig {
            token_budget_default,
            retrieval_k: 40,
            mmr_diversity_mu: 0.3,
            recency_decay_lambda: 0.03,
            relevance_alpha: 1.0,
            recency_beta: 0.2,
            micro_quote_max_tokens: 120,
        }
    }

    #[test]
    fn build_prepends_summary_bullets_not_summary_short() {
        let db = Arc::new(KnowledgeDatabase::new_in_memory(3).unwrap());
        let tenant = db.tenants.create("acme", Plan::Free).unwrap();
        let mut state = db.dialogue_states.get_or_create(&tenant.tenant_id, "s1", "u1").unwrap();
        state.summary_short = "a long narrative summary nobody should see here".to_string();
        state.summary_bullets = "- likes rust\n- wants async".to_string();
        db.dialogue_states.upsert(&state).unwrap();

        let builder = ContextBuilder::new(Arc::clone(&db), test_config(2000));
        let built = builder.build(&tenant.tenant_id, "s1", "hello", None, None);

        assert_eq!(built.dialogue_summary.as_deref(), Some(state.summary_bullets.as_str()));
        assert!(!built.render().contains("a long narrative summary"));
    }

    #[test]
    fn context_degrades_to_summary_only_with_no_src_markers_when_embedding_fails() {
        let db = Arc::new(KnowledgeDatabase::new_in_memory(3).unwrap());
        let tenant = db.tenants.create("acme", Plan::Free).unwrap();
        let mut state = db.dialogue_states.get_or_create(&tenant.tenant_id, "s1", "u1").unwrap();
        state.summary_bullets = "- discussed pricing".to_string();
        db.dialogue_states.upsert(&state).unwrap();

        let builder = ContextBuilder::new(Arc::clone(&db), test_config(2000));
        let built = builder.build(&tenant.tenant_id, "s1", "hello", None, None);

        assert!(built.degraded);
        assert!(!built.render().contains("[src:"));
        assert!(built.render().contains("discussed pricing"));
    }

    #[test]
    fn rendered_token_count_never_exceeds_budget_once_headers_and_markers_are_counted() {
        let db = Arc::new(KnowledgeDatabase::new_in_memory(2).unwrap());
        let tenant = db.tenants.create("acme", Plan::Free).unwrap();
        let mut state = db.dialogue_states.get_or_create(&tenant.tenant_id, "s1", "u1").unwrap();
        state.summary_bullets = "- likes rust".to_string();
        db.dialogue_states.upsert(&state).unwrap();

        // Pack enough near-identical, embeddable facts that raw content
        // alone would fit comfortably under the budget but the rendered
        // `- [src:<uuid>] ` markers plus section headers would not.
        for i in 0..40 {
            let object = db
                .objects
                .create(
                    &tenant.tenant_id,
                    KnowledgeObjectType::ExtractedFact,
                    None,
                    None,
                    None,
                    Vec::new(),
                    Default::default(),
                    4,
                )
                .unwrap();
            let text = format!("fact number {}", i);
            let variant = db.variants.create_inline(&object.id, VariantType::BulletFacts, &text, 4).unwrap();
            let embedding =
                db.embeddings.store_embedding(&tenant.tenant_id, &variant.id, &text, &[1.0, 0.0]).unwrap();
            db.variants.set_embedding_id(&variant.id, &embedding.id).unwrap();
        }

        let builder = ContextBuilder::new(Arc::clone(&db), test_config(60));
        let built = builder.build(&tenant.tenant_id, "s1", "tell me about rust", Some(&[1.0, 0.0]), Some(60));

        assert!(
            built.total_tokens <= 60,
            "rendered context of {} tokens exceeds the 60-token budget",
            built.total_tokens
        );
        assert_eq!(builder.token_counter.count(&built.render()), built.total_tokens);
    }
}
