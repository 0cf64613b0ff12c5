// src/memory_pipeline/worker.rs
//! The per-session serial worker: a `DashMap<session_id, mpsc::Sender>` of
//! lazily-spawned `tokio::spawn` tasks, generalizing a round-robin worker
//! dispatch idiom so that ordering is structural per session instead of
//! merely hoped for. Cross-session processing is fully parallel: one task
//! per session, no shared lock between them beyond the database pool.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::context_engine::mmr::cosine_similarity;
use crate::knowledge_db::{
    schema::{KnowledgeObjectType, VariantType},
    KnowledgeDatabase, SimilarityFilters,
};
use crate::metrics;
use crate::providers::EmbeddingProvider;
use crate::tokens::TokenCounter;

use super::extractor::MemoryExtractor;

#[derive(Debug, Clone)]
pub struct MemoryPipelineConfig {
    pub short_variant_max_tokens: usize,
    pub topics_max: usize,
    pub summarize_turn_interval: u32,
    pub summarize_token_threshold: u64,
    pub memory_queue_high_water_mark: usize,
}

/// One completed exchange, ready for background processing.
#[derive(Debug, Clone)]
pub struct MemoryTurn {
    pub tenant_id: String,
    pub session_id: String,
    pub user_id: String,
    pub request_id: String,
    pub user_message: String,
    pub assistant_message: String,
}

/// Emitted when a session crosses the summarization trigger; the jobs
/// module owns the receiving end and actually runs
/// `SessionSummarization`, kept decoupled so the memory pipeline doesn't need
/// to know anything about how that job is scheduled.
#[derive(Debug, Clone)]
pub struct SummarizationRequest {
    pub tenant_id: String,
    pub session_id: String,
}

pub struct MemoryPipeline {
    db: Arc<KnowledgeDatabase>,
    embedding_provider: Arc<dyn EmbeddingProvider>,
    extractor: Arc<dyn MemoryExtractor>,
    token_counter: TokenCounter,
    config: MemoryPipelineConfig,
    queues: DashMap<String, mpsc::Sender<MemoryTurn>>,
    summarization_trigger: mpsc::UnboundedSender<SummarizationRequest>,
}

impl MemoryPipeline {
    pub fn new(
        db: Arc<KnowledgeDatabase>,
        embedding_provider: Arc<dyn EmbeddingProvider>,
        extractor: Arc<dyn MemoryExtractor>,
        config: MemoryPipelineConfig,
        summarization_trigger: mpsc::UnboundedSender<SummarizationRequest>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            embedding_provider,
            extractor,
            token_counter: TokenCounter::default(),
            config,
            queues: DashMap::new(),
            summarization_trigger,
        })
    }

    /// Non-blocking enqueue — must not block the response. Backpressure is
    /// open-circuit: a full per-session queue drops the item rather than
    /// stalling the request that produced it.
    pub fn enqueue(self: &Arc<Self>, turn: MemoryTurn) {
        let session_id = turn.session_id.clone();
        let sender = self
            .queues
            .entry(session_id.clone())
            .or_insert_with(|| self.spawn_session_worker(session_id.clone()))
            .clone();

        if let Err(e) = sender.try_send(turn) {
            warn!("memory pipeline queue full for session {}, dropping item: {}", session_id, e);
            metrics::inc_memory_queue_dropped(&session_id);
        }
    }

    fn spawn_session_worker(self: &Arc<Self>, session_id: String) -> mpsc::Sender<MemoryTurn> {
        let (tx, mut rx) = mpsc::channel(self.config.memory_queue_high_water_mark);
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            debug!("memory pipeline worker started for session {}", session_id);
            while let Some(turn) = rx.recv().await {
                metrics::inc_queue();
                if let Err(e) = pipeline.process_turn(&turn).await {
                    error!("memory pipeline failed for session {} request {}: {}", turn.session_id, turn.request_id, e);
                }
                metrics::dec_queue();
            }
            debug!("memory pipeline worker exiting for session {} (queue closed)", session_id);
        });
        tx
    }

    /// The 5-step algorithm: persist turns, extract facts, dedupe against
    /// existing facts, update the running summary, and trigger
    /// summarization when thresholds are crossed.
    async fn process_turn(&self, turn: &MemoryTurn) -> anyhow::Result<()> {
        // At-most-once per exchange: if the user turn already exists under
        // this request_id, the whole exchange has already been processed.
        if self
            .db
            .objects
            .find_by_request_role(&turn.tenant_id, &turn.request_id, "user")?
            .is_some()
        {
            debug!("memory pipeline replay detected for request {}, skipping", turn.request_id);
            return Ok(());
        }

        // --- Step 1: persist turns ---
        let user_tokens = self.token_counter.count(&turn.user_message) as i64;
        let assistant_tokens = self.token_counter.count(&turn.assistant_message) as i64;

        let user_object = self.db.objects.create_idempotent(
            &turn.tenant_id,
            KnowledgeObjectType::Turn,
            Some(&turn.session_id),
            Some(&turn.user_id),
            None,
            Vec::new(),
            Default::default(),
            user_tokens,
            &turn.request_id,
            "user",
        )?;
        let assistant_object = self.db.objects.create_idempotent(
            &turn.tenant_id,
            KnowledgeObjectType::Turn,
            Some(&turn.session_id),
            Some(&turn.user_id),
            Some(&user_object.id),
            Vec::new(),
            Default::default(),
            assistant_tokens,
            &turn.request_id,
            "assistant",
        )?;

        self.persist_turn_variants(&turn.tenant_id, &user_object.id, &turn.user_message).await?;
        self.persist_turn_variants(&turn.tenant_id, &assistant_object.id, &turn.assistant_message).await?;

        // --- Step 2: extract memory ---
        let state = self
            .db
            .dialogue_states
            .get_or_create(&turn.tenant_id, &turn.session_id, &turn.user_id)?;
        let extraction = self
            .extractor
            .extract(&turn.assistant_message, &state.topics)
            .await
            .unwrap_or_else(|e| {
                warn!("memory extractor call failed, continuing with no facts: {}", e);
                super::extractor::ExtractedMemory::default()
            });

        let valid_facts: Vec<_> = extraction
            .facts
            .into_iter()
            .filter(|f| !f.content.trim().is_empty() && (0.0..=1.0).contains(&f.confidence))
            .collect();

        // --- Step 3: persist surviving facts ---
        let mut persisted = 0usize;
        for fact in valid_facts {
            if self.is_duplicate_fact(&turn.tenant_id, &fact.content).await? {
                continue;
            }
            self.persist_fact(&turn.tenant_id, &assistant_object.id, &fact.content).await?;
            persisted += 1;
        }
        debug!("memory pipeline persisted {} new fact(s) for session {}", persisted, turn.session_id);

        // --- Step 4: update dialogue state ---
        let topics = merge_topics(&state.topics, &extraction.entities, self.config.topics_max);
        let mut updated = state.clone();
        updated.turn_count += 1;
        updated.cumulative_tokens += user_tokens + assistant_tokens;
        updated.topics = topics;
        updated.last_updated_at = chrono::Utc::now();
        self.db.dialogue_states.upsert(&updated)?;

        // --- Step 5: conditionally trigger summarization ---
        let due_by_turns = self.config.summarize_turn_interval > 0
            && updated.turn_count as u32 % self.config.summarize_turn_interval == 0;
        // Proxy for "since last summary": the schema has no separate
        // last-summary baseline column, so this reads the running total.
        let due_by_tokens = updated.cumulative_tokens as u64 >= self.config.summarize_token_threshold;
        if due_by_turns || due_by_tokens {
            let request = SummarizationRequest {
                tenant_id: turn.tenant_id.clone(),
                session_id: turn.session_id.clone(),
            };
            if self.summarization_trigger.send(request).is_err() {
                warn!("summarization trigger channel closed, dropping request for session {}", turn.session_id);
            }
        }

        Ok(())
    }

    async fn persist_turn_variants(&self, tenant_id: &str, object_id: &str, text: &str) -> anyhow::Result<()> {
        let raw_tokens = self.token_counter.count(text) as i64;
        self.db.variants.create_inline(object_id, VariantType::Raw, text, raw_tokens)?;

        let short_text = self.token_counter.truncate_to(text, self.config.short_variant_max_tokens);
        let short_tokens = self.token_counter.count(&short_text) as i64;
        let short_variant = self.db.variants.create_inline(object_id, VariantType::Short, &short_text, short_tokens)?;

        let vector = self.embedding_provider.embed_one(&short_text).await?;
        let embedding = self.db.embeddings.store_embedding(tenant_id, &short_variant.id, &short_text, &vector)?;
        self.db.variants.set_embedding_id(&short_variant.id, &embedding.id)?;
        Ok(())
    }

    async fn persist_fact(&self, tenant_id: &str, parent_id: &str, content: &str) -> anyhow::Result<()> {
        let bullet = format!("- {}", content.trim());
        let fact_object = self.db.objects.create(
            tenant_id,
            KnowledgeObjectType::ExtractedFact,
            None,
            None,
            Some(parent_id),
            Vec::new(),
            Default::default(),
            self.token_counter.count(&bullet) as i64,
        )?;
        let tokens = self.token_counter.count(&bullet) as i64;
        let variant = self.db.variants.create_inline(&fact_object.id, VariantType::BulletFacts, &bullet, tokens)?;
        let vector = self.embedding_provider.embed_one(&bullet).await?;
        let embedding = self.db.embeddings.store_embedding(tenant_id, &variant.id, &bullet, &vector)?;
        self.db.variants.set_embedding_id(&variant.id, &embedding.id)?;
        Ok(())
    }

    /// Exact-text match first, then cosine≥0.95 against existing
    /// `EXTRACTED_FACT`s in the tenant.
    async fn is_duplicate_fact(&self, tenant_id: &str, content: &str) -> anyhow::Result<bool> {
        let existing = self.db.objects.list(tenant_id, Some(KnowledgeObjectType::ExtractedFact), None, 500)?;
        let normalized = content.trim();
        for object in &existing {
            if let Some(variant) = self.db.variants.get_by_object_and_type(&object.id, VariantType::BulletFacts)? {
                if let Some(existing_text) = &variant.content {
                    if existing_text.trim_start_matches("- ").trim() == normalized {
                        return Ok(true);
                    }
                }
            }
        }

        let vector = self.embedding_provider.embed_one(normalized).await?;
        let filters = SimilarityFilters {
            types: Some(vec![KnowledgeObjectType::ExtractedFact]),
            archived: Some(false),
            ..Default::default()
        };
        let matches = self.db.embeddings.find_similar(tenant_id, &vector, 1, &filters)?;
        if let Some(top) = matches.first() {
            if cosine_similarity(&vector, &top.vector) >= 0.95 {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// LRU-by-last-appearance merge, capped at `cap`.
fn merge_topics(existing: &[String], new_entities: &[String], cap: usize) -> Vec<String> {
    let mut topics: Vec<String> = existing.to_vec();
    for entity in new_entities {
        if entity.trim().is_empty() {
            continue;
        }
        topics.retain(|t| t != entity);
        topics.push(entity.clone());
    }
    if topics.len() > cap {
        let drop = topics.len() - cap;
        topics.drain(0..drop);
    }
    topics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_topics_moves_reappearing_entity_to_the_end() {
        let existing = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let merged = merge_topics(&existing, &["a".to_string()], 10);
        assert_eq!(merged, vec!["b", "c", "a"]);
    }

    #[test]
    fn merge_topics_caps_at_n_dropping_oldest() {
        let existing: Vec<String> = (0..5).map(|i| i.to_string()).collect();
        let merged = merge_topics(&existing, &["5".to_string(), "6".to_string()], 5);
        assert_eq!(merged, vec!["2", "3", "4", "5", "6"]);
    }
}
