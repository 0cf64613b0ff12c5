// src/app_state.rs
//! Constructor-wired application state — no DI container, concrete
//! implementations are wired by hand at startup: one flat, `Clone`-able
//! struct of `Arc`s handed to every axum handler via `State<AppState>`,
//! built once in `server.rs`.

use std::sync::Arc;

use crate::config::{Config, PricingTable};
use crate::context_engine::context_builder::{ContextBuilder, ContextBuilderConfig};
use crate::jobs::{
    ContradictionClassifier, LlmContradictionClassifier, RelationshipDiscoveryConfig, RelationshipDiscoveryJob,
    SessionSummarizationConfig, SessionSummarizationJob,
};
use crate::knowledge_db::KnowledgeDatabase;
use crate::memory_pipeline::{LlmMemoryExtractor, MemoryExtractor, MemoryPipeline, MemoryPipelineConfig};
use crate::orchestrator::ChatOrchestrator;
use crate::providers::{
    BlobStorage, EmbeddingProvider, HttpEmbeddingProvider, HttpLlmProvider, LlmProvider, LocalFsBlobStorage,
};
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::usage::UsageTracker;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<KnowledgeDatabase>,
    pub llm: Arc<dyn LlmProvider>,
    pub embeddings: Arc<dyn EmbeddingProvider>,
    pub blobs: Arc<dyn BlobStorage>,
    pub memory_pipeline: Arc<MemoryPipeline>,
    pub context_builder: Arc<ContextBuilder>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub chat_rate_limiter: Arc<RateLimiter>,
    pub job_rate_limiter: Arc<RateLimiter>,
    pub usage: Arc<UsageTracker>,
    pub relationship_discovery: Arc<RelationshipDiscoveryJob>,
    pub session_summarization: Arc<SessionSummarizationJob>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wires every concrete adapter by hand from `config`: one flat
    /// construct-everything-in-one-place constructor, no DI container.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let db = Arc::new(match KnowledgeDatabase::new(config.database_path(), config.embedding_dimension) {
            Ok(db) => db,
            Err(e) => {
                tracing::error!("failed to open knowledge database at {}: {}; falling back to in-memory", config.database_path, e);
                KnowledgeDatabase::new_in_memory(config.embedding_dimension)?
            }
        });

        let llm: Arc<dyn LlmProvider> = Arc::new(HttpLlmProvider::new(
            config.llm_provider_base_url.clone(),
            config.llm_provider_api_key.clone(),
            config.provider_timeout_seconds,
            config.provider_max_retries,
        ));
        let embeddings: Arc<dyn EmbeddingProvider> = Arc::new(HttpEmbeddingProvider::new(
            config.embedding_provider_base_url.clone(),
            config.embedding_provider_api_key.clone(),
            "text-embedding-gateway".to_string(),
            config.provider_timeout_seconds,
        ));
        let blobs: Arc<dyn BlobStorage> = Arc::new(LocalFsBlobStorage::new(config.blob_storage_root.clone()));

        let pricing = Arc::new(PricingTable::load(&config.pricing_table_path));
        let usage = Arc::new(UsageTracker::new(Arc::clone(&db), pricing));

        let extractor: Arc<dyn MemoryExtractor> =
            Arc::new(LlmMemoryExtractor::new(Arc::clone(&llm), "memory-extractor".to_string()));
        let (summarization_tx, summarization_rx) = tokio::sync::mpsc::unbounded_channel();
        let memory_pipeline = MemoryPipeline::new(
            Arc::clone(&db),
            Arc::clone(&embeddings),
            extractor,
            MemoryPipelineConfig {
                short_variant_max_tokens: config.short_variant_max_tokens,
                topics_max: config.topics_max,
                summarize_turn_interval: config.summarize_turn_interval,
                summarize_token_threshold: config.summarize_token_threshold,
                memory_queue_high_water_mark: config.memory_queue_high_water_mark,
            },
            summarization_tx,
        );

        let context_builder = Arc::new(ContextBuilder::new(
            Arc::clone(&db),
            ContextBuilderConfig {
                token_budget_default: config.token_budget_default,
                retrieval_k: config.retrieval_k,
                mmr_diversity_mu: config.mmr_diversity_mu,
                recency_decay_lambda: config.recency_decay_lambda,
                relevance_alpha: config.context_relevance_alpha,
                recency_beta: config.context_recency_beta,
                micro_quote_max_tokens: config.micro_quote_max_tokens,
            },
        ));

        let session_summarization = Arc::new(SessionSummarizationJob::new(
            Arc::clone(&db),
            Arc::clone(&llm),
            Arc::clone(&embeddings),
            SessionSummarizationConfig {
                model: "session-summarizer".to_string(),
                // summary_short caps at 250 tokens, bullets at 120.
                summary_short_max_tokens: 250,
                bullets_max_tokens: 120,
            },
        ));
        spawn_summarization_consumer(Arc::clone(&session_summarization), summarization_rx);

        let classifier: Option<Arc<dyn ContradictionClassifier>> =
            if config.relationship_discovery_contradiction_classifier_enabled {
                Some(Arc::new(LlmContradictionClassifier::new(
                    Arc::clone(&llm),
                    "contradiction-classifier".to_string(),
                )))
            } else {
                None
            };
        let relationship_discovery = Arc::new(RelationshipDiscoveryJob::new(
            Arc::clone(&db),
            classifier,
            RelationshipDiscoveryConfig {
                top_k: config.relationship_top_k,
                supports_threshold: config.relationship_supports_threshold,
                contradicts_threshold: config.relationship_contradicts_threshold,
                contradiction_classifier_enabled: config.relationship_discovery_contradiction_classifier_enabled,
            },
        ));

        let chat_rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            rps: config.rate_limit_rps,
            burst: config.rate_limit_burst,
        }));
        let job_rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            rps: config.job_rate_limit_rps,
            burst: config.job_rate_limit_burst,
        }));

        let orchestrator = Arc::new(ChatOrchestrator::new(
            Arc::clone(&db),
            Arc::clone(&llm),
            Arc::clone(&embeddings),
            Arc::clone(&context_builder),
            Arc::clone(&memory_pipeline),
            Arc::clone(&usage),
            Arc::clone(&config),
        ));

        Ok(Self {
            db,
            llm,
            embeddings,
            blobs,
            memory_pipeline,
            context_builder,
            orchestrator,
            chat_rate_limiter,
            job_rate_limiter,
            usage,
            relationship_discovery,
            session_summarization,
            config,
        })
    }
}

/// Bridges the memory pipeline's summarization trigger channel to the
/// session-summarization job, decoupled per `memory_pipeline/worker.rs`'s
/// doc comment ("the jobs module owns the receiving end").
fn spawn_summarization_consumer(
    job: Arc<SessionSummarizationJob>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<crate::memory_pipeline::SummarizationRequest>,
) {
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let job = Arc::clone(&job);
            tokio::spawn(async move {
                if let Err(e) = job.run(&request.tenant_id, &request.session_id).await {
                    tracing::warn!("session summarization failed for {}/{}: {}", request.tenant_id, request.session_id, e);
                }
            });
        }
    });
}
