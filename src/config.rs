// src/config.rs

use anyhow::Result;
use std::env;
use tracing::{info, warn};

/// A single immutable configuration snapshot. Reloadable atomically by
/// constructing a fresh `Config` and swapping the `Arc` the app state holds.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub prometheus_port: u16,
    pub database_path: String,

    // Context builder
    pub token_budget_default: usize,
    pub mmr_diversity_mu: f32,
    pub retrieval_k: usize,
    pub recency_decay_lambda: f32,
    pub micro_quote_max_tokens: usize,
    pub context_relevance_alpha: f32,
    pub context_recency_beta: f32,
    pub context_redundancy_delta: f32,

    // Memory pipeline
    pub short_variant_max_tokens: usize,
    pub summarize_turn_interval: u32,
    pub summarize_token_threshold: u64,
    pub topics_max: usize,
    pub memory_queue_high_water_mark: usize,
    pub memory_item_timeout_seconds: u64,

    // Rate limiting
    pub rate_limit_rps: u32,
    pub rate_limit_burst: u32,
    pub job_rate_limit_rps: u32,
    pub job_rate_limit_burst: u32,

    // Vector store / embeddings
    pub embedding_dimension: usize,

    /// Models advertised by `GET /v1/models`. The gateway does not discover
    /// these from the upstream provider; operators declare what they've
    /// provisioned pricing for.
    pub available_models: Vec<String>,

    // Providers
    pub llm_provider_base_url: String,
    pub llm_provider_api_key: Option<String>,
    pub embedding_provider_base_url: String,
    pub embedding_provider_api_key: Option<String>,
    pub provider_timeout_seconds: u64,
    pub provider_max_retries: u32,

    pub pricing_table_path: String,
    pub blob_storage_root: String,

    // Relationship discovery
    pub relationship_discovery_contradiction_classifier_enabled: bool,
    pub relationship_supports_threshold: f32,
    pub relationship_contradicts_threshold: f32,
    pub relationship_top_k: usize,

    // Timeouts
    pub context_build_soft_timeout_seconds: u64,
    pub context_build_hard_timeout_seconds: u64,
    pub provider_nonstream_timeout_seconds: u64,
    pub stream_idle_timeout_seconds: u64,
    pub job_timeout_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        fn var<T: std::str::FromStr>(name: &str, default: T) -> T {
            env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        let api_host = env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let api_port: u16 = var("API_PORT", 8080);
        let database_path = env::var("DATABASE_PATH")
            .unwrap_or_else(|_| "./data/gateway.db".into());

        let llm_provider_base_url = env::var("LLM_PROVIDER_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8081".into());
        let embedding_provider_base_url = env::var("EMBEDDING_PROVIDER_BASE_URL")
            .unwrap_or_else(|_| llm_provider_base_url.clone());

        let cfg = Self {
            api_host,
            api_port,
            prometheus_port: var("PROMETHEUS_PORT", 9000),
            database_path,

            token_budget_default: var("TOKEN_BUDGET_DEFAULT", 2000),
            mmr_diversity_mu: var("MMR_DIVERSITY_MU", 0.3),
            retrieval_k: var("RETRIEVAL_K", 40),
            recency_decay_lambda: var("RECENCY_DECAY_LAMBDA", 0.03),
            micro_quote_max_tokens: var("MICRO_QUOTE_MAX_TOKENS", 120),
            context_relevance_alpha: var("CONTEXT_RELEVANCE_ALPHA", 1.0),
            context_recency_beta: var("CONTEXT_RECENCY_BETA", 0.2),
            context_redundancy_delta: var("CONTEXT_REDUNDANCY_DELTA", 0.4),

            short_variant_max_tokens: var("SHORT_VARIANT_MAX_TOKENS", 120),
            summarize_turn_interval: var("SUMMARIZE_TURN_INTERVAL", 10),
            summarize_token_threshold: var("SUMMARIZE_TOKEN_THRESHOLD", 3000),
            topics_max: var("TOPICS_MAX", 20),
            memory_queue_high_water_mark: var("MEMORY_QUEUE_HIGH_WATER_MARK", 1000),
            memory_item_timeout_seconds: var("MEMORY_ITEM_TIMEOUT_SECONDS", 60),

            rate_limit_rps: var("RATE_LIMIT_RPS", 60),
            rate_limit_burst: var("RATE_LIMIT_BURST", 120),
            job_rate_limit_rps: var("JOB_RATE_LIMIT_RPS", 120),
            job_rate_limit_burst: var("JOB_RATE_LIMIT_BURST", 240),

            embedding_dimension: var("EMBEDDING_DIMENSION", 384),
            available_models: env::var("AVAILABLE_MODELS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_else(|_| vec!["gpt-4o-mini".to_string(), "gpt-4o".to_string()]),

            llm_provider_base_url,
            llm_provider_api_key: env::var("LLM_PROVIDER_API_KEY").ok(),
            embedding_provider_base_url,
            embedding_provider_api_key: env::var("EMBEDDING_PROVIDER_API_KEY").ok(),
            provider_timeout_seconds: var("PROVIDER_TIMEOUT_SECONDS", 60),
            provider_max_retries: var("PROVIDER_MAX_RETRIES", 3),

            pricing_table_path: env::var("PRICING_TABLE_PATH")
                .unwrap_or_else(|_| "./config/pricing.json".into()),
            blob_storage_root: env::var("BLOB_STORAGE_ROOT")
                .unwrap_or_else(|_| "./data/blobs".into()),

            relationship_discovery_contradiction_classifier_enabled:
                var("RELATIONSHIP_CONTRADICTION_CLASSIFIER_ENABLED", false),
            relationship_supports_threshold: var("RELATIONSHIP_SUPPORTS_THRESHOLD", 0.82),
            relationship_contradicts_threshold: var("RELATIONSHIP_CONTRADICTS_THRESHOLD", 0.70),
            relationship_top_k: var("RELATIONSHIP_TOP_K", 20),

            context_build_soft_timeout_seconds: var("CONTEXT_BUILD_SOFT_TIMEOUT_SECONDS", 5),
            context_build_hard_timeout_seconds: var("CONTEXT_BUILD_HARD_TIMEOUT_SECONDS", 10),
            provider_nonstream_timeout_seconds: var("PROVIDER_NONSTREAM_TIMEOUT_SECONDS", 30),
            stream_idle_timeout_seconds: var("STREAM_IDLE_TIMEOUT_SECONDS", 30),
            job_timeout_seconds: var("JOB_TIMEOUT_SECONDS", 300),
        };

        Ok(cfg)
    }

    pub fn database_path(&self) -> &std::path::Path {
        std::path::Path::new(&self.database_path)
    }

    pub fn print_config(&self) {
        info!(
            "Gateway config: api={}:{} db={} token_budget={} retrieval_k={} mmr_mu={} \
             embedding_dim={} llm_provider={} rate_limit={}/{}",
            self.api_host,
            self.api_port,
            self.database_path,
            self.token_budget_default,
            self.retrieval_k,
            self.mmr_diversity_mu,
            self.embedding_dimension,
            self.llm_provider_base_url,
            self.rate_limit_rps,
            self.rate_limit_burst,
        );
    }
}

/// Model pricing, reloadable atomically.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, Default)]
pub struct PricingTable {
    /// model -> (input rate per token, output rate per token), in USD.
    pub rates: std::collections::HashMap<String, (f64, f64)>,
}

impl PricingTable {
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("Failed to parse pricing table at {}: {}", path, e);
                Self::default()
            }),
            Err(e) => {
                warn!("Pricing table not found at {} ({}); costs will be 0", path, e);
                Self::default()
            }
        }
    }

    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        match self.rates.get(model) {
            Some((in_rate, out_rate)) => {
                (input_tokens as f64) * in_rate + (output_tokens as f64) * out_rate
            }
            None => {
                warn!("No pricing entry for model '{}', reporting cost 0", model);
                0.0
            }
        }
    }
}
