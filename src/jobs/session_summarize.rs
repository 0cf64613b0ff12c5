// src/jobs/session_summarize.rs
//! SessionSummarization job: generalizes a single-purpose
//! prompt-call-and-persist shape to a fixed summarization prompt that
//! produces both a short summary and a bulleted memory object.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::knowledge_db::{
    schema::{KnowledgeObjectType, VariantType},
    KnowledgeDatabase,
};
use crate::providers::{ChatMessage, EmbeddingProvider, LlmProvider};
use crate::tokens::TokenCounter;

#[derive(Debug, Clone)]
pub struct SessionSummarizationConfig {
    pub model: String,
    pub summary_short_max_tokens: usize,
    pub bullets_max_tokens: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SummarizationOutcome {
    pub status: String,
    pub session_id: String,
    pub summary: String,
    pub memory_object_id: Option<String>,
    pub tokens_used: u64,
}

const SUMMARIZATION_PROMPT: &str = r#"Summarize the following conversation turns.
Respond ONLY with a JSON object: {"summary_short": "...", "bullets": ["...", "..."]}
"summary_short" is a concise narrative summary of the whole conversation so far.
"bullets" are the durable facts/decisions worth remembering, one per array entry."#;

#[derive(Deserialize)]
struct RawSummary {
    summary_short: String,
    #[serde(default)]
    bullets: Vec<String>,
}

pub struct SessionSummarizationJob {
    db: Arc<KnowledgeDatabase>,
    llm: Arc<dyn LlmProvider>,
    embedding_provider: Arc<dyn EmbeddingProvider>,
    token_counter: TokenCounter,
    config: SessionSummarizationConfig,
}

impl SessionSummarizationJob {
    pub fn new(
        db: Arc<KnowledgeDatabase>,
        llm: Arc<dyn LlmProvider>,
        embedding_provider: Arc<dyn EmbeddingProvider>,
        config: SessionSummarizationConfig,
    ) -> Self {
        Self { db, llm, embedding_provider, token_counter: TokenCounter::for_model(&config.model), config }
    }

    pub async fn run(&self, tenant_id: &str, session_id: &str) -> anyhow::Result<SummarizationOutcome> {
        match self.run_inner(tenant_id, session_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!("session summarization failed for {}/{}: {}", tenant_id, session_id, e);
                Ok(SummarizationOutcome {
                    status: "FAILED".to_string(),
                    session_id: session_id.to_string(),
                    summary: String::new(),
                    memory_object_id: None,
                    tokens_used: 0,
                })
            }
        }
    }

    async fn run_inner(&self, tenant_id: &str, session_id: &str) -> anyhow::Result<SummarizationOutcome> {
        let mut turns = self.db.objects.list(tenant_id, Some(KnowledgeObjectType::Turn), Some(session_id), 2000)?;
        // `list` orders newest-first; summarization reads chronologically.
        turns.reverse();
        if turns.is_empty() {
            anyhow::bail!("no turns found for session {}", session_id);
        }
        let latest_turn_id = turns.last().map(|t| t.id.clone()).unwrap_or_default();

        let mut transcript = String::new();
        for turn in &turns {
            if let Some(variant) = self.db.variants.get_by_object_and_type(&turn.id, VariantType::Raw)? {
                // The assistant turn is the user turn's child
                // (assistant.parent = user.id); no separate role column.
                let role = if turn.parent_id.is_none() { "user" } else { "assistant" };
                transcript.push_str(&format!("{}: {}\n", role, variant.content.unwrap_or_default()));
            }
        }

        let content = format!("{}\n\nConversation:\n{}", SUMMARIZATION_PROMPT, transcript);
        let messages = vec![ChatMessage { role: "user".to_string(), content }];
        let result = self.llm.complete(&self.config.model, &messages, 0.2, 600).await?;
        let tokens_used = result.prompt_tokens.unwrap_or(0) + result.completion_tokens.unwrap_or(0);

        let parsed = parse_summary(&result.content).unwrap_or_else(|| {
            warn!("session summarization LLM output unparseable, falling back to raw text");
            RawSummary { summary_short: result.content.clone(), bullets: Vec::new() }
        });

        let summary_short = self.token_counter.truncate_to(&parsed.summary_short, self.config.summary_short_max_tokens);
        let bullets_text = parsed
            .bullets
            .iter()
            .map(|b| format!("- {}", b.trim()))
            .collect::<Vec<_>>()
            .join("\n");
        let bullets_text = self.token_counter.truncate_to(&bullets_text, self.config.bullets_max_tokens);

        let mut state = self.db.dialogue_states.get_or_create(tenant_id, session_id, "")?;
        state.summary_short = summary_short.clone();
        state.summary_bullets = bullets_text.clone();
        self.db.dialogue_states.upsert(&state)?;

        let memory_object = self.db.objects.create(
            tenant_id,
            KnowledgeObjectType::SessionMemory,
            Some(session_id),
            None,
            Some(&latest_turn_id),
            Vec::new(),
            Default::default(),
            self.token_counter.count(&bullets_text) as i64,
        )?;
        let tokens = self.token_counter.count(&bullets_text) as i64;
        let variant = self.db.variants.create_inline(&memory_object.id, VariantType::BulletFacts, &bullets_text, tokens)?;
        let vector = self.embedding_provider.embed_one(&bullets_text).await?;
        let embedding = self.db.embeddings.store_embedding(tenant_id, &variant.id, &bullets_text, &vector)?;
        self.db.variants.set_embedding_id(&variant.id, &embedding.id)?;

        info!("session summarization completed for {}/{}: memory object {}", tenant_id, session_id, memory_object.id);

        Ok(SummarizationOutcome {
            status: "COMPLETED".to_string(),
            session_id: session_id.to_string(),
            summary: summary_short,
            memory_object_id: Some(memory_object.id),
            tokens_used,
        })
    }
}

fn parse_summary(raw: &str) -> Option<RawSummary> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    serde_json::from_str(&raw[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_summary() {
        let raw = r#"{"summary_short": "talked about rust", "bullets": ["likes rust", "wants async"]}"#;
        let parsed = parse_summary(raw).unwrap();
        assert_eq!(parsed.summary_short, "talked about rust");
        assert_eq!(parsed.bullets.len(), 2);
    }
}
