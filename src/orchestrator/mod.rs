// src/orchestrator/mod.rs
//! ChatOrchestrator: drives one chat-completion request through RECEIVED ->
//! AUTHENTICATED -> RATE_CHECKED -> CONTEXT_BUILT -> PROVIDER_CALLED ->
//! [STREAMING|COMPLETED] -> MEMORY_ENQUEUED -> USAGE_LOGGED -> DONE/FAILED.
//! Authentication and rate-checking happen in the API layer before this is
//! constructed (axum extractors run first); this module owns everything
//! from CONTEXT_BUILT onward, the same span a `generate_stream`-style
//! handler covers end to end.

use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::Event;
use futures_util::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::config::Config;
use crate::context_engine::context_builder::ContextBuilder;
use crate::error::{GatewayError, GatewayResult};
use crate::knowledge_db::KnowledgeDatabase;
use crate::memory_pipeline::{MemoryPipeline, MemoryTurn};
use crate::metrics;
use crate::providers::{ChatMessage, EmbeddingProvider, LlmProvider, LlmStreamEvent};
use crate::tokens::TokenCounter;
use crate::usage::UsageTracker;

/// One inbound chat message, pre-validation.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct InputMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<InputMessage>,
    pub session_id: String,
    pub user_id: String,
    pub request_id: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stream: bool,
}

/// Result of a non-streaming completion, shaped for the `/v1/chat/completions`
/// OpenAI-compatible response body.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub degraded_context: bool,
}

/// Request-validation step (RECEIVED): every failure maps to
/// `INVALID_REQUEST` before any store or provider call happens.
pub fn validate_request(req: &ChatRequest) -> GatewayResult<()> {
    if req.model.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("model must not be empty".to_string()));
    }
    if req.messages.is_empty() {
        return Err(GatewayError::InvalidRequest("messages must not be empty".to_string()));
    }
    for message in &req.messages {
        if message.role.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("message role must not be empty".to_string()));
        }
        if message.content.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("message content must not be empty".to_string()));
        }
    }
    if let Some(temperature) = req.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(GatewayError::InvalidRequest("temperature must be within [0, 2]".to_string()));
        }
    }
    if let Some(max_tokens) = req.max_tokens {
        if max_tokens == 0 {
            return Err(GatewayError::InvalidRequest("max_tokens must be greater than 0".to_string()));
        }
    }
    Ok(())
}

pub struct ChatOrchestrator {
    db: Arc<KnowledgeDatabase>,
    llm: Arc<dyn LlmProvider>,
    embeddings: Arc<dyn EmbeddingProvider>,
    context_builder: Arc<ContextBuilder>,
    memory_pipeline: Arc<MemoryPipeline>,
    usage: Arc<UsageTracker>,
    config: Arc<Config>,
    token_counter: TokenCounter,
}

impl ChatOrchestrator {
    pub fn new(
        db: Arc<KnowledgeDatabase>,
        llm: Arc<dyn LlmProvider>,
        embeddings: Arc<dyn EmbeddingProvider>,
        context_builder: Arc<ContextBuilder>,
        memory_pipeline: Arc<MemoryPipeline>,
        usage: Arc<UsageTracker>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            llm,
            embeddings,
            context_builder,
            memory_pipeline,
            usage,
            config,
            token_counter: TokenCounter::default(),
        }
    }

    fn tenant_user_id(&self, req: &ChatRequest) -> String {
        if req.user_id.is_empty() { "anonymous".to_string() } else { req.user_id.clone() }
    }

    /// CONTEXT_BUILT: embeds the last user message and builds a
    /// token-budgeted context. Embedding failure degrades to no retrieval
    /// context rather than failing the turn.
    async fn build_context(
        &self,
        tenant_id: &str,
        session_id: &str,
        user_prompt: &str,
    ) -> crate::context_engine::context_builder::BuiltContext {
        let query_vector = match self.embeddings.embed_one(user_prompt).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!("query embedding failed, context will degrade: {}", e);
                None
            }
        };
        // The context token budget (default 2000, tenant-configurable) is
        // independent of the request's `max_tokens`, which bounds the
        // *completion* length, not the injected context.
        self.context_builder.build(tenant_id, session_id, user_prompt, query_vector.as_deref(), None)
    }

    fn provider_messages(
        &self,
        context_text: &str,
        input_messages: &[InputMessage],
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(input_messages.len() + 1);
        if !context_text.is_empty() {
            messages.push(ChatMessage { role: "system".to_string(), content: context_text.to_string() });
        }
        messages.extend(input_messages.iter().map(|m| ChatMessage { role: m.role.clone(), content: m.content.clone() }));
        messages
    }

    fn last_user_message(req: &ChatRequest) -> &str {
        req.messages.iter().rev().find(|m| m.role == "user").map(|m| m.content.as_str()).unwrap_or("")
    }

    /// Non-streaming path: CONTEXT_BUILT -> PROVIDER_CALLED -> COMPLETED ->
    /// MEMORY_ENQUEUED -> USAGE_LOGGED -> DONE/FAILED.
    pub async fn complete(&self, tenant_id: &str, req: &ChatRequest) -> GatewayResult<CompletionOutcome> {
        validate_request(req)?;
        let user_id = self.tenant_user_id(req);
        let user_prompt = Self::last_user_message(req);

        let built = self.build_context(tenant_id, &req.session_id, user_prompt).await;
        let provider_messages = self.provider_messages(&built.render(), &req.messages);

        let result = self
            .llm
            .complete(&req.model, &provider_messages, req.temperature.unwrap_or(0.7), req.max_tokens.unwrap_or(1024))
            .await
            .map_err(|e| {
                metrics::inc_chat_request("provider_error");
                GatewayError::ProviderUnavailable(e.to_string())
            })?;

        let prompt_tokens = result.prompt_tokens.unwrap_or_else(|| self.token_counter.count_many(provider_messages.iter().map(|m| m.content.as_str())) as u64);
        let completion_tokens = result.completion_tokens.unwrap_or_else(|| self.token_counter.count(&result.content) as u64);

        self.enqueue_memory(tenant_id, req, &user_id, user_prompt, &result.content);
        self.log_usage(tenant_id, req, &user_id, built.total_tokens as i64, prompt_tokens as i64, completion_tokens as i64);

        metrics::inc_chat_request("completed");
        Ok(CompletionOutcome {
            content: result.content,
            prompt_tokens,
            completion_tokens,
            degraded_context: built.degraded,
        })
    }

    /// Streaming path: yields named SSE events (`context`, `chunk`, `done`,
    /// `error`), replacing a raw OpenAI-passthrough `data: {...}` framing
    /// with typed events. A 30s idle timeout between deltas closes the
    /// stream with an `error` event rather than hanging the connection open
    /// forever.
    pub fn stream(
        self: Arc<Self>,
        tenant_id: String,
        req: ChatRequest,
    ) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
        async_stream::stream! {
            if let Err(e) = validate_request(&req) {
                yield Ok(error_event(&e));
                return;
            }
            let user_id = self.tenant_user_id(&req);
            let user_prompt = Self::last_user_message(&req).to_string();

            let built = self.build_context(&tenant_id, &req.session_id, &user_prompt).await;
            yield Ok(Event::default().event("context").data(built.render()));

            let provider_messages = self.provider_messages(&built.render(), &req.messages);
            let temperature = req.temperature.unwrap_or(0.7);
            let max_tokens = req.max_tokens.unwrap_or(1024);

            let provider_stream = match self.llm.stream(&req.model, &provider_messages, temperature, max_tokens).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("provider stream failed to start: {}", e);
                    metrics::inc_chat_request("provider_error");
                    yield Ok(error_event(&GatewayError::ProviderUnavailable(e.to_string())));
                    return;
                }
            };

            metrics::inc_sessions();
            let idle_timeout = Duration::from_secs(self.config.stream_idle_timeout_seconds);
            let mut provider_stream = provider_stream;
            let mut full_response = String::new();
            let mut finish_reason: Option<String> = None;
            let mut failed = false;

            loop {
                match tokio::time::timeout(idle_timeout, provider_stream.next()).await {
                    Ok(Some(Ok(LlmStreamEvent::Delta(delta)))) => {
                        full_response.push_str(&delta);
                        yield Ok(Event::default().event("chunk").data(delta));
                    }
                    Ok(Some(Ok(LlmStreamEvent::Done { finish_reason: reason }))) => {
                        finish_reason = reason;
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        warn!("provider stream errored mid-turn: {}", e);
                        failed = true;
                        yield Ok(error_event(&GatewayError::ProviderUnavailable(e.to_string())));
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!("provider stream idle for {}s, closing", self.config.stream_idle_timeout_seconds);
                        failed = true;
                        yield Ok(error_event(&GatewayError::ProviderUnavailable("stream idle timeout".to_string())));
                        break;
                    }
                }
            }
            metrics::dec_sessions();

            // Best-effort memory/usage writes happen even on a failed or
            // client-cancelled stream, for whatever partial output exists.
            if !full_response.is_empty() {
                let prompt_tokens = self.token_counter.count_many(provider_messages.iter().map(|m| m.content.as_str())) as i64;
                let completion_tokens = self.token_counter.count(&full_response) as i64;
                self.enqueue_memory(&tenant_id, &req, &user_id, &user_prompt, &full_response);
                self.log_usage(&tenant_id, &req, &user_id, built.total_tokens as i64, prompt_tokens, completion_tokens);
            }

            if !failed {
                metrics::inc_chat_request("completed");
                yield Ok(Event::default().event("done").data(finish_reason.unwrap_or_else(|| "stop".to_string())));
            } else {
                metrics::inc_chat_request("provider_error");
            }
        }
    }

    /// MEMORY_ENQUEUED: non-blocking, failure-to-enqueue is logged but never
    /// fails the request.
    fn enqueue_memory(&self, tenant_id: &str, req: &ChatRequest, user_id: &str, user_message: &str, assistant_message: &str) {
        self.memory_pipeline.enqueue(MemoryTurn {
            tenant_id: tenant_id.to_string(),
            session_id: req.session_id.clone(),
            user_id: user_id.to_string(),
            request_id: req.request_id.clone(),
            user_message: user_message.to_string(),
            assistant_message: assistant_message.to_string(),
        });
    }

    /// USAGE_LOGGED: keyed on `request_id`, duplicates ignored.
    fn log_usage(&self, tenant_id: &str, req: &ChatRequest, user_id: &str, knowledge_tokens: i64, prompt_tokens: i64, completion_tokens: i64) {
        if let Err(e) = self.usage.record(
            tenant_id,
            user_id,
            &req.session_id,
            &req.request_id,
            &req.model,
            knowledge_tokens,
            prompt_tokens,
            completion_tokens,
        ) {
            warn!("usage logging failed for request {}: {}", req.request_id, e);
        }
        debug!("usage logged for request {}", req.request_id);
    }
}

fn error_event(err: &GatewayError) -> Event {
    let body = serde_json::json!({ "type": err.kind(), "message": err.to_string() });
    Event::default().event("error").data(body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> InputMessage {
        InputMessage { role: role.to_string(), content: content.to_string() }
    }

    fn base_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-gateway".to_string(),
            messages: vec![msg("user", "hello there")],
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            request_id: "r1".to_string(),
            max_tokens: Some(256),
            temperature: Some(0.7),
            stream: false,
        }
    }

    #[test]
    fn rejects_empty_model() {
        let mut req = base_request();
        req.model = "".to_string();
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn rejects_empty_messages() {
        let mut req = base_request();
        req.messages = Vec::new();
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn rejects_blank_message_content() {
        let mut req = base_request();
        req.messages = vec![msg("user", "   ")];
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn rejects_out_of_range_temperature() {
        let mut req = base_request();
        req.temperature = Some(3.0);
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn rejects_zero_max_tokens() {
        let mut req = base_request();
        req.max_tokens = Some(0);
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn accepts_well_formed_request() {
        assert!(validate_request(&base_request()).is_ok());
    }
}
