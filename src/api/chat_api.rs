// src/api/chat_api.rs
//! `POST /v1/chat/completions`: OpenAI-compatible request and response
//! shapes around `ChatOrchestrator`, generalizing a `generate_stream`
//! handler's request struct shape and `Sse` response with a keep-alive to
//! support both the streaming and non-streaming paths plus the formal
//! error taxonomy.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::auth::AuthContext;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics;
use crate::orchestrator::{ChatRequest, InputMessage};

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: ChatUsage,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: WireMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ChatUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

fn to_orchestrator_request(body: ChatCompletionRequest, auth: &AuthContext) -> ChatRequest {
    ChatRequest {
        model: body.model,
        messages: body.messages.into_iter().map(|m| InputMessage { role: m.role, content: m.content }).collect(),
        session_id: body.session_id.unwrap_or_else(|| format!("default-{}", auth.api_key_id)),
        user_id: body.user.unwrap_or_default(),
        request_id: body.request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        max_tokens: body.max_tokens,
        temperature: body.temperature,
        stream: body.stream,
    }
}

pub async fn chat_completions(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<ChatCompletionRequest>,
) -> GatewayResult<Response> {
    if let Err(retry_after_secs) = state.chat_rate_limiter.check(&auth.tenant_id, &auth.api_key_id) {
        metrics::inc_rate_limited(&auth.tenant_id);
        return Err(GatewayError::RateLimited { retry_after_secs });
    }

    let stream = body.stream;
    let req = to_orchestrator_request(body, &auth);
    metrics::inc_request("/v1/chat/completions", "received");

    if stream {
        Ok(stream_completions(state, auth.tenant_id, req).await.into_response())
    } else {
        let outcome = state.orchestrator.complete(&auth.tenant_id, &req).await?;
        let response = ChatCompletionResponse {
            id: req.request_id,
            object: "chat.completion",
            created: chrono::Utc::now().timestamp(),
            model: req.model,
            choices: vec![ChatChoice {
                index: 0,
                message: WireMessage { role: "assistant".to_string(), content: outcome.content },
                finish_reason: "stop",
            }],
            usage: ChatUsage {
                prompt_tokens: outcome.prompt_tokens,
                completion_tokens: outcome.completion_tokens,
                total_tokens: outcome.prompt_tokens + outcome.completion_tokens,
            },
        };
        Ok(Json(response).into_response())
    }
}

async fn stream_completions(
    state: AppState,
    tenant_id: String,
    req: ChatRequest,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let orchestrator = Arc::clone(&state.orchestrator);
    Sse::new(orchestrator.stream(tenant_id, req)).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
