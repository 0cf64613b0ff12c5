// src/providers/llm_provider.rs
//! Chat completion provider seam, generalizing a single hardcoded
//! local-inference backend's generate/stream methods to any
//! OpenAI-compatible endpoint, addressed by per-provider base URL and key.

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub enum LlmStreamEvent {
    Delta(String),
    Done { finish_reason: Option<String> },
}

#[derive(Debug, Clone)]
pub struct ChatCompletionResult {
    pub content: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> anyhow::Result<ChatCompletionResult>;

    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> anyhow::Result<std::pin::Pin<Box<dyn Stream<Item = anyhow::Result<LlmStreamEvent>> + Send>>>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<ChatDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct ChatDelta {
    content: Option<String>,
}

pub struct HttpLlmProvider {
    base_url: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
    max_retries: u32,
}

impl HttpLlmProvider {
    pub fn new(base_url: String, api_key: Option<String>, timeout_seconds: u64, max_retries: u32) -> Self {
        Self {
            base_url,
            api_key,
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(timeout_seconds))
                .build()
                .unwrap_or_default(),
            max_retries,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// 3 tries, exponential backoff 100ms -> 1s, jittered.
    async fn with_retries<T, F, Fut>(&self, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt + 1 >= self.max_retries => return Err(e),
                Err(e) => {
                    attempt += 1;
                    let base_ms = 100u64 * 2u64.pow(attempt - 1);
                    let jitter_ms = (base_ms as f32 * fastrand_jitter()) as u64;
                    warn!("provider call failed (attempt {}), retrying in {}ms: {}", attempt, base_ms + jitter_ms, e);
                    tokio::time::sleep(std::time::Duration::from_millis(base_ms + jitter_ms)).await;
                }
            }
        }
    }
}

fn fastrand_jitter() -> f32 {
    // Cheap deterministic-enough jitter without pulling in a dedicated RNG
    // crate (dropped per DESIGN.md: `rand` has no other use in this gateway).
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f32 / 1000.0
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> anyhow::Result<ChatCompletionResult> {
        debug!("LLM provider completing (non-streaming) against {}", self.base_url);
        self.with_retries(|| async {
            let request = ChatCompletionRequest { model, messages, max_tokens, temperature, stream: false };
            let response = self
                .authed(self.http_client.post(self.completions_url()))
                .json(&request)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("LLM provider request failed: {}", e))?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("LLM provider returned {}: {}", status, body);
            }
            let completion: ChatCompletionResponse = response
                .json()
                .await
                .map_err(|e| anyhow::anyhow!("failed to parse LLM provider response: {}", e))?;
            let content = completion
                .choices
                .first()
                .and_then(|c| c.message.as_ref())
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(ChatCompletionResult {
                content,
                prompt_tokens: completion.usage.as_ref().map(|u| u.prompt_tokens),
                completion_tokens: completion.usage.as_ref().map(|u| u.completion_tokens),
            })
        })
        .await
    }

    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> anyhow::Result<std::pin::Pin<Box<dyn Stream<Item = anyhow::Result<LlmStreamEvent>> + Send>>> {
        debug!("LLM provider starting streaming completion against {}", self.base_url);
        let request = ChatCompletionRequest { model, messages, max_tokens, temperature, stream: true };
        let response = self
            .authed(self.http_client.post(self.completions_url()))
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("LLM provider request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM provider returned {}: {}", status, body);
        }

        let byte_stream = response.bytes_stream();
        let sse_stream = async_stream::try_stream! {
            let mut buffer = String::new();
            futures_util::pin_mut!(byte_stream);
            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = chunk_result.map_err(|e| anyhow::anyhow!("stream read error: {}", e))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer[..newline_pos].trim().to_string();
                    buffer = buffer[newline_pos + 1..].to_string();
                    if line.is_empty() || !line.starts_with("data: ") {
                        continue;
                    }
                    let data = &line[6..];
                    if data == "[DONE]" {
                        yield LlmStreamEvent::Done { finish_reason: None };
                        return;
                    }
                    match serde_json::from_str::<StreamChunk>(data) {
                        Ok(parsed) => {
                            for choice in &parsed.choices {
                                if let Some(delta) = &choice.delta {
                                    if let Some(content) = &delta.content {
                                        if !content.is_empty() {
                                            yield LlmStreamEvent::Delta(content.clone());
                                        }
                                    }
                                }
                                if choice.finish_reason.is_some() {
                                    yield LlmStreamEvent::Done { finish_reason: choice.finish_reason.clone() };
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!("unparseable stream chunk, skipping: {}", e);
                        }
                    }
                }
            }
            yield LlmStreamEvent::Done { finish_reason: None };
        };
        Ok(Box::pin(sse_stream))
    }
}
