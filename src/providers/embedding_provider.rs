// src/providers/embedding_provider.rs
//! Embedding provider seam, generalizing a single-purpose embedding-call
//! method to any OpenAI-compatible `/v1/embeddings` endpoint with its own
//! base URL/key, independent of the chat provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut result = self.embed(std::slice::from_ref(&text.to_string())).await?;
        result.pop().ok_or_else(|| anyhow::anyhow!("embedding provider returned no vectors"))
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

pub struct HttpEmbeddingProvider {
    base_url: String,
    api_key: Option<String>,
    model: String,
    http_client: reqwest::Client,
}

impl HttpEmbeddingProvider {
    pub fn new(base_url: String, api_key: Option<String>, model: String, timeout_seconds: u64) -> Self {
        Self {
            base_url,
            api_key,
            model,
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(timeout_seconds))
                .build()
                .unwrap_or_default(),
        }
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.base_url)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Generating embeddings for {} text(s) via {}", texts.len(), self.base_url);
        let request = EmbeddingRequest { model: &self.model, input: texts };
        let mut builder = self.http_client.post(self.embeddings_url()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("embedding request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("embedding endpoint returned {}: {}", status, body);
        }
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("failed to parse embedding response: {}", e))?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}
