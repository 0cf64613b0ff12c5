// src/api/embeddings_api.rs
//! `POST /v1/embeddings`: authenticated passthrough to the configured
//! embedding provider, OpenAI-shaped request/response.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::auth::AuthContext;
use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingsInput {
    One(String),
    Many(Vec<String>),
}

impl EmbeddingsInput {
    fn into_vec(self) -> Vec<String> {
        match self {
            EmbeddingsInput::One(s) => vec![s],
            EmbeddingsInput::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingsRequest {
    pub input: EmbeddingsInput,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingsResponse {
    pub object: &'static str,
    pub data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingDatum {
    pub index: usize,
    pub embedding: Vec<f32>,
}

pub async fn create_embeddings(
    State(state): State<AppState>,
    _auth: AuthContext,
    Json(body): Json<EmbeddingsRequest>,
) -> GatewayResult<Json<EmbeddingsResponse>> {
    let inputs = body.input.into_vec();
    if inputs.is_empty() {
        return Err(GatewayError::InvalidRequest("input must not be empty".to_string()));
    }
    let vectors = state
        .embeddings
        .embed(&inputs)
        .await
        .map_err(|e| GatewayError::ProviderUnavailable(e.to_string()))?;
    let data = vectors
        .into_iter()
        .enumerate()
        .map(|(index, embedding)| EmbeddingDatum { index, embedding })
        .collect();
    Ok(Json(EmbeddingsResponse { object: "list", data }))
}
