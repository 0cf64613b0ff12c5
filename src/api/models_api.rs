// src/api/models_api.rs
//! `GET /v1/models`: unauthenticated, OpenAI-shaped listing of
//! the models the operator has declared pricing and provisioning for
//! (`Config::available_models`) — the gateway doesn't probe the upstream
//! provider to discover these.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub owned_by: &'static str,
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let data = state
        .config
        .available_models
        .iter()
        .map(|id| ModelEntry { id: id.clone(), object: "model", owned_by: "knowledge-gateway" })
        .collect();
    Json(ModelsResponse { object: "list", data })
}
