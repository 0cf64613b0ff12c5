// src/api/health_api.rs
//! `GET /health`: unauthenticated liveness plus component-level readiness,
//! built fresh rather than the flat "ok" placeholder a health endpoint
//! often starts as.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: bool,
    pub embedding_tenants_indexed: usize,
}

pub async fn health(State(state): State<AppState>) -> Response {
    let database_healthy = state.db.is_healthy();
    let embedding_tenants_indexed = state.db.embeddings.statistics().map(|s| s.tenants_indexed).unwrap_or(0);

    let status = if database_healthy { "ok" } else { "degraded" };
    let response = HealthResponse { status, database: database_healthy, embedding_tenants_indexed };
    let code = if database_healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(response)).into_response()
}
