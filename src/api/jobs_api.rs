// src/api/jobs_api.rs
//! `/jobs/*`: operator-triggered off-path workers, distinct from the chat
//! path and checked against the higher-headroom `job_rate_limiter` rather
//! than `chat_rate_limiter`.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::auth::AuthContext;
use crate::error::{GatewayError, GatewayResult};

fn check_job_rate_limit(state: &AppState, auth: &AuthContext) -> GatewayResult<()> {
    state
        .job_rate_limiter
        .check(&auth.tenant_id, &auth.api_key_id)
        .map_err(|retry_after_secs| GatewayError::RateLimited { retry_after_secs })
}

#[derive(Debug, Deserialize)]
pub struct RelationshipDiscoveryRequest {
    /// When set, only this object's neighborhood is (re)scored. Otherwise
    /// the whole tenant graph is scanned.
    #[serde(default)]
    pub object_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RelationshipDiscoveryResponse {
    pub edges_created: usize,
}

pub async fn trigger_relationship_discovery(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<RelationshipDiscoveryRequest>,
) -> GatewayResult<Json<RelationshipDiscoveryResponse>> {
    check_job_rate_limit(&state, &auth)?;
    let edges_created = match body.object_id {
        Some(object_id) => state
            .relationship_discovery
            .run_for_object(&auth.tenant_id, &object_id)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?,
        None => state
            .relationship_discovery
            .run_for_tenant(&auth.tenant_id)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?,
    };
    Ok(Json(RelationshipDiscoveryResponse { edges_created }))
}

#[derive(Debug, Deserialize)]
pub struct SessionSummarizeRequest {
    pub session_id: String,
}

pub async fn trigger_session_summarize(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<SessionSummarizeRequest>,
) -> GatewayResult<Json<crate::jobs::SummarizationOutcome>> {
    check_job_rate_limit(&state, &auth)?;
    let outcome = state
        .session_summarization
        .run(&auth.tenant_id, &body.session_id)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    Ok(Json(outcome))
}
