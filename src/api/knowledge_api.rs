// src/api/knowledge_api.rs
//! `/v1/knowledge/*`: tenant-scoped semantic search and CRUD over knowledge
//! objects, combining a query-then-score search handler shape with a CRUD
//! surface retargeted at `KnowledgeObjectStore`/`EmbeddingStore` instead of
//! a flat memory table.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::auth::AuthContext;
use crate::error::{GatewayError, GatewayResult};
use crate::knowledge_db::schema::{KnowledgeObject, KnowledgeObjectType};
use crate::knowledge_db::SimilarityFilters;
use crate::tokens::TokenCounter;

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub knowledge_object_id: String,
    pub distance: f32,
    pub text: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
}

/// `GET /v1/knowledge/search` — embeds `q` and runs a tenant-scoped ANN
/// search, independent of the MMR-diversified context the chat path
/// builds.
pub async fn search(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<SearchQuery>,
) -> GatewayResult<Json<SearchResponse>> {
    if query.q.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("q must not be empty".to_string()));
    }
    let vector = state
        .embeddings
        .embed_one(&query.q)
        .await
        .map_err(|e| GatewayError::ProviderUnavailable(e.to_string()))?;

    let mut filters = SimilarityFilters::default();
    if let Some(session_id) = &query.session_id {
        // Session scoping isn't a native SimilarityFilters field; narrow by
        // tag instead, matching the convention the memory pipeline uses
        // when tagging turn objects with their session.
        filters.tags = Some(vec![format!("session:{}", session_id)]);
    }

    let matches = state
        .db
        .embeddings
        .find_similar(&auth.tenant_id, &vector, query.k.unwrap_or(10), &filters)
        .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;

    let results = matches
        .into_iter()
        .map(|m| SearchResult { knowledge_object_id: m.object.id, distance: m.distance, text: m.variant.content })
        .collect();
    Ok(Json(SearchResponse { results }))
}

#[derive(Debug, Deserialize)]
pub struct CreateObjectRequest {
    #[serde(rename = "type")]
    pub object_type: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub content: String,
}

/// `POST /v1/knowledge/objects` — creates a `KnowledgeObject` with a single
/// inline `RAW` variant. Callers who need MEDIUM/SHORT derivations or
/// embeddings go through the chat/memory pipeline instead; this endpoint is
/// the tenant-admin ingestion path (e.g. file uploads) — a "knowledge
/// object" origin other than chat turns.
pub async fn create_object(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<CreateObjectRequest>,
) -> GatewayResult<Json<KnowledgeObject>> {
    let object_type = KnowledgeObjectType::parse(&body.object_type)
        .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown knowledge object type '{}'", body.object_type)))?;
    if body.content.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("content must not be empty".to_string()));
    }
    let tokens = TokenCounter::default().count(&body.content) as i64;

    let object = state
        .db
        .objects
        .create(
            &auth.tenant_id,
            object_type,
            body.session_id.as_deref(),
            body.user_id.as_deref(),
            body.parent_id.as_deref(),
            body.tags,
            body.metadata,
            tokens,
        )
        .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;

    state
        .db
        .variants
        .create_inline(&object.id, crate::knowledge_db::schema::VariantType::Raw, &body.content, tokens)
        .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;

    Ok(Json(object))
}

/// `GET /v1/knowledge/objects/:id`
pub async fn get_object(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> GatewayResult<Json<KnowledgeObject>> {
    let object = state
        .db
        .objects
        .get(&auth.tenant_id, &id)
        .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?
        .ok_or_else(|| GatewayError::NotFound(id.clone()))?;
    Ok(Json(object))
}

#[derive(Debug, Deserialize)]
pub struct ListObjectsQuery {
    #[serde(rename = "type", default)]
    pub object_type: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `GET /v1/knowledge/objects`
pub async fn list_objects(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<ListObjectsQuery>,
) -> GatewayResult<Json<Vec<KnowledgeObject>>> {
    let object_type = query.object_type.as_deref().and_then(KnowledgeObjectType::parse);
    let objects = state
        .db
        .objects
        .list(&auth.tenant_id, object_type, query.session_id.as_deref(), query.limit.unwrap_or(50))
        .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
    Ok(Json(objects))
}

#[derive(Debug, Deserialize)]
pub struct UpdateTagsRequest {
    pub tags: Vec<String>,
}

/// `PUT /v1/knowledge/objects/:id/tags`
pub async fn update_tags(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<UpdateTagsRequest>,
) -> GatewayResult<Json<serde_json::Value>> {
    let updated = state
        .db
        .objects
        .update_tags(&auth.tenant_id, &id, body.tags)
        .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
    if !updated {
        return Err(GatewayError::NotFound(id));
    }
    Ok(Json(serde_json::json!({ "updated": true })))
}

/// `DELETE /v1/knowledge/objects/:id` — archives, never hard-deletes;
/// archival is the only removal the core performs.
pub async fn archive_object(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> GatewayResult<Json<serde_json::Value>> {
    let archived = state
        .db
        .objects
        .archive(&auth.tenant_id, &id)
        .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
    if !archived {
        return Err(GatewayError::NotFound(id));
    }
    Ok(Json(serde_json::json!({ "archived": true })))
}
