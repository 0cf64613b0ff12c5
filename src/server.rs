// src/server.rs
//! HTTP server bootstrap: the same init-tracing/init-metrics/bind-and-serve
//! shape and CORS/Trace/Timeout tower-http layering common to axum services,
//! retargeted at `AppState` and the gateway's route set rather than a
//! thread-pool bootstrap.

use std::time::Duration;

use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::{chat_api, embeddings_api, health_api, jobs_api, knowledge_api, models_api};
use crate::app_state::AppState;
use crate::config::Config;

pub async fn run(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics();
    cfg.print_config();
    info!("Starting knowledge gateway");

    let state = AppState::new(cfg.clone())?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", cfg.api_host, cfg.api_port)).await?;
    info!("Listening on {}:{}", cfg.api_host, cfg.api_port);
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(chat_api::chat_completions))
        .route("/v1/embeddings", post(embeddings_api::create_embeddings))
        .route("/v1/models", get(models_api::list_models))
        .route("/v1/knowledge/search", get(knowledge_api::search))
        .route("/v1/knowledge/objects", post(knowledge_api::create_object))
        .route("/v1/knowledge/objects", get(knowledge_api::list_objects))
        .route("/v1/knowledge/objects/{id}", get(knowledge_api::get_object))
        .route("/v1/knowledge/objects/{id}/tags", put(knowledge_api::update_tags))
        .route("/v1/knowledge/objects/{id}", delete(knowledge_api::archive_object))
        .route("/jobs/relationship-discovery", post(jobs_api::trigger_relationship_discovery))
        .route("/jobs/session-summarize", post(jobs_api::trigger_session_summarize))
        .route("/health", get(health_api::health))
        .route("/metrics", get(crate::metrics::get_metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(120)))
        .with_state(state)
}
