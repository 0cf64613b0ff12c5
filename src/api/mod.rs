// src/api/mod.rs
//! HTTP handler layer: one handler module per resource, exposing the
//! gateway's OpenAI-compatible chat/embeddings/models surface plus the
//! knowledge and job endpoints specific to this system.

pub mod chat_api;
pub mod embeddings_api;
pub mod health_api;
pub mod jobs_api;
pub mod knowledge_api;
pub mod models_api;
