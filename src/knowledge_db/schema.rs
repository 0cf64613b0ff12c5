// src/knowledge_db/schema.rs
//! Entity shapes for the tenant-scoped knowledge store. Identifiers are
//! opaque strings at this boundary; SQLite uses plain TEXT columns, never a
//! native UUID type, so nothing leaks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Plan {
    Free,
    Subscription,
    TokenBilled,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "FREE",
            Plan::Subscription => "SUBSCRIPTION",
            Plan::TokenBilled => "TOKEN_BILLED",
        }
    }
    pub fn parse(s: &str) -> Self {
        match s {
            "SUBSCRIPTION" => Plan::Subscription,
            "TOKEN_BILLED" => Plan::TokenBilled,
            _ => Plan::Free,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: String,
    pub name: String,
    pub plan: Plan,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub key_hash: String,
    pub tenant_id: String,
    pub name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KnowledgeObjectType {
    Turn,
    FileChunk,
    Summary,
    ExtractedFact,
    SessionMemory,
}

impl KnowledgeObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeObjectType::Turn => "TURN",
            KnowledgeObjectType::FileChunk => "FILE_CHUNK",
            KnowledgeObjectType::Summary => "SUMMARY",
            KnowledgeObjectType::ExtractedFact => "EXTRACTED_FACT",
            KnowledgeObjectType::SessionMemory => "SESSION_MEMORY",
        }
    }
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "TURN" => KnowledgeObjectType::Turn,
            "FILE_CHUNK" => KnowledgeObjectType::FileChunk,
            "SUMMARY" => KnowledgeObjectType::Summary,
            "EXTRACTED_FACT" => KnowledgeObjectType::ExtractedFact,
            "SESSION_MEMORY" => KnowledgeObjectType::SessionMemory,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeObject {
    pub id: String,
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub object_type: KnowledgeObjectType,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub original_tokens: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariantType {
    Raw,
    Short,
    Medium,
    BulletFacts,
}

impl VariantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariantType::Raw => "RAW",
            VariantType::Short => "SHORT",
            VariantType::Medium => "MEDIUM",
            VariantType::BulletFacts => "BULLET_FACTS",
        }
    }
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "RAW" => VariantType::Raw,
            "SHORT" => VariantType::Short,
            "MEDIUM" => VariantType::Medium,
            "BULLET_FACTS" => VariantType::BulletFacts,
            _ => return None,
        })
    }
}

/// Exactly one of `content`/`storage_uri` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentVariant {
    pub id: String,
    pub knowledge_object_id: String,
    pub variant: VariantType,
    pub content: Option<String>,
    pub tokens: i64,
    pub embedding_id: Option<String>,
    pub storage_uri: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ContentVariant {
    pub fn validate(&self) -> bool {
        self.content.is_some() != self.storage_uri.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Embedding {
    pub id: String,
    pub variant_id: String,
    pub vector: Vec<f32>,
    pub text_snippet: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipType {
    Supports,
    References,
    Contradicts,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::Supports => "SUPPORTS",
            RelationshipType::References => "REFERENCES",
            RelationshipType::Contradicts => "CONTRADICTS",
        }
    }
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "SUPPORTS" => RelationshipType::Supports,
            "REFERENCES" => RelationshipType::References,
            "CONTRADICTS" => RelationshipType::Contradicts,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeRelationship {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub relationship_type: RelationshipType,
    pub confidence: f32,
    pub evidence: String,
    pub detected_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueState {
    pub id: String,
    pub tenant_id: String,
    pub session_id: String,
    pub user_id: String,
    pub summary_short: String,
    pub summary_bullets: String,
    #[serde(default)]
    pub topics: Vec<String>,
    pub cumulative_tokens: i64,
    pub turn_count: i64,
    pub last_updated_at: DateTime<Utc>,
}

impl DialogueState {
    pub fn empty(tenant_id: &str, session_id: &str, user_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            summary_short: String::new(),
            summary_bullets: String::new(),
            topics: Vec::new(),
            cumulative_tokens: 0,
            turn_count: 0,
            last_updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLog {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub session_id: String,
    pub request_id: String,
    pub model: String,
    pub knowledge_tokens_used: i64,
    pub llm_input_tokens: i64,
    pub llm_output_tokens: i64,
    pub cost_estimate: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_tenants: i64,
    pub total_knowledge_objects: i64,
    pub total_content_variants: i64,
    pub total_embeddings: i64,
    pub total_relationships: i64,
    pub database_size_bytes: i64,
}

#[derive(Debug, Clone)]
pub struct SimilarityMatch {
    pub object: KnowledgeObject,
    pub variant: ContentVariant,
    /// Cosine distance (1 - cosine similarity); ascending is "most similar first".
    pub distance: f32,
    /// The stored embedding vector, carried through so downstream MMR
    /// diversity scoring doesn't need a second lookup.
    pub vector: Vec<f32>,
}
