// src/knowledge_db/embedding_store.rs
//! VectorStore implementation: embedding storage, per-tenant ANN search,
//! tenant isolation enforced at the query.
//!
//! Generalizes an HNSW-index-plus-linear-scan-fallback shape, with two
//! deliberate departures: identifiers are opaque `String`s (not `i64` row
//! ids), and `find_similar` orders by cosine *distance* ascending with a
//! `created_at`-descending tiebreak, not by raw similarity descending.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tracing::{info, warn};

use crate::knowledge_db::schema::{
    ContentVariant, Embedding, KnowledgeObject, KnowledgeObjectType, SimilarityMatch, VariantType,
};

#[derive(Debug, Clone, serde::Serialize)]
pub struct EmbeddingStats {
    pub total_embeddings: usize,
    pub dimension: usize,
    pub index_type: String,
    pub tenants_indexed: usize,
}

/// Filters accepted by `findSimilar`. `tenant_id` is mandatory and is
/// folded into the SQL candidate-set query itself, never applied as a
/// post-filter, so no cross-tenant row is ever scored.
#[derive(Debug, Clone, Default)]
pub struct SimilarityFilters {
    pub types: Option<Vec<KnowledgeObjectType>>,
    pub tags: Option<Vec<String>>,
    pub max_age_days: Option<i64>,
    pub archived: Option<bool>,
}

struct TenantIndex {
    index: HNSWIndex<f32, String>,
    ids: Vec<String>,
}

pub struct EmbeddingStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    dimension: usize,
    ann_indexes: RwLock<HashMap<String, TenantIndex>>,
    vector_cache: RwLock<HashMap<String, Vec<f32>>>,
}

impl EmbeddingStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>, dimension: usize) -> Self {
        Self {
            pool,
            dimension,
            ann_indexes: RwLock::new(HashMap::new()),
            vector_cache: RwLock::new(HashMap::new()),
        }
    }

    fn conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Rebuild a tenant's ANN index from the embeddings table. Safe to call
    /// at startup and periodically offline; the index is always rebuildable
    /// from the table alone.
    pub fn rebuild_index(&self, tenant_id: &str) -> anyhow::Result<()> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, vector FROM embeddings WHERE tenant_id = ?1")?;
        let mut rows = stmt.query(params![tenant_id])?;

        let hnsw_params = HNSWParams {
            n_neighbor: 16,
            ef_build: 100,
            ef_search: 50,
            ..Default::default()
        };
        let mut index = HNSWIndex::<f32, String>::new(self.dimension, &hnsw_params);
        let mut ids = Vec::new();
        let mut cache = self.vector_cache.write().unwrap();

        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let bytes: Vec<u8> = row.get(1)?;
            let vector: Vec<f32> = bincode::deserialize(&bytes)
                .map_err(|e| anyhow::anyhow!("embedding deserialize error: {}", e))?;
            let _ = index.add(&vector, id.clone());
            cache.insert(id.clone(), vector);
            ids.push(id);
        }
        if ids.is_empty() {
            self.ann_indexes.write().unwrap().remove(tenant_id);
            return Ok(());
        }
        index
            .build(Metric::CosineSimilarity)
            .map_err(|e| anyhow::anyhow!("failed to build ANN index: {}", e))?;
        self.ann_indexes
            .write()
            .unwrap()
            .insert(tenant_id.to_string(), TenantIndex { index, ids });
        info!("ANN index rebuilt for tenant {} with {} embeddings", tenant_id, cache.len());
        Ok(())
    }

    /// Upsert keyed on `variant_id`: re-embedding replaces both the vector
    /// and snippet and leaves exactly one row.
    pub fn store_embedding(
        &self,
        tenant_id: &str,
        variant_id: &str,
        text_snippet: &str,
        vector: &[f32],
    ) -> anyhow::Result<Embedding> {
        if vector.len() != self.dimension {
            anyhow::bail!(
                "embedding dimension {} does not match process-wide dimension {}",
                vector.len(),
                self.dimension
            );
        }
        let existing_id: Option<String> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT id FROM embeddings WHERE variant_id = ?1",
                params![variant_id],
                |row| row.get(0),
            )
            .ok()
        };
        let id = existing_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Utc::now();
        let bytes = bincode::serialize(&vector.to_vec())?;
        self.conn()?.execute(
            "INSERT INTO embeddings (id, variant_id, tenant_id, vector, text_snippet, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(variant_id) DO UPDATE SET vector = excluded.vector,
                text_snippet = excluded.text_snippet, created_at = excluded.created_at",
            params![id, variant_id, tenant_id, bytes, text_snippet, now.to_rfc3339()],
        )?;
        self.vector_cache.write().unwrap().insert(id.clone(), vector.to_vec());
        // Incremental add keeps the in-memory index warm; a periodic
        // `rebuild_index` call (job-scheduled) keeps it compact.
        if let Some(tenant_index) = self.ann_indexes.write().unwrap().get_mut(tenant_id) {
            let _ = tenant_index.index.add(vector, id.clone());
            tenant_index.ids.push(id.clone());
        }
        Ok(Embedding {
            id,
            variant_id: variant_id.to_string(),
            vector: vector.to_vec(),
            text_snippet: text_snippet.to_string(),
            created_at: now,
        })
    }

    /// Fetch a previously stored vector by embedding id, used by
    /// relationship discovery to seed a neighbor search from an object's
    /// existing embedding instead of re-embedding it.
    pub fn get_vector(&self, embedding_id: &str) -> Option<Vec<f32>> {
        self.vector_cache.read().unwrap().get(embedding_id).cloned()
    }

    pub fn delete_embedding(&self, id: &str) -> anyhow::Result<bool> {
        let changed = self.conn()?.execute("DELETE FROM embeddings WHERE id = ?1", params![id])?;
        self.vector_cache.write().unwrap().remove(id);
        Ok(changed > 0)
    }

    /// `findSimilar`: tenant-scoped, filtered, ordered by cosine distance
    /// ascending with `created_at` descending tiebreak.
    pub fn find_similar(
        &self,
        tenant_id: &str,
        query_vector: &[f32],
        k: usize,
        filters: &SimilarityFilters,
    ) -> anyhow::Result<Vec<SimilarityMatch>> {
        let candidates = self.candidate_set(tenant_id, filters)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let cache = self.vector_cache.read().unwrap();
        let mut scored: Vec<(f32, &KnowledgeObject, &ContentVariant, &Vec<f32>)> = Vec::new();
        for (object, variant) in &candidates {
            let embedding_id = match &variant.embedding_id {
                Some(id) => id,
                None => continue,
            };
            let vector = match cache.get(embedding_id) {
                Some(v) => v,
                None => continue,
            };
            let similarity = cosine_similarity(query_vector, vector);
            let distance = 1.0 - similarity;
            scored.push((distance, object, variant, vector));
        }

        scored.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.created_at.cmp(&a.1.created_at))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(distance, object, variant, vector)| SimilarityMatch {
                object: object.clone(),
                variant: variant.clone(),
                distance,
                vector: vector.clone(),
            })
            .collect())
    }

    /// Builds the tenant-scoped, filtered candidate set directly in SQL,
    /// rather than loading everything and filtering afterwards — tenant
    /// isolation happens in the WHERE clause itself so no cross-tenant row
    /// is ever loaded into the scorer.
    fn candidate_set(
        &self,
        tenant_id: &str,
        filters: &SimilarityFilters,
    ) -> anyhow::Result<Vec<(KnowledgeObject, ContentVariant)>> {
        let conn = self.conn()?;
        let mut sql = String::from(
            "SELECT ko.id, ko.tenant_id, ko.type, ko.session_id, ko.user_id, ko.parent_id,
                    ko.tags, ko.metadata, ko.archived, ko.created_at, ko.original_tokens,
                    cv.id, cv.knowledge_object_id, cv.variant, cv.content, cv.tokens,
                    cv.embedding_id, cv.storage_uri, cv.created_at
             FROM knowledge_objects ko
             JOIN content_variants cv ON cv.knowledge_object_id = ko.id
             WHERE ko.tenant_id = ?1 AND cv.embedding_id IS NOT NULL
                   AND cv.variant != 'RAW'",
        );
        let archived = filters.archived.unwrap_or(false);
        sql.push_str(" AND ko.archived = ?2");
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(tenant_id.to_string()), Box::new(archived)];

        if let Some(types) = &filters.types {
            let placeholders: Vec<String> =
                types.iter().map(|_| "?".to_string()).collect();
            sql.push_str(&format!(" AND ko.type IN ({})", placeholders.join(",")));
            for t in types {
                params_vec.push(Box::new(t.as_str().to_string()));
            }
        }
        if let Some(max_age_days) = filters.max_age_days {
            let cutoff = Utc::now() - chrono::Duration::days(max_age_days);
            sql.push_str(" AND ko.created_at >= ?");
            params_vec.push(Box::new(cutoff.to_rfc3339()));
        }

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(param_refs))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let type_str: String = row.get(2)?;
            let tags_json: String = row.get(6)?;
            let metadata_json: String = row.get(7)?;
            let ko_created_at: String = row.get(9)?;
            let object = KnowledgeObject {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                object_type: KnowledgeObjectType::parse(&type_str)
                    .unwrap_or(KnowledgeObjectType::Turn),
                session_id: row.get(3)?,
                user_id: row.get(4)?,
                parent_id: row.get(5)?,
                tags: serde_json::from_str(&tags_json).unwrap_or_default(),
                metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
                archived: row.get(8)?,
                created_at: parse_rfc3339(&ko_created_at),
                original_tokens: row.get(10)?,
            };

            if let Some(tag_filter) = &filters.tags {
                if !tag_filter.iter().any(|t| object.tags.contains(t)) {
                    continue;
                }
            }

            let variant_str: String = row.get(13)?;
            let cv_created_at: String = row.get(18)?;
            let variant = ContentVariant {
                id: row.get(11)?,
                knowledge_object_id: row.get(12)?,
                variant: VariantType::parse(&variant_str).unwrap_or(VariantType::Short),
                content: row.get(14)?,
                tokens: row.get(15)?,
                embedding_id: row.get(16)?,
                storage_uri: row.get(17)?,
                created_at: parse_rfc3339(&cv_created_at),
            };
            out.push((object, variant));
        }
        Ok(dedupe_preferred_variant(out))
    }

    pub fn statistics(&self) -> anyhow::Result<EmbeddingStats> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        let tenants_indexed = self.ann_indexes.read().unwrap().len();
        Ok(EmbeddingStats {
            total_embeddings: count as usize,
            dimension: self.dimension,
            index_type: "HNSW".to_string(),
            tenants_indexed,
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.conn().is_ok()
    }
}

/// Keeps at most one candidate row per knowledge object, preferring
/// `BULLET_FACTS` over `SHORT` over `MEDIUM` when an object has more than
/// one embedded variant, preferring the more condensed form for context
/// packing.
fn dedupe_preferred_variant(
    rows: Vec<(KnowledgeObject, ContentVariant)>,
) -> Vec<(KnowledgeObject, ContentVariant)> {
    fn rank(v: VariantType) -> u8 {
        match v {
            VariantType::BulletFacts => 0,
            VariantType::Short => 1,
            VariantType::Medium => 2,
            VariantType::Raw => 3,
        }
    }
    let mut best: HashMap<String, (KnowledgeObject, ContentVariant)> = HashMap::new();
    for (object, variant) in rows {
        match best.get(&object.id) {
            Some((_, existing)) if rank(existing.variant) <= rank(variant.variant) => {}
            _ => {
                best.insert(object.id.clone(), (object, variant));
            }
        }
    }
    best.into_values().collect()
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn store_embedding_twice_under_same_variant_leaves_one_row_with_latest_vector() {
        let db = crate::knowledge_db::KnowledgeDatabase::new_in_memory(3).unwrap();
        let tenant = db.tenants.create("acme", crate::knowledge_db::schema::Plan::Free).unwrap();
        let object = db
            .objects
            .create(
                &tenant.tenant_id,
                KnowledgeObjectType::ExtractedFact,
                None,
                None,
                None,
                Vec::new(),
                Default::default(),
                2,
            )
            .unwrap();
        let variant = db
            .variants
            .create_inline(&object.id, VariantType::BulletFacts, "fact one", 2)
            .unwrap();

        db.embeddings.store_embedding(&tenant.tenant_id, &variant.id, "fact one", &[1.0, 0.0, 0.0]).unwrap();
        let second = db
            .embeddings
            .store_embedding(&tenant.tenant_id, &variant.id, "fact one revised", &[0.0, 1.0, 0.0])
            .unwrap();

        let stats = db.embeddings.statistics().unwrap();
        assert_eq!(stats.total_embeddings, 1);
        assert_eq!(db.embeddings.get_vector(&second.id), Some(vec![0.0, 1.0, 0.0]));
    }

    #[test]
    fn find_similar_never_returns_another_tenants_objects() {
        let db = crate::knowledge_db::KnowledgeDatabase::new_in_memory(2).unwrap();
        let t1 = db.tenants.create("acme", crate::knowledge_db::schema::Plan::Free).unwrap();
        let t2 = db.tenants.create("globex", crate::knowledge_db::schema::Plan::Free).unwrap();

        let o1 = db
            .objects
            .create(&t1.tenant_id, KnowledgeObjectType::ExtractedFact, None, None, None, Vec::new(), Default::default(), 1)
            .unwrap();
        let v1 = db.variants.create_inline(&o1.id, VariantType::BulletFacts, "paris is the capital of france", 1).unwrap();
        db.embeddings.store_embedding(&t1.tenant_id, &v1.id, "paris is the capital of france", &[1.0, 0.0]).unwrap();

        let filters = SimilarityFilters::default();
        let results = db.embeddings.find_similar(&t2.tenant_id, &[1.0, 0.0], 10, &filters).unwrap();
        assert!(results.is_empty(), "tenant 2 must never see tenant 1's embeddings");

        let own_results = db.embeddings.find_similar(&t1.tenant_id, &[1.0, 0.0], 10, &filters).unwrap();
        assert_eq!(own_results.len(), 1);
    }
}
