//! Provider traits: the seams between the gateway and the outside world.
//! Each has a concrete HTTP or filesystem adapter; tests swap in mocks via
//! `mockito`/in-memory fakes.

pub mod blob_storage;
pub mod embedding_provider;
pub mod llm_provider;

pub use blob_storage::{BlobStorage, LocalFsBlobStorage};
pub use embedding_provider::{EmbeddingProvider, HttpEmbeddingProvider};
pub use llm_provider::{ChatMessage, HttpLlmProvider, LlmProvider, LlmStreamEvent};

use std::sync::Arc;

use dashmap::DashMap;
use moka::sync::Cache;

/// Generic cache seam used by rate limiting and any other hot-path lookup
/// that wants a shared, evictable cache with a local-fallback behavior:
/// open circuit, not deny, on cache failure.
pub trait KeyValueCache<K, V>: Send + Sync
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<V>;
    fn insert(&self, key: K, value: V);
    fn remove(&self, key: &K);
}

/// `moka`-backed default, with an in-process `DashMap` fallback for anything
/// that must never block the request path.
pub struct MokaKeyValueCache<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    moka: Cache<K, V>,
    fallback: Arc<DashMap<K, V>>,
}

impl<K, V> MokaKeyValueCache<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_capacity: u64) -> Self {
        Self {
            moka: Cache::new(max_capacity),
            fallback: Arc::new(DashMap::new()),
        }
    }
}

impl<K, V> KeyValueCache<K, V> for MokaKeyValueCache<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<V> {
        self.moka.get(key).or_else(|| self.fallback.get(key).map(|v| v.clone()))
    }

    fn insert(&self, key: K, value: V) {
        self.moka.insert(key.clone(), value.clone());
        self.fallback.insert(key, value);
    }

    fn remove(&self, key: &K) {
        self.moka.invalidate(key);
        self.fallback.remove(key);
    }
}
