//! Knowledge database: SQLite-backed, tenant-scoped storage for knowledge
//! objects, content variants, embeddings, relationships, dialogue state, and
//! usage accounting. Pool/WAL/migration bootstrap follows a familiar
//! embedded-SQLite shape; the store surface is purpose-built.

pub mod api_key_store;
pub mod content_variant_store;
pub mod dialogue_state_store;
pub mod embedding_store;
pub mod knowledge_object_store;
pub mod migration;
pub mod relationship_store;
pub mod schema;
pub mod tenant_store;
pub mod usage_log_store;

pub use api_key_store::ApiKeyStore;
pub use content_variant_store::ContentVariantStore;
pub use dialogue_state_store::DialogueStateStore;
pub use embedding_store::{EmbeddingStats, EmbeddingStore, SimilarityFilters};
pub use knowledge_object_store::KnowledgeObjectStore;
pub use migration::MigrationManager;
pub use relationship_store::RelationshipStore;
pub use schema::*;
pub use tenant_store::TenantStore;
pub use usage_log_store::UsageLogStore;

use std::path::Path;
use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

pub struct KnowledgeDatabase {
    pub tenants: TenantStore,
    pub api_keys: ApiKeyStore,
    pub objects: KnowledgeObjectStore,
    pub variants: ContentVariantStore,
    pub embeddings: EmbeddingStore,
    pub relationships: RelationshipStore,
    pub dialogue_states: DialogueStateStore,
    pub usage_log: UsageLogStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl KnowledgeDatabase {
    pub fn new(db_path: &Path, embedding_dimension: usize) -> anyhow::Result<Self> {
        info!("Opening knowledge database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        Self::migrate_and_configure(&pool)?;

        let pool = Arc::new(pool);
        info!("Knowledge database initialized successfully");
        Ok(Self::wire(pool, embedding_dimension))
    }

    /// Graceful-degrade bootstrap path: an in-memory database, used by
    /// `server.rs` when the on-disk database fails to open, and by tests.
    pub fn new_in_memory(embedding_dimension: usize) -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(5).build(manager)?;
        Self::migrate_and_configure(&pool)?;
        let pool = Arc::new(pool);
        Ok(Self::wire(pool, embedding_dimension))
    }

    fn migrate_and_configure(pool: &Pool<SqliteConnectionManager>) -> anyhow::Result<()> {
        let mut conn = pool.get()?;
        let mut migrator = migration::MigrationManager::new(&mut conn);
        migrator.initialize_database()?;

        let applied = migrator.get_current_version()?;
        let required = migration::MigrationManager::required_version();
        if applied < required {
            anyhow::bail!(
                "knowledge database schema is at version {} but this build requires {}; refusing to start",
                applied,
                required
            );
        }

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    fn wire(pool: Arc<Pool<SqliteConnectionManager>>, embedding_dimension: usize) -> Self {
        Self {
            tenants: TenantStore::new(Arc::clone(&pool)),
            api_keys: ApiKeyStore::new(Arc::clone(&pool)),
            objects: KnowledgeObjectStore::new(Arc::clone(&pool)),
            variants: ContentVariantStore::new(Arc::clone(&pool)),
            embeddings: EmbeddingStore::new(Arc::clone(&pool), embedding_dimension),
            relationships: RelationshipStore::new(Arc::clone(&pool)),
            dialogue_states: DialogueStateStore::new(Arc::clone(&pool)),
            usage_log: UsageLogStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    pub fn stats(&self) -> anyhow::Result<DatabaseStats> {
        let conn = self.pool.get()?;
        migration::get_database_stats(&conn).map_err(|e| anyhow::anyhow!("stats query failed: {}", e))
    }

    pub fn is_healthy(&self) -> bool {
        self.pool.get().is_ok()
    }
}
