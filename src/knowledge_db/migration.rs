// src/knowledge_db/migration.rs
//! Versioned, monotonic schema migrations — the database refuses to start
//! if a required migration is unapplied. A `schema_version` table,
//! `include_str!`-embedded migration SQL, applied transactionally in
//! ascending version order.

use rusqlite::{Connection, Result};
use tracing::{error, info, warn};

use crate::knowledge_db::schema::DatabaseStats;

pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    pub fn initialize_database(&mut self) -> Result<()> {
        info!("Initializing knowledge database schema...");

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version: i32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        info!("Current knowledge database schema version: {}", current_version);
        self.apply_migrations(current_version)?;
        Ok(())
    }

    fn apply_migrations(&mut self, current_version: i32) -> Result<()> {
        for (version, migration_sql) in get_migrations() {
            if version > current_version {
                info!("Applying migration {}...", version);
                let tx = self.conn.transaction()?;
                if let Err(e) = tx.execute_batch(migration_sql) {
                    error!("Failed to apply migration {}: {}", version, e);
                    return Err(e);
                }
                tx.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
                tx.commit()?;
                info!("Migration {} applied successfully", version);
            }
        }
        Ok(())
    }

    pub fn get_current_version(&self) -> Result<i32> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .or_else(|_| Ok(0))
    }

    /// Required version for this build. `run_thread_server`'s equivalent
    /// (`server::run`) refuses to start if the on-disk version is below this
    /// after migrations have been attempted and still fails to apply.
    pub fn required_version() -> i32 {
        get_migrations().iter().map(|(v, _)| *v).max().unwrap_or(0)
    }
}

fn get_migrations() -> Vec<(i32, &'static str)> {
    vec![(1, include_str!("migrations/001_initial.sql"))]
}

pub fn get_database_stats(conn: &Connection) -> Result<DatabaseStats> {
    fn get_table_count(conn: &Connection, table_name: &str) -> Result<i64> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table_name), [], |row| row.get(0))
            .or_else(|e| {
                warn!("Failed to get count from table {}: {}", table_name, e);
                Ok(0)
            })
    }

    let total_tenants = get_table_count(conn, "tenants")?;
    let total_knowledge_objects = get_table_count(conn, "knowledge_objects")?;
    let total_content_variants = get_table_count(conn, "content_variants")?;
    let total_embeddings = get_table_count(conn, "embeddings")?;
    let total_relationships = get_table_count(conn, "knowledge_relationships")?;

    let database_size_bytes: i64 = conn
        .query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(DatabaseStats {
        total_tenants,
        total_knowledge_objects,
        total_content_variants,
        total_embeddings,
        total_relationships,
        database_size_bytes,
    })
}
