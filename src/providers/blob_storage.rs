// src/providers/blob_storage.rs
//! Large-`RAW`-content storage seam: content variants too large to inline
//! get a `storage_uri` instead. Built on a plain-filesystem-path idiom
//! (`std::fs`, `anyhow::Context`) rather than any binary-packaging logic.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;

#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn put(&self, tenant_id: &str, key: &str, bytes: &[u8]) -> anyhow::Result<String>;
    async fn get(&self, uri: &str) -> anyhow::Result<Vec<u8>>;
    async fn delete(&self, uri: &str) -> anyhow::Result<()>;
}

pub struct LocalFsBlobStorage {
    root: PathBuf,
}

impl LocalFsBlobStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, tenant_id: &str, key: &str) -> PathBuf {
        self.root.join(tenant_id).join(key)
    }

    fn uri_for(path: &Path) -> String {
        format!("file://{}", path.display())
    }
}

#[async_trait]
impl BlobStorage for LocalFsBlobStorage {
    async fn put(&self, tenant_id: &str, key: &str, bytes: &[u8]) -> anyhow::Result<String> {
        let path = self.path_for(tenant_id, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating blob directory {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing blob {}", path.display()))?;
        Ok(Self::uri_for(&path))
    }

    async fn get(&self, uri: &str) -> anyhow::Result<Vec<u8>> {
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        tokio::fs::read(path).await.with_context(|| format!("reading blob {}", path))
    }

    async fn delete(&self, uri: &str) -> anyhow::Result<()> {
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting blob {}", path)),
        }
    }
}
