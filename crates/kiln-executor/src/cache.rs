//! Build cache backends.
//!
//! `InMemoryBuildCache` lives for one process and backs tests and dry runs.
//! `LocalDirCache` keeps one JSON document per key under a directory, so a
//! cache shared through a mounted volume survives between runs.

use async_trait::async_trait;
use kiln_core::{BuildCache, CacheEntry, CacheKey, Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// Process-local cache.
#[derive(Debug, Default)]
pub struct InMemoryBuildCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl InMemoryBuildCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl BuildCache for InMemoryBuildCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<()> {
        self.entries.write().await.insert(key.clone(), entry);
        Ok(())
    }
}

/// Cache stored as JSON files under a directory.
#[derive(Debug, Clone)]
pub struct LocalDirCache {
    root: PathBuf,
}

impl LocalDirCache {
    /// Open (and create if needed) a cache directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            Error::Internal(format!(
                "failed to create cache directory {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(format!("{:x}.json", md5::compute(key.as_str().as_bytes())))
    }
}

#[async_trait]
impl BuildCache for LocalDirCache {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(key = %key, "No cache entry on disk");
                return Ok(None);
            }
            Err(e) => {
                return Err(Error::Internal(format!(
                    "failed to read cache entry {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::Internal(format!("corrupt cache entry for {}: {}", key, e)))
    }

    async fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<()> {
        let path = self.entry_path(key);
        let body = serde_json::to_vec_pretty(&entry)
            .map_err(|e| Error::Internal(format!("failed to serialize cache entry: {}", e)))?;

        // Write then rename so readers never see a torn entry.
        let tmp = path.with_extension(format!("json.{}.tmp", entry.written_by));
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| Error::Internal(format!("failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Internal(format!("failed to replace {}: {}", path.display(), e)))?;

        debug!(key = %key, path = %path.display(), "Stored cache entry");
        Ok(())
    }
}
