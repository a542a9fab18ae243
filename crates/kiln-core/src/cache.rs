//! Remote build cache abstraction.
//!
//! The cache is a shared key-value service. Entries may be stale or missing at
//! any time because concurrent runs overwrite each other (last writer wins);
//! callers treat both as a miss.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::manifest::Descriptor;
use crate::{CacheMode, ImageDigest, Platform, Result, RunId};

/// Address of one cache entry: a scope plus the platform it was built for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(scope: &str, platform: &Platform) -> Self {
        Self(format!("{}/{}", scope, platform.slug()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a successful build leaves behind in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Fingerprint of the job inputs that produced these layers.
    pub fingerprint: String,
    /// Manifest of the final image.
    pub manifest: Descriptor,
    /// Layers of the final image, in order.
    pub layers: Vec<ImageDigest>,
    /// Intermediate layers; empty unless written in max mode.
    pub intermediate: Vec<ImageDigest>,
    pub mode: CacheMode,
    pub written_by: RunId,
    pub written_at: DateTime<Utc>,
}

/// Trait for build cache backends.
#[async_trait]
pub trait BuildCache: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// Look up an entry.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

    /// Store an entry, replacing whatever is there.
    async fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<()>;
}
