//! Cache-aware platform executor.
//!
//! Turns one `PlatformJob` into one `BuildResult`. A cache entry whose
//! fingerprint matches the job is reused as is; anything else (stale entry,
//! missing entry, unreadable cache) is a miss and the backend builds. The
//! cache write for a successful build is returned to the caller instead of
//! being applied, so a cancelled run can drop it.

use chrono::Utc;
use kiln_core::executor::{BuildBackend, BuildInvocation, BuildOutput, Emulator};
use kiln_core::manifest::{
    Descriptor, ImageManifest, OCI_LAYER_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE,
};
use kiln_core::{
    BuildCache, BuildResult, CacheEntry, CacheKey, CacheMode, Error, Platform, PlatformJob, Result,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// A cache write waiting for the run to decide whether to keep it.
#[derive(Debug, Clone)]
pub struct StagedCacheWrite {
    pub key: CacheKey,
    pub entry: CacheEntry,
}

/// Result of executing one job.
#[derive(Debug)]
pub struct JobOutcome {
    pub result: BuildResult,
    pub staged: Option<StagedCacheWrite>,
}

impl JobOutcome {
    fn failed(platform: Platform, message: impl Into<String>) -> Self {
        Self {
            result: BuildResult::failed(platform, message),
            staged: None,
        }
    }
}

enum CacheLookup {
    Hit(CacheEntry),
    Miss,
}

/// Runs platform jobs against a build backend and a shared build cache.
pub struct CacheAwareExecutor {
    backend: Arc<dyn BuildBackend>,
    cache: Arc<dyn BuildCache>,
    emulator: Arc<dyn Emulator>,
    host: Platform,
}

impl CacheAwareExecutor {
    pub fn new(
        backend: Arc<dyn BuildBackend>,
        cache: Arc<dyn BuildCache>,
        emulator: Arc<dyn Emulator>,
    ) -> Self {
        Self {
            backend,
            cache,
            emulator,
            host: Platform::host(),
        }
    }

    /// Override the detected host platform.
    pub fn with_host(mut self, host: Platform) -> Self {
        self.host = host;
        self
    }

    pub fn host(&self) -> &Platform {
        &self.host
    }

    /// Execute one job. Never fails: every error becomes a failed result.
    pub async fn execute(&self, job: PlatformJob) -> JobOutcome {
        let fingerprint = job.fingerprint();
        let platform = job.platform.clone();

        match self.lookup(&job, &fingerprint).await {
            CacheLookup::Hit(entry) => {
                info!(platform = %platform, digest = %entry.manifest.digest, "Cache hit");
                let staged = (job.cache.write_scope != job.cache.read_scope).then(|| {
                    StagedCacheWrite {
                        key: CacheKey::new(&job.cache.write_scope, &platform),
                        entry: CacheEntry {
                            written_by: job.run_id,
                            written_at: Utc::now(),
                            ..entry.clone()
                        },
                    }
                });
                JobOutcome {
                    result: BuildResult::Succeeded {
                        platform,
                        manifest: entry.manifest,
                        cache_hit: true,
                    },
                    staged,
                }
            }
            CacheLookup::Miss => self.build(job, fingerprint).await,
        }
    }

    /// Apply a staged write. Failures are logged; the cache is best-effort.
    pub async fn commit(&self, staged: StagedCacheWrite) {
        let key = staged.key.clone();
        match self.cache.put(&staged.key, staged.entry).await {
            Ok(()) => debug!(key = %key, cache = self.cache.name(), "Cache entry written"),
            Err(e) => warn!(key = %key, error = %e, "Failed to write cache entry"),
        }
    }

    async fn lookup(&self, job: &PlatformJob, fingerprint: &str) -> CacheLookup {
        let key = CacheKey::new(&job.cache.read_scope, &job.platform);
        match self.cache.get(&key).await {
            Ok(Some(entry)) if entry.fingerprint == fingerprint => CacheLookup::Hit(entry),
            Ok(Some(_)) => {
                debug!(key = %key, "Stale cache entry, rebuilding");
                CacheLookup::Miss
            }
            Ok(None) => {
                debug!(key = %key, "Cache miss");
                CacheLookup::Miss
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                CacheLookup::Miss
            }
        }
    }

    async fn build(&self, job: PlatformJob, fingerprint: String) -> JobOutcome {
        let platform = job.platform.clone();

        let emulate = platform.needs_emulation_on(&self.host);
        if emulate {
            if let Err(e) = self.emulator.ensure(&platform).await {
                error!(platform = %platform, error = %e, "Emulation setup failed");
                return JobOutcome::failed(platform, format!("emulation setup failed: {}", e));
            }
        }

        let Some(context_dir) = job.context_dir() else {
            return JobOutcome::failed(platform, "primary source is not checked out");
        };

        let invocation = BuildInvocation {
            run_id: job.run_id,
            platform: platform.clone(),
            image: job.tags.image().clone(),
            context_dir,
            dockerfile: job.build.dockerfile.clone(),
            args: job.build.args.clone(),
            secret_args: job.build.secret_args.clone(),
            labels: job.tags.image_labels(),
            cache: job.cache.clone(),
            emulate,
        };

        info!(
            platform = %platform,
            backend = self.backend.name(),
            emulate,
            "Building platform image"
        );

        let output = match self.backend.build(invocation).await {
            Ok(output) => output,
            Err(e) => {
                error!(platform = %platform, error = %e, "Platform build failed");
                return JobOutcome::failed(platform, e.to_string());
            }
        };

        let manifest = match output.manifest.clone() {
            Some(manifest) => manifest,
            None => match synthesize_manifest(&platform, &output) {
                Ok(manifest) => manifest,
                Err(e) => return JobOutcome::failed(platform, e.to_string()),
            },
        };

        let intermediate = match job.cache.mode {
            CacheMode::Max => output.intermediate,
            CacheMode::Min => Vec::new(),
        };

        let staged = StagedCacheWrite {
            key: CacheKey::new(&job.cache.write_scope, &platform),
            entry: CacheEntry {
                fingerprint,
                manifest: manifest.clone(),
                layers: output.layers,
                intermediate,
                mode: job.cache.mode,
                written_by: job.run_id,
                written_at: Utc::now(),
            },
        };

        info!(platform = %platform, digest = %manifest.digest, "Platform build succeeded");

        JobOutcome {
            result: BuildResult::Succeeded {
                platform,
                manifest,
                cache_hit: false,
            },
            staged: Some(staged),
        }
    }
}

/// Image manifest for a backend that reports layers but no manifest of its own.
fn synthesize_manifest(platform: &Platform, output: &BuildOutput) -> Result<Descriptor> {
    if output.layers.is_empty() {
        return Err(Error::Internal(
            "backend reported neither a manifest nor any layers".to_string(),
        ));
    }

    let config = json!({
        "architecture": platform.arch(),
        "os": platform.os(),
        "variant": platform.variant(),
        "rootfs": {
            "type": "layers",
            "diff_ids": output.layers.iter().map(|l| l.as_str()).collect::<Vec<_>>(),
        },
    });
    let config = serde_json::to_vec(&config)
        .map_err(|e| Error::Internal(format!("failed to serialize image config: {}", e)))?;

    let mut manifest = ImageManifest::artifact(
        output
            .layers
            .iter()
            .map(|layer| Descriptor::new(OCI_LAYER_MEDIA_TYPE, layer.clone(), 0))
            .collect(),
    );
    manifest.config = Descriptor::of(OCI_CONFIG_MEDIA_TYPE, &config);

    let body = manifest.to_bytes()?;
    Ok(Descriptor::of(OCI_MANIFEST_MEDIA_TYPE, &body))
}
