//! Platform jobs and their results.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::manifest::Descriptor;
use crate::{Error, Platform, Result, RunId, SourceSet, TagPlan};

/// Which layers a cache write captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Only the layers of the final image.
    Min,
    /// Every intermediate layer as well.
    #[default]
    Max,
}

impl std::str::FromStr for CacheMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "min" => Ok(CacheMode::Min),
            "max" => Ok(CacheMode::Max),
            other => Err(Error::Configuration(format!(
                "invalid cache mode '{}': expected min or max",
                other
            ))),
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheMode::Min => f.write_str("min"),
            CacheMode::Max => f.write_str("max"),
        }
    }
}

/// Where a job reads cached layers from and writes them back to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRef {
    pub read_scope: String,
    pub write_scope: String,
    pub mode: CacheMode,
}

/// How to build the image, shared by every platform job of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDefinition {
    /// Dockerfile path relative to the context.
    pub dockerfile: String,
    /// Build context relative to the primary checkout.
    pub context: String,
    /// Build arguments after interpolation.
    pub args: BTreeMap<String, String>,
    /// Arguments whose value changes on every run (timestamps) and are left
    /// out of cache fingerprints.
    pub volatile_args: BTreeSet<String>,
    /// Arguments carrying secrets; masked wherever arguments are recorded.
    pub secret_args: BTreeSet<String>,
}

impl BuildDefinition {
    /// Arguments safe to record in attestations and logs.
    pub fn public_args(&self) -> BTreeMap<String, String> {
        self.args
            .iter()
            .map(|(key, value)| {
                if self.secret_args.contains(key) {
                    (key.clone(), "***".to_string())
                } else {
                    (key.clone(), value.clone())
                }
            })
            .collect()
    }
}

/// One platform's unit of work. Consumed exactly once by the executor.
#[derive(Debug)]
pub struct PlatformJob {
    pub run_id: RunId,
    /// Position in the requested platform list.
    pub index: usize,
    pub platform: Platform,
    pub sources: Arc<SourceSet>,
    pub tags: Arc<TagPlan>,
    pub cache: CacheRef,
    pub build: Arc<BuildDefinition>,
}

impl PlatformJob {
    /// Hash of everything that determines the built image and where it lives.
    ///
    /// Volatile build arguments are excluded so a rebuild of unchanged sources hits the cache.
    /// The target repository is included: a cached manifest only exists in the repository
    /// it was pushed to.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.platform.to_string().as_bytes());
        hasher.update(b"\0image:");
        hasher.update(self.tags.image().as_str().as_bytes());
        for (key, value) in self.tags.image_labels() {
            hasher.update(b"\0label:");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        for commit in self.sources.commits() {
            hasher.update(b"\0source:");
            hasher.update(commit.as_bytes());
        }
        hasher.update(b"\0dockerfile:");
        hasher.update(self.build.dockerfile.as_bytes());
        hasher.update(b"\0context:");
        hasher.update(self.build.context.as_bytes());
        for (key, value) in &self.build.args {
            if self.build.volatile_args.contains(key) {
                continue;
            }
            hasher.update(b"\0arg:");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Directory to build from, inside the primary checkout.
    pub fn context_dir(&self) -> Option<PathBuf> {
        self.sources
            .primary()
            .map(|primary| primary.path.join(&self.build.context))
    }
}

/// A `sha256:<hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageDigest(String);

impl ImageDigest {
    pub fn parse(value: &str) -> Result<Self> {
        let hex_part = value.strip_prefix("sha256:").ok_or_else(|| {
            Error::Internal(format!("digest '{}' is not a sha256 digest", value))
        })?;
        if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Internal(format!("malformed digest '{}'", value)));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    /// Digest of a byte string.
    pub fn of(bytes: &[u8]) -> Self {
        Self(format!("sha256:{}", hex::encode(Sha256::digest(bytes))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex part, without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0["sha256:".len()..]
    }
}

impl fmt::Display for ImageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ImageDigest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ImageDigest> for String {
    fn from(digest: ImageDigest) -> Self {
        digest.0
    }
}

/// Outcome of one platform job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuildResult {
    Succeeded {
        platform: Platform,
        /// Per-platform image manifest.
        manifest: Descriptor,
        /// Whether the image came straight from the build cache.
        cache_hit: bool,
    },
    Failed {
        platform: Platform,
        message: String,
    },
}

impl BuildResult {
    pub fn failed(platform: Platform, message: impl Into<String>) -> Self {
        BuildResult::Failed {
            platform,
            message: message.into(),
        }
    }

    pub fn platform(&self) -> &Platform {
        match self {
            BuildResult::Succeeded { platform, .. } | BuildResult::Failed { platform, .. } => {
                platform
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BuildResult::Succeeded { .. })
    }

    pub fn digest(&self) -> Option<&ImageDigest> {
        match self {
            BuildResult::Succeeded { manifest, .. } => Some(&manifest.digest),
            BuildResult::Failed { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ResolvedSource;
    use crate::tags::{TagInputs, derive_tag_plan};
    use crate::{BuildRequest, Trigger};

    fn job(platform: &str, args: &[(&str, &str)], volatile: &[&str]) -> PlatformJob {
        job_for("refs/heads/main", "ghcr.io/example/atlas", platform, args, volatile)
    }

    fn job_for(
        git_ref: &str,
        image: &str,
        platform: &str,
        args: &[(&str, &str)],
        volatile: &[&str],
    ) -> PlatformJob {
        let request = BuildRequest::new(
            Trigger::from_ref(git_ref).unwrap(),
            "abcdef0",
            vec![platform.to_string()],
        )
        .unwrap();
        let tags = derive_tag_plan(
            &request,
            &TagInputs {
                image: Some(image),
                source_url: None,
                title: None,
                created: chrono::Utc::now(),
            },
        )
        .unwrap();
        let sources = SourceSet::new().with(
            "primary",
            ResolvedSource {
                url: "https://example.com/atlas.git".to_string(),
                commit: "abcdef0".to_string(),
                path: PathBuf::from("/work/primary"),
            },
        );
        PlatformJob {
            run_id: RunId::new(),
            index: 0,
            platform: Platform::parse(platform).unwrap(),
            sources: Arc::new(sources),
            tags: Arc::new(tags),
            cache: CacheRef {
                read_scope: "cache".to_string(),
                write_scope: "cache".to_string(),
                mode: CacheMode::Max,
            },
            build: Arc::new(BuildDefinition {
                dockerfile: "Dockerfile".to_string(),
                context: "app".to_string(),
                args: args
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                volatile_args: volatile.iter().map(|s| s.to_string()).collect(),
                secret_args: Default::default(),
            }),
        }
    }

    #[test]
    fn test_fingerprint_ignores_volatile_args() {
        let a = job(
            "linux/amd64",
            &[("BUILD_DATE", "2024-01-01T00:00:00Z"), ("VCS_REF", "abc")],
            &["BUILD_DATE"],
        );
        let b = job(
            "linux/amd64",
            &[("BUILD_DATE", "2025-06-01T00:00:00Z"), ("VCS_REF", "abc")],
            &["BUILD_DATE"],
        );
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_tracks_platform_and_args() {
        let base = job("linux/amd64", &[("VCS_REF", "abc")], &[]);
        let other_platform = job("linux/arm64", &[("VCS_REF", "abc")], &[]);
        let other_arg = job("linux/amd64", &[("VCS_REF", "def")], &[]);
        assert_ne!(base.fingerprint(), other_platform.fingerprint());
        assert_ne!(base.fingerprint(), other_arg.fingerprint());
    }

    #[test]
    fn test_fingerprint_tracks_target_repository() {
        let atlas = job_for("refs/heads/main", "ghcr.io/example/atlas", "linux/amd64", &[], &[]);
        let other = job_for("refs/heads/main", "ghcr.io/other/repo", "linux/amd64", &[], &[]);
        assert_ne!(atlas.fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_fingerprint_ignores_trigger_kind() {
        // Same commit built for a branch and then tagged reuses the branch build.
        let branch = job_for("refs/heads/main", "ghcr.io/example/atlas", "linux/amd64", &[], &[]);
        let tag = job_for("refs/tags/v1.2.3", "ghcr.io/example/atlas", "linux/amd64", &[], &[]);
        assert_eq!(branch.fingerprint(), tag.fingerprint());
    }

    #[test]
    fn test_public_args_mask_secrets() {
        let build = BuildDefinition {
            args: [("TOKEN", "hunter2"), ("VCS_REF", "abc")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            secret_args: ["TOKEN".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let public = build.public_args();
        assert_eq!(public["TOKEN"], "***");
        assert_eq!(public["VCS_REF"], "abc");
    }

    #[test]
    fn test_context_dir() {
        let j = job("linux/amd64", &[], &[]);
        assert_eq!(j.context_dir(), Some(PathBuf::from("/work/primary/app")));
    }

    #[test]
    fn test_digest_parse() {
        let layer = ImageDigest::of(b"layer-1");
        assert!(ImageDigest::parse(layer.as_str()).is_ok());
        assert!(ImageDigest::parse("sha256:xyz").is_err());
        assert!(ImageDigest::parse("md5:abc").is_err());
        assert_eq!(layer.hex().len(), 64);
    }

    #[test]
    fn test_cache_mode_parse() {
        assert_eq!("min".parse::<CacheMode>().unwrap(), CacheMode::Min);
        assert_eq!("max".parse::<CacheMode>().unwrap(), CacheMode::Max);
        assert!("full".parse::<CacheMode>().is_err());
    }
}
