//! Build backend and emulation traits.
//!
//! Backends build one platform image from a checked-out context; the
//! cache-aware executor decides whether a backend needs to run at all.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::manifest::Descriptor;
use crate::tags::ImageName;
use crate::{CacheRef, ImageDigest, Platform, Result, RunId};

/// Everything a backend needs to build one platform image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInvocation {
    pub run_id: RunId,
    pub platform: Platform,
    /// Image name the per-platform image is pushed under (by digest).
    pub image: ImageName,
    pub context_dir: PathBuf,
    pub dockerfile: String,
    pub args: BTreeMap<String, String>,
    /// Keys of `args` whose values are secrets and must never be logged.
    pub secret_args: BTreeSet<String>,
    /// Labels baked into the platform image; identical for every trigger of one commit.
    pub labels: BTreeMap<String, String>,
    pub cache: CacheRef,
    /// Build under CPU emulation because the target differs from the host.
    pub emulate: bool,
}

/// What a backend produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutput {
    /// Manifest the backend pushed the image under, when it pushes itself.
    pub manifest: Option<Descriptor>,
    /// Layers of the final image, in order.
    pub layers: Vec<ImageDigest>,
    /// Intermediate layers produced along the way.
    pub intermediate: Vec<ImageDigest>,
}

/// Trait for image build backends.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// Build one platform image.
    ///
    /// A failed build returns `Err`; the executor turns it into a failed result.
    async fn build(&self, invocation: BuildInvocation) -> Result<BuildOutput>;
}

/// Makes foreign CPU architectures runnable on the build host.
#[async_trait]
pub trait Emulator: Send + Sync {
    /// Ensure binaries for `platform` can run on this host. Must be idempotent.
    async fn ensure(&self, platform: &Platform) -> Result<()>;
}
