//! Build, cache, emulation and registry backends for kiln.
//!
//! Provides:
//! - The cache-aware platform executor
//! - Build cache backends (in-memory, local directory)
//! - `docker buildx` build backend
//! - QEMU binfmt emulation setup through the Docker engine
//! - OCI distribution registry client

pub mod buildx;
pub mod cache;
pub mod cache_aware;
pub mod qemu;
pub mod registry;

pub use buildx::BuildxBackend;
pub use cache::{InMemoryBuildCache, LocalDirCache};
pub use cache_aware::{CacheAwareExecutor, JobOutcome, StagedCacheWrite};
pub use qemu::BinfmtEmulator;
pub use registry::DistributionRegistry;
