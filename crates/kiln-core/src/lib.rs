//! Core domain types and traits for the kiln multi-platform image builder.
//!
//! This crate contains:
//! - Build requests, triggers and run identifiers
//! - Platform parsing and host detection
//! - Source sets and the source fetcher trait
//! - Tag plan derivation
//! - Platform jobs, build results and the build backend traits
//! - Build cache abstraction
//! - OCI index/manifest documents, attestations and the registry trait

pub mod attestation;
pub mod cache;
pub mod error;
pub mod executor;
pub mod id;
pub mod job;
pub mod manifest;
pub mod platform;
pub mod request;
pub mod source;
pub mod tags;

pub use cache::{BuildCache, CacheEntry, CacheKey};
pub use error::{Error, PlatformFailure, Result};
pub use executor::{BuildBackend, BuildInvocation, BuildOutput, Emulator};
pub use id::RunId;
pub use job::{BuildResult, CacheMode, CacheRef, ImageDigest, PlatformJob};
pub use manifest::{Descriptor, PublishedManifest, Registry, RegistryCredentials};
pub use platform::Platform;
pub use request::{BuildRequest, Trigger};
pub use source::{ResolvedSource, SourceDependency, SourceFetcher, SourceSet};
pub use tags::{ImageName, TagPlan};
