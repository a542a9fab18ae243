//! OCI manifest documents and the registry trait.
//!
//! A run publishes one image index per tag set. The index references every
//! per-platform image manifest plus one attestation manifest per platform,
//! following the `vnd.docker.reference.*` annotation convention so that
//! registries and `docker buildx imagetools` recognise them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::attestation::{Attestation, AttestationKind};
use crate::tags::ImageName;
use crate::{Error, ImageDigest, Platform, Result, TagPlan};

pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_EMPTY_MEDIA_TYPE: &str = "application/vnd.oci.empty.v1+json";
pub const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const IN_TOTO_MEDIA_TYPE: &str = "application/vnd.in-toto+json";

pub const ANNOTATION_REFERENCE_DIGEST: &str = "vnd.docker.reference.digest";
pub const ANNOTATION_REFERENCE_TYPE: &str = "vnd.docker.reference.type";
pub const ANNOTATION_PREDICATE_TYPE: &str = "in-toto.io/predicate-type";
pub const REFERENCE_TYPE_ATTESTATION: &str = "attestation-manifest";

const EMPTY_JSON: &[u8] = b"{}";

/// Platform as it appears inside an OCI descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformDescriptor {
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl PlatformDescriptor {
    /// Placeholder platform carried by attestation manifests.
    pub fn unknown() -> Self {
        Self {
            architecture: "unknown".to_string(),
            os: "unknown".to_string(),
            variant: None,
        }
    }
}

impl From<&Platform> for PlatformDescriptor {
    fn from(platform: &Platform) -> Self {
        Self {
            architecture: platform.arch().to_string(),
            os: platform.os().to_string(),
            variant: platform.variant().map(str::to_string),
        }
    }
}

/// An OCI content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: ImageDigest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformDescriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: ImageDigest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            platform: None,
            annotations: BTreeMap::new(),
        }
    }

    /// Descriptor for an in-memory payload.
    pub fn of(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self::new(media_type, ImageDigest::of(bytes), bytes.len() as u64)
    }

    pub fn with_platform(mut self, platform: PlatformDescriptor) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

/// A blob to upload before the manifests that reference it.
#[derive(Clone, PartialEq, Eq)]
pub struct Blob {
    pub media_type: String,
    pub data: Vec<u8>,
}

impl Blob {
    pub fn digest(&self) -> ImageDigest {
        ImageDigest::of(&self.data)
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::of(self.media_type.clone(), &self.data)
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("media_type", &self.media_type)
            .field("size", &self.data.len())
            .finish()
    }
}

/// An OCI image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageManifest {
    /// Manifest with the empty config, for artifacts that are not runnable images.
    pub fn artifact(layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: OCI_MANIFEST_MEDIA_TYPE.to_string(),
            config: Descriptor::of(OCI_EMPTY_MEDIA_TYPE, EMPTY_JSON),
            layers,
            annotations: BTreeMap::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::Internal(format!("failed to serialize manifest: {}", e)))
    }

    pub fn descriptor(&self) -> Result<Descriptor> {
        Ok(Descriptor::of(OCI_MANIFEST_MEDIA_TYPE, &self.to_bytes()?))
    }
}

/// The blob backing the empty config descriptor.
pub fn empty_config_blob() -> Blob {
    Blob {
        media_type: OCI_EMPTY_MEDIA_TYPE.to_string(),
        data: EMPTY_JSON.to_vec(),
    }
}

/// An OCI image index: one manifest list for all platforms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageIndex {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::Internal(format!("failed to serialize index: {}", e)))
    }

    pub fn digest(&self) -> Result<ImageDigest> {
        Ok(ImageDigest::of(&self.to_bytes()?))
    }

    /// Image manifests that describe a runnable platform.
    pub fn platform_manifests(&self) -> impl Iterator<Item = &Descriptor> {
        self.manifests
            .iter()
            .filter(|d| !d.annotations.contains_key(ANNOTATION_REFERENCE_TYPE))
    }
}

/// An attestation manifest together with its payload blobs.
#[derive(Debug, Clone)]
pub struct AttestationManifest {
    pub platform: Platform,
    pub manifest: ImageManifest,
    pub body: Vec<u8>,
    pub blobs: Vec<Blob>,
}

/// Every document a publish uploads, in upload order.
#[derive(Debug, Clone)]
pub struct ManifestBundle {
    pub index: ImageIndex,
    pub index_body: Vec<u8>,
    pub digest: ImageDigest,
    pub attestations: Vec<AttestationManifest>,
}

impl ManifestBundle {
    /// Assemble the index for a set of built platforms.
    ///
    /// `platforms` keeps the requested order; attestations are grouped under
    /// the platform they describe.
    pub fn assemble(
        tags: &TagPlan,
        platforms: &[(Platform, Descriptor)],
        attestations: &[Attestation],
    ) -> Result<Self> {
        if platforms.is_empty() {
            return Err(Error::Internal(
                "cannot assemble an index without platform manifests".to_string(),
            ));
        }

        let mut manifests = Vec::with_capacity(platforms.len() * 2);
        for (platform, descriptor) in platforms {
            let mut entry = descriptor.clone();
            entry.platform = Some(PlatformDescriptor::from(platform));
            manifests.push(entry);
        }

        let mut attestation_manifests = Vec::new();
        for (platform, descriptor) in platforms {
            let statements: Vec<&Attestation> = attestations
                .iter()
                .filter(|a| &a.platform == platform)
                .collect();
            if statements.is_empty() {
                continue;
            }

            let layers = statements
                .iter()
                .map(|a| {
                    a.blob()
                        .descriptor()
                        .with_annotation(ANNOTATION_PREDICATE_TYPE, a.predicate_type)
                })
                .collect();
            let manifest = ImageManifest::artifact(layers);
            let body = manifest.to_bytes()?;

            manifests.push(
                Descriptor::of(OCI_MANIFEST_MEDIA_TYPE, &body)
                    .with_platform(PlatformDescriptor::unknown())
                    .with_annotation(ANNOTATION_REFERENCE_DIGEST, descriptor.digest.as_str())
                    .with_annotation(ANNOTATION_REFERENCE_TYPE, REFERENCE_TYPE_ATTESTATION),
            );

            let mut blobs = vec![empty_config_blob()];
            blobs.extend(statements.iter().map(|a| a.blob()));
            attestation_manifests.push(AttestationManifest {
                platform: platform.clone(),
                manifest,
                body,
                blobs,
            });
        }

        let index = ImageIndex {
            schema_version: 2,
            media_type: OCI_INDEX_MEDIA_TYPE.to_string(),
            manifests,
            annotations: tags.labels().clone(),
        };
        let index_body = index.to_bytes()?;
        let digest = ImageDigest::of(&index_body);

        Ok(Self {
            index,
            index_body,
            digest,
            attestations: attestation_manifests,
        })
    }
}

/// One platform entry of a published index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformDigest {
    pub platform: Platform,
    pub digest: ImageDigest,
}

/// One attestation entry of a published index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationDigest {
    pub kind: AttestationKind,
    pub platform: Platform,
    pub digest: ImageDigest,
}

/// What a run published, or would have published with pushing disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedManifest {
    pub image: ImageName,
    pub digest: ImageDigest,
    pub tags: Vec<String>,
    pub platforms: Vec<PlatformDigest>,
    pub attestations: Vec<AttestationDigest>,
    /// False when pushing was disabled and nothing left the host.
    pub pushed: bool,
}

impl PublishedManifest {
    /// `image@digest`
    pub fn reference(&self) -> String {
        self.image.with_digest(self.digest.as_str())
    }

    pub fn references(&self) -> Vec<String> {
        self.tags.iter().map(|t| self.image.with_tag(t)).collect()
    }
}

/// Credentials for one registry.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub token: String,
}

impl RegistryCredentials {
    pub const USERNAME_VAR: &'static str = "KILN_REGISTRY_USERNAME";
    pub const TOKEN_VAR: &'static str = "KILN_REGISTRY_TOKEN";

    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
        }
    }

    /// Read credentials from `KILN_REGISTRY_USERNAME` / `KILN_REGISTRY_TOKEN`.
    pub fn from_env() -> Option<Self> {
        let username = std::env::var(Self::USERNAME_VAR).ok()?;
        let token = std::env::var(Self::TOKEN_VAR).ok()?;
        if username.is_empty() || token.is_empty() {
            return None;
        }
        Some(Self::new(username, token))
    }
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("token", &"***")
            .finish()
    }
}

/// Trait for OCI registries.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Name of this registry client.
    fn name(&self) -> &'static str;

    /// Authenticate against a registry host.
    async fn login(&self, registry: &str, credentials: &RegistryCredentials) -> Result<()>;

    /// Upload a blob unless the registry already has it.
    async fn push_blob(&self, image: &ImageName, blob: &Blob) -> Result<()>;

    /// Upload a manifest under a tag or digest reference.
    async fn push_manifest(
        &self,
        image: &ImageName,
        reference: &str,
        media_type: &str,
        body: &[u8],
    ) -> Result<ImageDigest>;
}
