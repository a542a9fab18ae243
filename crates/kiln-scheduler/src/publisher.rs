//! Manifest publisher - joins platform results into one multi-arch index.
//!
//! Publishing is all-or-nothing with respect to builds: a single failed
//! platform aborts before any registry call. Registry calls are made once
//! each, in dependency order (blobs, attestation manifests, then the index
//! under every tag), each bounded by the publish timeout.

use kiln_core::attestation::{self, ProvenanceContext};
use kiln_core::manifest::{
    AttestationDigest, ManifestBundle, OCI_INDEX_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE,
    PlatformDigest,
};
use kiln_core::{
    BuildResult, Descriptor, Error, Platform, PlatformFailure, PublishedManifest, Registry,
    RegistryCredentials, Result, TagPlan,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Pushes the index for a set of platform builds.
#[derive(Clone)]
pub struct Publisher {
    registry: Arc<dyn Registry>,
    timeout: Duration,
    push: bool,
}

impl Publisher {
    pub fn new(registry: Arc<dyn Registry>, timeout: Duration) -> Self {
        Self {
            registry,
            timeout,
            push: true,
        }
    }

    /// With `false`, everything is assembled but nothing is sent.
    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    /// Split results into platform manifests, or fail naming every failed platform.
    pub fn collect(results: &[BuildResult]) -> Result<Vec<(Platform, Descriptor)>> {
        let mut built = Vec::with_capacity(results.len());
        let mut failures = Vec::new();

        for result in results {
            match result {
                BuildResult::Succeeded {
                    platform, manifest, ..
                } => built.push((platform.clone(), manifest.clone())),
                BuildResult::Failed { platform, message } => failures.push(PlatformFailure {
                    platform: platform.clone(),
                    message: message.clone(),
                }),
            }
        }

        if !failures.is_empty() {
            return Err(Error::PartialBuildFailure(failures));
        }
        Ok(built)
    }

    /// Log in to the registry hosting `tags`' image.
    pub async fn login(&self, tags: &TagPlan, credentials: &RegistryCredentials) -> Result<()> {
        let host = tags.image().registry();
        self.timed(
            &format!("login to {}", host),
            self.registry.login(host, credentials),
        )
        .await
    }

    /// Publish the index for `results`, which must be every result of the run.
    pub async fn publish(
        &self,
        tags: &TagPlan,
        results: &[BuildResult],
        ctx: &ProvenanceContext<'_>,
    ) -> Result<PublishedManifest> {
        let built = match Self::collect(results) {
            Ok(built) => built,
            Err(e) => {
                error!(error = %e, "Not publishing: platform builds failed");
                return Err(e);
            }
        };

        let image = tags.image();
        let mut attestations = Vec::with_capacity(built.len() * 2);
        for (platform, manifest) in &built {
            attestations.push(attestation::provenance(
                image,
                platform,
                &manifest.digest,
                ctx,
            )?);
            attestations.push(attestation::sbom(
                image,
                platform,
                &manifest.digest,
                ctx.sources,
                ctx.run_id,
                ctx.finished_at,
            )?);
        }

        let bundle = ManifestBundle::assemble(tags, &built, &attestations)?;

        let published = PublishedManifest {
            image: image.clone(),
            digest: bundle.digest.clone(),
            tags: tags.tags().to_vec(),
            platforms: built
                .iter()
                .map(|(platform, manifest)| PlatformDigest {
                    platform: platform.clone(),
                    digest: manifest.digest.clone(),
                })
                .collect(),
            attestations: attestations
                .iter()
                .map(|a| AttestationDigest {
                    kind: a.kind,
                    platform: a.platform.clone(),
                    digest: a.digest(),
                })
                .collect(),
            pushed: self.push,
        };

        if !self.push {
            info!(
                image = %image,
                digest = %bundle.digest,
                tags = ?published.tags,
                "Push disabled, index assembled but not published"
            );
            return Ok(published);
        }

        info!(
            image = %image,
            digest = %bundle.digest,
            platforms = built.len(),
            tags = published.tags.len(),
            registry = self.registry.name(),
            "Publishing index"
        );

        for attestation_manifest in &bundle.attestations {
            for blob in &attestation_manifest.blobs {
                self.timed(
                    &format!("blob upload {}", blob.digest()),
                    self.registry.push_blob(image, blob),
                )
                .await?;
            }

            let reference = attestation_manifest.manifest.descriptor()?.digest;
            self.timed(
                &format!("attestation manifest for {}", attestation_manifest.platform),
                self.registry.push_manifest(
                    image,
                    reference.as_str(),
                    OCI_MANIFEST_MEDIA_TYPE,
                    &attestation_manifest.body,
                ),
            )
            .await?;
        }

        for tag in tags.tags() {
            let digest = self
                .timed(
                    &format!("index push to {}", image.with_tag(tag)),
                    self.registry.push_manifest(
                        image,
                        tag,
                        OCI_INDEX_MEDIA_TYPE,
                        &bundle.index_body,
                    ),
                )
                .await?;
            if digest != bundle.digest {
                warn!(tag = %tag, expected = %bundle.digest, actual = %digest, "Registry reported a different index digest");
            }
            info!(reference = %image.with_tag(tag), "Tag pushed");
        }

        info!(reference = %published.reference(), "Index published");
        Ok(published)
    }

    /// Run one registry call under the publish timeout; every failure is a publish error.
    async fn timed<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(Error::Publish(message))) => Err(Error::Publish(message)),
            Ok(Err(e)) => Err(Error::Publish(format!("{}: {}", what, e))),
            Err(_) => Err(Error::Publish(format!(
                "{} timed out after {:?}",
                what, self.timeout
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use kiln_core::job::BuildDefinition;
    use kiln_core::manifest::{Blob, ImageIndex};
    use kiln_core::source::ResolvedSource;
    use kiln_core::tags::{TagInputs, derive_tag_plan};
    use kiln_core::{BuildRequest, ImageDigest, ImageName, RunId, SourceSet, Trigger};
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Records every registry call.
    #[derive(Default)]
    pub(crate) struct MockRegistry {
        pub logins: Mutex<Vec<String>>,
        pub blobs: Mutex<Vec<ImageDigest>>,
        pub manifests: Mutex<Vec<(String, String, Vec<u8>)>>,
        pub fail_manifests: bool,
        pub hang: bool,
        pub manifest_delay: Option<Duration>,
    }

    impl MockRegistry {
        pub fn push_count(&self) -> usize {
            self.blobs.lock().unwrap().len() + self.manifests.lock().unwrap().len()
        }

        pub fn pushed_tags(&self) -> Vec<String> {
            self.manifests
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, media_type, _)| media_type == OCI_INDEX_MEDIA_TYPE)
                .map(|(reference, _, _)| reference.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Registry for MockRegistry {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn login(&self, registry: &str, _credentials: &RegistryCredentials) -> Result<()> {
            self.logins.lock().unwrap().push(registry.to_string());
            Ok(())
        }

        async fn push_blob(&self, _image: &ImageName, blob: &Blob) -> Result<()> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.blobs.lock().unwrap().push(blob.digest());
            Ok(())
        }

        async fn push_manifest(
            &self,
            _image: &ImageName,
            reference: &str,
            media_type: &str,
            body: &[u8],
        ) -> Result<ImageDigest> {
            if let Some(delay) = self.manifest_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_manifests {
                return Err(Error::Publish("401 Unauthorized".to_string()));
            }
            self.manifests.lock().unwrap().push((
                reference.to_string(),
                media_type.to_string(),
                body.to_vec(),
            ));
            Ok(ImageDigest::of(body))
        }
    }

    struct Fixture {
        request: BuildRequest,
        tags: TagPlan,
        sources: SourceSet,
        build: BuildDefinition,
    }

    impl Fixture {
        fn new() -> Self {
            let request = BuildRequest::new(
                Trigger::from_ref("refs/tags/v1.2.3").unwrap(),
                "abc1234def",
                vec!["linux/amd64".to_string(), "linux/arm64".to_string()],
            )
            .unwrap();
            let tags = derive_tag_plan(
                &request,
                &TagInputs {
                    image: Some("ghcr.io/example/atlas"),
                    source_url: Some("https://github.com/example/atlas"),
                    title: None,
                    created: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
                },
            )
            .unwrap();
            let sources = SourceSet::new().with(
                "primary",
                ResolvedSource {
                    url: "https://github.com/example/atlas.git".to_string(),
                    commit: "abc1234def".to_string(),
                    path: PathBuf::from("/work/primary"),
                },
            );
            Self {
                request,
                tags,
                sources,
                build: BuildDefinition::default(),
            }
        }

        fn ctx(&self) -> ProvenanceContext<'_> {
            let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
            ProvenanceContext {
                run_id: RunId::new(),
                builder_id: "kiln-test",
                request: &self.request,
                sources: &self.sources,
                build: &self.build,
                started_at: at,
                finished_at: at,
            }
        }
    }

    fn succeeded(platform: &str) -> BuildResult {
        BuildResult::Succeeded {
            platform: Platform::parse(platform).unwrap(),
            manifest: Descriptor::of(OCI_MANIFEST_MEDIA_TYPE, platform.as_bytes()),
            cache_hit: false,
        }
    }

    #[tokio::test]
    async fn test_publish_pushes_every_tag() {
        let fixture = Fixture::new();
        let registry = Arc::new(MockRegistry::default());
        let publisher = Publisher::new(registry.clone(), Duration::from_secs(5));

        let results = vec![succeeded("linux/amd64"), succeeded("linux/arm64")];
        let published = publisher
            .publish(&fixture.tags, &results, &fixture.ctx())
            .await
            .unwrap();

        assert!(published.pushed);
        assert_eq!(published.platforms.len(), 2);
        assert_eq!(published.attestations.len(), 4);
        assert_eq!(
            registry.pushed_tags(),
            ["v1.2.3", "1.2.3", "1.2", "1", "sha-abc1234"]
        );

        // Attestation manifests are pushed by digest before any tag.
        let manifests = registry.manifests.lock().unwrap();
        assert!(manifests[0].0.starts_with("sha256:"));
        assert!(manifests[1].0.starts_with("sha256:"));
        assert_eq!(manifests[0].1, OCI_MANIFEST_MEDIA_TYPE);

        let index: ImageIndex = serde_json::from_slice(&manifests[2].2).unwrap();
        let digests: Vec<_> = index.platform_manifests().map(|d| d.digest.clone()).collect();
        assert_eq!(
            digests,
            [
                results[0].digest().unwrap().clone(),
                results[1].digest().unwrap().clone()
            ]
        );
        assert_eq!(ImageDigest::of(&manifests[2].2), published.digest);
    }

    #[tokio::test]
    async fn test_failed_platform_pushes_nothing() {
        let fixture = Fixture::new();
        let registry = Arc::new(MockRegistry::default());
        let publisher = Publisher::new(registry.clone(), Duration::from_secs(5));

        let results = vec![
            succeeded("linux/amd64"),
            BuildResult::failed(Platform::parse("linux/arm64").unwrap(), "exit status 1"),
        ];
        let err = publisher
            .publish(&fixture.tags, &results, &fixture.ctx())
            .await
            .unwrap_err();

        match err {
            Error::PartialBuildFailure(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].platform.to_string(), "linux/arm64");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(registry.push_count(), 0);
    }

    #[tokio::test]
    async fn test_no_push_mode() {
        let fixture = Fixture::new();
        let registry = Arc::new(MockRegistry::default());
        let publisher = Publisher::new(registry.clone(), Duration::from_secs(5)).with_push(false);

        let published = publisher
            .publish(&fixture.tags, &[succeeded("linux/amd64")], &fixture.ctx())
            .await
            .unwrap();
        assert!(!published.pushed);
        assert_eq!(published.tags.len(), 5);
        assert_eq!(registry.push_count(), 0);
    }

    #[tokio::test]
    async fn test_registry_rejection_is_not_retried() {
        let fixture = Fixture::new();
        let registry = Arc::new(MockRegistry {
            fail_manifests: true,
            ..Default::default()
        });
        let publisher = Publisher::new(registry.clone(), Duration::from_secs(5));

        let err = publisher
            .publish(&fixture.tags, &[succeeded("linux/amd64")], &fixture.ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Publish(_)));
        // Config blob and the two statements went up; the manifest failed once.
        assert_eq!(registry.blobs.lock().unwrap().len(), 3);
        assert!(registry.manifests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_timeout_is_publish_error() {
        let fixture = Fixture::new();
        let registry = Arc::new(MockRegistry {
            hang: true,
            ..Default::default()
        });
        let publisher = Publisher::new(registry, Duration::from_millis(50));

        let err = publisher
            .publish(&fixture.tags, &[succeeded("linux/amd64")], &fixture.ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out after 50ms"));
    }
}
