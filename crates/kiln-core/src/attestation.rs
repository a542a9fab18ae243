//! Provenance and SBOM attestations.
//!
//! Both are in-toto statements whose subject is one platform image. Payloads
//! are serialized from `serde_json::Value`, whose maps are key-sorted, so the
//! bytes (and therefore digests) are stable for equal inputs.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::job::BuildDefinition;
use crate::manifest::{Blob, IN_TOTO_MEDIA_TYPE};
use crate::tags::ImageName;
use crate::{BuildRequest, Error, ImageDigest, Platform, Result, RunId, SourceSet};

pub const STATEMENT_TYPE: &str = "https://in-toto.io/Statement/v0.1";
pub const PROVENANCE_PREDICATE: &str = "https://slsa.dev/provenance/v0.2";
pub const SBOM_PREDICATE: &str = "https://spdx.dev/Document";
pub const BUILD_TYPE: &str = "https://kiln.dev/build/buildx@v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttestationKind {
    Provenance,
    Sbom,
}

/// A signed-off statement about one platform image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    pub kind: AttestationKind,
    pub platform: Platform,
    pub subject: ImageDigest,
    pub predicate_type: &'static str,
    /// Serialized in-toto statement.
    pub statement: Vec<u8>,
}

impl Attestation {
    pub fn digest(&self) -> ImageDigest {
        ImageDigest::of(&self.statement)
    }

    pub fn blob(&self) -> Blob {
        Blob {
            media_type: IN_TOTO_MEDIA_TYPE.to_string(),
            data: self.statement.clone(),
        }
    }
}

/// Run-wide facts recorded in provenance.
#[derive(Debug, Clone)]
pub struct ProvenanceContext<'a> {
    pub run_id: RunId,
    pub builder_id: &'a str,
    pub request: &'a BuildRequest,
    pub sources: &'a SourceSet,
    pub build: &'a BuildDefinition,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// SLSA provenance for one platform image.
pub fn provenance(
    image: &ImageName,
    platform: &Platform,
    subject: &ImageDigest,
    ctx: &ProvenanceContext<'_>,
) -> Result<Attestation> {
    let materials: Vec<Value> = ctx
        .sources
        .iter()
        .map(|(name, source)| {
            json!({
                "uri": format!("git+{}", source.url),
                "digest": { "sha1": source.commit },
                "annotations": { "name": name },
            })
        })
        .collect();

    let config_source = match ctx.sources.primary() {
        Some(primary) => json!({
            "uri": format!("git+{}@{}", primary.url, ctx.request.trigger().full_ref()),
            "digest": { "sha1": primary.commit },
            "entryPoint": ctx.build.dockerfile,
        }),
        None => json!({ "entryPoint": ctx.build.dockerfile }),
    };

    let predicate = json!({
        "builder": { "id": ctx.builder_id },
        "buildType": BUILD_TYPE,
        "invocation": {
            "configSource": config_source,
            "parameters": {
                "platform": platform.to_string(),
                "context": ctx.build.context,
                "args": ctx.build.public_args(),
            },
            "environment": { "runId": ctx.run_id.to_string() },
        },
        "metadata": {
            "buildInvocationId": ctx.run_id.to_string(),
            "buildStartedOn": rfc3339(ctx.started_at),
            "buildFinishedOn": rfc3339(ctx.finished_at),
            "reproducible": false,
            "completeness": { "parameters": true, "environment": false, "materials": true },
        },
        "materials": materials,
    });

    statement(
        AttestationKind::Provenance,
        PROVENANCE_PREDICATE,
        image,
        platform,
        subject,
        predicate,
    )
}

/// SPDX bill of materials listing every fetched source for one platform image.
pub fn sbom(
    image: &ImageName,
    platform: &Platform,
    subject: &ImageDigest,
    sources: &SourceSet,
    run_id: RunId,
    created: DateTime<Utc>,
) -> Result<Attestation> {
    let packages: Vec<Value> = sources
        .iter()
        .map(|(name, source)| {
            json!({
                "SPDXID": format!("SPDXRef-Package-{}", spdx_id(name)),
                "name": name,
                "versionInfo": source.commit,
                "downloadLocation": format!("git+{}@{}", source.url, source.commit),
                "filesAnalyzed": false,
            })
        })
        .collect();

    let predicate = json!({
        "spdxVersion": "SPDX-2.3",
        "dataLicense": "CC0-1.0",
        "SPDXID": "SPDXRef-DOCUMENT",
        "name": format!("{}@{}", image, subject),
        "documentNamespace": format!("https://kiln.dev/spdx/{}/{}/{}", image, platform.slug(), run_id),
        "creationInfo": {
            "created": rfc3339(created),
            "creators": [format!("Tool: kiln-{}", env!("CARGO_PKG_VERSION"))],
        },
        "packages": packages,
    });

    statement(
        AttestationKind::Sbom,
        SBOM_PREDICATE,
        image,
        platform,
        subject,
        predicate,
    )
}

fn statement(
    kind: AttestationKind,
    predicate_type: &'static str,
    image: &ImageName,
    platform: &Platform,
    subject: &ImageDigest,
    predicate: Value,
) -> Result<Attestation> {
    let statement = json!({
        "_type": STATEMENT_TYPE,
        "predicateType": predicate_type,
        "subject": [{
            "name": image.with_digest(subject.as_str()),
            "digest": { "sha256": subject.hex() },
        }],
        "predicate": predicate,
    });

    let bytes = serde_json::to_vec(&statement)
        .map_err(|e| Error::Internal(format!("failed to serialize attestation: {}", e)))?;

    Ok(Attestation {
        kind,
        platform: platform.clone(),
        subject: subject.clone(),
        predicate_type,
        statement: bytes,
    })
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn spdx_id(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Trigger;
    use crate::source::ResolvedSource;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn fixtures() -> (ImageName, Platform, ImageDigest, BuildRequest, SourceSet) {
        let image = ImageName::parse("ghcr.io/example/atlas").unwrap();
        let platform = Platform::parse("linux/arm64").unwrap();
        let subject = ImageDigest::of(b"platform-manifest");
        let request = BuildRequest::new(
            Trigger::from_ref("refs/tags/v1.2.3").unwrap(),
            "abc123",
            vec!["linux/arm64".to_string()],
        )
        .unwrap();
        let sources = SourceSet::new()
            .with(
                "primary",
                ResolvedSource {
                    url: "https://github.com/example/atlas.git".to_string(),
                    commit: "abc123".to_string(),
                    path: PathBuf::new(),
                },
            )
            .with(
                "adapter",
                ResolvedSource {
                    url: "https://github.com/example/adapter.git".to_string(),
                    commit: "def456".to_string(),
                    path: PathBuf::new(),
                },
            );
        (image, platform, subject, request, sources)
    }

    #[test]
    fn test_provenance_statement() {
        let (image, platform, subject, request, sources) = fixtures();
        let build = BuildDefinition {
            dockerfile: "Dockerfile".to_string(),
            context: ".".to_string(),
            ..Default::default()
        };
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let ctx = ProvenanceContext {
            run_id: RunId::new(),
            builder_id: "https://kiln.dev/builder",
            request: &request,
            sources: &sources,
            build: &build,
            started_at: at,
            finished_at: at,
        };

        let att = provenance(&image, &platform, &subject, &ctx).unwrap();
        assert_eq!(att.kind, AttestationKind::Provenance);

        let value: Value = serde_json::from_slice(&att.statement).unwrap();
        assert_eq!(value["predicateType"], PROVENANCE_PREDICATE);
        assert_eq!(value["subject"][0]["digest"]["sha256"], subject.hex());
        assert_eq!(value["predicate"]["invocation"]["parameters"]["platform"], "linux/arm64");
        assert_eq!(value["predicate"]["materials"].as_array().unwrap().len(), 2);
        assert_eq!(
            value["predicate"]["invocation"]["configSource"]["uri"],
            "git+https://github.com/example/atlas.git@refs/tags/v1.2.3"
        );
    }

    #[test]
    fn test_sbom_lists_every_source() {
        let (image, platform, subject, _request, sources) = fixtures();
        let run_id = RunId::new();
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();

        let att = sbom(&image, &platform, &subject, &sources, run_id, created).unwrap();
        let value: Value = serde_json::from_slice(&att.statement).unwrap();
        let packages = value["predicate"]["packages"].as_array().unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0]["name"], "adapter");
        assert_eq!(packages[0]["versionInfo"], "def456");

        let again = sbom(&image, &platform, &subject, &sources, run_id, created).unwrap();
        assert_eq!(att.digest(), again.digest());
    }
}
