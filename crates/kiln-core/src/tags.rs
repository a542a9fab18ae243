//! Tag and label derivation.
//!
//! Rules, applied independently and unioned with first-seen order kept:
//! - branch push: the (sanitised) branch name
//! - tag push: the tag name verbatim
//! - tags shaped `vMAJOR.MINOR.PATCH`: also `MAJOR.MINOR.PATCH`, `MAJOR.MINOR`, `MAJOR`
//! - always: `sha-<short sha>`

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use crate::{BuildRequest, Error, Result, Trigger};

pub const LABEL_CREATED: &str = "org.opencontainers.image.created";
pub const LABEL_REVISION: &str = "org.opencontainers.image.revision";
pub const LABEL_SOURCE: &str = "org.opencontainers.image.source";
pub const LABEL_VERSION: &str = "org.opencontainers.image.version";
pub const LABEL_TITLE: &str = "org.opencontainers.image.title";

const DEFAULT_REGISTRY: &str = "docker.io";
const MAX_TAG_LEN: usize = 128;

static SEMVER_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v(\d+)\.(\d+)\.(\d+)$").unwrap());

static IMAGE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?::[0-9]+)?(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)+$",
    )
    .unwrap()
});

/// A registry image name without tag or digest, e.g. `ghcr.io/example/atlas`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageName(String);

impl ImageName {
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Configuration(
                "no registry image name configured".to_string(),
            ));
        }
        if !IMAGE_NAME.is_match(name) {
            return Err(Error::Configuration(format!(
                "invalid image name '{}': expected lowercase [registry/]namespace/name",
                name
            )));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Registry host. Names whose first component is not a hostname live on Docker Hub.
    pub fn registry(&self) -> &str {
        match self.0.split_once('/') {
            Some((first, _)) if is_registry_host(first) => first,
            _ => DEFAULT_REGISTRY,
        }
    }

    /// Repository path inside the registry.
    pub fn repository(&self) -> &str {
        match self.0.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => rest,
            _ => &self.0,
        }
    }

    /// `name:tag`
    pub fn with_tag(&self, tag: &str) -> String {
        format!("{}:{}", self.0, tag)
    }

    /// `name@digest`
    pub fn with_digest(&self, digest: &str) -> String {
        format!("{}@{}", self.0, digest)
    }
}

fn is_registry_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ImageName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ImageName> for String {
    fn from(name: ImageName) -> Self {
        name.0
    }
}

/// Output tags and labels for one build request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagPlan {
    image: ImageName,
    tags: Vec<String>,
    labels: BTreeMap<String, String>,
}

impl TagPlan {
    pub fn image(&self) -> &ImageName {
        &self.image
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Labels that depend only on the build inputs, for baking into platform images.
    ///
    /// `created` and `version` change per run or per trigger and live on the index only.
    pub fn image_labels(&self) -> BTreeMap<String, String> {
        self.labels
            .iter()
            .filter(|(key, _)| key.as_str() != LABEL_CREATED && key.as_str() != LABEL_VERSION)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Full image references, one per tag, in plan order.
    pub fn references(&self) -> Vec<String> {
        self.tags.iter().map(|t| self.image.with_tag(t)).collect()
    }
}

/// Operator-supplied inputs to tag derivation besides the request itself.
#[derive(Debug, Clone)]
pub struct TagInputs<'a> {
    /// Registry image name; required.
    pub image: Option<&'a str>,
    /// Repository URL recorded in the source label.
    pub source_url: Option<&'a str>,
    /// Human-readable image title.
    pub title: Option<&'a str>,
    /// Build timestamp, captured once per run.
    pub created: DateTime<Utc>,
}

/// Derive the tag plan for a request. Pure: equal inputs give equal plans.
pub fn derive_tag_plan(request: &BuildRequest, inputs: &TagInputs<'_>) -> Result<TagPlan> {
    let image = ImageName::parse(inputs.image.unwrap_or_default())?;

    let mut tags: Vec<String> = Vec::new();
    let mut push = |tag: String| {
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    };

    match request.trigger() {
        Trigger::BranchPush { branch } => push(sanitize_tag(branch)),
        Trigger::TagPush { tag } => {
            push(tag.clone());
            for derived in semver_tags(tag) {
                push(derived);
            }
        }
    }
    push(format!("sha-{}", request.short_sha()));

    let mut labels = BTreeMap::new();
    labels.insert(
        LABEL_CREATED.to_string(),
        inputs.created.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    labels.insert(
        LABEL_REVISION.to_string(),
        request.commit_sha().to_string(),
    );
    if let Some(url) = inputs.source_url {
        labels.insert(LABEL_SOURCE.to_string(), url.to_string());
    }
    if let Some(version) = tags.first() {
        labels.insert(LABEL_VERSION.to_string(), version.clone());
    }
    if let Some(title) = inputs.title {
        labels.insert(LABEL_TITLE.to_string(), title.to_string());
    }

    Ok(TagPlan {
        image,
        tags,
        labels,
    })
}

/// `MAJOR.MINOR.PATCH`, `MAJOR.MINOR`, `MAJOR` for a `vMAJOR.MINOR.PATCH` tag, else nothing.
fn semver_tags(tag: &str) -> Vec<String> {
    match SEMVER_TAG.captures(tag) {
        Some(caps) => {
            let (major, minor, patch) = (&caps[1], &caps[2], &caps[3]);
            vec![
                format!("{}.{}.{}", major, minor, patch),
                format!("{}.{}", major, minor),
                major.to_string(),
            ]
        }
        None => Vec::new(),
    }
}

/// Turn a branch name into a valid image tag.
fn sanitize_tag(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();

    replaced
        .trim_start_matches(['.', '-'])
        .chars()
        .take(MAX_TAG_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn created() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    fn inputs() -> TagInputs<'static> {
        TagInputs {
            image: Some("ghcr.io/example/atlas"),
            source_url: Some("https://github.com/example/atlas"),
            title: None,
            created: created(),
        }
    }

    fn request(git_ref: &str, sha: &str) -> BuildRequest {
        BuildRequest::new(Trigger::from_ref(git_ref).unwrap(), sha, vec![]).unwrap()
    }

    #[test]
    fn test_semver_tag_push() {
        let plan = derive_tag_plan(&request("refs/tags/v1.2.3", "abc123"), &inputs()).unwrap();
        assert_eq!(plan.tags(), ["v1.2.3", "1.2.3", "1.2", "1", "sha-abc123"]);
    }

    #[test]
    fn test_branch_push() {
        let plan = derive_tag_plan(
            &request("refs/heads/dev", "0123456789abcdef"),
            &inputs(),
        )
        .unwrap();
        assert_eq!(plan.tags(), ["dev", "sha-0123456"]);
        assert_eq!(
            plan.references(),
            ["ghcr.io/example/atlas:dev", "ghcr.io/example/atlas:sha-0123456"]
        );
    }

    #[test]
    fn test_non_semver_tag_is_verbatim_only() {
        let plan = derive_tag_plan(&request("refs/tags/v1.2", "abcdef0"), &inputs()).unwrap();
        assert_eq!(plan.tags(), ["v1.2", "sha-abcdef0"]);

        let plan = derive_tag_plan(&request("refs/tags/v1.2.3-rc1", "abcdef0"), &inputs()).unwrap();
        assert_eq!(plan.tags(), ["v1.2.3-rc1", "sha-abcdef0"]);
    }

    #[test]
    fn test_duplicates_collapse() {
        // A branch literally named like the sha tag collapses into one entry.
        let plan = derive_tag_plan(&request("refs/heads/sha-abcdef0", "abcdef0"), &inputs()).unwrap();
        assert_eq!(plan.tags(), ["sha-abcdef0"]);
    }

    #[test]
    fn test_branch_names_are_sanitised() {
        let plan = derive_tag_plan(&request("refs/heads/feature/x", "abcdef0"), &inputs()).unwrap();
        assert_eq!(plan.tags()[0], "feature-x");
    }

    #[test]
    fn test_labels() {
        let plan = derive_tag_plan(&request("refs/tags/v2.0.0", "abcdef0123"), &inputs()).unwrap();
        let labels = plan.labels();
        assert_eq!(labels[LABEL_CREATED], "2024-05-01T12:30:00Z");
        assert_eq!(labels[LABEL_REVISION], "abcdef0123");
        assert_eq!(labels[LABEL_SOURCE], "https://github.com/example/atlas");
        assert_eq!(labels[LABEL_VERSION], "v2.0.0");
        assert!(!labels.contains_key(LABEL_TITLE));
    }

    #[test]
    fn test_image_labels_are_the_same_for_branch_and_tag_push() {
        let branch = derive_tag_plan(&request("refs/heads/main", "abcdef0123"), &inputs()).unwrap();
        let tag = derive_tag_plan(&request("refs/tags/v1.2.3", "abcdef0123"), &inputs()).unwrap();

        let labels = tag.image_labels();
        assert_eq!(labels, branch.image_labels());
        assert!(!labels.contains_key(LABEL_CREATED));
        assert!(!labels.contains_key(LABEL_VERSION));
        assert_eq!(labels[LABEL_REVISION], "abcdef0123");
    }

    #[test]
    fn test_missing_image_name_is_configuration_error() {
        let mut no_image = inputs();
        no_image.image = None;
        let err = derive_tag_plan(&request("refs/heads/main", "abcdef0"), &no_image).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let req = request("refs/tags/v1.2.3", "abc123");
        assert_eq!(
            derive_tag_plan(&req, &inputs()).unwrap(),
            derive_tag_plan(&req, &inputs()).unwrap()
        );
    }

    #[test]
    fn test_image_name_registry_split() {
        let ghcr = ImageName::parse("ghcr.io/example/atlas").unwrap();
        assert_eq!(ghcr.registry(), "ghcr.io");
        assert_eq!(ghcr.repository(), "example/atlas");

        let hub = ImageName::parse("example/atlas").unwrap();
        assert_eq!(hub.registry(), "docker.io");
        assert_eq!(hub.repository(), "example/atlas");

        let local = ImageName::parse("localhost:5000/atlas").unwrap();
        assert_eq!(local.registry(), "localhost:5000");
        assert_eq!(local.repository(), "atlas");
    }

    #[test]
    fn test_image_name_rejects_invalid() {
        assert!(ImageName::parse("Example/Atlas").is_err());
        assert!(ImageName::parse("atlas").is_err());
        assert!(ImageName::parse("ghcr.io/example/atlas:latest").is_err());
    }
}
