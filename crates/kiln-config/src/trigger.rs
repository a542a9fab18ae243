//! Trigger rules and trigger context discovery.

use kiln_core::Trigger;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

/// An `on` rule from the pipeline file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerRule {
    /// Push to a branch matching any of the globs.
    Push { branches: Vec<String> },
    /// Push of a tag matching the glob.
    Tag { pattern: String },
}

impl TriggerRule {
    pub fn matches(&self, trigger: &Trigger) -> bool {
        match (self, trigger) {
            (TriggerRule::Push { branches }, Trigger::BranchPush { branch }) => {
                branches.iter().any(|glob| glob_matches(glob, branch))
            }
            (TriggerRule::Tag { pattern }, Trigger::TagPush { tag }) => glob_matches(pattern, tag),
            _ => false,
        }
    }
}

impl std::fmt::Display for TriggerRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerRule::Push { branches } => write!(f, "push to {}", branches.join(", ")),
            TriggerRule::Tag { pattern } => write!(f, "tag {}", pattern),
        }
    }
}

/// Shell-style glob match: `*` is any run of characters, `?` exactly one.
pub fn glob_matches(glob: &str, value: &str) -> bool {
    let mut pattern = String::with_capacity(glob.len() + 2);
    pattern.push('^');
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');

    Regex::new(&pattern)
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

/// The ref and commit a run builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerContext {
    pub git_ref: String,
    pub commit_sha: String,
}

impl TriggerContext {
    /// Explicit values win; otherwise the usual CI environment variables are consulted.
    pub fn discover(explicit_ref: Option<&str>, explicit_sha: Option<&str>) -> ConfigResult<Self> {
        Self::discover_with(explicit_ref, explicit_sha, |key| std::env::var(key).ok())
    }

    pub fn discover_with(
        explicit_ref: Option<&str>,
        explicit_sha: Option<&str>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ConfigResult<Self> {
        let first = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| lookup(key))
                .find(|value| !value.is_empty())
        };

        let git_ref = explicit_ref
            .map(str::to_string)
            .or_else(|| first(&["KILN_REF", "GITHUB_REF"]))
            .ok_or_else(|| ConfigError::MissingField("git ref (--ref or KILN_REF)".to_string()))?;

        let commit_sha = explicit_sha
            .map(str::to_string)
            .or_else(|| first(&["KILN_COMMIT_SHA", "GITHUB_SHA", "GIT_COMMIT"]))
            .ok_or_else(|| {
                ConfigError::MissingField("commit sha (--sha or KILN_COMMIT_SHA)".to_string())
            })?;

        Ok(Self {
            git_ref,
            commit_sha,
        })
    }
}
