//! Build requests and the source-control events that create them.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const SHORT_SHA_LEN: usize = 7;

/// What kind of push started a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Push to a branch.
    BranchPush { branch: String },
    /// Push of a tag.
    TagPush { tag: String },
}

impl Trigger {
    /// Parse a fully qualified git ref (`refs/heads/main`, `refs/tags/v1.2.3`).
    pub fn from_ref(git_ref: &str) -> Result<Self> {
        if let Some(branch) = git_ref.strip_prefix("refs/heads/") {
            if !branch.is_empty() {
                return Ok(Trigger::BranchPush {
                    branch: branch.to_string(),
                });
            }
        } else if let Some(tag) = git_ref.strip_prefix("refs/tags/") {
            if !tag.is_empty() {
                return Ok(Trigger::TagPush {
                    tag: tag.to_string(),
                });
            }
        }

        Err(Error::Configuration(format!(
            "unsupported git ref '{}': expected refs/heads/<branch> or refs/tags/<tag>",
            git_ref
        )))
    }

    /// Branch or tag name without the `refs/...` prefix.
    pub fn ref_name(&self) -> &str {
        match self {
            Trigger::BranchPush { branch } => branch,
            Trigger::TagPush { tag } => tag,
        }
    }

    pub fn full_ref(&self) -> String {
        match self {
            Trigger::BranchPush { branch } => format!("refs/heads/{}", branch),
            Trigger::TagPush { tag } => format!("refs/tags/{}", tag),
        }
    }

    pub fn branch(&self) -> Option<&str> {
        match self {
            Trigger::BranchPush { branch } => Some(branch),
            Trigger::TagPush { .. } => None,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            Trigger::TagPush { tag } => Some(tag),
            Trigger::BranchPush { .. } => None,
        }
    }
}

/// A request to build and publish one commit for a set of platforms.
///
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    trigger: Trigger,
    commit_sha: String,
    platforms: Vec<String>,
}

impl BuildRequest {
    /// Create a request. The commit SHA must be a non-empty hex string.
    ///
    /// Platforms are kept as given; the planner validates them.
    pub fn new(
        trigger: Trigger,
        commit_sha: impl Into<String>,
        platforms: Vec<String>,
    ) -> Result<Self> {
        let commit_sha = commit_sha.into().trim().to_ascii_lowercase();
        if commit_sha.is_empty() || !commit_sha.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Configuration(format!(
                "invalid commit sha '{}'",
                commit_sha
            )));
        }

        Ok(Self {
            trigger,
            commit_sha,
            platforms,
        })
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn commit_sha(&self) -> &str {
        &self.commit_sha
    }

    /// First seven characters of the commit SHA.
    pub fn short_sha(&self) -> &str {
        let end = self.commit_sha.len().min(SHORT_SHA_LEN);
        &self.commit_sha[..end]
    }

    pub fn platforms(&self) -> &[String] {
        &self.platforms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_from_branch_ref() {
        let trigger = Trigger::from_ref("refs/heads/feature/x").unwrap();
        assert_eq!(
            trigger,
            Trigger::BranchPush {
                branch: "feature/x".to_string()
            }
        );
        assert_eq!(trigger.full_ref(), "refs/heads/feature/x");
    }

    #[test]
    fn test_trigger_from_tag_ref() {
        let trigger = Trigger::from_ref("refs/tags/v1.2.3").unwrap();
        assert_eq!(trigger.tag(), Some("v1.2.3"));
        assert_eq!(trigger.branch(), None);
    }

    #[test]
    fn test_trigger_rejects_other_refs() {
        assert!(Trigger::from_ref("refs/pull/12/merge").is_err());
        assert!(Trigger::from_ref("main").is_err());
        assert!(Trigger::from_ref("refs/heads/").is_err());
    }

    #[test]
    fn test_short_sha() {
        let req = BuildRequest::new(
            Trigger::from_ref("refs/heads/main").unwrap(),
            "ABC1234567890",
            vec![],
        )
        .unwrap();
        assert_eq!(req.commit_sha(), "abc1234567890");
        assert_eq!(req.short_sha(), "abc1234");

        let short = BuildRequest::new(
            Trigger::from_ref("refs/heads/main").unwrap(),
            "abc123",
            vec![],
        )
        .unwrap();
        assert_eq!(short.short_sha(), "abc123");
    }

    #[test]
    fn test_rejects_non_hex_sha() {
        let trigger = Trigger::from_ref("refs/heads/main").unwrap();
        assert!(BuildRequest::new(trigger.clone(), "", vec![]).is_err());
        assert!(BuildRequest::new(trigger, "not-a-sha", vec![]).is_err());
    }
}
