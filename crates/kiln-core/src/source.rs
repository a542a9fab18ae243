//! Source dependencies, resolved source sets and the fetcher trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::Result;

/// Name under which the repository being built is registered.
pub const PRIMARY_SOURCE: &str = "primary";

/// Which revision of a repository to materialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Revision {
    /// An exact commit.
    Commit(String),
    /// A branch or tag name.
    Ref(String),
    /// Whatever the remote's HEAD points at.
    DefaultBranch,
}

/// A repository to fetch before building.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDependency {
    pub name: String,
    pub url: String,
    pub revision: Revision,
    /// Fetch the full history instead of a shallow clone.
    pub full_history: bool,
}

impl SourceDependency {
    /// An auxiliary dependency pinned to a ref, or the default branch when `git_ref` is None.
    pub fn auxiliary(
        name: impl Into<String>,
        url: impl Into<String>,
        git_ref: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            revision: git_ref.map(Revision::Ref).unwrap_or(Revision::DefaultBranch),
            full_history: false,
        }
    }

    /// The primary repository, checked out at an exact commit with full history.
    pub fn primary(url: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            name: PRIMARY_SOURCE.to_string(),
            url: url.into(),
            revision: Revision::Commit(commit.into()),
            full_history: true,
        }
    }
}

/// A dependency after it has been fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub url: String,
    pub commit: String,
    /// Checkout location inside the run's working area.
    #[serde(skip)]
    pub path: PathBuf,
}

/// Mapping from dependency name to its resolved source.
///
/// Built by the resolver and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSet {
    sources: BTreeMap<String, ResolvedSource>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert used while resolving.
    pub fn with(mut self, name: impl Into<String>, source: ResolvedSource) -> Self {
        self.sources.insert(name.into(), source);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedSource> {
        self.sources.get(name)
    }

    pub fn primary(&self) -> Option<&ResolvedSource> {
        self.get(PRIMARY_SOURCE)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ResolvedSource)> {
        self.sources.iter()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// `name=commit` pairs in name order, for fingerprinting.
    pub fn commits(&self) -> Vec<String> {
        self.sources
            .iter()
            .map(|(name, source)| format!("{}={}", name, source.commit))
            .collect()
    }
}

/// Fetches a repository into a directory and reports the commit it checked out.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Name of this fetcher.
    fn name(&self) -> &'static str;

    /// Materialize `dependency` under `dest` and return the resolved commit SHA.
    ///
    /// Unreachable repositories and unknown revisions must fail with `Error::Fetch`.
    async fn fetch(&self, dependency: &SourceDependency, dest: &Path) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(url: &str, commit: &str) -> ResolvedSource {
        ResolvedSource {
            url: url.to_string(),
            commit: commit.to_string(),
            path: PathBuf::from("/tmp/x"),
        }
    }

    #[test]
    fn test_commits_are_name_ordered() {
        let set = SourceSet::new()
            .with("primary", resolved("https://example.com/a.git", "aaa"))
            .with("adapter", resolved("https://example.com/b.git", "bbb"));

        assert_eq!(set.commits(), vec!["adapter=bbb", "primary=aaa"]);
        assert_eq!(set.primary().unwrap().commit, "aaa");
    }

    #[test]
    fn test_auxiliary_defaults_to_default_branch() {
        let dep = SourceDependency::auxiliary("plugins", "https://example.com/p.git", None);
        assert_eq!(dep.revision, Revision::DefaultBranch);
        assert!(!dep.full_history);

        let pinned =
            SourceDependency::auxiliary("plugins", "https://example.com/p.git", Some("main".into()));
        assert_eq!(pinned.revision, Revision::Ref("main".to_string()));
    }
}
