//! Source resolver - fetches the primary repository and auxiliary dependencies.

use async_trait::async_trait;
use futures::future::join_all;
use kiln_core::source::{PRIMARY_SOURCE, Revision};
use kiln_core::{
    BuildRequest, Error, ResolvedSource, Result, SourceDependency, SourceFetcher, SourceSet,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Scoped working area holding one run's checkouts.
///
/// Everything under it is deleted when the workspace is dropped.
#[derive(Debug)]
pub struct SourceWorkspace {
    dir: TempDir,
}

impl SourceWorkspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Checkout directory for one dependency.
    fn checkout_dir(&self, dependency: &SourceDependency) -> PathBuf {
        let key = format!("{}\0{}", dependency.name, dependency.url);
        self.dir.path().join(format!("{:x}", md5::compute(key)))
    }
}

/// Resolves the sources of a build request into a `SourceSet`.
#[derive(Clone)]
pub struct SourceResolver {
    fetcher: Arc<dyn SourceFetcher>,
    work_root: Option<PathBuf>,
}

impl SourceResolver {
    pub fn new(fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self {
            fetcher,
            work_root: None,
        }
    }

    /// Create workspaces under `root` instead of the system temp dir.
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }

    /// Create a fresh working area for one run.
    pub fn workspace(&self) -> Result<SourceWorkspace> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("kiln-run-");
        let dir = match &self.work_root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|e| {
                    Error::Internal(format!(
                        "failed to create work root {}: {}",
                        root.display(),
                        e
                    ))
                })?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| Error::Internal(format!("failed to create working area: {}", e)))?;

        Ok(SourceWorkspace { dir })
    }

    /// Fetch the primary repository at the request's commit plus every auxiliary dependency.
    ///
    /// Fetches run concurrently; the first failure in declaration order is returned.
    pub async fn resolve(
        &self,
        request: &BuildRequest,
        primary_url: &str,
        auxiliary: &[SourceDependency],
        workspace: &SourceWorkspace,
    ) -> Result<SourceSet> {
        let mut dependencies = vec![SourceDependency::primary(primary_url, request.commit_sha())];
        dependencies.extend(auxiliary.iter().cloned());

        let mut seen = HashSet::new();
        for dep in &dependencies {
            if !seen.insert(dep.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "source dependency '{}' is declared more than once",
                    dep.name
                )));
            }
        }

        info!(
            sources = dependencies.len(),
            fetcher = self.fetcher.name(),
            "Resolving sources"
        );

        let fetches = dependencies.iter().map(|dep| {
            let dest = workspace.checkout_dir(dep);
            async move {
                let commit = self.fetcher.fetch(dep, &dest).await?;
                Ok::<_, Error>((dep, commit, dest))
            }
        });

        let mut sources = SourceSet::new();
        for outcome in join_all(fetches).await {
            let (dep, commit, path) = outcome?;

            if dep.name == PRIMARY_SOURCE && !commit.starts_with(request.commit_sha()) {
                return Err(Error::fetch(
                    &dep.name,
                    format!(
                        "checked out {} but the request is for {}",
                        commit,
                        request.commit_sha()
                    ),
                ));
            }

            debug!(name = %dep.name, commit = %commit, "Source resolved");
            sources = sources.with(
                dep.name.clone(),
                ResolvedSource {
                    url: dep.url.clone(),
                    commit,
                    path,
                },
            );
        }

        Ok(sources)
    }
}

/// Fetches repositories with the `git` command line.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    git_bin: String,
    access_token: Option<String>,
}

impl GitFetcher {
    pub fn new() -> Self {
        Self {
            git_bin: "git".to_string(),
            access_token: None,
        }
    }

    /// Authenticate `https://` clones with a token.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.access_token = (!token.is_empty()).then_some(token);
        self
    }

    pub fn with_git_bin(mut self, bin: impl Into<String>) -> Self {
        self.git_bin = bin.into();
        self
    }

    /// https://github.com/owner/repo.git -> https://token@github.com/owner/repo.git
    fn authenticated_url(&self, url: &str) -> String {
        match (&self.access_token, url.strip_prefix("https://")) {
            (Some(token), Some(rest)) => format!("https://{}@{}", token, rest),
            _ => url.to_string(),
        }
    }

    fn redact(&self, text: &str) -> String {
        match &self.access_token {
            Some(token) => text.replace(token.as_str(), "[REDACTED]"),
            None => text.to_string(),
        }
    }

    async fn git(&self, name: &str, args: &[&str], cwd: Option<&Path>) -> Result<String> {
        let mut command = Command::new(&self.git_bin);
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = command
            .output()
            .await
            .map_err(|e| Error::fetch(name, format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // The token may appear in git's own messages.
            warn!(name = %name, "Git command failed");
            return Err(Error::fetch(name, self.redact(stderr.trim())));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for GitFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn fetch(&self, dependency: &SourceDependency, dest: &Path) -> Result<String> {
        let name = dependency.name.as_str();
        let url = self.authenticated_url(&dependency.url);
        let dest_str = dest.to_string_lossy().to_string();

        info!(name = %name, url = %dependency.url, path = %dest.display(), "Fetching source");

        match &dependency.revision {
            Revision::Commit(commit) => {
                let mut args = vec!["clone", "--no-checkout"];
                if !dependency.full_history {
                    args.push("--filter=blob:none");
                }
                args.extend([url.as_str(), dest_str.as_str()]);
                self.git(name, &args, None).await?;
                self.git(name, &["checkout", "--quiet", "--detach", commit], Some(dest))
                    .await?;
            }
            Revision::Ref(git_ref) => {
                let mut args = vec!["clone", "--single-branch", "--branch", git_ref.as_str()];
                if !dependency.full_history {
                    args.extend(["--depth", "1"]);
                }
                args.extend([url.as_str(), dest_str.as_str()]);
                self.git(name, &args, None).await?;
            }
            Revision::DefaultBranch => {
                let mut args = vec!["clone", "--single-branch"];
                if !dependency.full_history {
                    args.extend(["--depth", "1"]);
                }
                args.extend([url.as_str(), dest_str.as_str()]);
                self.git(name, &args, None).await?;
            }
        }

        let commit = self.git(name, &["rev-parse", "HEAD"], Some(dest)).await?;
        info!(name = %name, commit = %commit, "Source fetched");
        Ok(commit)
    }
}
