//! Variable interpolation for build arguments.
//!
//! Supports variables like:
//! - `${git.sha}` - Full git commit SHA
//! - `${git.short_sha}` - Short (7 char) git commit SHA
//! - `${git.branch}` - Branch name (branch pushes only)
//! - `${git.tag}` - Git tag (tag pushes only)
//! - `${git.ref}` - Branch or tag name
//! - `${pipeline.name}` - Pipeline name
//! - `${pipeline.image}` - Registry image name
//! - `${run.id}` - Run ID
//! - `${env.VAR_NAME}` - Environment variable
//! - `${secrets.SECRET_NAME}` - Secret value (from `KILN_SECRET_<NAME>`)
//! - `${timestamp}` - Unix timestamp of the run
//! - `${date}` - ISO date (YYYY-MM-DD) of the run
//! - `${datetime}` - ISO datetime of the run
//!
//! Time variables all read the same instant, fixed when the context is built.

use chrono::{DateTime, Utc};
use kiln_core::{BuildRequest, RunId, Trigger};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

const SECRET_ENV_PREFIX: &str = "KILN_SECRET_";

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone)]
pub struct VariableContext {
    /// Git-related variables
    pub git: GitContext,
    pub pipeline_name: String,
    pub image: String,
    pub run: RunContext,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Secrets (masked wherever arguments are recorded)
    pub secrets: HashMap<String, String>,
    /// Instant every time variable resolves to
    pub now: DateTime<Utc>,
}

/// Git context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub ref_name: String,
}

/// Run context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub id: String,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

impl Default for VariableContext {
    fn default() -> Self {
        Self {
            git: GitContext::default(),
            pipeline_name: String::new(),
            image: String::new(),
            run: RunContext::default(),
            env: HashMap::new(),
            secrets: HashMap::new(),
            now: Utc::now(),
        }
    }
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for one run of a pipeline.
    pub fn for_run(
        request: &BuildRequest,
        pipeline_name: &str,
        image: &str,
        run_id: RunId,
        now: DateTime<Utc>,
    ) -> Self {
        let mut builder = VariableContextBuilder::new()
            .with_git_sha(request.commit_sha())
            .with_pipeline(pipeline_name, image)
            .with_run(run_id.to_string())
            .with_now(now);
        builder = match request.trigger() {
            Trigger::BranchPush { branch } => builder.with_git_branch(branch.clone()),
            Trigger::TagPush { tag } => builder.with_git_tag(tag.clone()),
        };
        builder.build()
    }

    /// Populate environment variables and `KILN_SECRET_*` secrets from the process environment.
    pub fn populate_env(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix(SECRET_ENV_PREFIX) {
                self.secrets.insert(name.to_string(), value);
            } else {
                self.env.insert(key, value);
            }
        }
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["git", "sha"] => Some(self.git.sha.clone()),
            ["git", "short_sha"] => Some(self.git.short_sha.clone()),
            ["git", "branch"] => self.git.branch.clone(),
            ["git", "tag"] => self.git.tag.clone(),
            ["git", "ref"] => Some(self.git.ref_name.clone()),

            ["pipeline", "name"] => Some(self.pipeline_name.clone()),
            ["pipeline", "image"] => Some(self.image.clone()),

            ["run", "id"] => Some(self.run.id.clone()),

            ["env", name] => self.env.get(*name).cloned(),
            ["secrets", name] => self.secrets.get(*name).cloned(),

            ["timestamp"] => Some(self.now.timestamp().to_string()),
            ["date"] => Some(self.now.format("%Y-%m-%d").to_string()),
            ["datetime"] => Some(self.now.format("%Y-%m-%dT%H:%M:%SZ").to_string()),

            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    /// Unknown variables are left as written.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Whether a template changes value between runs of the same commit.
    pub fn is_volatile(template: &str) -> bool {
        variable_names(template)
            .any(|name| matches!(name, "timestamp" | "date" | "datetime" | "run.id"))
    }

    /// Whether a template pulls in a secret.
    pub fn references_secret(template: &str) -> bool {
        variable_names(template).any(|name| name.starts_with("secrets."))
    }
}

fn variable_names(template: &str) -> impl Iterator<Item = &str> {
    VAR_REGEX
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_git_sha(mut self, sha: impl Into<String>) -> Self {
        let sha = sha.into();
        self.ctx.git.short_sha = sha.chars().take(7).collect();
        self.ctx.git.sha = sha;
        self
    }

    pub fn with_git_branch(mut self, branch: impl Into<String>) -> Self {
        let branch = branch.into();
        self.ctx.git.ref_name = branch.clone();
        self.ctx.git.branch = Some(branch);
        self
    }

    pub fn with_git_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        self.ctx.git.ref_name = tag.clone();
        self.ctx.git.tag = Some(tag);
        self
    }

    pub fn with_pipeline(mut self, name: impl Into<String>, image: impl Into<String>) -> Self {
        self.ctx.pipeline_name = name.into();
        self.ctx.image = image.into();
        self
    }

    pub fn with_run(mut self, id: impl Into<String>) -> Self {
        self.ctx.run.id = id.into();
        self
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.ctx.now = now;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.secrets.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
