//! Pipeline configuration parsing.

use crate::trigger::TriggerRule;
use crate::variables::VariableContext;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use kiln_core::job::BuildDefinition;
use kiln_core::source::{PRIMARY_SOURCE, SourceDependency};
use kiln_core::{CacheMode, CacheRef, ImageName, Platform, Trigger};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// A parsed `kiln.kdl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub image: ImageName,
    pub title: Option<String>,
    /// Empty means every branch and tag push builds.
    pub triggers: Vec<TriggerRule>,
    /// Raw platform identifiers, in requested order.
    pub platforms: Vec<String>,
    /// URL of the repository being built.
    pub source: String,
    pub dependencies: Vec<DependencyConfig>,
    pub build: BuildConfig,
    pub cache: CacheConfig,
    pub push: bool,
    pub timeouts: Timeouts,
    pub max_parallel: Option<usize>,
}

/// An auxiliary repository fetched next to the primary one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyConfig {
    pub name: String,
    pub url: String,
    /// Branch or tag; None means the remote's default branch.
    pub git_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub dockerfile: String,
    pub context: String,
    /// Argument templates in declaration order.
    pub args: Vec<(String, String)>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            dockerfile: "Dockerfile".to_string(),
            context: ".".to_string(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub read: String,
    pub write: String,
    pub mode: CacheMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    pub build: Duration,
    pub publish: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            build: DEFAULT_BUILD_TIMEOUT,
            publish: DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

impl PipelineConfig {
    /// The first rule matching `trigger`.
    pub fn matching_rule(&self, trigger: &Trigger) -> Option<&TriggerRule> {
        self.triggers.iter().find(|rule| rule.matches(trigger))
    }

    /// With no rules configured every push builds.
    pub fn is_triggered_by(&self, trigger: &Trigger) -> bool {
        self.triggers.is_empty() || self.matching_rule(trigger).is_some()
    }

    /// Auxiliary dependencies in declaration order.
    pub fn auxiliary_dependencies(&self) -> Vec<SourceDependency> {
        self.dependencies
            .iter()
            .map(|dep| SourceDependency::auxiliary(&dep.name, &dep.url, dep.git_ref.clone()))
            .collect()
    }

    pub fn cache_ref(&self) -> CacheRef {
        CacheRef {
            read_scope: self.cache.read.clone(),
            write_scope: self.cache.write.clone(),
            mode: self.cache.mode,
        }
    }

    /// Interpolate build arguments for one run.
    pub fn build_definition(&self, vars: &VariableContext) -> BuildDefinition {
        let mut args = BTreeMap::new();
        let mut volatile_args = BTreeSet::new();
        let mut secret_args = BTreeSet::new();

        for (key, template) in &self.build.args {
            if VariableContext::is_volatile(template) {
                volatile_args.insert(key.clone());
            }
            if VariableContext::references_secret(template) {
                secret_args.insert(key.clone());
            }
            args.insert(key.clone(), vars.interpolate(template));
        }

        BuildDefinition {
            dockerfile: self.build.dockerfile.clone(),
            context: self.build.context.clone(),
            args,
            volatile_args,
            secret_args,
        }
    }
}

/// Read and parse a pipeline file.
pub fn load_pipeline(path: &Path) -> ConfigResult<PipelineConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_pipeline(&text)
}

/// Parse a pipeline configuration from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<PipelineConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut image = None;
    let mut title = None;
    let mut triggers = Vec::new();
    let mut platforms = Vec::new();
    let mut source = None;
    let mut dependencies: Vec<DependencyConfig> = Vec::new();
    let mut build = BuildConfig::default();
    let mut cache = None;
    let mut push = true;
    let mut timeouts = Timeouts::default();
    let mut max_parallel = None;

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "image" => image = get_first_string_arg(node),
            "title" => title = get_first_string_arg(node),
            "on" => triggers.push(parse_trigger(node)?),
            "platforms" => platforms.extend(get_all_string_args(node)),
            "source" => source = Some(parse_source(node)?),
            "dependency" => {
                let dep = parse_dependency(node)?;
                if dep.name == PRIMARY_SOURCE || dependencies.iter().any(|d| d.name == dep.name) {
                    return Err(ConfigError::Duplicate(format!("dependency '{}'", dep.name)));
                }
                dependencies.push(dep);
            }
            "build" => build = parse_build(node)?,
            "cache" => cache = Some(parse_cache(node)?),
            "push" => {
                push = get_first_bool_arg(node)
                    .ok_or_else(|| ConfigError::invalid("push", "expected #true or #false"))?;
            }
            "timeout" => timeouts = parse_timeouts(node)?,
            "max-parallel" => {
                let value = get_first_int_arg(node)
                    .filter(|n| *n > 0)
                    .ok_or_else(|| ConfigError::invalid("max-parallel", "expected a positive integer"))?;
                max_parallel = Some(usize::try_from(value).map_err(|_| {
                    ConfigError::invalid("max-parallel", format!("{} is too large", value))
                })?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }

    let image = image.ok_or_else(|| ConfigError::MissingField("image".to_string()))?;
    let image =
        ImageName::parse(&image).map_err(|e| ConfigError::invalid("image", e.to_string()))?;

    let source = source.ok_or_else(|| ConfigError::MissingField("source url".to_string()))?;

    for platform in &platforms {
        Platform::parse(platform).map_err(|e| ConfigError::invalid("platforms", e.to_string()))?;
    }

    let cache = cache.unwrap_or_else(|| {
        let scope = image.with_tag("buildcache");
        CacheConfig {
            read: scope.clone(),
            write: scope,
            mode: CacheMode::Max,
        }
    });

    Ok(PipelineConfig {
        name,
        image,
        title,
        triggers,
        platforms,
        source,
        dependencies,
        build,
        cache,
        push,
        timeouts,
        max_parallel,
    })
}

fn parse_trigger(node: &KdlNode) -> ConfigResult<TriggerRule> {
    let trigger_type = get_first_string_arg(node).unwrap_or_default();

    match trigger_type.as_str() {
        "push" => {
            let branches = get_string_list_prop(node, "branches");
            Ok(TriggerRule::Push {
                branches: if branches.is_empty() {
                    vec!["*".to_string()]
                } else {
                    branches
                },
            })
        }
        "tag" => {
            let pattern = get_string_prop(node, "pattern").unwrap_or_else(|| "*".to_string());
            Ok(TriggerRule::Tag { pattern })
        }
        _ => Err(ConfigError::invalid(
            "trigger type",
            format!("unknown trigger type: {}", trigger_type),
        )),
    }
}

fn parse_source(node: &KdlNode) -> ConfigResult<String> {
    if let Some(name) = get_first_string_arg(node) {
        if name != PRIMARY_SOURCE {
            return Err(ConfigError::invalid(
                "source",
                format!("only the '{}' source can be declared with `source`; use `dependency` for '{}'", PRIMARY_SOURCE, name),
            ));
        }
    }

    let url = get_string_prop(node, "url")
        .ok_or_else(|| ConfigError::MissingField("source url".to_string()))?;
    validate_url("source url", &url)?;
    Ok(url)
}

fn parse_dependency(node: &KdlNode) -> ConfigResult<DependencyConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("dependency name".to_string()))?;
    let url = get_string_prop(node, "url")
        .ok_or_else(|| ConfigError::MissingField(format!("url for dependency '{}'", name)))?;
    validate_url(&format!("url for dependency '{}'", name), &url)?;

    Ok(DependencyConfig {
        name,
        url,
        git_ref: get_string_prop(node, "ref"),
    })
}

fn parse_build(node: &KdlNode) -> ConfigResult<BuildConfig> {
    let mut build = BuildConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "dockerfile" => {
                    build.dockerfile = get_first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("build dockerfile".to_string()))?;
                }
                "context" => {
                    build.context = get_first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("build context".to_string()))?;
                }
                "arg" => {
                    let parts = get_all_string_args(child);
                    let [key, value] = parts.as_slice() else {
                        return Err(ConfigError::invalid(
                            "build arg",
                            "expected `arg \"NAME\" \"value\"`",
                        ));
                    };
                    if build.args.iter().any(|(k, _)| k == key) {
                        return Err(ConfigError::Duplicate(format!("build arg '{}'", key)));
                    }
                    build.args.push((key.clone(), value.clone()));
                }
                _ => {}
            }
        }
    }

    Ok(build)
}

fn parse_cache(node: &KdlNode) -> ConfigResult<CacheConfig> {
    let read =
        get_string_prop(node, "read").ok_or_else(|| ConfigError::MissingField("cache read".to_string()))?;
    let write = get_string_prop(node, "write").unwrap_or_else(|| read.clone());
    let mode = match get_string_prop(node, "mode") {
        Some(mode) => mode
            .parse::<CacheMode>()
            .map_err(|e| ConfigError::invalid("cache mode", e.to_string()))?,
        None => CacheMode::Max,
    };

    Ok(CacheConfig { read, write, mode })
}

fn parse_timeouts(node: &KdlNode) -> ConfigResult<Timeouts> {
    let mut timeouts = Timeouts::default();
    if let Some(build) = get_string_prop(node, "build") {
        timeouts.build = parse_duration("timeout build", &build)?;
    }
    if let Some(publish) = get_string_prop(node, "publish") {
        timeouts.publish = parse_duration("timeout publish", &publish)?;
    }
    Ok(timeouts)
}

/// Parse `90s`, `45m`, `2h`; a bare number is seconds.
pub fn parse_duration(field: &str, value: &str) -> ConfigResult<Duration> {
    let value = value.trim();
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => value.split_at(idx),
        None => (value, "s"),
    };

    let amount: u64 = digits
        .parse()
        .map_err(|_| ConfigError::invalid(field, format!("invalid duration '{}'", value)))?;
    let seconds = match unit {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 60 * 60,
        _ => {
            return Err(ConfigError::invalid(
                field,
                format!("invalid duration unit in '{}': expected s, m or h", value),
            ));
        }
    };

    if seconds == 0 {
        return Err(ConfigError::invalid(field, "duration must be positive"));
    }
    Ok(Duration::from_secs(seconds))
}

fn validate_url(field: &str, value: &str) -> ConfigResult<()> {
    let parsed = url::Url::parse(value)
        .map_err(|e| ConfigError::invalid(field, format!("'{}': {}", value, e)))?;
    match parsed.scheme() {
        "https" | "http" | "ssh" | "git" | "file" => Ok(()),
        other => Err(ConfigError::invalid(
            field,
            format!("unsupported scheme '{}' in '{}'", other, value),
        )),
    }
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

fn get_first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();

    // Repeated properties (branches="a" branches="b")
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    if seen.insert(s.to_string()) {
                        result.push(s.to_string());
                    }
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    // Block syntax
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return get_all_string_args(child);
            }
        }
    }

    Vec::new()
}
