//! `docker buildx` build backend.
//!
//! Each platform is built by its own `docker buildx build` invocation that
//! reads and writes the registry cache and pushes the image by digest. The
//! per-platform manifest descriptor comes from the `--metadata-file` output.

use async_trait::async_trait;
use kiln_core::executor::{BuildBackend, BuildInvocation, BuildOutput};
use kiln_core::manifest::{Descriptor, OCI_MANIFEST_MEDIA_TYPE};
use kiln_core::{Error, ImageDigest, RegistryCredentials, Result};
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

const STDERR_TAIL_LINES: usize = 20;

/// Builds images with the docker CLI's buildx plugin.
#[derive(Debug, Clone)]
pub struct BuildxBackend {
    docker_bin: String,
    builder: Option<String>,
    push: bool,
}

impl BuildxBackend {
    pub fn new() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            builder: None,
            push: true,
        }
    }

    /// Use a named buildx builder instead of the current one.
    pub fn with_builder(mut self, builder: impl Into<String>) -> Self {
        self.builder = Some(builder.into());
        self
    }

    /// Keep images in the builder instead of pushing them.
    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    pub fn with_docker_bin(mut self, bin: impl Into<String>) -> Self {
        self.docker_bin = bin.into();
        self
    }

    /// `docker login` so buildx can push to `registry`.
    pub async fn login(&self, registry: &str, credentials: &RegistryCredentials) -> Result<()> {
        let mut child = Command::new(&self.docker_bin)
            .args(["login", registry, "--username", &credentials.username, "--password-stdin"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Publish(format!("failed to run docker login: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(credentials.token.as_bytes())
                .await
                .map_err(|e| Error::Publish(format!("failed to pass registry token: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Publish(format!("docker login failed: {}", e)))?;
        if !output.status.success() {
            return Err(Error::Publish(format!(
                "docker login to {} failed: {}",
                registry,
                stderr_tail(&output.stderr)
            )));
        }

        info!(registry = %registry, username = %credentials.username, "Logged in to registry");
        Ok(())
    }

    fn command_args(&self, invocation: &BuildInvocation, metadata_file: &Path) -> Vec<String> {
        let mut args = vec!["buildx".to_string(), "build".to_string()];

        if let Some(builder) = &self.builder {
            args.extend(["--builder".to_string(), builder.clone()]);
        }

        args.extend([
            "--platform".to_string(),
            invocation.platform.to_string(),
            "--file".to_string(),
            invocation
                .context_dir
                .join(&invocation.dockerfile)
                .display()
                .to_string(),
            "--metadata-file".to_string(),
            metadata_file.display().to_string(),
            // Attestations are attached to the index by the publisher.
            "--provenance=false".to_string(),
            "--sbom=false".to_string(),
            "--cache-from".to_string(),
            format!("type=registry,ref={}", invocation.cache.read_scope),
        ]);

        if self.push {
            args.extend([
                "--cache-to".to_string(),
                format!(
                    "type=registry,ref={},mode={}",
                    invocation.cache.write_scope, invocation.cache.mode
                ),
                "--output".to_string(),
                format!(
                    "type=image,name={},push-by-digest=true,name-canonical=true,push=true",
                    invocation.image
                ),
            ]);
        } else {
            args.extend([
                "--output".to_string(),
                format!("type=image,name={},push=false", invocation.image),
            ]);
        }

        for (key, value) in &invocation.args {
            args.extend(["--build-arg".to_string(), format!("{}={}", key, value)]);
        }
        for (key, value) in &invocation.labels {
            args.extend(["--label".to_string(), format!("{}={}", key, value)]);
        }

        args.push(invocation.context_dir.display().to_string());
        args
    }
}

impl Default for BuildxBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BuildBackend for BuildxBackend {
    fn name(&self) -> &'static str {
        "buildx"
    }

    async fn build(&self, invocation: BuildInvocation) -> Result<BuildOutput> {
        let workdir = tempfile::tempdir()
            .map_err(|e| Error::Internal(format!("failed to create metadata dir: {}", e)))?;
        let metadata_file = workdir.path().join("metadata.json");
        let args = self.command_args(&invocation, &metadata_file);

        debug!(
            platform = %invocation.platform,
            args = ?masked_args(&args, &invocation),
            "Running docker buildx"
        );

        let output = Command::new(&self.docker_bin)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Internal(format!("failed to run docker buildx: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Internal(format!(
                "docker buildx build exited with {}: {}",
                output.status,
                stderr_tail(&output.stderr)
            )));
        }

        let metadata = tokio::fs::read(&metadata_file)
            .await
            .map_err(|e| Error::Internal(format!("buildx wrote no metadata file: {}", e)))?;
        let manifest = parse_metadata(&metadata)?;

        if self.push && manifest.is_none() {
            return Err(Error::Internal(
                "buildx metadata is missing containerimage.digest".to_string(),
            ));
        }

        Ok(BuildOutput {
            manifest,
            layers: Vec::new(),
            intermediate: Vec::new(),
        })
    }
}

/// Extract the pushed image manifest from a buildx metadata file.
fn parse_metadata(bytes: &[u8]) -> Result<Option<Descriptor>> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| Error::Internal(format!("invalid buildx metadata: {}", e)))?;

    if let Some(descriptor) = value.get("containerimage.descriptor") {
        let mut descriptor: Descriptor = serde_json::from_value(descriptor.clone())
            .map_err(|e| Error::Internal(format!("invalid containerimage.descriptor: {}", e)))?;
        // Buildx repeats the platform here; the index sets its own.
        descriptor.platform = None;
        descriptor.annotations.clear();
        return Ok(Some(descriptor));
    }

    match value.get("containerimage.digest").and_then(Value::as_str) {
        Some(digest) => Ok(Some(Descriptor::new(
            OCI_MANIFEST_MEDIA_TYPE,
            ImageDigest::parse(digest)?,
            0,
        ))),
        None => Ok(None),
    }
}

/// `args` with the value of every secret `--build-arg` replaced by `***`.
fn masked_args(args: &[String], invocation: &BuildInvocation) -> Vec<String> {
    let mut masked = Vec::with_capacity(args.len());
    let mut after_build_arg = false;
    for arg in args {
        let secret_key = after_build_arg
            .then(|| arg.split_once('=').map(|(key, _)| key))
            .flatten()
            .filter(|key| invocation.secret_args.contains(*key));
        match secret_key {
            Some(key) => masked.push(format!("{}=***", key)),
            None => masked.push(arg.clone()),
        }
        after_build_arg = arg == "--build-arg";
    }
    masked
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{CacheMode, CacheRef, ImageName, Platform, RunId};
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;

    fn invocation() -> BuildInvocation {
        let mut args = BTreeMap::new();
        args.insert("VCS_REF".to_string(), "abc123".to_string());
        args.insert("NPM_TOKEN".to_string(), "t0k3n".to_string());
        let mut labels = BTreeMap::new();
        labels.insert(
            "org.opencontainers.image.revision".to_string(),
            "abc123".to_string(),
        );

        BuildInvocation {
            run_id: RunId::new(),
            platform: Platform::parse("linux/arm64").unwrap(),
            image: ImageName::parse("ghcr.io/example/atlas").unwrap(),
            context_dir: PathBuf::from("/work/primary"),
            dockerfile: "Dockerfile".to_string(),
            args,
            secret_args: BTreeSet::from(["NPM_TOKEN".to_string()]),
            labels,
            cache: CacheRef {
                read_scope: "ghcr.io/example/atlas:buildcache".to_string(),
                write_scope: "ghcr.io/example/atlas:buildcache-main".to_string(),
                mode: CacheMode::Max,
            },
            emulate: true,
        }
    }

    #[test]
    fn test_command_args_push() {
        let backend = BuildxBackend::new().with_builder("kiln");
        let args = backend.command_args(&invocation(), Path::new("/tmp/meta.json"));

        let joined = args.join(" ");
        assert!(joined.starts_with("buildx build --builder kiln --platform linux/arm64"));
        assert!(joined.contains("--file /work/primary/Dockerfile"));
        assert!(joined.contains("--cache-from type=registry,ref=ghcr.io/example/atlas:buildcache "));
        assert!(joined.contains(
            "--cache-to type=registry,ref=ghcr.io/example/atlas:buildcache-main,mode=max"
        ));
        assert!(joined.contains("push-by-digest=true"));
        assert!(joined.contains("--build-arg VCS_REF=abc123"));
        assert!(joined.contains("--label org.opencontainers.image.revision=abc123"));
        assert_eq!(args.last().unwrap(), "/work/primary");
    }

    #[test]
    fn test_command_args_without_push_skip_cache_export() {
        let backend = BuildxBackend::new().with_push(false);
        let args = backend.command_args(&invocation(), Path::new("/tmp/meta.json"));

        assert!(!args.iter().any(|a| a == "--cache-to"));
        assert!(args.iter().any(|a| a.ends_with("push=false")));
    }

    #[test]
    fn test_masked_args_hide_secret_build_args() {
        let backend = BuildxBackend::new();
        let invocation = invocation();
        let args = backend.command_args(&invocation, Path::new("/tmp/meta.json"));
        assert!(args.iter().any(|a| a == "NPM_TOKEN=t0k3n"));

        let masked = masked_args(&args, &invocation);
        assert_eq!(masked.len(), args.len());
        assert!(masked.iter().any(|a| a == "NPM_TOKEN=***"));
        assert!(masked.iter().any(|a| a == "VCS_REF=abc123"));
        assert!(!format!("{:?}", masked).contains("t0k3n"));
    }

    #[test]
    fn test_parse_metadata_descriptor() {
        let digest = ImageDigest::of(b"manifest");
        let metadata = serde_json::json!({
            "containerimage.config.digest": ImageDigest::of(b"config").as_str(),
            "containerimage.digest": digest.as_str(),
            "containerimage.descriptor": {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": digest.as_str(),
                "size": 1234,
                "platform": { "architecture": "arm64", "os": "linux" }
            }
        });
        let parsed = parse_metadata(&serde_json::to_vec(&metadata).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(parsed.digest, digest);
        assert_eq!(parsed.size, 1234);
        assert!(parsed.platform.is_none());
    }

    #[test]
    fn test_parse_metadata_digest_only() {
        let digest = ImageDigest::of(b"manifest");
        let metadata = serde_json::json!({ "containerimage.digest": digest.as_str() });
        let parsed = parse_metadata(&serde_json::to_vec(&metadata).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(parsed.digest, digest);

        assert!(parse_metadata(b"{}").unwrap().is_none());
        assert!(parse_metadata(b"garbage").is_err());
    }

    #[test]
    fn test_stderr_tail() {
        let stderr: String = (0..30).map(|i| format!("line {}\n", i)).collect();
        let tail = stderr_tail(stderr.as_bytes());
        assert!(tail.starts_with("line 10"));
        assert!(tail.ends_with("line 29"));
    }

    #[tokio::test]
    #[ignore = "requires docker with the buildx plugin"]
    async fn test_buildx_available() {
        let output = Command::new("docker")
            .args(["buildx", "version"])
            .output()
            .await
            .unwrap();
        assert!(output.status.success());
    }
}
