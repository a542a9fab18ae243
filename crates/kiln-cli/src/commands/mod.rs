//! CLI command implementations.

pub mod plan;
pub mod run;

use anyhow::{Context, Result};
use kiln_config::{ConfigError, PipelineConfig, TriggerContext, load_pipeline};
use kiln_core::{BuildRequest, Error, Registry, RegistryCredentials, Trigger};
use kiln_executor::{BuildxBackend, DistributionRegistry};
use std::path::Path;
use tracing::info;

use crate::TriggerArgs;

/// Process exit status for a failed command.
pub fn exit_code(error: &anyhow::Error) -> u8 {
    if let Some(e) = error.downcast_ref::<Error>() {
        return u8::try_from(e.exit_code()).unwrap_or(1);
    }
    if error.downcast_ref::<ConfigError>().is_some() {
        return 2;
    }
    1
}

pub fn validate(path: &Path) -> Result<()> {
    match load_pipeline(path) {
        Ok(pipeline) => {
            println!("Configuration is valid");
            println!("  pipeline:  {}", pipeline.name);
            println!("  image:     {}", pipeline.image);
            println!("  platforms: {}", pipeline.platforms.join(", "));
            for rule in &pipeline.triggers {
                println!("  trigger:   {}", rule);
            }
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

pub async fn login(registry: &str) -> Result<()> {
    let credentials = RegistryCredentials::from_env().ok_or_else(|| {
        Error::Configuration(format!(
            "set {} and {} to log in",
            RegistryCredentials::USERNAME_VAR,
            RegistryCredentials::TOKEN_VAR
        ))
    })?;

    DistributionRegistry::new()
        .login(registry, &credentials)
        .await?;
    BuildxBackend::new().login(registry, &credentials).await?;

    println!("Logged in to {} as {}", registry, credentials.username);
    Ok(())
}

pub(crate) fn load(path: &Path) -> Result<PipelineConfig> {
    load_pipeline(path)
        .with_context(|| format!("Failed to load pipeline config: {}", path.display()))
}

/// The request for this invocation, or `None` when no trigger rule matches.
pub(crate) fn build_request(
    pipeline: &PipelineConfig,
    args: &TriggerArgs,
) -> Result<Option<BuildRequest>> {
    let context = TriggerContext::discover(args.git_ref.as_deref(), args.sha.as_deref())?;
    let trigger = Trigger::from_ref(&context.git_ref)?;

    if !pipeline.is_triggered_by(&trigger) {
        info!(git_ref = %trigger.full_ref(), pipeline = %pipeline.name, "No trigger matched, skipping");
        println!(
            "no trigger matched {} (rules: {})",
            trigger.full_ref(),
            pipeline
                .triggers
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        );
        return Ok(None);
    }

    let request = BuildRequest::new(trigger, context.commit_sha, pipeline.platforms.clone())?;
    Ok(Some(request))
}
