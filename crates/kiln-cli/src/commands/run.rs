//! Build, cache and publish command.

use anyhow::{Context, Result};
use kiln_core::{BuildResult, Error, RegistryCredentials};
use kiln_executor::{
    BinfmtEmulator, BuildxBackend, CacheAwareExecutor, DistributionRegistry, LocalDirCache,
};
use kiln_scheduler::{GitFetcher, RunEvent, RunOrchestrator, SourceResolver};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::TriggerArgs;

pub struct RunOptions {
    pub no_push: bool,
    pub cache_dir: PathBuf,
    pub work_dir: Option<PathBuf>,
    pub builder: Option<String>,
    pub git_token: Option<String>,
    pub json: bool,
}

/// Run a pipeline for the current (or given) trigger.
pub async fn run(path: &Path, args: &TriggerArgs, options: RunOptions) -> Result<()> {
    let pipeline = super::load(path)?;
    let Some(request) = super::build_request(&pipeline, args)? else {
        return Ok(());
    };

    let push = pipeline.push && !options.no_push;
    let credentials = RegistryCredentials::from_env();
    if push && credentials.is_none() {
        return Err(Error::Configuration(format!(
            "pushing to {} requires {} and {}",
            pipeline.image,
            RegistryCredentials::USERNAME_VAR,
            RegistryCredentials::TOKEN_VAR
        ))
        .into());
    }

    let mut backend = BuildxBackend::new().with_push(push);
    if let Some(builder) = &options.builder {
        backend = backend.with_builder(builder.clone());
    }
    if let Some(credentials) = credentials.as_ref().filter(|_| push) {
        backend
            .login(pipeline.image.registry(), credentials)
            .await
            .context("docker login failed")?;
    }

    let emulator = BinfmtEmulator::new().context("Failed to connect to Docker")?;
    let cache = LocalDirCache::open(&options.cache_dir)
        .await
        .with_context(|| format!("Failed to open cache dir: {}", options.cache_dir.display()))?;

    let mut fetcher = GitFetcher::new();
    if let Some(token) = options.git_token {
        fetcher = fetcher.with_access_token(token);
    }
    let mut resolver = SourceResolver::new(Arc::new(fetcher));
    if let Some(work_dir) = &options.work_dir {
        tokio::fs::create_dir_all(work_dir)
            .await
            .with_context(|| format!("Failed to create work dir: {}", work_dir.display()))?;
        resolver = resolver.with_work_root(work_dir);
    }

    let executor = CacheAwareExecutor::new(Arc::new(backend), Arc::new(cache), Arc::new(emulator));
    let orchestrator = RunOrchestrator::new(
        resolver,
        Arc::new(executor),
        Arc::new(DistributionRegistry::new()),
    )
    .with_credentials(credentials)
    .with_push(!options.no_push);

    if !options.json {
        println!("Running pipeline: {}", pipeline.name);
        println!("Ref: {} @ {}", request.trigger().full_ref(), request.short_sha());
        println!("Platforms: {}\n", request.platforms().join(", "));
    }

    let (mut rx, handle) = orchestrator.execute(pipeline, request);

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            cancel.cancel();
        }
    });

    while let Some(event) = rx.recv().await {
        if !options.json {
            print_event(&event);
        }
    }

    let report = handle.wait().await?;
    info!(run_id = %report.run_id, digest = %report.published.digest, "Run finished");

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("\n--- Platform Summary ---");
    for result in &report.results {
        match result {
            BuildResult::Succeeded {
                platform,
                manifest,
                cache_hit,
            } => {
                let source = if *cache_hit { " (cached)" } else { "" };
                println!("  {} - ✓ {}{}", platform, manifest.digest, source);
            }
            BuildResult::Failed { platform, message } => {
                println!("  {} - ✗ {}", platform, message);
            }
        }
    }

    let published = &report.published;
    if published.pushed {
        println!("\n✓ Published {}", published.reference());
        for reference in published.references() {
            println!("  {}", reference);
        }
    } else {
        println!("\n✓ Built {} (push disabled)", published.digest);
    }
    Ok(())
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::RunStarted { run_id, .. } => {
            println!("--- Run {} started ---\n", run_id);
        }
        RunEvent::SourcesResolved { sources } => {
            for (name, commit) in sources {
                println!("  source {} @ {}", name, commit);
            }
        }
        RunEvent::TagsDerived { references } => {
            for reference in references {
                println!("  tag {}", reference);
            }
            println!();
        }
        RunEvent::JobStarted { platform } => {
            println!("▶ {} started", platform);
        }
        RunEvent::CacheHit { platform, digest } => {
            println!("  [{}] cache hit {}", platform, digest);
        }
        RunEvent::CacheMiss { platform } => {
            println!("  [{}] cache miss, building", platform);
        }
        RunEvent::JobCompleted { result } => match result {
            BuildResult::Succeeded {
                platform, manifest, ..
            } => println!("✓ {} built {}", platform, manifest.digest),
            BuildResult::Failed { platform, message } => {
                println!("✗ {} failed: {}", platform, message)
            }
        },
        RunEvent::PublishStarted { tags } => {
            println!("\n▶ Publishing index under {} tags", tags);
        }
        RunEvent::PublishCompleted { manifest } => {
            println!("✓ Index {}", manifest.digest);
        }
        RunEvent::RunCompleted { success } => {
            if *success {
                println!("\n--- Run completed successfully ---");
            } else {
                println!("\n--- Run failed ---");
            }
        }
    }
}
