//! Run orchestrator - drives one build request from sources to published index.
//!
//! Resolve sources, derive tags, plan one job per platform, run the jobs
//! concurrently through the cache-aware executor, then hand the complete
//! result set to the publisher. Progress is streamed as `RunEvent`s.

use chrono::Utc;
use futures::FutureExt;
use kiln_config::{PipelineConfig, VariableContext};
use kiln_core::attestation::ProvenanceContext;
use kiln_core::tags::{TagInputs, derive_tag_plan};
use kiln_core::{
    BuildRequest, BuildResult, Error, ImageDigest, Platform, PublishedManifest, Registry,
    RegistryCredentials, Result, RunId, TagPlan,
};
use kiln_executor::{CacheAwareExecutor, JobOutcome, StagedCacheWrite};
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::planner::plan_jobs;
use crate::publisher::Publisher;
use crate::resolver::SourceResolver;

const DEFAULT_BUILDER_ID: &str = concat!("https://kiln.dev/builder@", env!("CARGO_PKG_VERSION"));

/// Event emitted during a run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted { run_id: RunId, pipeline: String },
    SourcesResolved { sources: Vec<(String, String)> },
    TagsDerived { references: Vec<String> },
    JobStarted { platform: Platform },
    CacheHit { platform: Platform, digest: ImageDigest },
    CacheMiss { platform: Platform },
    JobCompleted { result: BuildResult },
    PublishStarted { tags: usize },
    PublishCompleted { manifest: PublishedManifest },
    RunCompleted { success: bool },
}

/// Outcome of a run that got as far as publishing.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub tags: TagPlan,
    /// One result per requested platform, in request order.
    pub results: Vec<BuildResult>,
    pub published: PublishedManifest,
}

/// Handle to an in-flight run.
pub struct RunHandle {
    cancel: CancellationToken,
    join: JoinHandle<Result<RunReport>>,
}

impl RunHandle {
    /// Cancel every in-flight job; staged cache writes are dropped.
    ///
    /// A run that has already started publishing finishes publishing.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<RunReport> {
        self.join
            .await
            .map_err(|e| Error::Internal(format!("run task failed: {}", e)))?
    }
}

/// Orchestrates runs of one pipeline configuration.
#[derive(Clone)]
pub struct RunOrchestrator {
    resolver: SourceResolver,
    executor: Arc<CacheAwareExecutor>,
    registry: Arc<dyn Registry>,
    credentials: Option<RegistryCredentials>,
    push: bool,
    inherit_env: bool,
    builder_id: String,
}

impl RunOrchestrator {
    pub fn new(
        resolver: SourceResolver,
        executor: Arc<CacheAwareExecutor>,
        registry: Arc<dyn Registry>,
    ) -> Self {
        Self {
            resolver,
            executor,
            registry,
            credentials: None,
            push: true,
            inherit_env: true,
            builder_id: DEFAULT_BUILDER_ID.to_string(),
        }
    }

    pub fn with_credentials(mut self, credentials: Option<RegistryCredentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// `false` disables pushing even when the pipeline asks for it.
    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    /// Whether `${env.*}` and `${secrets.*}` see the process environment.
    pub fn with_inherited_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    pub fn with_builder_id(mut self, builder_id: impl Into<String>) -> Self {
        self.builder_id = builder_id.into();
        self
    }

    /// Start a run, returning a channel of events and a handle to the final result.
    pub fn execute(
        &self,
        pipeline: PipelineConfig,
        request: BuildRequest,
    ) -> (mpsc::Receiver<RunEvent>, RunHandle) {
        let (tx, rx) = mpsc::channel(100);
        let cancel = CancellationToken::new();
        let this = self.clone();
        let token = cancel.clone();

        let join =
            tokio::spawn(async move { this.run(&pipeline, &request, token, Some(tx)).await });

        (rx, RunHandle { cancel, join })
    }

    /// Run to completion on the current task.
    pub async fn run(
        &self,
        pipeline: &PipelineConfig,
        request: &BuildRequest,
        cancel: CancellationToken,
        events: Option<mpsc::Sender<RunEvent>>,
    ) -> Result<RunReport> {
        let run_id = RunId::new();
        let events = Events(events);

        info!(run_id = %run_id, pipeline = %pipeline.name, git_ref = %request.trigger().full_ref(), "Run started");
        events
            .send(RunEvent::RunStarted {
                run_id,
                pipeline: pipeline.name.clone(),
            })
            .await;

        let outcome = self
            .run_inner(run_id, pipeline, request, &cancel, &events)
            .await;

        match &outcome {
            Ok(report) => info!(run_id = %run_id, reference = %report.published.reference(), "Run completed"),
            Err(e) => error!(run_id = %run_id, error = %e, "Run failed"),
        }
        events
            .send(RunEvent::RunCompleted {
                success: outcome.is_ok(),
            })
            .await;
        outcome
    }

    async fn run_inner(
        &self,
        run_id: RunId,
        pipeline: &PipelineConfig,
        request: &BuildRequest,
        cancel: &CancellationToken,
        events: &Events,
    ) -> Result<RunReport> {
        let started_at = Utc::now();
        let push = self.push && pipeline.push;

        let credentials = match (&self.credentials, push) {
            (Some(credentials), true) => Some(credentials),
            (None, true) => {
                return Err(Error::Configuration(format!(
                    "pushing requires registry credentials; set {} and {}",
                    RegistryCredentials::USERNAME_VAR,
                    RegistryCredentials::TOKEN_VAR
                )));
            }
            (_, false) => None,
        };

        // Resolved before planning: an unreachable source is reported even
        // when the platform list is also wrong.
        let workspace = self.resolver.workspace()?;
        let auxiliary = pipeline.auxiliary_dependencies();
        let sources = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            sources = self.resolver.resolve(
                request,
                &pipeline.source,
                &auxiliary,
                &workspace,
            ) => sources?,
        };
        events
            .send(RunEvent::SourcesResolved {
                sources: sources
                    .iter()
                    .map(|(name, source)| (name.clone(), source.commit.clone()))
                    .collect(),
            })
            .await;

        let tags = derive_tag_plan(
            request,
            &TagInputs {
                image: Some(pipeline.image.as_str()),
                source_url: Some(pipeline.source.trim_end_matches(".git")),
                title: pipeline.title.as_deref(),
                created: started_at,
            },
        )?;
        info!(run_id = %run_id, tags = ?tags.tags(), "Tags derived");
        events
            .send(RunEvent::TagsDerived {
                references: tags.references(),
            })
            .await;

        let mut vars = VariableContext::for_run(
            request,
            &pipeline.name,
            pipeline.image.as_str(),
            run_id,
            started_at,
        );
        if self.inherit_env {
            vars.populate_env();
        }
        let build = Arc::new(pipeline.build_definition(&vars));

        let sources = Arc::new(sources);
        let tags = Arc::new(tags);
        let jobs = plan_jobs(
            run_id,
            request.platforms(),
            sources.clone(),
            tags.clone(),
            &pipeline.cache_ref(),
            build.clone(),
        )?;

        let publisher = Publisher::new(self.registry.clone(), pipeline.timeouts.publish)
            .with_push(push);
        if let Some(credentials) = credentials {
            publisher.login(&tags, credentials).await?;
        }

        let max_parallel = pipeline.max_parallel.unwrap_or(jobs.len()).max(1);
        info!(
            run_id = %run_id,
            jobs = jobs.len(),
            max_parallel,
            "Starting platform builds"
        );

        let platforms: Vec<Platform> = jobs.iter().map(|j| j.platform.clone()).collect();
        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let mut set = JoinSet::new();

        for job in jobs {
            let executor = self.executor.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let events = events.clone();
            let build_timeout = pipeline.timeouts.build;

            set.spawn(async move {
                let index = job.index;
                let platform = job.platform.clone();

                let work = async {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return failed(&platform, "build workers shut down");
                    };
                    events
                        .send(RunEvent::JobStarted {
                            platform: platform.clone(),
                        })
                        .await;
                    run_with_timeout(&executor, job, build_timeout).await
                };

                let outcome = tokio::select! {
                    _ = cancel.cancelled() => failed(&platform, "cancelled"),
                    outcome = AssertUnwindSafe(work).catch_unwind() => outcome.unwrap_or_else(|panic| {
                        failed(&platform, format!("build task panicked: {}", panic_message(&*panic)))
                    }),
                };
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<JobOutcome>> = platforms.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            let Ok((index, outcome)) = joined else {
                // Only reachable if the set is aborted; the slot is filled below.
                warn!(run_id = %run_id, "Platform task ended without a result");
                continue;
            };

            match &outcome.result {
                BuildResult::Succeeded {
                    platform,
                    manifest,
                    cache_hit: true,
                } => {
                    events
                        .send(RunEvent::CacheHit {
                            platform: platform.clone(),
                            digest: manifest.digest.clone(),
                        })
                        .await;
                }
                BuildResult::Succeeded { platform, .. } => {
                    events
                        .send(RunEvent::CacheMiss {
                            platform: platform.clone(),
                        })
                        .await;
                }
                BuildResult::Failed { .. } => {}
            }
            events
                .send(RunEvent::JobCompleted {
                    result: outcome.result.clone(),
                })
                .await;
            outcomes[index] = Some(outcome);
        }

        let mut results = Vec::with_capacity(outcomes.len());
        let mut staged: Vec<StagedCacheWrite> = Vec::new();
        for (slot, platform) in outcomes.into_iter().zip(&platforms) {
            let outcome = slot.unwrap_or_else(|| failed(platform, "build task was aborted"));
            staged.extend(outcome.staged);
            results.push(outcome.result);
        }

        if cancel.is_cancelled() {
            info!(run_id = %run_id, discarded = staged.len(), "Run cancelled, discarding cache writes");
            return Err(Error::Cancelled);
        }
        // A cached descriptor must name a manifest the registry has.
        if push {
            for write in staged {
                self.executor.commit(write).await;
            }
        } else if !staged.is_empty() {
            info!(run_id = %run_id, discarded = staged.len(), "Push disabled, discarding cache writes");
        }

        let finished_at = Utc::now();
        let ctx = ProvenanceContext {
            run_id,
            builder_id: &self.builder_id,
            request,
            sources: &sources,
            build: &build,
            started_at,
            finished_at,
        };

        events
            .send(RunEvent::PublishStarted {
                tags: tags.tags().len(),
            })
            .await;
        // Not cancellable once pushing starts; the publish timeout bounds it.
        let published = publisher.publish(&tags, &results, &ctx).await?;
        if cancel.is_cancelled() {
            warn!(run_id = %run_id, "Cancel requested while publishing; publish completed");
        }
        events
            .send(RunEvent::PublishCompleted {
                manifest: published.clone(),
            })
            .await;

        drop(workspace);
        Ok(RunReport {
            run_id,
            tags: (*tags).clone(),
            results,
            published,
        })
    }
}

/// Optional event sink; a dropped receiver is not an error.
#[derive(Clone)]
struct Events(Option<mpsc::Sender<RunEvent>>);

impl Events {
    async fn send(&self, event: RunEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event).await;
        }
    }
}

fn failed(platform: &Platform, message: impl Into<String>) -> JobOutcome {
    JobOutcome {
        result: BuildResult::failed(platform.clone(), message),
        staged: None,
    }
}

async fn run_with_timeout(
    executor: &CacheAwareExecutor,
    job: kiln_core::PlatformJob,
    limit: Duration,
) -> JobOutcome {
    let platform = job.platform.clone();
    match tokio::time::timeout(limit, executor.execute(job)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(platform = %platform, timeout = ?limit, "Platform build timed out");
            failed(&platform, format!("timed out after {:?}", limit))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
