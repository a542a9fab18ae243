//! Run scheduling for kiln.
//!
//! Resolves sources, plans one job per platform, fans the jobs out to the
//! cache-aware executor and joins them before publishing the index.

pub mod orchestrator;
pub mod planner;
pub mod publisher;
pub mod resolver;

pub use orchestrator::{RunEvent, RunHandle, RunOrchestrator, RunReport};
pub use planner::{parse_platforms, plan_jobs};
pub use publisher::Publisher;
pub use resolver::{GitFetcher, SourceResolver, SourceWorkspace};
