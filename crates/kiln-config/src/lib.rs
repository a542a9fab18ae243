//! KDL pipeline configuration for kiln.
//!
//! This crate handles parsing of:
//! - Pipeline definitions (kiln.kdl)
//! - Trigger matching and trigger context discovery
//! - Variable interpolation for build arguments

pub mod error;
pub mod pipeline;
pub mod trigger;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{
    BuildConfig, CacheConfig, DependencyConfig, PipelineConfig, Timeouts, load_pipeline,
    parse_pipeline,
};
pub use trigger::{TriggerContext, TriggerRule};
pub use variables::{GitContext, RunContext, VariableContext, VariableContextBuilder};
