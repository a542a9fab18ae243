//! Error types for kiln.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Platform;

/// A single platform build that did not produce an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFailure {
    pub platform: Platform,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("fetch failed for source '{name}': {message}")]
    Fetch { name: String, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("partial build failure: {}", describe_failures(.0))]
    PartialBuildFailure(Vec<PlatformFailure>),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn fetch(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Fetch {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Process exit status for a run that ended with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Configuration(_) => 2,
            Error::Fetch { .. } => 3,
            Error::PartialBuildFailure(_) => 4,
            Error::Publish(_) => 5,
            Error::Cancelled => 130,
            Error::Timeout(_) | Error::Internal(_) => 1,
        }
    }
}

fn describe_failures(failures: &[PlatformFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.platform, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_failure_names_every_platform() {
        let err = Error::PartialBuildFailure(vec![
            PlatformFailure {
                platform: Platform::parse("linux/arm64").unwrap(),
                message: "exit status 1".to_string(),
            },
            PlatformFailure {
                platform: Platform::parse("linux/amd64").unwrap(),
                message: "timed out after 10s".to_string(),
            },
        ]);

        assert_eq!(
            err.to_string(),
            "partial build failure: linux/arm64: exit status 1; linux/amd64: timed out after 10s"
        );
    }

    #[test]
    fn test_exit_codes_are_distinct_per_category() {
        assert_eq!(Error::Configuration("x".into()).exit_code(), 2);
        assert_eq!(Error::fetch("primary", "unreachable").exit_code(), 3);
        assert_eq!(Error::PartialBuildFailure(vec![]).exit_code(), 4);
        assert_eq!(Error::Publish("denied".into()).exit_code(), 5);
        assert_eq!(Error::Cancelled.exit_code(), 130);
    }
}
