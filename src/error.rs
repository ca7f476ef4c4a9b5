use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification carried on ERROR traces so the platform knows whether a
/// failure is the user's to fix, worth retrying, or a bug.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    ConfigError,
    TransientError,
    SystemError,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::ConfigError => write!(f, "config_error"),
            FailureType::TransientError => write!(f, "transient_error"),
            FailureType::SystemError => write!(f, "system_error"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid manifest: {0}")]
    Manifest(String),

    #[error("Interpolation failed: {0}")]
    Interpolation(String),

    #[error("{message}")]
    Request {
        failure_type: FailureType,
        message: String,
    },

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Sync failed for streams: {}", .0.join(", "))]
    SyncFailed(Vec<String>),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SourceError {
    pub fn request(failure_type: FailureType, message: impl Into<String>) -> Self {
        SourceError::Request {
            failure_type,
            message: message.into(),
        }
    }

    /// Failure classification reported on the ERROR trace.
    pub fn failure_type(&self) -> FailureType {
        match self {
            SourceError::Config(_) => FailureType::ConfigError,
            SourceError::Request { failure_type, .. } => *failure_type,
            SourceError::Manifest(_)
            | SourceError::Interpolation(_)
            | SourceError::State(_)
            | SourceError::SyncFailed(_)
            | SourceError::Other(_) => FailureType::SystemError,
        }
    }
}

pub type Result<T, E = SourceError> = std::result::Result<T, E>;
