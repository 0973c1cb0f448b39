//! Typed error hierarchy for the pipeline engine.
//!
//! Two enums cover the two layers:
//! - `StoreError` — persistent store failures (I/O, lock acquisition, keys)
//! - `PipelineError` — everything the public engine API can fail with
//!
//! `LockTimeout` and `StorageFailure` are retryable by the caller; they never
//! count as a stage failure and never produce a dead letter.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::stage::Stage;

/// Errors from the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {waited:?} waiting for lock on {namespace}")]
    LockTimeout { namespace: String, waited: Duration },

    #[error("Invalid store key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors surfaced by the state manager, circuit breaker, feedback loop
/// controller and dispatcher.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid project id '{0}': expected project-<positive integer>")]
    InvalidProjectId(String),

    #[error("Invalid stage name '{0}'")]
    InvalidStage(String),

    #[error("Invalid transition for {project}: {reason}")]
    InvalidTransition { project: String, reason: String },

    #[error("Project {0} already exists")]
    AlreadyExists(String),

    #[error("Project {0} not found")]
    NotFound(String),

    #[error("Timed out after {waited:?} waiting for lock on {project}")]
    LockTimeout { project: String, waited: Duration },

    #[error("Circuit breaker tripped for {project}: {reason}")]
    CircuitBreakerTripped { project: String, reason: String },

    #[error("Feedback loop escalated for {project} after {iterations} iterations: {reason}")]
    FeedbackLoopEscalated {
        project: String,
        iterations: u32,
        reason: String,
    },

    #[error("Path {path} escapes project data root {root}")]
    PathEscape { path: PathBuf, root: PathBuf },

    #[error("Storage failure: {0}")]
    StorageFailure(#[source] StoreError),

    #[error("Corrupt record {key}: {source}")]
    CorruptRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether the caller may retry the same request with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::StorageFailure(_))
    }

    /// Whether the error leaves the project requiring human intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CircuitBreakerTripped { .. } | Self::FeedbackLoopEscalated { .. }
        )
    }

    pub(crate) fn invalid_transition(project: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidTransition {
            project: project.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unexpected_stage(project: impl ToString, expected: Stage, got: Stage) -> Self {
        Self::invalid_transition(
            project,
            format!("stage '{}' is not the current stage '{}'", got, expected),
        )
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LockTimeout { namespace, waited } => Self::LockTimeout {
                project: namespace,
                waited,
            },
            other => Self::StorageFailure(other),
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
