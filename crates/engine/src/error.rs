use std::{path::PathBuf, time::Duration};

use serde::Serialize;

/// Hard errors surfaced by the engine.
///
/// Script failures, timeouts and rejected inputs are not errors; they come
/// back inside [`crate::ExecutionResult`] as a [`Failure`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every sandbox slot stayed busy for the whole acquire timeout.
    #[error("server is busy: all {capacity} sandbox slots are occupied, try again later")]
    AdmissionExhausted { capacity: usize },

    /// The caller gave up before the operation finished.
    #[error("operation cancelled by caller")]
    Cancelled,

    /// The container runtime or the host misbehaved (endpoint unreachable,
    /// create/start/wait failure, staging I/O).
    #[error("sandbox infrastructure error: {0:#}")]
    Infrastructure(anyhow::Error),

    #[error("execution {0} not found")]
    NotFound(String),

    #[error("file {name} not found in execution {execution_id}")]
    FileNotFound { execution_id: String, name: String },

    #[error("path traversal detected: {0}")]
    PathTraversal(String),

    #[error("invalid execution id: {0:?}")]
    InvalidExecutionId(String),

    #[error("output persistence is not configured")]
    ArtifactsDisabled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn infra(err: impl Into<anyhow::Error>) -> Self {
        Self::Infrastructure(err.into())
    }

    /// True for conditions a caller may simply retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AdmissionExhausted { .. })
    }

    /// True for "does not exist" conditions, as opposed to internal faults.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::FileNotFound { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification attached to an [`crate::ExecutionResult`] that did not
/// succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    #[error(
        "sandbox image is still being prepared, please try again in a minute \
         (first startup pulls or builds the execution environment)"
    )]
    ImageNotReady,

    #[error("sandbox image preparation failed: {message}")]
    ImageBuildFailed { message: String },

    #[error("{reason}")]
    InputValidationFailed { reason: InputRejection },

    #[error("execution timeout: script exceeded {}s", .timeout.as_secs_f64())]
    ExecutionTimeout { timeout: Duration },

    #[error("execution cancelled by caller")]
    Cancelled,

    #[error("script exited with code {exit_code}")]
    ExecutionFailed { exit_code: i64 },
}

/// Why a declared input path was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "rule", content = "path", rename_all = "snake_case")]
pub enum InputRejection {
    #[error("access denied: path traversal detected in {}", .0.display())]
    ParentTraversal(PathBuf),

    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("access denied: {} is not a regular file", .0.display())]
    NotRegularFile(PathBuf),

    #[error("access denied: {} is outside the allowed input directories", .0.display())]
    OutsideAllowedRoots(PathBuf),

    #[error("cannot access file {}", .0.display())]
    Inaccessible(PathBuf),
}
