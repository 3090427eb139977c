//! Error types for dumpflow.
//!
//! `DumpflowError` is what stages, the job graph and the service return.
//! `ErrorKind` and `ErrorDescriptor` are the serializable projection stored
//! in FAILED execution records and surfaced by status queries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// The main error type for dumpflow operations.
#[derive(Debug, Error)]
pub enum DumpflowError {
    /// A stage's required context field is absent.
    #[error("stage '{stage}' requires context field '{field}' which is not set")]
    MissingInput {
        /// The stage that needed the field.
        stage: String,
        /// The missing field.
        field: String,
    },

    /// A target already exists or a source is missing.
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    /// An external tool exited unsuccessfully.
    #[error("{tool} failed ({status}): {stderr}")]
    ExternalTool {
        /// The tool that was invoked.
        tool: String,
        /// Exit status description.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// A stage exceeded its execution budget.
    #[error("stage '{stage}' timed out after {}s", .after.as_secs_f64())]
    Timeout {
        /// The stage that timed out.
        stage: String,
        /// The budget that was exceeded.
        after: Duration,
    },

    /// Work was stopped through its cancellation token.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A filesystem path already exists where a stage wanted to create it.
    #[error("filesystem conflict: {} already exists", .path.display())]
    FilesystemConflict {
        /// The conflicting path.
        path: PathBuf,
    },

    /// A requested job, result or artifact does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A submission was rejected before scheduling.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The job graph contains a cycle.
    #[error("cycle detected in job graph at execution {0}")]
    CycleDetected(Uuid),

    /// No execution record with this id.
    #[error("unknown execution: {0}")]
    UnknownExecution(Uuid),

    /// An execution record was asked to move to a state it cannot reach.
    #[error("invalid transition for execution {id}: {from} -> {to}")]
    InvalidTransition {
        /// The record id.
        id: Uuid,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// Archive read/write error.
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = DumpflowError> = std::result::Result<T, E>;

impl DumpflowError {
    /// Creates a missing-input error.
    #[must_use]
    pub fn missing_input(stage: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingInput {
            stage: stage.into(),
            field: field.into(),
        }
    }

    /// Creates a precondition violation.
    #[must_use]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionViolation(message.into())
    }

    /// Creates an external tool error.
    #[must_use]
    pub fn external_tool(
        tool: impl Into<String>,
        status: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::ExternalTool {
            tool: tool.into(),
            status: status.into(),
            stderr: stderr.into(),
        }
    }

    /// Creates a filesystem conflict error.
    #[must_use]
    pub fn conflict(path: impl Into<PathBuf>) -> Self {
        Self::FilesystemConflict { path: path.into() }
    }

    /// Returns the serializable kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingInput { .. } => ErrorKind::MissingInputError,
            Self::PreconditionViolation(_) => ErrorKind::PreconditionViolation,
            Self::ExternalTool { .. } => ErrorKind::ExternalToolError,
            Self::Timeout { .. } | Self::Cancelled(_) => ErrorKind::TimeoutError,
            Self::FilesystemConflict { .. } => ErrorKind::FilesystemConflictError,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            // An IO failure inside a stage is a failed filesystem side effect.
            Self::Io(_) | Self::Zip(_) => ErrorKind::FilesystemError,
            Self::CycleDetected(_)
            | Self::UnknownExecution(_)
            | Self::InvalidTransition { .. }
            | Self::Serialization(_)
            | Self::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Returns true if a stage with a retry budget may re-run after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalTool { .. } | Self::Timeout { .. })
    }
}

/// Serializable classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Required context field absent.
    MissingInputError,
    /// Target exists or source missing.
    PreconditionViolation,
    /// External tool exited non-zero.
    ExternalToolError,
    /// Execution budget exceeded.
    TimeoutError,
    /// Destination path already exists.
    FilesystemConflictError,
    /// Other filesystem or archive IO failure.
    FilesystemError,
    /// Lookup found nothing.
    NotFound,
    /// Rejected request.
    InvalidRequest,
    /// Invariant violation inside the engine.
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MissingInputError => "MissingInputError",
            Self::PreconditionViolation => "PreconditionViolation",
            Self::ExternalToolError => "ExternalToolError",
            Self::TimeoutError => "TimeoutError",
            Self::FilesystemConflictError => "FilesystemConflictError",
            Self::FilesystemError => "FilesystemError",
            Self::NotFound => "NotFound",
            Self::InvalidRequest => "InvalidRequest",
            Self::InternalError => "InternalError",
        };
        f.write_str(name)
    }
}

/// Error payload stored on a FAILED execution record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// The error classification.
    pub kind: ErrorKind,
    /// Human-readable reason.
    pub message: String,
    /// Name of the stage that failed.
    pub stage: String,
    /// Zero-based position of the failing stage in its chain.
    pub position: usize,
    /// How many times the failing stage was attempted.
    pub attempts: u32,
}

impl ErrorDescriptor {
    /// Builds a descriptor for an error raised by `stage` at `position`.
    #[must_use]
    pub fn new(error: &DumpflowError, stage: impl Into<String>, position: usize, attempts: u32) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            stage: stage.into(),
            position,
            attempts,
        }
    }

    /// Renders the descriptor as a short traceback-like text block.
    #[must_use]
    pub fn traceback(&self) -> String {
        format!(
            "{}: {}\n  in stage '{}' (position {}, attempt {})",
            self.kind, self.message, self.stage, self.position, self.attempts
        )
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind.to_string()));
        map.insert("message".to_string(), serde_json::json!(self.message));
        map.insert("stage".to_string(), serde_json::json!(self.stage));
        map.insert("position".to_string(), serde_json::json!(self.position));
        map.insert("attempts".to_string(), serde_json::json!(self.attempts));
        map
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in stage '{}' (#{}): {}",
            self.kind, self.stage, self.position, self.message
        )
    }
}
