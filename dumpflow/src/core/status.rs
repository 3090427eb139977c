//! Execution state and job kind enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of job a chain implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Dump a database (and optionally its filestore) into an archive.
    Backup,
    /// Recreate a database and its filestore from an archive.
    Restore,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backup => write!(f, "backup"),
            Self::Restore => write!(f, "restore"),
        }
    }
}

/// The state of a single stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    /// Scheduled but not started.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Failed once and waiting to run again.
    Retrying,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Retrying => write!(f, "RETRYING"),
        }
    }
}

impl ExecutionState {
    /// Returns true if the state is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns true if a record in this state may move to `next`.
    ///
    /// Terminal states never change. A retry loops back through RUNNING.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running | Self::Failed) => true,
            (Self::Running, Self::Succeeded | Self::Failed | Self::Retrying) => true,
            (Self::Retrying, Self::Running | Self::Failed) => true,
            _ => false,
        }
    }
}
