//! Failure compensation.
//!
//! Every chain carries exactly one [`ErrorHook`]. The sequencer calls it at
//! most once, with the input context of the stage that failed. Stages that
//! already succeeded are not rolled back: a database created earlier in a
//! restore stays in place.

mod workdir;

pub use workdir::WorkdirCompensator;

use crate::core::JobContext;
use crate::errors::ErrorDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// What the hook receives about a failed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    /// The failing execution.
    pub execution_id: Uuid,
    /// Name of the failing stage.
    pub stage: String,
    /// Position of the failing stage in its chain.
    pub position: usize,
    /// The context the failing stage was invoked with.
    pub input: JobContext,
    /// What went wrong.
    pub error: ErrorDescriptor,
}

/// What a hook did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compensation {
    /// The working directory the hook targeted, if the input had one.
    pub workdir: Option<PathBuf>,
    /// Whether that directory is gone afterwards.
    pub removed: bool,
}

/// Chain-wide error hook.
///
/// Implementations must not panic and must not fail: cleanup problems are
/// logged and reported through [`Compensation`].
#[async_trait]
pub trait ErrorHook: Send + Sync {
    /// Handles a stage failure.
    async fn on_failure(&self, failure: &StageFailure) -> Compensation;
}
