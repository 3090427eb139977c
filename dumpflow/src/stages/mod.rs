//! Stage trait and the backup and restore stages.
//!
//! A stage takes the previous stage's [`JobContext`] by value and returns
//! the next one. It declares which context fields it reads and which it
//! adds, so chains can be validated before anything runs.

mod backup;
mod kind;
mod registry;
mod restore;

pub use backup::{AddFilestore, AddToZip, CleanWorkdir, CreateEnv, CreateManifest, DumpDb, MANIFEST_FILENAME};
pub use kind::StageKind;
pub use registry::StageRegistry;
pub use restore::{CreateDatabase, InitRestore, RestoreDump, UnzipDump, UnzipFilestore};

use crate::cancellation::CancellationToken;
use crate::config::Settings;
use crate::core::{ContextField, JobContext};
use crate::errors::{DumpflowError, Result};
use crate::pipeline::StagePolicy;
use crate::progress::ProgressHandle;
use crate::tools::DatabaseTools;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// Trait for chain stages.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Which stage this is.
    fn kind(&self) -> StageKind;

    /// Name recorded in the job graph.
    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Context fields that must be set before the stage runs.
    fn requires(&self) -> &'static [ContextField] {
        &[]
    }

    /// Context fields the stage sets on success.
    fn provides(&self) -> &'static [ContextField] {
        &[]
    }

    /// Timeout and retry budget.
    fn policy(&self, _settings: &Settings) -> StagePolicy {
        StagePolicy::default()
    }

    /// Runs the stage.
    ///
    /// On error, any artifact the stage was writing has been removed or
    /// was never moved into place.
    async fn run(&self, ctx: JobContext, env: &StageEnv) -> Result<JobContext>;
}

/// What a stage gets besides its context.
#[derive(Clone)]
pub struct StageEnv {
    /// Engine settings.
    pub settings: Arc<Settings>,
    /// Database tooling.
    pub tools: Arc<dyn DatabaseTools>,
    /// Progress side channel bound to this execution.
    pub progress: ProgressHandle,
    /// Set when the stage's time budget runs out.
    pub cancellation: CancellationToken,
}

impl Debug for StageEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageEnv")
            .field("settings", &self.settings)
            .field("progress", &self.progress)
            .field("cancellation", &self.cancellation)
            .finish_non_exhaustive()
    }
}

impl StageEnv {
    /// Creates an environment with detached progress and a fresh token.
    #[must_use]
    pub fn new(settings: Arc<Settings>, tools: Arc<dyn DatabaseTools>) -> Self {
        Self {
            settings,
            tools,
            progress: ProgressHandle::detached(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Binds a progress handle.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressHandle) -> Self {
        self.progress = progress;
        self
    }

    /// Binds a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// Runs blocking filesystem work off the async runtime.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| DumpflowError::Internal(format!("blocking task failed: {e}")))?
}
