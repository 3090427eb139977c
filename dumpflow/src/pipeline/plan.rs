//! Fixed stage lists of the two job kinds.

use crate::core::{ContextField, JobContext, JobKind};
use crate::errors::{DumpflowError, Result};
use crate::stages::{StageKind, StageRegistry};
use std::collections::HashSet;

/// The ordered stages of one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainPlan {
    /// Backup or restore.
    pub kind: JobKind,
    /// Stages in execution order.
    pub stages: Vec<StageKind>,
}

impl ChainPlan {
    /// Workdir, manifest, dump, archive, filestore, cleanup.
    #[must_use]
    pub fn backup() -> Self {
        Self {
            kind: JobKind::Backup,
            stages: vec![
                StageKind::CreateEnv,
                StageKind::CreateManifest,
                StageKind::DumpDb,
                StageKind::AddToZip,
                StageKind::AddFilestore,
                StageKind::CleanWorkdir,
            ],
        }
    }

    /// Preconditions, dump extraction, database creation, load, filestore.
    #[must_use]
    pub fn restore() -> Self {
        Self {
            kind: JobKind::Restore,
            stages: vec![
                StageKind::InitRestore,
                StageKind::UnzipDump,
                StageKind::CreateDatabase,
                StageKind::RestoreDump,
                StageKind::UnzipFilestore,
            ],
        }
    }

    /// The plan of a job kind.
    #[must_use]
    pub fn for_kind(kind: JobKind) -> Self {
        match kind {
            JobKind::Backup => Self::backup(),
            JobKind::Restore => Self::restore(),
        }
    }

    /// Stage names in order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(StageKind::name).collect()
    }

    /// Whether the first stage goes through chain admission.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        self.kind == JobKind::Backup
    }

    /// Checks that every stage is registered and that each required field
    /// is set initially or provided by an earlier stage.
    pub fn validate(&self, registry: &StageRegistry, initial: &JobContext) -> Result<()> {
        if self.stages.is_empty() {
            return Err(DumpflowError::Internal(format!("{} chain has no stages", self.kind)));
        }

        let mut available: HashSet<ContextField> = ContextField::ALL
            .into_iter()
            .filter(|f| initial.has(*f))
            .collect();

        for kind in &self.stages {
            let stage = registry.get(*kind)?;
            if let Some(missing) = stage.requires().iter().find(|f| !available.contains(*f)) {
                return Err(DumpflowError::missing_input(kind.name(), missing.as_str()));
            }
            available.extend(stage.provides().iter().copied());
        }
        Ok(())
    }
}
