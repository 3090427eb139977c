//! Lookup table from stage kind to implementation.

use super::{
    AddFilestore, AddToZip, CleanWorkdir, CreateDatabase, CreateEnv, CreateManifest, DumpDb, InitRestore,
    RestoreDump, Stage, StageKind, UnzipDump, UnzipFilestore,
};
use crate::errors::{DumpflowError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps each [`StageKind`] to the stage that runs it.
///
/// Chains name stages by kind only; swapping an entry changes the
/// implementation without touching chain definitions.
#[derive(Debug, Default, Clone)]
pub struct StageRegistry {
    stages: HashMap<StageKind, Arc<dyn Stage>>,
}

impl StageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every built-in stage.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for kind in StageKind::ALL {
            registry.register(Self::builtin(kind));
        }
        registry
    }

    /// The built-in implementation of a kind.
    #[must_use]
    pub fn builtin(kind: StageKind) -> Arc<dyn Stage> {
        match kind {
            StageKind::CreateEnv => Arc::new(CreateEnv),
            StageKind::CreateManifest => Arc::new(CreateManifest),
            StageKind::DumpDb => Arc::new(DumpDb),
            StageKind::AddToZip => Arc::new(AddToZip),
            StageKind::AddFilestore => Arc::new(AddFilestore),
            StageKind::CleanWorkdir => Arc::new(CleanWorkdir),
            StageKind::InitRestore => Arc::new(InitRestore),
            StageKind::UnzipDump => Arc::new(UnzipDump),
            StageKind::CreateDatabase => Arc::new(CreateDatabase),
            StageKind::RestoreDump => Arc::new(RestoreDump),
            StageKind::UnzipFilestore => Arc::new(UnzipFilestore),
        }
    }

    /// Registers a stage under its own kind, replacing any previous entry.
    pub fn register(&mut self, stage: Arc<dyn Stage>) {
        self.stages.insert(stage.kind(), stage);
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, stage: Arc<dyn Stage>) -> Self {
        self.register(stage);
        self
    }

    /// Returns the stage for a kind.
    pub fn get(&self, kind: StageKind) -> Result<Arc<dyn Stage>> {
        self.stages
            .get(&kind)
            .cloned()
            .ok_or_else(|| DumpflowError::Internal(format!("no stage registered for '{kind}'")))
    }

    /// Returns true if a kind is registered.
    #[must_use]
    pub fn contains(&self, kind: StageKind) -> bool {
        self.stages.contains_key(&kind)
    }

    /// Number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_covers_every_kind() {
        let registry = StageRegistry::standard();
        assert_eq!(registry.len(), StageKind::ALL.len());
        for kind in StageKind::ALL {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
    }

    #[test]
    fn test_missing_kind_is_an_error() {
        let registry = StageRegistry::new().with(Arc::new(CreateEnv));
        assert!(registry.contains(StageKind::CreateEnv));
        assert!(registry.get(StageKind::DumpDb).is_err());
    }
}
