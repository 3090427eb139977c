//! The default hook: remove the failing stage's working directory.

use super::{Compensation, ErrorHook, StageFailure};
use async_trait::async_trait;
use tracing::{error, info, warn};

/// Deletes the `workdir` found in the failing stage's own input.
///
/// Only that input is consulted. A failure in a stage that runs after the
/// workdir was removed finds nothing to delete.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkdirCompensator;

impl WorkdirCompensator {
    /// Creates the compensator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ErrorHook for WorkdirCompensator {
    async fn on_failure(&self, failure: &StageFailure) -> Compensation {
        error!(
            execution_id = %failure.execution_id,
            stage = %failure.stage,
            position = failure.position,
            kind = %failure.error.kind,
            "stage failed: {}",
            failure.error.message
        );

        let Some(workdir) = failure.input.workdir.clone() else {
            return Compensation::default();
        };

        let removed = match tokio::fs::remove_dir_all(&workdir).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(workdir = %workdir.display(), error = %e, "could not clean workdir");
                false
            }
        };
        info!(workdir = %workdir.display(), removed, "compensated failed chain");

        Compensation {
            workdir: Some(workdir),
            removed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DumpFormat, JobContext};
    use crate::errors::{DumpflowError, ErrorDescriptor};
    use uuid::Uuid;

    fn failure(input: JobContext) -> StageFailure {
        let err = DumpflowError::external_tool("pg_dump", "exit status: 1", "boom");
        StageFailure {
            execution_id: Uuid::new_v4(),
            stage: "dump_db".into(),
            position: 2,
            input,
            error: ErrorDescriptor::new(&err, "dump_db", 2, 1),
        }
    }

    #[tokio::test]
    async fn test_removes_workdir_from_input() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("job");
        std::fs::create_dir_all(workdir.join("nested")).unwrap();
        std::fs::write(workdir.join("nested/dump.sql"), b"--").unwrap();
        let mut ctx = JobContext::backup("acme", false, DumpFormat::Sql);
        ctx.workdir = Some(workdir.clone());

        let outcome = WorkdirCompensator.on_failure(&failure(ctx)).await;

        assert!(outcome.removed);
        assert_eq!(outcome.workdir, Some(workdir.clone()));
        assert!(!workdir.exists());
    }

    #[tokio::test]
    async fn test_without_workdir_does_nothing() {
        let outcome = WorkdirCompensator
            .on_failure(&failure(JobContext::backup("acme", false, DumpFormat::Sql)))
            .await;
        assert_eq!(outcome, Compensation::default());
    }

    #[tokio::test]
    async fn test_already_missing_workdir_counts_as_removed() {
        let mut ctx = JobContext::backup("acme", false, DumpFormat::Sql);
        ctx.workdir = Some(std::env::temp_dir().join(format!("dumpflow-gone-{}", Uuid::new_v4())));

        assert!(WorkdirCompensator.on_failure(&failure(ctx)).await.removed);
    }
}
