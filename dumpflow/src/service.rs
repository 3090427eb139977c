//! Submission, status and download entry points.
//!
//! [`JobService`] is the surface an HTTP layer or a CLI sits on. Submission
//! validates the request, hands the chain to the [`Sequencer`] and returns
//! immediately. Status queries read a snapshot of the job graph and never
//! wait for a chain to finish.

use crate::config::Settings;
use crate::core::{ExecutionState, JobContext, DOWNLOAD_KEY};
use crate::errors::{DumpflowError, Result};
use crate::graph::StageResult;
use crate::pipeline::{ChainPlan, Sequencer};
use crate::tools::PostgresTools;
use crate::utils::{validate_archive_filename, validate_database_name};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

const CHUNK_SIZE: usize = 64 * 1024;

/// Backup submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRequest {
    /// Database to back up.
    pub name: String,
    /// Include the filestore; defaults to the configured value.
    #[serde(default)]
    pub filestore: Option<bool>,
    /// `sql` or `custom`; defaults to the configured value.
    #[serde(default)]
    pub dump_format: Option<String>,
}

impl BackupRequest {
    /// A request that takes every option from the settings.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filestore: None,
            dump_format: None,
        }
    }

    /// Overrides the filestore flag.
    #[must_use]
    pub fn with_filestore(mut self, filestore: bool) -> Self {
        self.filestore = Some(filestore);
        self
    }

    /// Overrides the dump format.
    #[must_use]
    pub fn with_dump_format(mut self, format: impl Into<String>) -> Self {
        self.dump_format = Some(format.into());
        self
    }
}

/// Restore submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// Database to create.
    pub name: String,
    /// Archive file name under the input root.
    pub filename: String,
}

impl RestoreRequest {
    /// Creates a restore request.
    #[must_use]
    pub fn new(name: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: filename.into(),
        }
    }
}

/// Answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// Job handle: the last stage execution of the chain.
    pub task_id: Uuid,
    /// First stage execution of the chain.
    pub parent_id: Uuid,
    /// Stage names from the handle back to the root (restores only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<Vec<String>>,
}

/// Snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// The queried execution.
    pub id: Uuid,
    /// Output context on success; on failure the error fields plus the
    /// `context` the failing stage was given.
    pub result: Option<serde_json::Value>,
    /// Failure description, empty unless FAILED.
    pub traceback: String,
    /// State of the queried execution.
    pub status: ExecutionState,
    /// Every stage of the chain with its state, root first.
    pub tasks: Vec<(String, ExecutionState)>,
    /// Last published percent of a running stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

/// How a download hands over the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Chunked stream read lazily from disk.
    #[default]
    Stream,
    /// The whole file in memory.
    File,
}

/// A resolved result file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Location on disk.
    pub path: PathBuf,
    /// Base name offered to the client.
    pub filename: String,
    /// Size in bytes at lookup time.
    pub size: u64,
}

/// Download payload.
pub enum DownloadBody {
    /// Chunks in file order.
    Stream(BoxStream<'static, std::io::Result<Vec<u8>>>),
    /// Whole file.
    File(Vec<u8>),
}

impl std::fmt::Debug for DownloadBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("DownloadBody::Stream"),
            Self::File(bytes) => write!(f, "DownloadBody::File({} bytes)", bytes.len()),
        }
    }
}

/// A file ready to send.
#[derive(Debug)]
pub struct Download {
    /// What is being sent.
    pub artifact: Artifact,
    /// The bytes.
    pub body: DownloadBody,
}

impl Download {
    /// Collects the body into memory.
    pub async fn into_bytes(self) -> Result<Vec<u8>> {
        match self.body {
            DownloadBody::File(bytes) => Ok(bytes),
            DownloadBody::Stream(mut chunks) => {
                let mut bytes = Vec::new();
                while let Some(chunk) = chunks.next().await {
                    bytes.extend_from_slice(&chunk?);
                }
                Ok(bytes)
            }
        }
    }
}

fn chunked(file: tokio::fs::File) -> BoxStream<'static, std::io::Result<Vec<u8>>> {
    stream::unfold(Some(file), |state| async move {
        let mut file = state?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(buf), Some(file)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

/// Job submission and query facade.
#[derive(Debug, Clone)]
pub struct JobService {
    sequencer: Sequencer,
}

impl JobService {
    /// Wraps a sequencer.
    #[must_use]
    pub fn new(sequencer: Sequencer) -> Self {
        Self { sequencer }
    }

    /// A service backed by the PostgreSQL client tools with default wiring.
    #[must_use]
    pub fn from_settings(settings: Settings) -> Self {
        let tools = Arc::new(PostgresTools::new(settings.postgres.clone()));
        Self::new(Sequencer::builder(Arc::new(settings), tools).build())
    }

    /// The underlying sequencer.
    #[must_use]
    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// Submits a backup chain.
    pub fn submit_backup(&self, request: BackupRequest) -> Result<SubmitResponse> {
        validate_database_name(&request.name)?;
        let settings = self.sequencer.settings();
        let format = match request.dump_format.as_deref() {
            Some(format) => format.parse()?,
            None => settings.dump_format,
        };
        let filestore = request.filestore.unwrap_or(settings.dump_filestore);

        let handle = self.sequencer.submit(
            ChainPlan::backup(),
            JobContext::backup(request.name, filestore, format),
        )?;
        Ok(SubmitResponse {
            task_id: handle.task_id,
            parent_id: handle.parent_id,
            names: None,
        })
    }

    /// Submits a restore chain.
    pub fn submit_restore(&self, request: RestoreRequest) -> Result<SubmitResponse> {
        validate_database_name(&request.name)?;
        validate_archive_filename(&request.filename)?;

        let handle = self.sequencer.submit(
            ChainPlan::restore(),
            JobContext::restore(request.name, request.filename),
        )?;
        Ok(SubmitResponse {
            task_id: handle.task_id,
            parent_id: handle.parent_id,
            names: Some(handle.names),
        })
    }

    /// Reports the state of a job and every stage of its chain.
    pub fn status(&self, id: Uuid) -> Result<StatusReport> {
        let graph = self.sequencer.graph();
        let record = graph
            .get(id)
            .ok_or_else(|| DumpflowError::NotFound(format!("no job {id}")))?;
        let tree = graph.tree(id)?;

        let (result, traceback) = match record.result {
            Some(StageResult::Succeeded { ref context }) => (Some(serde_json::to_value(context)?), String::new()),
            Some(StageResult::Failed { ref error, ref context }) => {
                let mut payload = error.to_dict();
                payload.insert("context".to_string(), serde_json::to_value(context)?);
                (Some(serde_json::to_value(payload)?), error.traceback())
            }
            None => (None, String::new()),
        };

        Ok(StatusReport {
            id,
            result,
            traceback,
            status: record.state,
            progress: tree.iter().find_map(|r| r.progress),
            tasks: tree.into_iter().map(|r| (r.stage, r.state)).collect(),
        })
    }

    /// Resolves a result file of a finished job by key.
    ///
    /// Fails with [`DumpflowError::NotFound`] unless the job SUCCEEDED and
    /// the file still exists.
    pub async fn resolve_artifact(&self, id: Uuid, key: &str) -> Result<Artifact> {
        let record = self
            .sequencer
            .graph()
            .get(id)
            .ok_or_else(|| DumpflowError::NotFound(format!("no job {id}")))?;

        let path = match record.result {
            Some(StageResult::Succeeded { ref context }) if record.state == ExecutionState::Succeeded => context
                .artifact(key)
                .map(Path::to_path_buf)
                .ok_or_else(|| DumpflowError::NotFound(format!("job {id} has no '{key}' result")))?,
            _ => {
                return Err(DumpflowError::NotFound(format!(
                    "job {id} has not succeeded (state {})",
                    record.state
                )))
            }
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            _ => {
                return Err(DumpflowError::NotFound(format!(
                    "{} no longer exists",
                    path.display()
                )))
            }
        };
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Artifact {
            path,
            filename,
            size: metadata.len(),
        })
    }

    /// Opens the archive of a finished backup.
    pub async fn download(&self, id: Uuid, mode: TransferMode) -> Result<Download> {
        let artifact = self.resolve_artifact(id, DOWNLOAD_KEY).await?;
        debug!(job = %id, path = %artifact.path.display(), ?mode, "download");

        let body = match mode {
            TransferMode::Stream => DownloadBody::Stream(chunked(tokio::fs::File::open(&artifact.path).await?)),
            TransferMode::File => DownloadBody::File(tokio::fs::read(&artifact.path).await?),
        };
        Ok(Download { artifact, body })
    }

    /// Drops finished chains older than the retention window.
    pub fn prune(&self) -> usize {
        let retention = self.sequencer.settings().result_retention();
        let removed = self.sequencer.graph().prune_expired(retention);
        if removed > 0 {
            info!(removed, "pruned expired chains");
        }
        removed
    }

    /// Runs [`JobService::prune`] every `every` until the task is aborted.
    #[must_use]
    pub fn spawn_retention_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                service.prune();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDatabaseTools, TestRoots};
    use pretty_assertions::assert_eq;

    const WAIT: Duration = Duration::from_secs(10);

    fn service(roots: &TestRoots, tools: FakeDatabaseTools) -> JobService {
        JobService::new(Sequencer::builder(Arc::new(roots.settings().clone()), Arc::new(tools)).build())
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_names() {
        let roots = TestRoots::new();
        let service = service(&roots, FakeDatabaseTools::new());

        let err = service.submit_backup(BackupRequest::new("../etc")).unwrap_err();
        assert!(matches!(err, DumpflowError::InvalidRequest(_)));
        let err = service
            .submit_restore(RestoreRequest::new("acme", "../../secret.zip"))
            .unwrap_err();
        assert!(matches!(err, DumpflowError::InvalidRequest(_)));
        let err = service
            .submit_backup(BackupRequest::new("acme").with_dump_format("tar"))
            .unwrap_err();
        assert!(matches!(err, DumpflowError::InvalidRequest(_)));
        assert!(service.sequencer().graph().is_empty());
    }

    #[tokio::test]
    async fn test_restore_response_lists_names() {
        let roots = TestRoots::new();
        let service = service(&roots, FakeDatabaseTools::new());

        let response = service
            .submit_restore(RestoreRequest::new("acme", "acme.zip"))
            .unwrap();

        assert_eq!(
            response.names.unwrap(),
            ["unzip_filestore", "restore_dump", "create_database", "unzip_dump", "init_restore"]
        );
        assert_ne!(response.task_id, response.parent_id);
    }

    #[tokio::test]
    async fn test_status_reports_success_and_download() {
        let roots = TestRoots::new();
        let service = service(&roots, FakeDatabaseTools::new().with_database("acme"));

        let response = service.submit_backup(BackupRequest::new("acme")).unwrap();
        service.sequencer().wait(response.task_id, WAIT).await.unwrap();

        let report = service.status(response.task_id).unwrap();
        assert_eq!(report.status, ExecutionState::Succeeded);
        assert_eq!(report.tasks.len(), 6);
        assert!(report.traceback.is_empty());
        assert!(report.result.unwrap()["download"].is_string());

        let streamed = service
            .download(response.task_id, TransferMode::Stream)
            .await
            .unwrap();
        let whole = service.download(response.task_id, TransferMode::File).await.unwrap();
        assert_eq!(streamed.artifact, whole.artifact);
        assert_eq!(streamed.into_bytes().await.unwrap(), whole.into_bytes().await.unwrap());
    }

    #[tokio::test]
    async fn test_download_requires_existing_file() {
        let roots = TestRoots::new();
        let service = service(&roots, FakeDatabaseTools::new().with_database("acme"));
        let response = service.submit_backup(BackupRequest::new("acme")).unwrap();
        service.sequencer().wait(response.task_id, WAIT).await.unwrap();

        let artifact = service.resolve_artifact(response.task_id, DOWNLOAD_KEY).await.unwrap();
        std::fs::remove_file(&artifact.path).unwrap();

        let err = service
            .download(response.task_id, TransferMode::File)
            .await
            .unwrap_err();
        assert!(matches!(err, DumpflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_job_has_traceback_and_no_download() {
        let roots = TestRoots::new();
        let service = service(&roots, FakeDatabaseTools::new());

        let response = service.submit_backup(BackupRequest::new("ghost")).unwrap();
        service.sequencer().wait(response.task_id, WAIT).await.unwrap();

        let report = service.status(response.task_id).unwrap();
        assert_eq!(report.status, ExecutionState::Failed);
        assert!(report.traceback.contains("create_manifest"));
        let result = report.result.unwrap();
        assert_eq!(result["type"], "ExternalToolError");
        assert_eq!(result["context"]["database_name"], "ghost");

        let err = service
            .download(response.task_id, TransferMode::Stream)
            .await
            .unwrap_err();
        assert!(matches!(err, DumpflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let roots = TestRoots::new();
        let service = service(&roots, FakeDatabaseTools::new());

        assert!(matches!(
            service.status(Uuid::new_v4()),
            Err(DumpflowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_prune_keeps_fresh_chains() {
        let roots = TestRoots::new();
        let service = service(&roots, FakeDatabaseTools::new().with_database("acme"));
        let response = service.submit_backup(BackupRequest::new("acme")).unwrap();
        service.sequencer().wait(response.task_id, WAIT).await.unwrap();

        assert_eq!(service.prune(), 0);
        assert!(service.status(response.task_id).is_ok());
    }
}
