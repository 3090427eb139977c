//! # Dumpflow
//!
//! Backup and restore job orchestration for a PostgreSQL database and its
//! filestore directory.
//!
//! A job is a chain of stages run strictly in order:
//!
//! - **Backup**: allocate a workdir, write a manifest, dump the database,
//!   bundle both into a zip archive, append the filestore tree, clean up.
//! - **Restore**: check preconditions, extract the dump, create the
//!   database, load the dump, extract the filestore.
//!
//! Every stage execution is recorded in a [`graph::JobGraph`]. A failed
//! stage stops its chain and triggers one compensation hook that removes
//! the job's working directory.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dumpflow::prelude::*;
//!
//! let service = JobService::from_settings(Settings::from_env()?);
//! let job = service.submit_backup(BackupRequest::new("acme").with_filestore(true))?;
//!
//! // Later, from any task:
//! let report = service.status(job.task_id)?;
//! if report.status == ExecutionState::Succeeded {
//!     let download = service.download(job.task_id, TransferMode::Stream).await?;
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod archive;
pub mod cancellation;
pub mod compensation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod graph;
pub mod observability;
pub mod pipeline;
pub mod progress;
pub mod service;
pub mod stages;
pub mod testing;
pub mod tools;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::compensation::{ErrorHook, StageFailure, WorkdirCompensator};
    pub use crate::config::{PostgresConfig, Settings};
    pub use crate::core::{ContextField, DumpFormat, ExecutionState, FileInfo, JobContext, JobKind};
    pub use crate::errors::{DumpflowError, ErrorDescriptor, ErrorKind, Result};
    pub use crate::events::{CollectingEventSink, EventSink, JobEvent, LoggingEventSink, NoOpEventSink};
    pub use crate::graph::{ChainState, JobGraph, StageExecutionRecord};
    pub use crate::observability::{init_logging, LogConfig};
    pub use crate::pipeline::{ChainPlan, RetryConfig, Sequencer, StagePolicy};
    pub use crate::progress::{ProgressEvent, ProgressHandle};
    pub use crate::service::{BackupRequest, JobService, RestoreRequest, StatusReport, TransferMode};
    pub use crate::stages::{Stage, StageEnv, StageKind, StageRegistry};
    pub use crate::tools::{DatabaseTools, PostgresTools};
    pub use crate::utils::{generate_uuid, iso_timestamp, Timestamp};
}
