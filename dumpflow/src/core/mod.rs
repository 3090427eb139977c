//! Core domain model types for dumpflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - The job context threaded through a chain
//! - Execution state and job kind enums

mod context;
mod status;

pub use context::{ContextField, DumpFormat, FileInfo, JobContext, DOWNLOAD_KEY};
pub use status::{ExecutionState, JobKind};
