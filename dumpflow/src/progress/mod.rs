//! Progress reporting for the long-running archiving stage.

mod reporter;
mod tracker;

pub use reporter::{ProgressEvent, ProgressHandle, ProgressReporter};
pub use tracker::ProgressTracker;
