//! Chain planning and execution.
//!
//! This module provides:
//! - The fixed stage plans of backup and restore chains
//! - Per-stage timeout and retry policies with backoff
//! - Admission rate limiting for backup chains
//! - The sequencer that drives chains against the job graph

mod plan;
mod policy;
mod rate_limit;
mod retry;
mod sequencer;

pub use plan::ChainPlan;
pub use policy::StagePolicy;
pub use rate_limit::RateLimiter;
pub use retry::{BackoffStrategy, JitterStrategy, RetryConfig};
pub use sequencer::{ChainHandle, Sequencer, SequencerBuilder};
