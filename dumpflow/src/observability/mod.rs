//! Observability utilities.

mod logging;
mod wide_events;

pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat};
pub use wide_events::chain_summary;
