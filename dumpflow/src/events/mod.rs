//! Event sink system for observability.
//!
//! Chains report stage and chain lifecycle transitions to an [`EventSink`].
//! The default sink logs through `tracing`.

mod event;
mod sink;

pub use event::JobEvent;
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
