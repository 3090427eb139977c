//! Side channel through which a running stage publishes progress.

use crate::cancellation::CancellationToken;
use crate::events::{EventSink, JobEvent};
use crate::graph::JobGraph;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// A published progress decile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The running execution.
    pub stage_execution_id: Uuid,
    /// Completion percentage, a multiple of ten.
    pub percent: u8,
}

/// Fans progress out to the job graph, subscribers and the event sink.
///
/// Publishing never blocks and never fails: a lagging or absent subscriber
/// simply misses events.
pub struct ProgressReporter {
    graph: Arc<JobGraph>,
    sink: Arc<dyn EventSink>,
    sender: broadcast::Sender<ProgressEvent>,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl ProgressReporter {
    /// Creates a reporter writing into `graph` and `sink`.
    #[must_use]
    pub fn new(graph: Arc<JobGraph>, sink: Arc<dyn EventSink>) -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { graph, sink, sender }
    }

    /// Subscribes to every future progress event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Publishes a percent for a running execution.
    pub fn publish(&self, stage_execution_id: Uuid, percent: u8) {
        if !self.graph.set_progress(stage_execution_id, percent) {
            debug!(%stage_execution_id, percent, "progress for a stage that is not running");
            return;
        }
        self.sink
            .try_emit(&JobEvent::stage_progress(stage_execution_id, percent));
        let _ = self.sender.send(ProgressEvent {
            stage_execution_id,
            percent,
        });
    }

    /// Binds the reporter to one execution.
    #[must_use]
    pub fn handle(self: &Arc<Self>, stage_execution_id: Uuid) -> ProgressHandle {
        ProgressHandle {
            reporter: Some(Arc::clone(self)),
            stage_execution_id,
            attempt: None,
        }
    }
}

/// A reporter bound to one execution, handed to the stage that runs it.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    reporter: Option<Arc<ProgressReporter>>,
    stage_execution_id: Uuid,
    attempt: Option<CancellationToken>,
}

impl ProgressHandle {
    /// A handle that drops every report.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            reporter: None,
            stage_execution_id: Uuid::nil(),
            attempt: None,
        }
    }

    /// Ties the handle to one attempt: once `token` is cancelled, reports
    /// from that attempt are dropped even if a retry has the execution
    /// running again.
    #[must_use]
    pub fn bound_to(mut self, token: CancellationToken) -> Self {
        self.attempt = Some(token);
        self
    }

    /// The execution this handle reports for.
    #[must_use]
    pub fn stage_execution_id(&self) -> Uuid {
        self.stage_execution_id
    }

    /// Publishes a percent.
    pub fn report(&self, percent: u8) {
        if self.attempt.as_ref().is_some_and(CancellationToken::is_cancelled) {
            debug!(stage_execution_id = %self.stage_execution_id, percent, "progress from a cancelled attempt");
            return;
        }
        if let Some(ref reporter) = self.reporter {
            reporter.publish(self.stage_execution_id, percent);
        }
    }
}
