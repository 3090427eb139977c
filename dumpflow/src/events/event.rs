//! Lifecycle events emitted while chains execute.

use crate::core::JobKind;
use crate::errors::ErrorDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// An event describing something that happened to a stage or chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// The event type (e.g., "stage.started", "chain.failed").
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the event occurred (ISO 8601).
    pub timestamp: String,

    /// The execution the event is about.
    pub execution_id: Uuid,

    /// The event payload data.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl JobEvent {
    /// Creates a new event.
    #[must_use]
    pub fn new(event_type: impl Into<String>, execution_id: Uuid) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: crate::utils::iso_timestamp(),
            execution_id,
            data: HashMap::new(),
        }
    }

    /// Adds a data field to the event.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// A stage started an attempt.
    #[must_use]
    pub fn stage_started(execution_id: Uuid, stage: &str, attempt: u32) -> Self {
        Self::new("stage.started", execution_id)
            .add_data("stage", serde_json::json!(stage))
            .add_data("attempt", serde_json::json!(attempt))
    }

    /// A stage succeeded.
    #[must_use]
    pub fn stage_succeeded(execution_id: Uuid, stage: &str, duration_ms: f64) -> Self {
        Self::new("stage.succeeded", execution_id)
            .add_data("stage", serde_json::json!(stage))
            .add_data("duration_ms", serde_json::json!(duration_ms))
    }

    /// A stage failed an attempt and will run again.
    #[must_use]
    pub fn stage_retrying(execution_id: Uuid, stage: &str, attempt: u32, error: &str) -> Self {
        Self::new("stage.retrying", execution_id)
            .add_data("stage", serde_json::json!(stage))
            .add_data("attempt", serde_json::json!(attempt))
            .add_data("error", serde_json::json!(error))
    }

    /// A stage failed for good.
    #[must_use]
    pub fn stage_failed(execution_id: Uuid, error: &ErrorDescriptor) -> Self {
        Self::new("stage.failed", execution_id)
            .add_data("stage", serde_json::json!(error.stage))
            .add_data("error", serde_json::json!(error))
    }

    /// A long-running stage published a progress decile.
    #[must_use]
    pub fn stage_progress(execution_id: Uuid, percent: u8) -> Self {
        Self::new("stage.progress", execution_id).add_data("percent", serde_json::json!(percent))
    }

    /// Every stage of a chain succeeded.
    #[must_use]
    pub fn chain_succeeded(handle: Uuid, kind: JobKind) -> Self {
        Self::new("chain.succeeded", handle).add_data("kind", serde_json::json!(kind))
    }

    /// A chain stopped at a failing stage.
    #[must_use]
    pub fn chain_failed(handle: Uuid, kind: JobKind, error: &ErrorDescriptor) -> Self {
        Self::new("chain.failed", handle)
            .add_data("kind", serde_json::json!(kind))
            .add_data("stage", serde_json::json!(error.stage))
            .add_data("position", serde_json::json!(error.position))
    }

    /// The error hook ran for a failed chain.
    #[must_use]
    pub fn chain_compensated(execution_id: Uuid, workdir: Option<&std::path::Path>, removed: bool) -> Self {
        Self::new("chain.compensated", execution_id)
            .add_data("workdir", serde_json::json!(workdir))
            .add_data("removed", serde_json::json!(removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_event_creation() {
        let id = Uuid::new_v4();
        let event = JobEvent::new("test.event", id);
        assert_eq!(event.event_type, "test.event");
        assert_eq!(event.execution_id, id);
        assert!(event.data.is_empty());
    }

    #[test]
    fn test_stage_started() {
        let event = JobEvent::stage_started(Uuid::new_v4(), "dump_db", 2);
        assert_eq!(event.event_type, "stage.started");
        assert_eq!(event.data.get("stage"), Some(&serde_json::json!("dump_db")));
        assert_eq!(event.data.get("attempt"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn test_chain_failed_carries_position() {
        let error = ErrorDescriptor {
            kind: ErrorKind::PreconditionViolation,
            message: "missing".into(),
            stage: "init_restore".into(),
            position: 0,
            attempts: 1,
        };
        let event = JobEvent::chain_failed(Uuid::new_v4(), JobKind::Restore, &error);
        assert_eq!(event.data.get("kind"), Some(&serde_json::json!("restore")));
        assert_eq!(event.data.get("position"), Some(&serde_json::json!(0)));
    }

    #[test]
    fn test_event_serialization() {
        let event = JobEvent::stage_progress(Uuid::new_v4(), 30);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"stage.progress""#));
        let back: JobEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
