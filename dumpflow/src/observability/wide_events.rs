//! One wide payload per finished chain.
//!
//! Instead of correlating a dozen stage events, a consumer can read the
//! whole story of a chain from a single JSON object.

use crate::core::JobKind;
use crate::graph::StageExecutionRecord;

/// Builds the summary of a chain from its records, in chain order.
#[must_use]
pub fn chain_summary(kind: JobKind, outcome: &str, records: &[StageExecutionRecord]) -> serde_json::Value {
    let stages: Vec<serde_json::Value> = records
        .iter()
        .map(|record| {
            let duration_ms = match (record.started_at, record.finished_at) {
                (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
                _ => None,
            };
            let mut stage = serde_json::json!({
                "id": record.id,
                "stage": record.stage,
                "state": record.state,
                "attempts": record.attempts,
                "duration_ms": duration_ms,
            });
            if let Some(error) = record.result.as_ref().and_then(|r| r.error()) {
                stage["error"] = serde_json::json!(error.message);
            }
            stage
        })
        .collect();

    let total_attempts: u32 = records.iter().map(|r| r.attempts).sum();
    serde_json::json!({
        "kind": kind,
        "outcome": outcome,
        "root_id": records.first().map(|r| r.id),
        "task_id": records.last().map(|r| r.id),
        "stage_count": records.len(),
        "total_attempts": total_attempts,
        "stages": stages,
    })
}
