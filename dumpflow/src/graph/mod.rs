//! The job graph: an arena of stage execution records.
//!
//! Records are addressed by id and linked through explicit `parent_id` /
//! `children_ids` fields, so the whole structure serializes as-is. A record
//! is created when its stage is submitted, changes only through the
//! transition methods below, and never changes again once terminal.

mod record;
mod traversal;

pub use record::{ChainMeta, ChainState, StageExecutionRecord, StageResult};

use crate::core::{ExecutionState, JobContext};
use crate::errors::{DumpflowError, ErrorDescriptor, Result};
use crate::utils::{generate_uuid, now_utc, Timestamp};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Serialized form of the graph.
#[derive(Debug, Default, Serialize, Deserialize)]
struct GraphSnapshot {
    records: Vec<StageExecutionRecord>,
    chains: Vec<ChainMeta>,
}

/// Thread-safe arena of stage executions plus per-chain metadata.
#[derive(Debug, Default)]
pub struct JobGraph {
    records: RwLock<HashMap<Uuid, StageExecutionRecord>>,
    chains: DashMap<Uuid, ChainMeta>,
}

impl JobGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a new PENDING execution of `stage` under `parent`.
    pub fn schedule(&self, stage: impl Into<String>, parent: Option<Uuid>) -> Result<Uuid> {
        let id = generate_uuid();
        let mut records = self.records.write();

        if let Some(parent_id) = parent {
            let parent_rec = records
                .get_mut(&parent_id)
                .ok_or(DumpflowError::UnknownExecution(parent_id))?;
            parent_rec.children_ids.push(id);
        }
        records.insert(id, StageExecutionRecord::new(id, stage, parent));

        Ok(id)
    }

    /// Returns a copy of a record.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<StageExecutionRecord> {
        self.records.read().get(&id).cloned()
    }

    /// Returns the state of a record.
    #[must_use]
    pub fn state(&self, id: Uuid) -> Option<ExecutionState> {
        self.records.read().get(&id).map(|r| r.state)
    }

    /// Number of records in the arena.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if the arena is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn with_record<T>(
        &self,
        id: Uuid,
        next: ExecutionState,
        apply: impl FnOnce(&mut StageExecutionRecord) -> T,
    ) -> Result<T> {
        let mut records = self.records.write();
        let record = records.get_mut(&id).ok_or(DumpflowError::UnknownExecution(id))?;

        if !record.state.can_transition_to(next) {
            return Err(DumpflowError::InvalidTransition {
                id,
                from: record.state.to_string(),
                to: next.to_string(),
            });
        }

        record.state = next;
        if next.is_terminal() {
            record.finished_at = Some(now_utc());
            record.progress = None;
        }
        Ok(apply(record))
    }

    /// Marks an execution RUNNING and counts the attempt. Returns the attempt number.
    pub fn mark_running(&self, id: Uuid) -> Result<u32> {
        self.with_record(id, ExecutionState::Running, |record| {
            record.started_at = Some(now_utc());
            record.attempts += 1;
            record.progress = None;
            record.attempts
        })
    }

    /// Marks a RUNNING execution as waiting for another attempt.
    pub fn mark_retrying(&self, id: Uuid) -> Result<()> {
        self.with_record(id, ExecutionState::Retrying, |record| {
            record.progress = None;
        })
    }

    /// Marks an execution SUCCEEDED with its output context.
    pub fn mark_succeeded(&self, id: Uuid, context: JobContext) -> Result<()> {
        self.with_record(id, ExecutionState::Succeeded, |record| {
            record.result = Some(StageResult::Succeeded { context });
        })
    }

    /// Marks an execution FAILED with the error and its input context.
    pub fn mark_failed(&self, id: Uuid, error: ErrorDescriptor, context: JobContext) -> Result<()> {
        self.with_record(id, ExecutionState::Failed, |record| {
            record.result = Some(StageResult::Failed { error, context });
        })
    }

    /// Publishes progress on a RUNNING execution. Ignored in any other state.
    pub fn set_progress(&self, id: Uuid, percent: u8) -> bool {
        let mut records = self.records.write();
        match records.get_mut(&id) {
            Some(record) if record.state == ExecutionState::Running => {
                record.progress = Some(percent);
                true
            }
            _ => false,
        }
    }

    /// Id of the chain root reached by following parent links from `id`.
    pub fn root_of(&self, id: Uuid) -> Result<Uuid> {
        let records = self.records.read();
        let path = traversal::ancestors(&records, id)?;
        path.last().copied().ok_or(DumpflowError::UnknownExecution(id))
    }

    /// Stage names from `id` back to its root, in that order.
    pub fn lineage(&self, id: Uuid) -> Result<Vec<String>> {
        let records = self.records.read();
        let path = traversal::ancestors(&records, id)?;
        Ok(path
            .iter()
            .filter_map(|rid| records.get(rid).map(|r| r.stage.clone()))
            .collect())
    }

    /// Records of the whole tree containing `id`, root first.
    pub fn tree(&self, id: Uuid) -> Result<Vec<StageExecutionRecord>> {
        let records = self.records.read();
        let path = traversal::ancestors(&records, id)?;
        let root = *path.last().ok_or(DumpflowError::UnknownExecution(id))?;
        let order = traversal::descendants(&records, root)?;
        Ok(order
            .iter()
            .filter_map(|rid| records.get(rid).cloned())
            .collect())
    }

    /// Flattened `(stage_name, state)` view of the tree containing `id`.
    pub fn flatten(&self, id: Uuid) -> Result<Vec<(String, ExecutionState)>> {
        Ok(self
            .tree(id)?
            .into_iter()
            .map(|r| (r.stage, r.state))
            .collect())
    }

    /// Registers a chain under its root id.
    pub fn register_chain(&self, meta: ChainMeta) -> Result<Uuid> {
        let root = meta
            .root_id()
            .ok_or_else(|| DumpflowError::Internal("cannot register an empty chain".into()))?;
        self.chains.insert(root, meta);
        Ok(root)
    }

    /// Returns a copy of the chain rooted at `root`.
    #[must_use]
    pub fn chain(&self, root: Uuid) -> Option<ChainMeta> {
        self.chains.get(&root).map(|c| c.value().clone())
    }

    /// Returns the chain containing execution `id`.
    pub fn chain_of(&self, id: Uuid) -> Result<ChainMeta> {
        let root = self.root_of(id)?;
        self.chain(root)
            .ok_or_else(|| DumpflowError::NotFound(format!("no chain rooted at {root}")))
    }

    /// Applies `update` to the chain rooted at `root`.
    pub fn update_chain<T>(&self, root: Uuid, update: impl FnOnce(&mut ChainMeta) -> T) -> Result<T> {
        let mut entry = self
            .chains
            .get_mut(&root)
            .ok_or_else(|| DumpflowError::NotFound(format!("no chain rooted at {root}")))?;
        Ok(update(&mut entry))
    }

    /// Moves a chain to a new state, stamping the finish time on terminal states.
    pub fn set_chain_state(&self, root: Uuid, state: ChainState) -> Result<()> {
        self.update_chain(root, |chain| {
            chain.state = state;
            if state.is_terminal() {
                chain.finished_at = Some(now_utc());
            }
        })
    }

    /// Drops finished chains whose finish time is older than `retention`.
    ///
    /// Returns the number of chains removed.
    pub fn prune_expired(&self, retention: Duration) -> usize {
        chrono::Duration::from_std(retention)
            .ok()
            .and_then(|delta| now_utc().checked_sub_signed(delta))
            .map_or(0, |cutoff| self.prune_finished_before(cutoff))
    }

    fn prune_finished_before(&self, cutoff: Timestamp) -> usize {
        let expired: Vec<(Uuid, Vec<Uuid>)> = self
            .chains
            .iter()
            .filter(|c| c.state.is_terminal() && c.finished_at.is_some_and(|t| t < cutoff))
            .map(|c| (*c.key(), c.stage_ids.clone()))
            .collect();

        let mut records = self.records.write();
        for (root, ids) in &expired {
            for id in ids {
                records.remove(id);
            }
            self.chains.remove(root);
        }
        expired.len()
    }

    /// Serializes the graph to JSON.
    pub fn to_json(&self) -> Result<String> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        let snapshot = GraphSnapshot {
            records,
            chains: self.chains.iter().map(|c| c.value().clone()).collect(),
        };
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    /// Rebuilds a graph from JSON produced by [`JobGraph::to_json`].
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: GraphSnapshot = serde_json::from_str(json)?;
        let graph = Self::new();
        {
            let mut records = graph.records.write();
            for record in snapshot.records {
                records.insert(record.id, record);
            }
        }
        for chain in snapshot.chains {
            graph.register_chain(chain)?;
        }
        Ok(graph)
    }

    /// Writes the graph to a file, replacing it atomically.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, self.to_json()?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Loads a graph saved with [`JobGraph::save_to`].
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DumpFormat, JobKind};
    use crate::errors::ErrorKind;
    use pretty_assertions::assert_eq;

    fn chain(graph: &JobGraph, names: &[&str]) -> Vec<Uuid> {
        let mut ids = Vec::new();
        let mut parent = None;
        for name in names {
            let id = graph.schedule(*name, parent).unwrap();
            ids.push(id);
            parent = Some(id);
        }
        graph.register_chain(ChainMeta::new(JobKind::Backup, ids.clone())).unwrap();
        ids
    }

    fn failure() -> ErrorDescriptor {
        ErrorDescriptor {
            kind: ErrorKind::ExternalToolError,
            message: "pg_dump failed".into(),
            stage: "dump_db".into(),
            position: 1,
            attempts: 1,
        }
    }

    #[test]
    fn test_schedule_links_parent_and_children() {
        let graph = JobGraph::new();
        let ids = chain(&graph, &["a", "b", "c"]);

        let root = graph.get(ids[0]).unwrap();
        assert!(root.is_root());
        assert_eq!(root.children_ids, vec![ids[1]]);
        assert!(graph.get(ids[2]).unwrap().is_leaf());
        assert_eq!(graph.get(ids[2]).unwrap().parent_id, Some(ids[1]));
    }

    #[test]
    fn test_schedule_unknown_parent() {
        let graph = JobGraph::new();
        let err = graph.schedule("x", Some(Uuid::new_v4())).unwrap_err();
        assert!(matches!(err, DumpflowError::UnknownExecution(_)));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_flatten_from_handle_walks_up_then_down() {
        let graph = JobGraph::new();
        let ids = chain(&graph, &["create_env", "dump_db", "clean_workdir"]);
        graph.mark_running(ids[0]).unwrap();
        graph.mark_succeeded(ids[0], JobContext::default()).unwrap();
        graph.mark_running(ids[1]).unwrap();

        let flat = graph.flatten(ids[2]).unwrap();
        assert_eq!(
            flat,
            vec![
                ("create_env".to_string(), ExecutionState::Succeeded),
                ("dump_db".to_string(), ExecutionState::Running),
                ("clean_workdir".to_string(), ExecutionState::Pending),
            ]
        );
        assert_eq!(graph.root_of(ids[2]).unwrap(), ids[0]);
    }

    #[test]
    fn test_lineage_is_terminal_to_root() {
        let graph = JobGraph::new();
        let ids = chain(&graph, &["init_restore", "unzip_dump", "create_database"]);

        assert_eq!(
            graph.lineage(ids[2]).unwrap(),
            vec!["create_database", "unzip_dump", "init_restore"]
        );
    }

    #[test]
    fn test_terminal_records_are_immutable() {
        let graph = JobGraph::new();
        let ids = chain(&graph, &["a"]);
        graph.mark_running(ids[0]).unwrap();
        graph.mark_failed(ids[0], failure(), JobContext::default()).unwrap();

        let err = graph.mark_succeeded(ids[0], JobContext::default()).unwrap_err();
        assert!(matches!(err, DumpflowError::InvalidTransition { .. }));
        assert_eq!(graph.state(ids[0]), Some(ExecutionState::Failed));
    }

    #[test]
    fn test_pending_cannot_succeed_without_running() {
        let graph = JobGraph::new();
        let ids = chain(&graph, &["a"]);
        assert!(graph.mark_succeeded(ids[0], JobContext::default()).is_err());
    }

    #[test]
    fn test_progress_only_while_running() {
        let graph = JobGraph::new();
        let ids = chain(&graph, &["add_filestore"]);

        assert!(!graph.set_progress(ids[0], 10));
        graph.mark_running(ids[0]).unwrap();
        assert!(graph.set_progress(ids[0], 40));
        assert_eq!(graph.get(ids[0]).unwrap().progress, Some(40));

        graph.mark_succeeded(ids[0], JobContext::default()).unwrap();
        assert_eq!(graph.get(ids[0]).unwrap().progress, None);
        assert!(!graph.set_progress(ids[0], 50));
    }

    #[test]
    fn test_retry_counts_attempts() {
        let graph = JobGraph::new();
        let ids = chain(&graph, &["add_filestore"]);

        assert_eq!(graph.mark_running(ids[0]).unwrap(), 1);
        graph.mark_retrying(ids[0]).unwrap();
        assert_eq!(graph.state(ids[0]), Some(ExecutionState::Retrying));
        assert_eq!(graph.mark_running(ids[0]).unwrap(), 2);
    }

    #[test]
    fn test_json_roundtrip_preserves_structure() {
        let graph = JobGraph::new();
        let ids = chain(&graph, &["create_env", "dump_db"]);
        graph.mark_running(ids[0]).unwrap();
        let mut ctx = JobContext::backup("acme", true, DumpFormat::Sql);
        ctx.workdir = Some("/out/w".into());
        graph.mark_succeeded(ids[0], ctx.clone()).unwrap();

        let restored = JobGraph::from_json(&graph.to_json().unwrap()).unwrap();
        assert_eq!(restored.flatten(ids[1]).unwrap(), graph.flatten(ids[1]).unwrap());
        assert_eq!(
            restored.get(ids[0]).unwrap().result,
            Some(StageResult::Succeeded { context: ctx })
        );
        assert_eq!(restored.chain(ids[0]).unwrap().stage_ids, ids);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        let graph = JobGraph::new();
        let ids = chain(&graph, &["a", "b"]);

        graph.save_to(&path).unwrap();
        let loaded = JobGraph::load_from(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.root_of(ids[1]).unwrap(), ids[0]);
    }

    #[test]
    fn test_loaded_cycle_fails_loudly() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut ra = StageExecutionRecord::new(a, "a", Some(b));
        ra.children_ids = vec![b];
        let mut rb = StageExecutionRecord::new(b, "b", Some(a));
        rb.children_ids = vec![a];
        let json = serde_json::to_string(&serde_json::json!({
            "records": [ra, rb],
            "chains": [],
        }))
        .unwrap();

        let graph = JobGraph::from_json(&json).unwrap();
        assert!(matches!(graph.flatten(a), Err(DumpflowError::CycleDetected(_))));
    }

    #[test]
    fn test_prune_only_finished_chains() {
        let graph = JobGraph::new();
        let done = chain(&graph, &["a", "b"]);
        let running = chain(&graph, &["c"]);
        graph.set_chain_state(done[0], ChainState::Succeeded).unwrap();
        graph
            .set_chain_state(running[0], ChainState::Running { index: 0 })
            .unwrap();

        assert_eq!(graph.prune_expired(Duration::from_secs(3600)), 0);
        let removed = graph.prune_finished_before(now_utc() + chrono::Duration::seconds(1));
        assert_eq!(removed, 1);
        assert!(graph.get(done[0]).is_none());
        assert!(graph.get(running[0]).is_some());
        assert!(graph.chain(done[0]).is_none());
    }
}
