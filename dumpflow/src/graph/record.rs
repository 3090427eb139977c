//! Stage execution records and chain metadata.

use crate::core::{ExecutionState, JobContext, JobKind};
use crate::errors::ErrorDescriptor;
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal payload of a stage execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageResult {
    /// The stage returned this context.
    Succeeded {
        /// The stage's output.
        context: JobContext,
    },
    /// The stage (or an upstream stage of its chain) failed.
    Failed {
        /// What went wrong.
        error: ErrorDescriptor,
        /// The context the failing stage was invoked with.
        context: JobContext,
    },
}

impl StageResult {
    /// The context carried by the result.
    #[must_use]
    pub fn context(&self) -> &JobContext {
        match self {
            Self::Succeeded { context } | Self::Failed { context, .. } => context,
        }
    }

    /// The error descriptor, if the result is a failure.
    #[must_use]
    pub fn error(&self) -> Option<&ErrorDescriptor> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Failed { error, .. } => Some(error),
        }
    }
}

/// One scheduled unit of work in the job graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageExecutionRecord {
    /// Unique execution id.
    pub id: Uuid,
    /// Name of the stage this execution runs.
    pub stage: String,
    /// When the execution was scheduled.
    pub created_at: Timestamp,
    /// When the execution last started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When the execution reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    /// The execution that scheduled this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    /// Executions scheduled as a continuation of this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children_ids: Vec<Uuid>,
    /// Current state.
    pub state: ExecutionState,
    /// Number of times the stage started.
    #[serde(default)]
    pub attempts: u32,
    /// Last published progress percent, only while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// Terminal payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StageResult>,
}

impl StageExecutionRecord {
    /// Creates a PENDING record.
    #[must_use]
    pub fn new(id: Uuid, stage: impl Into<String>, parent_id: Option<Uuid>) -> Self {
        Self {
            id,
            stage: stage.into(),
            created_at: now_utc(),
            started_at: None,
            finished_at: None,
            parent_id,
            children_ids: Vec::new(),
            state: ExecutionState::Pending,
            attempts: 0,
            progress: None,
            result: None,
        }
    }

    /// Returns true if the record is a chain root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Returns true if the record has no continuation.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children_ids.is_empty()
    }
}

/// Explicit state machine of a whole chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainState {
    /// Submitted, first stage not started.
    Pending,
    /// Stage at `index` is executing.
    Running {
        /// Position of the running stage.
        index: usize,
    },
    /// Every stage succeeded.
    Succeeded,
    /// Stage at `index` failed; later stages never ran.
    Failed {
        /// Position of the failing stage.
        index: usize,
    },
}

impl ChainState {
    /// Returns true if the chain has finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

/// Bookkeeping for one submitted chain, keyed by its root execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainMeta {
    /// Backup or restore.
    pub kind: JobKind,
    /// Execution ids in chain order; the first is the root, the last the job handle.
    pub stage_ids: Vec<Uuid>,
    /// Current chain state.
    pub state: ChainState,
    /// Submission time.
    pub submitted_at: Timestamp,
    /// When the chain reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    /// Whether the error hook has run for this chain.
    #[serde(default)]
    pub compensated: bool,
}

impl ChainMeta {
    /// Creates metadata for a freshly submitted chain.
    #[must_use]
    pub fn new(kind: JobKind, stage_ids: Vec<Uuid>) -> Self {
        Self {
            kind,
            stage_ids,
            state: ChainState::Pending,
            submitted_at: now_utc(),
            finished_at: None,
            compensated: false,
        }
    }

    /// Id of the first execution.
    #[must_use]
    pub fn root_id(&self) -> Option<Uuid> {
        self.stage_ids.first().copied()
    }

    /// Id of the last execution.
    #[must_use]
    pub fn handle_id(&self) -> Option<Uuid> {
        self.stage_ids.last().copied()
    }
}
