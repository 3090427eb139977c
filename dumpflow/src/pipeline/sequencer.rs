//! Runs chains stage by stage against the job graph.
//!
//! Submission schedules every stage of a chain up front as a linked list of
//! PENDING records (each stage's parent is the previous stage) and returns
//! at once. A spawned task then walks the chain: stage `n + 1` starts only
//! after stage `n` is SUCCEEDED. On the first failure the error hook runs
//! once, the failing stage and everything after it are marked FAILED, and
//! the chain stops.

use super::{ChainPlan, RateLimiter, RetryConfig};
use crate::cancellation::CancellationToken;
use crate::compensation::{Compensation, ErrorHook, StageFailure, WorkdirCompensator};
use crate::config::Settings;
use crate::core::JobContext;
use crate::errors::{DumpflowError, ErrorDescriptor, Result};
use crate::events::{EventSink, JobEvent, LoggingEventSink};
use crate::graph::{ChainMeta, ChainState, JobGraph};
use crate::observability::chain_summary;
use crate::progress::ProgressReporter;
use crate::stages::{StageEnv, StageKind, StageRegistry};
use crate::tools::DatabaseTools;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// What a caller gets back from a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHandle {
    /// Id of the last stage execution, used to query the job.
    pub task_id: Uuid,
    /// Id of the first stage execution.
    pub parent_id: Uuid,
    /// Stage names from the last execution back to the first.
    pub names: Vec<String>,
}

fn log_graph_update(result: Result<()>) {
    if let Err(e) = result {
        error!(error = %e, "job graph update failed");
    }
}

struct Inner {
    settings: Arc<Settings>,
    tools: Arc<dyn DatabaseTools>,
    graph: Arc<JobGraph>,
    registry: StageRegistry,
    sink: Arc<dyn EventSink>,
    hook: Arc<dyn ErrorHook>,
    progress: Arc<ProgressReporter>,
    workers: Semaphore,
    admission: RateLimiter,
    retry: RetryConfig,
}

/// Builder for [`Sequencer`].
pub struct SequencerBuilder {
    settings: Arc<Settings>,
    tools: Arc<dyn DatabaseTools>,
    graph: Option<Arc<JobGraph>>,
    registry: Option<StageRegistry>,
    sink: Option<Arc<dyn EventSink>>,
    hook: Option<Arc<dyn ErrorHook>>,
    retry: RetryConfig,
}

impl SequencerBuilder {
    /// Uses an existing job graph.
    #[must_use]
    pub fn graph(mut self, graph: Arc<JobGraph>) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Replaces the stage registry.
    #[must_use]
    pub fn registry(mut self, registry: StageRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sends lifecycle events to `sink`.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replaces the chain error hook.
    #[must_use]
    pub fn error_hook(mut self, hook: Arc<dyn ErrorHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Sets the delay between retries.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Builds the sequencer.
    #[must_use]
    pub fn build(self) -> Sequencer {
        let graph = self.graph.unwrap_or_default();
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(LoggingEventSink::debug()));
        let progress = Arc::new(ProgressReporter::new(graph.clone(), sink.clone()));
        Sequencer {
            inner: Arc::new(Inner {
                workers: Semaphore::new(self.settings.worker_concurrency.max(1)),
                admission: RateLimiter::per_minute(self.settings.backup_rate_limit),
                settings: self.settings,
                tools: self.tools,
                graph,
                registry: self.registry.unwrap_or_else(StageRegistry::standard),
                sink,
                hook: self.hook.unwrap_or_else(|| Arc::new(WorkdirCompensator::new())),
                progress,
                retry: self.retry,
            }),
        }
    }
}

/// Submits chains and drives them to a terminal state.
#[derive(Clone)]
pub struct Sequencer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("records", &self.inner.graph.len())
            .field("available_workers", &self.inner.workers.available_permits())
            .finish_non_exhaustive()
    }
}

impl Sequencer {
    /// Starts building a sequencer.
    #[must_use]
    pub fn builder(settings: Arc<Settings>, tools: Arc<dyn DatabaseTools>) -> SequencerBuilder {
        SequencerBuilder {
            settings,
            tools,
            graph: None,
            registry: None,
            sink: None,
            hook: None,
            retry: RetryConfig::default(),
        }
    }

    /// The job graph chains are recorded in.
    #[must_use]
    pub fn graph(&self) -> &Arc<JobGraph> {
        &self.inner.graph
    }

    /// The progress side channel.
    #[must_use]
    pub fn progress(&self) -> &Arc<ProgressReporter> {
        &self.inner.progress
    }

    /// Engine settings.
    #[must_use]
    pub fn settings(&self) -> &Arc<Settings> {
        &self.inner.settings
    }

    /// Schedules a chain and starts it in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, plan: ChainPlan, initial: JobContext) -> Result<ChainHandle> {
        if plan.stages.is_empty() {
            return Err(DumpflowError::InvalidRequest("a chain needs at least one stage".into()));
        }
        plan.validate(&self.inner.registry, &initial)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DumpflowError::Internal(format!("no async runtime: {e}")))?;

        let graph = &self.inner.graph;
        let mut ids = Vec::with_capacity(plan.stages.len());
        let mut parent = None;
        for kind in &plan.stages {
            let id = graph.schedule(kind.name(), parent)?;
            ids.push(id);
            parent = Some(id);
        }
        let root = graph.register_chain(ChainMeta::new(plan.kind, ids.clone()))?;
        let task_id = ids[ids.len() - 1];
        let handle = ChainHandle {
            task_id,
            parent_id: root,
            names: graph.lineage(task_id)?,
        };

        info!(kind = %plan.kind, job = %initial.database_name, %task_id, "chain submitted");
        let span = info_span!("chain", kind = %plan.kind, job = %initial.database_name, %root);
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move { inner.run_chain(plan, ids, initial).await }.instrument(span));

        Ok(handle)
    }

    /// Polls until the chain containing `task_id` is terminal.
    pub async fn wait(&self, task_id: Uuid, limit: Duration) -> Result<ChainMeta> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let chain = self.inner.graph.chain_of(task_id)?;
            if chain.state.is_terminal() {
                return Ok(chain);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DumpflowError::Timeout {
                    stage: "chain".to_string(),
                    after: limit,
                });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Inner {
    async fn run_chain(&self, plan: ChainPlan, ids: Vec<Uuid>, initial: JobContext) {
        let root = ids[0];
        let mut ctx = initial;

        for (index, (&kind, &id)) in plan.stages.iter().zip(&ids).enumerate() {
            if index == 0 && plan.is_rate_limited() {
                self.admission.acquire().await;
            }
            log_graph_update(self.graph.set_chain_state(root, ChainState::Running { index }));

            match self.run_stage(kind, id, index, ctx.clone()).await {
                Ok(output) => {
                    log_graph_update(self.graph.mark_succeeded(id, output.clone()));
                    ctx = output;
                }
                Err(descriptor) => {
                    self.fail_chain(&plan, &ids, index, descriptor, ctx).await;
                    return;
                }
            }
        }

        info!("chain succeeded");
        self.sink
            .try_emit(&JobEvent::chain_succeeded(ids[ids.len() - 1], plan.kind));
        self.emit_summary(&plan, &ids, "succeeded");
        log_graph_update(self.graph.set_chain_state(root, ChainState::Succeeded));
    }

    fn emit_summary(&self, plan: &ChainPlan, ids: &[Uuid], outcome: &str) {
        let records: Vec<_> = ids.iter().filter_map(|id| self.graph.get(*id)).collect();
        let summary = chain_summary(plan.kind, outcome, &records);
        debug!(%summary, "chain summary");
        self.sink.try_emit(
            &JobEvent::new("chain.summary", ids[ids.len() - 1]).add_data("summary", summary),
        );
    }

    async fn run_stage(
        &self,
        kind: StageKind,
        id: Uuid,
        index: usize,
        input: JobContext,
    ) -> std::result::Result<JobContext, ErrorDescriptor> {
        let name = kind.name();
        let describe = |err: &DumpflowError, attempts: u32| ErrorDescriptor::new(err, name, index, attempts);

        let stage = self.registry.get(kind).map_err(|e| describe(&e, 0))?;
        if let Some(field) = input.first_missing(stage.requires()) {
            return Err(describe(&DumpflowError::missing_input(name, field.as_str()), 0));
        }
        let policy = stage.policy(&self.settings);
        let mut retries = 0;

        loop {
            let permit = self
                .workers
                .acquire()
                .await
                .map_err(|e| describe(&DumpflowError::Internal(e.to_string()), retries))?;
            let attempt = self.graph.mark_running(id).map_err(|e| describe(&e, retries))?;
            self.sink.try_emit(&JobEvent::stage_started(id, name, attempt));
            info!(stage = name, execution_id = %id, attempt, "stage started");

            let token = CancellationToken::new();
            let env = StageEnv::new(self.settings.clone(), self.tools.clone())
                .with_progress(self.progress.handle(id).bound_to(token.clone()))
                .with_cancellation(token.clone());
            let started = Instant::now();

            let outcome = match policy.timeout {
                Some(limit) => match tokio::time::timeout(limit, stage.run(input.clone(), &env)).await {
                    Ok(result) => result,
                    Err(_) => {
                        token.cancel(format!("{name} exceeded its {}s budget", limit.as_secs_f64()));
                        Err(DumpflowError::Timeout {
                            stage: name.to_string(),
                            after: limit,
                        })
                    }
                },
                None => stage.run(input.clone(), &env).await,
            };
            drop(permit);

            match outcome {
                Ok(output) => {
                    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                    self.sink
                        .try_emit(&JobEvent::stage_succeeded(id, name, duration_ms));
                    info!(stage = name, execution_id = %id, duration_ms, "stage succeeded");
                    return Ok(output);
                }
                Err(err) if err.is_retryable() && retries < policy.max_retries => {
                    retries += 1;
                    warn!(stage = name, execution_id = %id, attempt, error = %err, "stage failed, retrying");
                    self.graph
                        .mark_retrying(id)
                        .map_err(|e| describe(&e, attempt))?;
                    self.sink
                        .try_emit(&JobEvent::stage_retrying(id, name, attempt, &err.to_string()));
                    tokio::time::sleep(self.retry.delay_for(retries)).await;
                }
                Err(err) => {
                    error!(stage = name, execution_id = %id, attempt, error = %err, "stage failed");
                    return Err(describe(&err, attempt));
                }
            }
        }
    }

    async fn fail_chain(
        &self,
        plan: &ChainPlan,
        ids: &[Uuid],
        index: usize,
        descriptor: ErrorDescriptor,
        input: JobContext,
    ) {
        let root = ids[0];
        let failed_id = ids[index];

        let first_failure = match self
            .graph
            .update_chain(root, |chain| !std::mem::replace(&mut chain.compensated, true))
        {
            Ok(first) => first,
            Err(e) => {
                error!(error = %e, "chain metadata missing, compensating anyway");
                true
            }
        };

        if first_failure {
            let failure = StageFailure {
                execution_id: failed_id,
                stage: descriptor.stage.clone(),
                position: index,
                input: input.clone(),
                error: descriptor.clone(),
            };
            let outcome = AssertUnwindSafe(self.hook.on_failure(&failure))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(stage = %failure.stage, "error hook panicked");
                    Compensation::default()
                });
            self.sink.try_emit(&JobEvent::chain_compensated(
                failed_id,
                outcome.workdir.as_deref(),
                outcome.removed,
            ));
        }

        log_graph_update(self.graph.mark_failed(failed_id, descriptor.clone(), input.clone()));
        self.sink.try_emit(&JobEvent::stage_failed(failed_id, &descriptor));
        for &later in &ids[index + 1..] {
            log_graph_update(self.graph.mark_failed(later, descriptor.clone(), input.clone()));
        }

        warn!(stage = %descriptor.stage, position = index, kind = %descriptor.kind, "chain failed");
        self.sink.try_emit(&JobEvent::chain_failed(
            ids[ids.len() - 1],
            plan.kind,
            &descriptor,
        ));
        self.emit_summary(plan, ids, "failed");
        // Terminal chain state goes last: observers that see it also see
        // every record and event of the chain.
        log_graph_update(self.graph.set_chain_state(root, ChainState::Failed { index }));
    }
}
