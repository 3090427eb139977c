//! Test doubles for database tools, stages and the error hook.

use crate::compensation::{Compensation, ErrorHook, StageFailure, WorkdirCompensator};
use crate::config::Settings;
use crate::core::{ContextField, DumpFormat, JobContext};
use crate::errors::{DumpflowError, Result};
use crate::pipeline::StagePolicy;
use crate::stages::{Stage, StageEnv, StageKind, StageRegistry};
use crate::tools::{DatabaseTools, Manifest};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct FakeState {
    databases: BTreeSet<String>,
    restored: HashMap<String, String>,
    failing: HashSet<String>,
}

/// In-memory [`DatabaseTools`].
///
/// Databases are names in a set. A dump writes a one-line SQL comment; a
/// restore records the dump text under the database name. Operations named
/// with [`FakeDatabaseTools::failing`] fail like a tool exiting non-zero.
#[derive(Debug, Default)]
pub struct FakeDatabaseTools {
    state: Mutex<FakeState>,
}

impl FakeDatabaseTools {
    /// Creates tools with no databases.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an existing database.
    #[must_use]
    pub fn with_database(self, name: &str) -> Self {
        self.add_database(name);
        self
    }

    /// Makes `operation` (`manifest`, `dump`, `create`, `restore`) fail.
    #[must_use]
    pub fn failing(self, operation: &str) -> Self {
        self.state.lock().failing.insert(operation.to_string());
        self
    }

    /// Adds a database after construction.
    pub fn add_database(&self, name: &str) {
        self.state.lock().databases.insert(name.to_string());
    }

    /// Returns true if the database exists.
    #[must_use]
    pub fn has_database(&self, name: &str) -> bool {
        self.state.lock().databases.contains(name)
    }

    /// Names of all databases.
    #[must_use]
    pub fn databases(&self) -> Vec<String> {
        self.state.lock().databases.iter().cloned().collect()
    }

    /// Text of the dump last restored into `name`.
    #[must_use]
    pub fn restored(&self, name: &str) -> Option<String> {
        self.state.lock().restored.get(name).cloned()
    }

    fn check(&self, operation: &str, tool: &str) -> Result<()> {
        if self.state.lock().failing.contains(operation) {
            return Err(DumpflowError::external_tool(tool, "exit status: 1", format!("{operation} failed")));
        }
        Ok(())
    }

    fn require(&self, name: &str, tool: &str) -> Result<()> {
        if self.has_database(name) {
            Ok(())
        } else {
            Err(DumpflowError::external_tool(
                tool,
                "exit status: 1",
                format!("database \"{name}\" does not exist"),
            ))
        }
    }
}

#[async_trait]
impl DatabaseTools for FakeDatabaseTools {
    async fn manifest(&self, database_name: &str) -> Result<Manifest> {
        self.check("manifest", "psql")?;
        self.require(database_name, "psql")?;
        let modules = BTreeMap::from([("base".to_string(), "16.0.1.0".to_string())]);
        Ok(Manifest::new(database_name, "14.0", modules))
    }

    async fn dump(&self, database_name: &str, dest: &Path, format: DumpFormat) -> Result<()> {
        let tool = "pg_dump";
        self.check("dump", tool)?;
        self.require(database_name, tool)?;
        let body = match format {
            DumpFormat::Sql => format!("-- dump of {database_name}\n"),
            DumpFormat::Custom => format!("PGDMP {database_name}"),
        };
        tokio::fs::write(dest, body).await?;
        Ok(())
    }

    async fn database_exists(&self, database_name: &str) -> Result<bool> {
        self.check("exists", "psql")?;
        Ok(self.has_database(database_name))
    }

    async fn create_database(&self, database_name: &str) -> Result<()> {
        self.check("create", "psql")?;
        let mut state = self.state.lock();
        if !state.databases.insert(database_name.to_string()) {
            return Err(DumpflowError::precondition(format!(
                "database '{database_name}' already exists"
            )));
        }
        Ok(())
    }

    async fn restore(&self, database_name: &str, dump: &Path, format: DumpFormat) -> Result<()> {
        let tool = match format {
            DumpFormat::Sql => "psql",
            DumpFormat::Custom => "pg_restore",
        };
        self.check("restore", tool)?;
        self.require(database_name, tool)?;
        let text = String::from_utf8_lossy(&tokio::fs::read(dump).await?).into_owned();
        self.state.lock().restored.insert(database_name.to_string(), text);
        Ok(())
    }
}

/// A stage that fails, either always or for its first few attempts.
///
/// It stands in for the built-in stage of the given kind, declaring the
/// same context fields, and runs that stage once it stops failing.
#[derive(Debug)]
pub struct FailingStage {
    kind: StageKind,
    declared: Arc<dyn Stage>,
    remaining_failures: AtomicU32,
    retryable: bool,
    max_retries: u32,
    calls: AtomicU32,
}

impl FailingStage {
    /// Fails every time with a non-retryable precondition violation.
    #[must_use]
    pub fn always(kind: StageKind) -> Self {
        Self {
            kind,
            declared: StageRegistry::builtin(kind),
            remaining_failures: AtomicU32::new(u32::MAX),
            retryable: false,
            max_retries: 0,
            calls: AtomicU32::new(0),
        }
    }

    /// Fails `failures` times with a retryable tool error, then succeeds.
    #[must_use]
    pub fn flaky(kind: StageKind, failures: u32) -> Self {
        Self {
            kind,
            declared: StageRegistry::builtin(kind),
            remaining_failures: AtomicU32::new(failures),
            retryable: true,
            max_retries: 0,
            calls: AtomicU32::new(0),
        }
    }

    /// Sets the retry budget reported through the stage policy.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Number of times the stage ran.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn requires(&self) -> &'static [ContextField] {
        self.declared.requires()
    }

    fn provides(&self) -> &'static [ContextField] {
        self.declared.provides()
    }

    fn policy(&self, _settings: &Settings) -> StagePolicy {
        StagePolicy::default().with_max_retries(self.max_retries)
    }

    async fn run(&self, ctx: JobContext, env: &StageEnv) -> Result<JobContext> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if !failing {
            return self.declared.run(ctx, env).await;
        }
        if self.retryable {
            Err(DumpflowError::external_tool(self.kind.name(), "exit status: 2", "transient failure"))
        } else {
            Err(DumpflowError::precondition(format!("{} refused to run", self.kind)))
        }
    }
}

/// A stage that sleeps, then runs the built-in stage of its kind.
///
/// By default every call is slow; [`SlowStage::slow_for`] limits the delay
/// to the first calls so a retry can go through.
#[derive(Debug)]
pub struct SlowStage {
    kind: StageKind,
    declared: Arc<dyn Stage>,
    delay: Duration,
    timeout: Option<Duration>,
    max_retries: u32,
    remaining_slow: AtomicU32,
    calls: AtomicU32,
}

impl SlowStage {
    /// Creates a slow stand-in for `kind`.
    #[must_use]
    pub fn new(kind: StageKind, delay: Duration) -> Self {
        Self {
            kind,
            declared: StageRegistry::builtin(kind),
            delay,
            timeout: None,
            max_retries: 0,
            remaining_slow: AtomicU32::new(u32::MAX),
            calls: AtomicU32::new(0),
        }
    }

    /// Gives the stage a time budget.
    #[must_use]
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Sets the retry budget reported through the stage policy.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Only the first `calls` runs sleep.
    #[must_use]
    pub fn slow_for(self, calls: u32) -> Self {
        self.remaining_slow.store(calls, Ordering::SeqCst);
        self
    }

    /// Number of times the stage ran.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for SlowStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn requires(&self) -> &'static [ContextField] {
        self.declared.requires()
    }

    fn provides(&self) -> &'static [ContextField] {
        self.declared.provides()
    }

    fn policy(&self, _settings: &Settings) -> StagePolicy {
        let policy = StagePolicy::default().with_max_retries(self.max_retries);
        match self.timeout {
            Some(limit) => policy.with_timeout(limit),
            None => policy,
        }
    }

    async fn run(&self, ctx: JobContext, env: &StageEnv) -> Result<JobContext> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let slow = self
            .remaining_slow
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if slow {
            tokio::time::sleep(self.delay).await;
        }
        self.declared.run(ctx, env).await
    }
}

/// Wraps [`WorkdirCompensator`] and records every call.
#[derive(Debug, Default)]
pub struct CountingHook {
    inner: WorkdirCompensator,
    calls: AtomicUsize,
    failures: Mutex<Vec<StageFailure>>,
}

impl CountingHook {
    /// Creates the hook.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the hook ran.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every failure the hook received.
    #[must_use]
    pub fn failures(&self) -> Vec<StageFailure> {
        self.failures.lock().clone()
    }
}

#[async_trait]
impl ErrorHook for CountingHook {
    async fn on_failure(&self, failure: &StageFailure) -> Compensation {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.failures.lock().push(failure.clone());
        self.inner.on_failure(failure).await
    }
}
