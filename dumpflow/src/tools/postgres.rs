//! `DatabaseTools` backed by the PostgreSQL client binaries.

use super::{pg_version_from_num, DatabaseTools, Manifest};
use crate::config::PostgresConfig;
use crate::core::DumpFormat;
use crate::errors::{DumpflowError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, instrument};

const SELECT_MODULES: &str =
    "SELECT name, latest_version FROM ir_module_module WHERE state = 'installed' ORDER BY name";

/// Runs `pg_dump`, `pg_restore` and `psql` with libpq environment variables.
#[derive(Debug, Clone)]
pub struct PostgresTools {
    config: PostgresConfig,
}

impl PostgresTools {
    /// Creates the adapter.
    #[must_use]
    pub fn new(config: PostgresConfig) -> Self {
        Self { config }
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.envs(self.config.libpq_env()).kill_on_drop(true);
        cmd
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!(program, ?args, "running database tool");
        let output = self.command(program).args(args).output().await.map_err(|e| {
            DumpflowError::external_tool(program, "spawn failed", e.to_string())
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DumpflowError::external_tool(
                program,
                output.status.to_string(),
                stderr.trim(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn query(&self, database: &str, sql: &str) -> Result<String> {
        self.run("psql", &["-X", "-tA", "-v", "ON_ERROR_STOP=1", "-d", database, "-c", sql])
            .await
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| DumpflowError::Internal(format!("non UTF-8 path: {}", path.display())))
}

#[async_trait]
impl DatabaseTools for PostgresTools {
    #[instrument(skip(self))]
    async fn manifest(&self, database_name: &str) -> Result<Manifest> {
        let version_num = self.query(database_name, "SHOW server_version_num").await?;
        let version_num: u32 = version_num.trim().parse().map_err(|_| {
            DumpflowError::external_tool("psql", "unexpected output", version_num.trim())
        })?;

        let rows = self.query(database_name, SELECT_MODULES).await?;
        let modules: BTreeMap<String, String> = rows
            .lines()
            .filter_map(|line| line.split_once('|'))
            .map(|(name, version)| (name.to_string(), version.to_string()))
            .collect();

        Ok(Manifest::new(database_name, pg_version_from_num(version_num), modules))
    }

    #[instrument(skip(self))]
    async fn dump(&self, database_name: &str, dest: &Path, format: DumpFormat) -> Result<()> {
        let mut args = vec!["--no-owner", "-f", path_arg(dest)?];
        if format == DumpFormat::Custom {
            args.push("-Fc");
        }
        args.push(database_name);
        self.run("pg_dump", &args).await.map(drop)
    }

    async fn database_exists(&self, database_name: &str) -> Result<bool> {
        let sql = format!("SELECT 1 FROM pg_database WHERE datname = '{database_name}'");
        let out = self.query(&self.config.maintenance_db, &sql).await?;
        Ok(out.trim() == "1")
    }

    #[instrument(skip(self))]
    async fn create_database(&self, database_name: &str) -> Result<()> {
        if self.database_exists(database_name).await? {
            return Err(DumpflowError::precondition(format!(
                "database '{database_name}' already exists"
            )));
        }
        let sql = format!("CREATE DATABASE \"{database_name}\";");
        match self.query(&self.config.maintenance_db, &sql).await {
            Err(DumpflowError::ExternalTool { stderr, .. }) if stderr.contains("already exists") => Err(
                DumpflowError::precondition(format!("database '{database_name}' already exists")),
            ),
            other => other.map(drop),
        }
    }

    #[instrument(skip(self))]
    async fn restore(&self, database_name: &str, dump: &Path, format: DumpFormat) -> Result<()> {
        let dump = path_arg(dump)?;
        match format {
            DumpFormat::Sql => {
                self.run("psql", &["-X", "-q", "-v", "ON_ERROR_STOP=1", "-d", database_name, "-f", dump])
                    .await
            }
            DumpFormat::Custom => {
                self.run("pg_restore", &["--no-owner", "-d", database_name, dump])
                    .await
            }
        }
        .map(drop)
    }
}
