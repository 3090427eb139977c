//! Runtime settings.
//!
//! Settings deserialize with per-field defaults and can be loaded from the
//! process environment with [`Settings::from_env`].

use crate::core::DumpFormat;
use crate::errors::{DumpflowError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection parameters handed to the PostgreSQL client tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Server host.
    #[serde(default = "default_pg_host")]
    pub host: String,
    /// Server port.
    #[serde(default = "default_pg_port")]
    pub port: u16,
    /// Role name.
    #[serde(default)]
    pub user: Option<String>,
    /// Role password.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Maintenance database used for `CREATE DATABASE`.
    #[serde(default = "default_maintenance_db")]
    pub maintenance_db: String,
}

fn default_pg_host() -> String {
    "db".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_maintenance_db() -> String {
    "template1".to_string()
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_pg_host(),
            port: default_pg_port(),
            user: None,
            password: None,
            maintenance_db: default_maintenance_db(),
        }
    }
}

impl PostgresConfig {
    /// Environment variables understood by libpq-based tools.
    #[must_use]
    pub fn libpq_env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![("PGHOST", self.host.clone()), ("PGPORT", self.port.to_string())];
        if let Some(ref user) = self.user {
            env.push(("PGUSER", user.clone()));
        }
        if let Some(ref password) = self.password {
            env.push(("PGPASSWORD", password.clone()));
        }
        env
    }
}

/// Settings for the job engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Root under which per-job working directories are created.
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    /// Root from which restore archives are read.
    #[serde(default = "default_input_root")]
    pub input_root: PathBuf,
    /// Root holding one filestore directory per database.
    #[serde(default = "default_filestore_root")]
    pub filestore_root: PathBuf,
    /// Whether backups include the filestore when the request does not say.
    #[serde(default)]
    pub dump_filestore: bool,
    /// Dump format when the request does not say.
    #[serde(default)]
    pub dump_format: DumpFormat,
    /// Database connection.
    #[serde(default)]
    pub postgres: PostgresConfig,
    /// Backup chains admitted per minute.
    #[serde(default = "default_backup_rate_limit")]
    pub backup_rate_limit: u32,
    /// Hard time limit of the filestore archiving stage, in seconds.
    #[serde(default = "default_filestore_time_limit")]
    pub filestore_time_limit_secs: u64,
    /// Automatic retries of the filestore archiving stage.
    #[serde(default = "default_filestore_max_retries")]
    pub filestore_max_retries: u32,
    /// Stages that may execute at the same time across all jobs.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// How long finished chains are kept, in seconds.
    #[serde(default = "default_result_retention")]
    pub result_retention_secs: u64,
}

fn default_output_root() -> PathBuf {
    PathBuf::from("/usr/src/output")
}

fn default_input_root() -> PathBuf {
    PathBuf::from("/usr/src/input")
}

fn default_filestore_root() -> PathBuf {
    PathBuf::from("/usr/src/filestore")
}

fn default_backup_rate_limit() -> u32 {
    4
}

fn default_filestore_time_limit() -> u64 {
    240
}

fn default_filestore_max_retries() -> u32 {
    1
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_result_retention() -> u64 {
    24 * 60 * 60
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
            input_root: default_input_root(),
            filestore_root: default_filestore_root(),
            dump_filestore: false,
            dump_format: DumpFormat::default(),
            postgres: PostgresConfig::default(),
            backup_rate_limit: default_backup_rate_limit(),
            filestore_time_limit_secs: default_filestore_time_limit(),
            filestore_max_retries: default_filestore_max_retries(),
            worker_concurrency: default_worker_concurrency(),
            result_retention_secs: default_result_retention(),
        }
    }
}

impl Settings {
    /// Creates settings with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads settings from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(v) = lookup("OUTPUT_DIR") {
            settings.output_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("INPUT_DIR") {
            settings.input_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("FILESTORE_PATH") {
            settings.filestore_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("DUMP_FILESTORE") {
            settings.dump_filestore = parse_bool("DUMP_FILESTORE", &v)?;
        }
        if let Some(v) = lookup("DUMP_FORMAT") {
            settings.dump_format = v.parse()?;
        }
        if let Some(v) = lookup("POSTGRES_HOST") {
            settings.postgres.host = v;
        }
        if let Some(v) = lookup("POSTGRES_PORT") {
            settings.postgres.port = parse_number("POSTGRES_PORT", &v)?;
        }
        settings.postgres.user = lookup("POSTGRES_USER");
        settings.postgres.password = lookup("POSTGRES_PASSWORD");
        if let Some(v) = lookup("BACKUP_RATE_LIMIT") {
            settings.backup_rate_limit = parse_number("BACKUP_RATE_LIMIT", &v)?;
        }
        if let Some(v) = lookup("FILESTORE_TIME_LIMIT_SECS") {
            settings.filestore_time_limit_secs = parse_number("FILESTORE_TIME_LIMIT_SECS", &v)?;
        }
        if let Some(v) = lookup("FILESTORE_MAX_RETRIES") {
            settings.filestore_max_retries = parse_number("FILESTORE_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("WORKER_CONCURRENCY") {
            settings.worker_concurrency = parse_number("WORKER_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("RESULT_RETENTION_SECS") {
            settings.result_retention_secs = parse_number("RESULT_RETENTION_SECS", &v)?;
        }

        Ok(settings)
    }

    /// Sets all three roots below `base` (`output`, `input`, `filestore`).
    #[must_use]
    pub fn with_base_dir(mut self, base: &Path) -> Self {
        self.output_root = base.join("output");
        self.input_root = base.join("input");
        self.filestore_root = base.join("filestore");
        self
    }

    /// Sets the default filestore flag.
    #[must_use]
    pub fn with_dump_filestore(mut self, enabled: bool) -> Self {
        self.dump_filestore = enabled;
        self
    }

    /// Sets the backup admission rate.
    #[must_use]
    pub fn with_backup_rate_limit(mut self, per_minute: u32) -> Self {
        self.backup_rate_limit = per_minute;
        self
    }

    /// Sets the filestore stage time limit.
    #[must_use]
    pub fn with_filestore_time_limit(mut self, limit: Duration) -> Self {
        self.filestore_time_limit_secs = limit.as_secs().max(1);
        self
    }

    /// Sets the worker concurrency.
    #[must_use]
    pub fn with_worker_concurrency(mut self, workers: usize) -> Self {
        self.worker_concurrency = workers;
        self
    }

    /// Filestore stage time limit as a `Duration`.
    #[must_use]
    pub fn filestore_time_limit(&self) -> Duration {
        Duration::from_secs(self.filestore_time_limit_secs)
    }

    /// Result retention as a `Duration`.
    #[must_use]
    pub fn result_retention(&self) -> Duration {
        Duration::from_secs(self.result_retention_secs)
    }

    /// Filestore directory of a database.
    #[must_use]
    pub fn filestore_path(&self, database_name: &str) -> PathBuf {
        self.filestore_root.join(database_name)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(DumpflowError::InvalidRequest(format!(
            "{key}: expected a boolean, got '{other}'"
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DumpflowError::InvalidRequest(format!("{key}: expected a number, got '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.output_root, PathBuf::from("/usr/src/output"));
        assert_eq!(settings.filestore_root, PathBuf::from("/usr/src/filestore"));
        assert!(!settings.dump_filestore);
        assert_eq!(settings.dump_format, DumpFormat::Sql);
        assert_eq!(settings.backup_rate_limit, 4);
        assert_eq!(settings.filestore_time_limit(), Duration::from_secs(240));
        assert_eq!(settings.filestore_max_retries, 1);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("OUTPUT_DIR", "/data/out"),
            ("DUMP_FILESTORE", "True"),
            ("DUMP_FORMAT", "custom"),
            ("POSTGRES_PORT", "6543"),
            ("POSTGRES_USER", "odoo"),
        ]))
        .unwrap();

        assert_eq!(settings.output_root, PathBuf::from("/data/out"));
        assert!(settings.dump_filestore);
        assert_eq!(settings.dump_format, DumpFormat::Custom);
        assert_eq!(settings.postgres.port, 6543);
        assert_eq!(settings.postgres.user.as_deref(), Some("odoo"));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        assert!(Settings::from_lookup(lookup_from(&[("POSTGRES_PORT", "abc")])).is_err());
        assert!(Settings::from_lookup(lookup_from(&[("DUMP_FILESTORE", "maybe")])).is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let settings: Settings =
            serde_json::from_str(r#"{"output_root": "/x", "worker_concurrency": 8}"#).unwrap();
        assert_eq!(settings.output_root, PathBuf::from("/x"));
        assert_eq!(settings.worker_concurrency, 8);
        assert_eq!(settings.postgres.host, "db");
    }

    #[test]
    fn test_libpq_env_omits_unset_credentials() {
        let env = PostgresConfig::default().libpq_env();
        assert_eq!(env.len(), 2);
        assert_eq!(env[0], ("PGHOST", "db".to_string()));
    }
}
