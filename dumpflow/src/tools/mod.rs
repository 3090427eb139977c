//! Database tooling port.
//!
//! Stages talk to PostgreSQL only through [`DatabaseTools`]. The production
//! adapter shells out to the client binaries; tests substitute a fake or a
//! mock.

mod manifest;
mod postgres;

pub use manifest::{guess_version, pg_version_from_num, Manifest};
pub use postgres::PostgresTools;

use crate::core::DumpFormat;
use crate::errors::Result;
use async_trait::async_trait;
use std::path::Path;

/// Operations the backup and restore stages need from the database server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseTools: Send + Sync {
    /// Collects the manifest of an existing database.
    async fn manifest(&self, database_name: &str) -> Result<Manifest>;

    /// Dumps a database into `dest` in the given format.
    async fn dump(&self, database_name: &str, dest: &Path, format: DumpFormat) -> Result<()>;

    /// Returns true if the database exists.
    async fn database_exists(&self, database_name: &str) -> Result<bool>;

    /// Creates an empty database.
    ///
    /// Fails with a precondition violation if it already exists, including
    /// when a concurrent creation wins the race.
    async fn create_database(&self, database_name: &str) -> Result<()>;

    /// Loads a dump into an existing database.
    async fn restore(&self, database_name: &str, dump: &Path, format: DumpFormat) -> Result<()>;
}
