//! The closed set of stages.

use crate::errors::{DumpflowError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every stage the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Allocate the working directory and archive name.
    CreateEnv,
    /// Write `manifest.json`.
    CreateManifest,
    /// Dump the database.
    DumpDb,
    /// Bundle manifest and dump into the archive.
    AddToZip,
    /// Append the filestore tree to the archive.
    AddFilestore,
    /// Remove intermediate files, keeping the archive.
    CleanWorkdir,
    /// Check restore preconditions.
    InitRestore,
    /// Extract the dump member.
    UnzipDump,
    /// Create the target database.
    CreateDatabase,
    /// Load the dump into the database.
    RestoreDump,
    /// Extract the filestore tree.
    UnzipFilestore,
}

impl StageKind {
    /// All kinds, backup stages first, each chain in order.
    pub const ALL: [StageKind; 11] = [
        Self::CreateEnv,
        Self::CreateManifest,
        Self::DumpDb,
        Self::AddToZip,
        Self::AddFilestore,
        Self::CleanWorkdir,
        Self::InitRestore,
        Self::UnzipDump,
        Self::CreateDatabase,
        Self::RestoreDump,
        Self::UnzipFilestore,
    ];

    /// Name recorded in the job graph.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateEnv => "create_env",
            Self::CreateManifest => "create_manifest",
            Self::DumpDb => "dump_db",
            Self::AddToZip => "add_to_zip",
            Self::AddFilestore => "add_filestore",
            Self::CleanWorkdir => "clean_workdir",
            Self::InitRestore => "init_restore",
            Self::UnzipDump => "unzip_dump",
            Self::CreateDatabase => "create_database",
            Self::RestoreDump => "restore_dump",
            Self::UnzipFilestore => "unzip_filestore",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageKind {
    type Err = DumpflowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| DumpflowError::InvalidRequest(format!("unknown stage '{s}'")))
    }
}
