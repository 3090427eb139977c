//! The record threaded through every stage of a chain.

use crate::errors::{DumpflowError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Result key under which a backup's downloadable archive is exposed.
pub const DOWNLOAD_KEY: &str = "download";

/// The output format of a database dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpFormat {
    /// Plain SQL script, restored with `psql`.
    #[default]
    Sql,
    /// `pg_dump` custom format, restored with `pg_restore`.
    Custom,
}

impl DumpFormat {
    /// The archive member name used for a dump in this format.
    #[must_use]
    pub fn member_name(&self) -> &'static str {
        match self {
            Self::Sql => "dump.sql",
            Self::Custom => "dump.dump",
        }
    }

    /// Guesses the format from an archive member name.
    #[must_use]
    pub fn from_member_name(name: &str) -> Option<Self> {
        [Self::Sql, Self::Custom]
            .into_iter()
            .find(|format| format.member_name() == name)
    }
}

impl fmt::Display for DumpFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql => write!(f, "sql"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

impl FromStr for DumpFormat {
    type Err = DumpflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sql" | "plain" => Ok(Self::Sql),
            "custom" | "dump" => Ok(Self::Custom),
            other => Err(DumpflowError::InvalidRequest(format!(
                "unsupported dump format '{other}'"
            ))),
        }
    }
}

/// A file written by a stage, with enough metadata to verify it later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Absolute path of the file or directory.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Hex SHA-256 of the file content, absent for directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl FileInfo {
    /// Stats a path without hashing it.
    pub fn stat(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let size = std::fs::metadata(&path)?.len();
        Ok(Self {
            path,
            size,
            sha256: None,
        })
    }

    /// Stats and hashes a regular file.
    pub fn digest(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            size += n as u64;
            hasher.update(&buf[..n]);
        }
        Ok(Self {
            path,
            size,
            sha256: Some(hex::encode(hasher.finalize())),
        })
    }
}

/// Names of the `JobContext` fields a stage can require or provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextField {
    /// `workdir`
    Workdir,
    /// `filename`
    Filename,
    /// `archive_path`
    ArchivePath,
    /// `source_archive`
    SourceArchive,
    /// `filestore_target`
    FilestoreTarget,
    /// `manifest_info`
    ManifestInfo,
    /// `dump_info`
    DumpInfo,
    /// `archive_info`
    ArchiveInfo,
    /// `filestore_info`
    FilestoreInfo,
    /// `restore_info`
    RestoreInfo,
}

impl ContextField {
    /// Every field.
    pub const ALL: [ContextField; 10] = [
        Self::Workdir,
        Self::Filename,
        Self::ArchivePath,
        Self::SourceArchive,
        Self::FilestoreTarget,
        Self::ManifestInfo,
        Self::DumpInfo,
        Self::ArchiveInfo,
        Self::FilestoreInfo,
        Self::RestoreInfo,
    ];

    /// The field name as it appears in serialized contexts.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workdir => "workdir",
            Self::Filename => "filename",
            Self::ArchivePath => "archive_path",
            Self::SourceArchive => "source_archive",
            Self::FilestoreTarget => "filestore_target",
            Self::ManifestInfo => "manifest_info",
            Self::DumpInfo => "dump_info",
            Self::ArchiveInfo => "archive_info",
            Self::FilestoreInfo => "filestore_info",
            Self::RestoreInfo => "restore_info",
        }
    }
}

impl fmt::Display for ContextField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The accumulating record passed from stage to stage.
///
/// Every stage receives the previous stage's output by value and returns a
/// new value. Fields are only ever added: a stage never clears a field set by
/// an earlier stage. Request options (`database_name`, `include_filestore`,
/// `dump_format`, `source_filename`) are set at submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    /// Database the job operates on.
    pub database_name: String,
    /// Whether a backup includes the filestore tree.
    #[serde(default)]
    pub include_filestore: bool,
    /// Dump format for backups.
    #[serde(default)]
    pub dump_format: DumpFormat,
    /// Archive file name under the input root, for restores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_filename: Option<String>,

    /// Per-job working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
    /// Base name of the backup archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Path of the backup archive being produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<PathBuf>,
    /// Archive a restore reads from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_archive: Option<PathBuf>,
    /// Final filestore location a restore creates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filestore_target: Option<PathBuf>,
    /// Intermediate files that belong in the archive, in insertion order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub staged_files: Vec<PathBuf>,

    /// The written manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_info: Option<FileInfo>,
    /// The produced or extracted dump.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dump_info: Option<FileInfo>,
    /// The finished archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_info: Option<FileInfo>,
    /// The archived or restored filestore.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filestore_info: Option<FileInfo>,
    /// The applied dump.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_info: Option<FileInfo>,

    /// Downloadable artifact of a finished backup.
    #[serde(default, rename = "download", skip_serializing_if = "Option::is_none")]
    pub download: Option<PathBuf>,
}

impl JobContext {
    /// Creates the initial context of a backup chain.
    #[must_use]
    pub fn backup(database_name: impl Into<String>, include_filestore: bool, dump_format: DumpFormat) -> Self {
        Self {
            database_name: database_name.into(),
            include_filestore,
            dump_format,
            ..Self::default()
        }
    }

    /// Creates the initial context of a restore chain.
    #[must_use]
    pub fn restore(database_name: impl Into<String>, source_filename: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            source_filename: Some(source_filename.into()),
            ..Self::default()
        }
    }

    /// Returns true if the given field is set.
    #[must_use]
    pub fn has(&self, field: ContextField) -> bool {
        match field {
            ContextField::Workdir => self.workdir.is_some(),
            ContextField::Filename => self.filename.is_some(),
            ContextField::ArchivePath => self.archive_path.is_some(),
            ContextField::SourceArchive => self.source_archive.is_some(),
            ContextField::FilestoreTarget => self.filestore_target.is_some(),
            ContextField::ManifestInfo => self.manifest_info.is_some(),
            ContextField::DumpInfo => self.dump_info.is_some(),
            ContextField::ArchiveInfo => self.archive_info.is_some(),
            ContextField::FilestoreInfo => self.filestore_info.is_some(),
            ContextField::RestoreInfo => self.restore_info.is_some(),
        }
    }

    /// Returns the first of `fields` that is not set.
    #[must_use]
    pub fn first_missing(&self, fields: &[ContextField]) -> Option<ContextField> {
        fields.iter().copied().find(|f| !self.has(*f))
    }

    /// Returns the working directory or a missing-input error for `stage`.
    pub fn require_workdir(&self, stage: &str) -> Result<&Path> {
        self.workdir
            .as_deref()
            .ok_or_else(|| DumpflowError::missing_input(stage, ContextField::Workdir.as_str()))
    }

    /// Returns the archive path or a missing-input error for `stage`.
    pub fn require_archive_path(&self, stage: &str) -> Result<&Path> {
        self.archive_path
            .as_deref()
            .ok_or_else(|| DumpflowError::missing_input(stage, ContextField::ArchivePath.as_str()))
    }

    /// Returns the restore source archive or a missing-input error for `stage`.
    pub fn require_source_archive(&self, stage: &str) -> Result<&Path> {
        self.source_archive
            .as_deref()
            .ok_or_else(|| DumpflowError::missing_input(stage, ContextField::SourceArchive.as_str()))
    }

    /// Returns the dump info or a missing-input error for `stage`.
    pub fn require_dump(&self, stage: &str) -> Result<&FileInfo> {
        self.dump_info
            .as_ref()
            .ok_or_else(|| DumpflowError::missing_input(stage, ContextField::DumpInfo.as_str()))
    }

    /// Returns the filestore target or a missing-input error for `stage`.
    pub fn require_filestore_target(&self, stage: &str) -> Result<&Path> {
        self.filestore_target
            .as_deref()
            .ok_or_else(|| DumpflowError::missing_input(stage, ContextField::FilestoreTarget.as_str()))
    }

    /// Appends a staged file unless it is already recorded.
    ///
    /// Keeps re-executed stages from recording the same file twice.
    pub fn stage_file(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.staged_files.contains(&path) {
            self.staged_files.push(path);
        }
    }

    /// Resolves a result artifact by key.
    #[must_use]
    pub fn artifact(&self, key: &str) -> Option<&Path> {
        match key {
            DOWNLOAD_KEY => self.download.as_deref(),
            "archive" => self.archive_path.as_deref(),
            "dump" => self.dump_info.as_ref().map(|i| i.path.as_path()),
            "manifest" => self.manifest_info.as_ref().map(|i| i.path.as_path()),
            "filestore" => self.filestore_info.as_ref().map(|i| i.path.as_path()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_dump_format_parse() {
        assert_eq!("sql".parse::<DumpFormat>().unwrap(), DumpFormat::Sql);
        assert_eq!("CUSTOM".parse::<DumpFormat>().unwrap(), DumpFormat::Custom);
        assert!("tar".parse::<DumpFormat>().is_err());
    }

    #[test]
    fn test_dump_format_member_names() {
        assert_eq!(DumpFormat::Sql.member_name(), "dump.sql");
        assert_eq!(DumpFormat::from_member_name("dump.dump"), Some(DumpFormat::Custom));
        assert_eq!(DumpFormat::from_member_name("manifest.json"), None);
    }

    #[test]
    fn test_first_missing_reports_in_order() {
        let mut ctx = JobContext::backup("acme", true, DumpFormat::Sql);
        assert_eq!(
            ctx.first_missing(&[ContextField::Workdir, ContextField::DumpInfo]),
            Some(ContextField::Workdir)
        );

        ctx.workdir = Some(PathBuf::from("/tmp/w"));
        assert_eq!(
            ctx.first_missing(&[ContextField::Workdir, ContextField::DumpInfo]),
            Some(ContextField::DumpInfo)
        );
    }

    #[test]
    fn test_require_workdir_error() {
        let ctx = JobContext::backup("acme", false, DumpFormat::Sql);
        let err = ctx.require_workdir("dump_db").unwrap_err();
        assert!(matches!(err, DumpflowError::MissingInput { ref field, .. } if field == "workdir"));
    }

    #[test]
    fn test_stage_file_is_idempotent() {
        let mut ctx = JobContext::default();
        ctx.stage_file("/w/dump.sql");
        ctx.stage_file("/w/dump.sql");
        ctx.stage_file("/w/manifest.json");
        assert_eq!(ctx.staged_files.len(), 2);
    }

    #[test]
    fn test_download_serializes_under_download_key() {
        let mut ctx = JobContext::backup("acme", false, DumpFormat::Sql);
        ctx.download = Some(PathBuf::from("/out/acme.zip"));

        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value["download"], "/out/acme.zip");
        assert_eq!(ctx.artifact(DOWNLOAD_KEY), Some(Path::new("/out/acme.zip")));
        assert_eq!(ctx.artifact("nope"), None);
    }

    #[test]
    fn test_file_info_digest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();

        let info = FileInfo::digest(file.path()).unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(
            info.sha256.as_deref(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
    }
}
