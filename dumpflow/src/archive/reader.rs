//! Reading members back out of an archive.

use super::{partial_path, TreeSummary};
use crate::core::DumpFormat;
use crate::errors::{DumpflowError, Result};
use crate::utils::generate_uuid;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::warn;
use zip::result::ZipError;
use zip::ZipArchive;

fn open(archive: &Path) -> Result<ZipArchive<BufReader<File>>> {
    Ok(ZipArchive::new(BufReader::new(File::open(archive)?))?)
}

/// Names of every entry, in archive order.
pub fn list_entries(archive: &Path) -> Result<Vec<String>> {
    let mut zip = open(archive)?;
    let mut names = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        names.push(zip.by_index_raw(index)?.name().to_string());
    }
    Ok(names)
}

/// Which dump member the archive carries.
pub fn detect_dump_format(archive: &Path) -> Result<DumpFormat> {
    let zip = open(archive)?;
    [DumpFormat::Sql, DumpFormat::Custom]
        .into_iter()
        .find(|format| zip.file_names().any(|n| n == format.member_name()))
        .ok_or_else(|| {
            DumpflowError::precondition(format!(
                "archive {} contains neither dump.sql nor dump.dump",
                archive.display()
            ))
        })
}

/// Extracts a single top-level member into `dest_dir` and returns its path.
pub fn extract_member(archive: &Path, member: &str, dest_dir: &Path) -> Result<PathBuf> {
    let mut zip = open(archive)?;
    let mut entry = zip.by_name(member).map_err(|e| match e {
        ZipError::FileNotFound => DumpflowError::precondition(format!(
            "archive {} has no member '{member}'",
            archive.display()
        )),
        other => other.into(),
    })?;

    std::fs::create_dir_all(dest_dir)?;
    let dest = dest_dir.join(member);
    let partial = partial_path(&dest);
    let copied = File::create(&partial)
        .map(BufWriter::new)
        .and_then(|mut out| std::io::copy(&mut entry, &mut out));
    if let Err(e) = copied {
        let _ = std::fs::remove_file(&partial);
        return Err(e.into());
    }
    std::fs::rename(&partial, &dest)?;
    Ok(dest)
}

/// Extracts every entry under `prefix/` into `target`.
///
/// The tree is unpacked into a hidden staging directory next to `target`
/// and renamed into place, so `target` either does not exist or is
/// complete. Fails with a conflict if `target` already exists. Returns what
/// was written, or `None` when the archive has no such subtree
/// (nothing is created then).
pub fn extract_tree(archive: &Path, prefix: &str, target: &Path) -> Result<Option<TreeSummary>> {
    if target.exists() {
        return Err(DumpflowError::conflict(target));
    }
    let mut zip = open(archive)?;
    let dir_prefix = format!("{prefix}/");
    if !zip.file_names().any(|n| n.starts_with(&dir_prefix)) {
        return Ok(None);
    }

    let parent = target
        .parent()
        .ok_or_else(|| DumpflowError::Internal(format!("{} has no parent", target.display())))?;
    std::fs::create_dir_all(parent)?;
    let staging = parent.join(format!(".staging-{}", generate_uuid()));

    let result = (|| -> Result<TreeSummary> {
        std::fs::create_dir_all(&staging)?;
        let mut summary = TreeSummary::default();
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index)?;
            if !entry.name().starts_with(&dir_prefix) {
                continue;
            }
            let Some(name) = entry.enclosed_name() else {
                return Err(DumpflowError::precondition(format!(
                    "archive entry '{}' escapes the extraction root",
                    entry.name()
                )));
            };
            let Ok(relative) = name.strip_prefix(prefix) else {
                continue;
            };
            let dest = staging.join(relative);
            if entry.is_dir() {
                std::fs::create_dir_all(&dest)?;
                continue;
            }
            if let Some(dir) = dest.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let mut out = BufWriter::new(File::create(&dest)?);
            summary.bytes += std::io::copy(&mut entry, &mut out)?;
            summary.files += 1;
        }
        if target.exists() {
            return Err(DumpflowError::conflict(target));
        }
        std::fs::rename(&staging, target)?;
        Ok(summary)
    })();

    match result {
        Ok(summary) => Ok(Some(summary)),
        Err(e) => {
            if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                warn!(path = %staging.display(), error = %cleanup, "could not remove staging directory");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{append_tree, bundle_files, FILESTORE_PREFIX};
    use crate::cancellation::CancellationToken;
    use pretty_assertions::assert_eq;

    fn sample(dir: &Path) -> PathBuf {
        let dump = dir.join("dump.sql");
        std::fs::write(&dump, b"SELECT 1;").unwrap();
        let source = dir.join("src-fs");
        std::fs::create_dir_all(source.join("ab")).unwrap();
        std::fs::write(source.join("ab/blob"), b"payload").unwrap();
        let archive = dir.join("acme.zip");
        bundle_files(&archive, &[dump]).unwrap();
        append_tree(&archive, &source, FILESTORE_PREFIX, &CancellationToken::new(), |_| {}).unwrap();
        archive
    }

    #[test]
    fn test_detect_and_extract_dump() {
        let dir = tempfile::tempdir().unwrap();
        let archive = sample(dir.path());

        assert_eq!(detect_dump_format(&archive).unwrap(), DumpFormat::Sql);
        let out = extract_member(&archive, "dump.sql", &dir.path().join("restore")).unwrap();
        assert_eq!(std::fs::read(out).unwrap(), b"SELECT 1;");
    }

    #[test]
    fn test_extract_missing_member_is_precondition() {
        let dir = tempfile::tempdir().unwrap();
        let archive = sample(dir.path());

        let err = extract_member(&archive, "dump.dump", dir.path()).unwrap_err();
        assert!(matches!(err, DumpflowError::PreconditionViolation(_)));
    }

    #[test]
    fn test_extract_tree_into_fresh_target() {
        let dir = tempfile::tempdir().unwrap();
        let archive = sample(dir.path());
        let target = dir.path().join("filestore/acme");

        let summary = extract_tree(&archive, FILESTORE_PREFIX, &target).unwrap().unwrap();
        assert_eq!(summary, TreeSummary { files: 1, bytes: 7 });
        assert_eq!(std::fs::read(target.join("ab/blob")).unwrap(), b"payload");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("filestore"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("acme")]);
    }

    #[test]
    fn test_extract_tree_refuses_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let archive = sample(dir.path());
        let target = dir.path().join("taken");
        std::fs::create_dir_all(&target).unwrap();

        let err = extract_tree(&archive, FILESTORE_PREFIX, &target).unwrap_err();
        assert!(matches!(err, DumpflowError::FilesystemConflict { .. }));
    }

    #[test]
    fn test_extract_tree_without_subtree_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("dump.sql");
        std::fs::write(&dump, b"--").unwrap();
        let archive = dir.path().join("plain.zip");
        bundle_files(&archive, &[dump]).unwrap();
        let target = dir.path().join("fs/acme");

        assert_eq!(extract_tree(&archive, FILESTORE_PREFIX, &target).unwrap(), None);
        assert!(!target.exists());
    }
}
