//! Building and extending zip archives.

use super::{collect_tree, entry_name, unique_partial_path, TreeSummary};
use crate::cancellation::CancellationToken;
use crate::core::FileInfo;
use crate::errors::{DumpflowError, Result};
use crate::progress::ProgressTracker;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

fn options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn file_options(path: &Path) -> Result<SimpleFileOptions> {
    let size = std::fs::metadata(path)?.len();
    Ok(options().large_file(size >= u64::from(u32::MAX)))
}

fn discard(partial: &Path) {
    if let Err(e) = std::fs::remove_file(partial) {
        debug!(path = %partial.display(), error = %e, "could not remove partial archive");
    }
}

fn check_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(DumpflowError::Cancelled(
            token.reason().unwrap_or_else(|| "archiving cancelled".to_string()),
        ));
    }
    Ok(())
}

/// Writes a new archive holding `files`, each stored under its base name.
///
/// An existing archive at `archive` is replaced.
pub fn bundle_files(archive: &Path, files: &[PathBuf]) -> Result<FileInfo> {
    let partial = unique_partial_path(archive);
    let result = (|| -> Result<()> {
        let mut writer = ZipWriter::new(BufWriter::new(File::create(&partial)?));
        for path in files {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| DumpflowError::Internal(format!("unusable file name: {}", path.display())))?;
            writer.start_file(name, file_options(path)?)?;
            std::io::copy(&mut BufReader::new(File::open(path)?), &mut writer)?;
        }
        writer.finish()?;
        Ok(())
    })();

    if let Err(e) = result {
        discard(&partial);
        return Err(e);
    }
    std::fs::rename(&partial, archive)?;
    FileInfo::digest(archive)
}

/// Adds the tree under `source` to `archive` below `prefix`.
///
/// Entries already under `prefix` are dropped first, so running this twice
/// yields the same archive as running it once. `on_progress` receives each
/// decile as files are written; skipped files are left out of the total.
/// The token is polled between files.
pub fn append_tree<F>(
    archive: &Path,
    source: &Path,
    prefix: &str,
    token: &CancellationToken,
    mut on_progress: F,
) -> Result<TreeSummary>
where
    F: FnMut(u8),
{
    let listing = collect_tree(source)?;
    let partial = unique_partial_path(archive);
    let dir_prefix = format!("{prefix}/");

    let result = (|| -> Result<u64> {
        let mut existing = ZipArchive::new(BufReader::new(File::open(archive)?))?;
        let mut writer = ZipWriter::new(BufWriter::new(File::create(&partial)?));

        for index in 0..existing.len() {
            let entry = existing.by_index_raw(index)?;
            if entry.name() == dir_prefix || entry.name().starts_with(&dir_prefix) {
                continue;
            }
            writer.raw_copy_file(entry)?;
        }

        writer.add_directory(dir_prefix.as_str(), options())?;
        for dir in &listing.directories {
            writer.add_directory(format!("{}/", entry_name(prefix, dir)), options())?;
        }

        let mut tracker = ProgressTracker::new(listing.files.len());
        let mut bytes = 0;
        for relative in &listing.files {
            check_cancelled(token)?;
            let path = source.join(relative);
            writer.start_file(entry_name(prefix, relative), file_options(&path)?)?;
            bytes += std::io::copy(&mut BufReader::new(File::open(&path)?), &mut writer)?;
            let decile = tracker.advance();
            check_cancelled(token)?;
            if let Some(percent) = decile {
                on_progress(percent);
            }
        }

        writer.finish()?;
        Ok(bytes)
    })();

    let bytes = match result {
        Ok(bytes) => bytes,
        Err(e) => {
            discard(&partial);
            return Err(e);
        }
    };
    std::fs::rename(&partial, archive)?;
    debug!(
        archive = %archive.display(),
        files = listing.files.len(),
        skipped = listing.skipped.len(),
        "appended tree"
    );
    Ok(TreeSummary {
        files: listing.files.len(),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::list_entries;

    fn no_partials(dir: &Path) -> bool {
        std::fs::read_dir(dir)
            .unwrap()
            .all(|e| !e.unwrap().file_name().to_string_lossy().ends_with(".partial"))
    }

    fn write(path: &Path, content: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_bundle_stores_base_names() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("dump.sql");
        let manifest = dir.path().join("manifest.json");
        write(&dump, b"CREATE TABLE t();");
        write(&manifest, b"{}");
        let archive = dir.path().join("acme.zip");

        let info = bundle_files(&archive, &[dump, manifest]).unwrap();

        assert_eq!(info.path, archive);
        assert!(info.sha256.is_some());
        assert_eq!(list_entries(&archive).unwrap(), vec!["dump.sql", "manifest.json"]);
        assert!(no_partials(dir.path()));
    }

    #[test]
    fn test_bundle_missing_input_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("acme.zip");

        assert!(bundle_files(&archive, &[dir.path().join("absent")]).is_err());
        assert!(!archive.exists());
        assert!(no_partials(dir.path()));
    }

    #[test]
    fn test_append_tree_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("dump.sql");
        write(&dump, b"--");
        let source = dir.path().join("fs");
        write(&source.join("ab/one"), b"1");
        write(&source.join("cd/two"), b"2");
        write(&source.join("cd/junk.pyc"), b"");
        let archive = dir.path().join("a.zip");
        bundle_files(&archive, &[dump]).unwrap();

        let token = CancellationToken::new();
        let mut first = Vec::new();
        let summary = append_tree(&archive, &source, "filestore", &token, |p| first.push(p)).unwrap();
        assert_eq!(summary, TreeSummary { files: 2, bytes: 2 });
        let once = list_entries(&archive).unwrap();
        append_tree(&archive, &source, "filestore", &token, |_| {}).unwrap();

        assert_eq!(list_entries(&archive).unwrap(), once);
        assert_eq!(first, vec![50, 100]);
        assert!(once.contains(&"dump.sql".to_string()));
        assert!(once.contains(&"filestore/ab/one".to_string()));
        assert!(!once.iter().any(|n| n.ends_with(".pyc")));
    }

    #[test]
    fn test_append_tree_stops_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("dump.sql");
        write(&dump, b"--");
        let source = dir.path().join("fs");
        write(&source.join("f"), b"x");
        let archive = dir.path().join("a.zip");
        bundle_files(&archive, &[dump]).unwrap();
        let before = std::fs::read(&archive).unwrap();

        let token = CancellationToken::new();
        token.cancel("time limit");
        let err = append_tree(&archive, &source, "filestore", &token, |_| {}).unwrap_err();

        assert!(matches!(err, DumpflowError::Cancelled(ref r) if r == "time limit"));
        assert_eq!(std::fs::read(&archive).unwrap(), before);
        assert!(no_partials(dir.path()));
    }
}
