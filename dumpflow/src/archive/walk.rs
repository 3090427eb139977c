//! Directory listing with the skip set applied.

use crate::errors::Result;
use std::path::{Path, PathBuf};

/// File names and extensions never archived.
pub const SKIPPED_NAMES: &[&str] = &[".pyc", ".pyo", ".swp", ".DS_Store"];

/// Returns true if a file is in the skip set, by extension or by exact name.
#[must_use]
pub fn is_skipped(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let extension = path.extension().and_then(|e| e.to_str()).map(|e| format!(".{e}"));
    SKIPPED_NAMES
        .iter()
        .any(|marker| name == *marker || extension.as_deref() == Some(*marker))
}

/// Everything below a root, relative to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeListing {
    /// Directories, parents before children.
    pub directories: Vec<PathBuf>,
    /// Files to archive.
    pub files: Vec<PathBuf>,
    /// Files left out because of the skip set.
    pub skipped: Vec<PathBuf>,
}

/// Lists `root` recursively in name order, following symlinks.
pub fn collect_tree(root: &Path) -> Result<TreeListing> {
    let mut listing = TreeListing::default();
    let mut stack = vec![PathBuf::new()];

    while let Some(relative) = stack.pop() {
        let mut entries = std::fs::read_dir(root.join(&relative))?
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        let mut subdirs = Vec::new();
        for entry in entries {
            let child = relative.join(entry.file_name());
            // metadata() follows links so a symlinked root or subtree is walked
            if std::fs::metadata(entry.path())?.is_dir() {
                listing.directories.push(child.clone());
                subdirs.push(child);
            } else if is_skipped(&child) {
                listing.skipped.push(child);
            } else {
                listing.files.push(child);
            }
        }
        stack.extend(subdirs.into_iter().rev());
    }

    Ok(listing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_skip_set_by_extension_and_name() {
        assert!(is_skipped(Path::new("addons/module.pyc")));
        assert!(is_skipped(Path::new("x.pyo")));
        assert!(is_skipped(Path::new(".notes.swp")));
        assert!(is_skipped(Path::new("dir/.DS_Store")));
        assert!(!is_skipped(Path::new("ab/0123456789abcdef")));
        assert!(!is_skipped(Path::new("pyc")));
    }

    #[test]
    fn test_collect_tree_splits_skipped_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/one"), b"1").unwrap();
        std::fs::write(dir.path().join("a/b/two"), b"2").unwrap();
        std::fs::write(dir.path().join("a/.DS_Store"), b"").unwrap();
        std::fs::write(dir.path().join("top.pyc"), b"").unwrap();

        let listing = collect_tree(dir.path()).unwrap();

        assert_eq!(listing.directories, vec![PathBuf::from("a"), PathBuf::from("a/b")]);
        assert_eq!(listing.files, vec![PathBuf::from("a/one"), PathBuf::from("a/b/two")]);
        assert_eq!(listing.skipped.len(), 2);
    }
}
