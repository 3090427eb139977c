//! Zip archive primitives used by the backup and restore stages.
//!
//! Every function here writes its output to a sibling temporary path and
//! renames it into place, so a path handed back to a stage always names a
//! complete artifact.

mod reader;
mod walk;
mod writer;

pub use reader::{detect_dump_format, extract_member, extract_tree, list_entries};
pub use walk::{collect_tree, is_skipped, TreeListing, SKIPPED_NAMES};
pub use writer::{append_tree, bundle_files};

use crate::utils::generate_uuid;
use std::path::{Path, PathBuf};

/// What a tree operation wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeSummary {
    /// Regular files written.
    pub files: usize,
    /// Uncompressed bytes written.
    pub bytes: u64,
}

/// Archive prefix of the filestore subtree.
pub const FILESTORE_PREFIX: &str = "filestore";

/// `archive.zip` becomes `archive.zip.partial`.
pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

/// Like [`partial_path`] but distinct per call, for writers that may still
/// be running when the same archive is rebuilt.
pub(crate) fn unique_partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}.partial", generate_uuid().simple()));
    path.with_file_name(name)
}

/// Zip entry name of a relative path under `prefix`, always `/` separated.
pub(crate) fn entry_name(prefix: &str, relative: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !prefix.is_empty() {
        parts.push(prefix.to_string());
    }
    parts.extend(
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned()),
    );
    parts.join("/")
}
