//! Temporary directory fixtures.

use crate::archive::{self, FILESTORE_PREFIX};
use crate::cancellation::CancellationToken;
use crate::config::Settings;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A scratch directory holding the output, input and filestore roots.
///
/// The roots themselves are created lazily by whatever writes into them,
/// so tests can check that a stage did not touch a root at all. Everything
/// is removed when the value is dropped.
#[derive(Debug)]
pub struct TestRoots {
    dir: TempDir,
    settings: Settings,
}

impl Default for TestRoots {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRoots {
    /// Creates a fresh scratch directory.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let settings = Settings::default().with_base_dir(dir.path());
        Self { dir, settings }
    }

    /// Settings whose roots live inside the scratch directory.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Mutable access for tests that tune limits.
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// The scratch directory itself.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes `files` into the filestore of `database_name`.
    ///
    /// # Panics
    ///
    /// Panics on any filesystem error.
    pub fn write_filestore(&self, database_name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let root = self.settings.filestore_path(database_name);
        std::fs::create_dir_all(&root).expect("create filestore");
        write_files(&root, files);
        root
    }

    /// Builds a backup-shaped archive in the input root.
    ///
    /// The archive holds `dump.sql` with `dump`, a `manifest.json`, and a
    /// `filestore/` subtree when `filestore` is non-empty.
    ///
    /// # Panics
    ///
    /// Panics on any filesystem or archive error.
    pub fn write_input_archive(&self, filename: &str, dump: &[u8], filestore: &[(&str, &[u8])]) -> PathBuf {
        let staging = tempfile::tempdir().expect("create staging dir");
        let dump_path = staging.path().join("dump.sql");
        let manifest_path = staging.path().join("manifest.json");
        std::fs::write(&dump_path, dump).expect("write dump");
        std::fs::write(&manifest_path, br#"{"odoo_dump": "1"}"#).expect("write manifest");

        std::fs::create_dir_all(&self.settings.input_root).expect("create input root");
        let target = self.settings.input_root.join(filename);
        archive::bundle_files(&target, &[dump_path, manifest_path]).expect("bundle archive");

        if !filestore.is_empty() {
            let tree = staging.path().join("tree");
            std::fs::create_dir_all(&tree).expect("create tree");
            write_files(&tree, filestore);
            archive::append_tree(&target, &tree, FILESTORE_PREFIX, &CancellationToken::new(), |_| {})
                .expect("append filestore");
        }
        target
    }
}

fn write_files(root: &Path, files: &[(&str, &[u8])]) {
    for (rel, bytes) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dir");
        }
        std::fs::write(path, bytes).expect("write file");
    }
}
