//! Stages of the backup chain.

use super::{blocking, Stage, StageEnv, StageKind};
use crate::archive::{self, FILESTORE_PREFIX};
use crate::config::Settings;
use crate::core::{ContextField, FileInfo, JobContext};
use crate::errors::{DumpflowError, Result};
use crate::pipeline::StagePolicy;
use crate::utils::{backup_filename, generate_uuid};
use async_trait::async_trait;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use tracing::{debug, info};

/// Name of the manifest inside the workdir and the archive.
pub const MANIFEST_FILENAME: &str = "manifest.json";

async fn write_atomically(path: &Path, bytes: Vec<u8>) -> Result<()> {
    let partial = archive::partial_path(path);
    tokio::fs::write(&partial, bytes).await?;
    tokio::fs::rename(&partial, path).await?;
    Ok(())
}

/// Allocates a fresh working directory and the archive name.
#[derive(Debug, Default, Clone, Copy)]
pub struct CreateEnv;

#[async_trait]
impl Stage for CreateEnv {
    fn kind(&self) -> StageKind {
        StageKind::CreateEnv
    }

    fn provides(&self) -> &'static [ContextField] {
        &[ContextField::Workdir, ContextField::Filename, ContextField::ArchivePath]
    }

    async fn run(&self, mut ctx: JobContext, env: &StageEnv) -> Result<JobContext> {
        if let Some(ref workdir) = ctx.workdir {
            // redelivered after the directory was recorded
            tokio::fs::create_dir_all(workdir).await?;
            return Ok(ctx);
        }

        tokio::fs::create_dir_all(&env.settings.output_root).await?;
        let workdir = env.settings.output_root.join(generate_uuid().to_string());
        tokio::fs::create_dir(&workdir).await?;

        let filename = backup_filename(&ctx.database_name);
        ctx.archive_path = Some(workdir.join(format!("{filename}.zip")));
        ctx.filename = Some(filename);
        info!(job = %ctx.database_name, workdir = %workdir.display(), "allocated workdir");
        ctx.workdir = Some(workdir);
        Ok(ctx)
    }
}

/// Writes `manifest.json` describing the source database.
#[derive(Debug, Default, Clone, Copy)]
pub struct CreateManifest;

#[async_trait]
impl Stage for CreateManifest {
    fn kind(&self) -> StageKind {
        StageKind::CreateManifest
    }

    fn requires(&self) -> &'static [ContextField] {
        &[ContextField::Workdir]
    }

    fn provides(&self) -> &'static [ContextField] {
        &[ContextField::ManifestInfo]
    }

    async fn run(&self, mut ctx: JobContext, env: &StageEnv) -> Result<JobContext> {
        let path = ctx.require_workdir(self.name())?.join(MANIFEST_FILENAME);
        let manifest = env.tools.manifest(&ctx.database_name).await?;
        write_atomically(&path, serde_json::to_vec_pretty(&manifest)?).await?;

        let info = {
            let path = path.clone();
            blocking(move || FileInfo::digest(path)).await?
        };
        debug!(modules = manifest.modules.len(), version = %manifest.version, "manifest written");
        ctx.stage_file(path);
        ctx.manifest_info = Some(info);
        Ok(ctx)
    }
}

/// Dumps the database into the workdir.
#[derive(Debug, Default, Clone, Copy)]
pub struct DumpDb;

#[async_trait]
impl Stage for DumpDb {
    fn kind(&self) -> StageKind {
        StageKind::DumpDb
    }

    fn requires(&self) -> &'static [ContextField] {
        &[ContextField::Workdir]
    }

    fn provides(&self) -> &'static [ContextField] {
        &[ContextField::DumpInfo]
    }

    async fn run(&self, mut ctx: JobContext, env: &StageEnv) -> Result<JobContext> {
        let dest = ctx
            .require_workdir(self.name())?
            .join(ctx.dump_format.member_name());
        let partial = archive::partial_path(&dest);

        if let Err(e) = env.tools.dump(&ctx.database_name, &partial, ctx.dump_format).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, &dest).await?;

        let info = {
            let dest = dest.clone();
            blocking(move || FileInfo::digest(dest)).await?
        };
        info!(job = %ctx.database_name, size = info.size, format = %ctx.dump_format, "database dumped");
        ctx.stage_file(dest);
        ctx.dump_info = Some(info);
        Ok(ctx)
    }
}

/// Bundles the staged manifest and dump into a new archive.
#[derive(Debug, Default, Clone, Copy)]
pub struct AddToZip;

#[async_trait]
impl Stage for AddToZip {
    fn kind(&self) -> StageKind {
        StageKind::AddToZip
    }

    fn requires(&self) -> &'static [ContextField] {
        &[
            ContextField::Workdir,
            ContextField::ArchivePath,
            ContextField::ManifestInfo,
            ContextField::DumpInfo,
        ]
    }

    fn provides(&self) -> &'static [ContextField] {
        &[ContextField::ArchiveInfo]
    }

    async fn run(&self, mut ctx: JobContext, _env: &StageEnv) -> Result<JobContext> {
        let archive_path = ctx.require_archive_path(self.name())?.to_path_buf();
        let files = ctx.staged_files.clone();

        let info = {
            let archive_path = archive_path.clone();
            blocking(move || archive::bundle_files(&archive_path, &files)).await?
        };
        info!(archive = %archive_path.display(), size = info.size, "archive written");
        ctx.archive_info = Some(info);
        ctx.download = Some(archive_path);
        Ok(ctx)
    }
}

/// Appends the filestore tree to the archive, publishing progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct AddFilestore;

/// Links `source` at `link`, reusing a link that already points there.
fn link_filestore(source: &Path, link: &Path) -> Result<()> {
    match std::fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            if std::fs::read_link(link)? == source {
                Ok(())
            } else {
                Err(DumpflowError::conflict(link))
            }
        }
        Ok(_) => Err(DumpflowError::conflict(link)),
        Err(e) if e.kind() == IoErrorKind::NotFound => {
            #[cfg(unix)]
            std::os::unix::fs::symlink(source, link)?;
            #[cfg(windows)]
            std::os::windows::fs::symlink_dir(source, link)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Stage for AddFilestore {
    fn kind(&self) -> StageKind {
        StageKind::AddFilestore
    }

    fn requires(&self) -> &'static [ContextField] {
        &[ContextField::Workdir, ContextField::ArchivePath, ContextField::ArchiveInfo]
    }

    fn provides(&self) -> &'static [ContextField] {
        &[ContextField::FilestoreInfo]
    }

    fn policy(&self, settings: &Settings) -> StagePolicy {
        StagePolicy::default()
            .with_timeout(settings.filestore_time_limit())
            .with_max_retries(settings.filestore_max_retries)
    }

    async fn run(&self, mut ctx: JobContext, env: &StageEnv) -> Result<JobContext> {
        if !ctx.include_filestore {
            debug!(job = %ctx.database_name, "filestore not requested");
            return Ok(ctx);
        }

        let source = env.settings.filestore_path(&ctx.database_name);
        if !tokio::fs::try_exists(&source).await? {
            return Err(DumpflowError::precondition(format!(
                "filestore {} does not exist",
                source.display()
            )));
        }
        let link = ctx.require_workdir(self.name())?.join(FILESTORE_PREFIX);
        let archive_path = ctx.require_archive_path(self.name())?.to_path_buf();

        let (summary, archive_info) = {
            let (source, link) = (source.clone(), link.clone());
            let progress = env.progress.clone();
            let token = env.cancellation.clone();
            blocking(move || {
                link_filestore(&source, &link)?;
                let summary = archive::append_tree(&archive_path, &link, FILESTORE_PREFIX, &token, |p| {
                    progress.report(p);
                })?;
                Ok((summary, FileInfo::digest(&archive_path)?))
            })
            .await?
        };

        info!(
            job = %ctx.database_name,
            files = summary.files,
            bytes = summary.bytes,
            "filestore archived"
        );
        ctx.stage_file(link);
        ctx.filestore_info = Some(FileInfo {
            path: source,
            size: summary.bytes,
            sha256: None,
        });
        ctx.archive_info = Some(archive_info);
        Ok(ctx)
    }
}

/// Removes the staged intermediate files; the archive stays.
#[derive(Debug, Default, Clone, Copy)]
pub struct CleanWorkdir;

async fn remove_staged(path: &Path) -> Result<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        // also unlinks symlinks without following them
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

#[async_trait]
impl Stage for CleanWorkdir {
    fn kind(&self) -> StageKind {
        StageKind::CleanWorkdir
    }

    fn requires(&self) -> &'static [ContextField] {
        &[ContextField::Workdir]
    }

    async fn run(&self, ctx: JobContext, _env: &StageEnv) -> Result<JobContext> {
        for path in &ctx.staged_files {
            if ctx.archive_path.as_ref() == Some(path) {
                continue;
            }
            remove_staged(path).await?;
        }
        debug!(removed = ctx.staged_files.len(), "workdir cleaned");
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::list_entries;
    use crate::core::DumpFormat;
    use crate::testing::{FakeDatabaseTools, TestRoots};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn env(roots: &TestRoots, tools: FakeDatabaseTools) -> StageEnv {
        StageEnv::new(Arc::new(roots.settings().clone()), Arc::new(tools))
    }

    async fn through_zip(env: &StageEnv, include_filestore: bool) -> JobContext {
        let mut ctx = JobContext::backup("acme", include_filestore, DumpFormat::Sql);
        ctx = CreateEnv.run(ctx, env).await.unwrap();
        ctx = CreateManifest.run(ctx, env).await.unwrap();
        ctx = DumpDb.run(ctx, env).await.unwrap();
        AddToZip.run(ctx, env).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_env_allocates_unique_workdir() {
        let roots = TestRoots::new();
        let env = env(&roots, FakeDatabaseTools::new());

        let a = CreateEnv.run(JobContext::backup("acme", false, DumpFormat::Sql), &env).await.unwrap();
        let b = CreateEnv.run(JobContext::backup("acme", false, DumpFormat::Sql), &env).await.unwrap();

        let workdir = a.workdir.clone().unwrap();
        assert!(workdir.is_dir());
        assert!(workdir.starts_with(&roots.settings().output_root));
        assert_ne!(a.workdir, b.workdir);
        assert!(a.filename.as_deref().unwrap().starts_with("acme_"));
        assert_eq!(a.archive_path.unwrap().extension().unwrap(), "zip");
    }

    #[tokio::test]
    async fn test_create_env_rerun_keeps_workdir() {
        let roots = TestRoots::new();
        let env = env(&roots, FakeDatabaseTools::new());
        let first = CreateEnv.run(JobContext::backup("acme", false, DumpFormat::Sql), &env).await.unwrap();

        let again = CreateEnv.run(first.clone(), &env).await.unwrap();
        assert_eq!(again, first);
    }

    #[tokio::test]
    async fn test_manifest_and_dump_are_staged_in_order() {
        let roots = TestRoots::new();
        let env = env(&roots, FakeDatabaseTools::new().with_database("acme"));

        let ctx = through_zip(&env, false).await;
        let workdir = ctx.workdir.clone().unwrap();

        assert_eq!(
            ctx.staged_files,
            vec![workdir.join(MANIFEST_FILENAME), workdir.join("dump.sql")]
        );
        assert_eq!(
            list_entries(ctx.archive_path.as_ref().unwrap()).unwrap(),
            vec!["manifest.json", "dump.sql"]
        );
        assert_eq!(ctx.download, ctx.archive_path);
        assert!(ctx.dump_info.unwrap().sha256.is_some());
    }

    #[tokio::test]
    async fn test_failed_dump_leaves_no_dump_file() {
        let roots = TestRoots::new();
        let tools = FakeDatabaseTools::new().with_database("acme").failing("dump");
        let env = env(&roots, tools);
        let ctx = CreateEnv.run(JobContext::backup("acme", false, DumpFormat::Sql), &env).await.unwrap();
        let workdir = ctx.workdir.clone().unwrap();

        let err = DumpDb.run(ctx, &env).await.unwrap_err();
        assert!(matches!(err, DumpflowError::ExternalTool { .. }));
        assert_eq!(std::fs::read_dir(workdir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_add_filestore_appends_tree() {
        let roots = TestRoots::new();
        roots.write_filestore("acme", &[("ab/0001", b"one"), ("cd/0002", b"two")]);
        let env = env(&roots, FakeDatabaseTools::new().with_database("acme"));

        let ctx = AddFilestore.run(through_zip(&env, true).await, &env).await.unwrap();

        let entries = list_entries(ctx.archive_path.as_ref().unwrap()).unwrap();
        assert!(entries.contains(&"filestore/ab/0001".to_string()));
        assert_eq!(ctx.filestore_info.as_ref().unwrap().size, 6);
        let link = ctx.workdir.as_ref().unwrap().join("filestore");
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(ctx.staged_files.last(), Some(&link));
    }

    #[tokio::test]
    async fn test_add_filestore_rerun_reuses_link() {
        let roots = TestRoots::new();
        roots.write_filestore("acme", &[("ab/0001", b"one")]);
        let env = env(&roots, FakeDatabaseTools::new().with_database("acme"));
        let ctx = through_zip(&env, true).await;

        let once = AddFilestore.run(ctx.clone(), &env).await.unwrap();
        let twice = AddFilestore.run(ctx, &env).await.unwrap();

        assert_eq!(
            list_entries(once.archive_path.as_ref().unwrap()).unwrap(),
            list_entries(twice.archive_path.as_ref().unwrap()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_add_filestore_without_source_is_precondition() {
        let roots = TestRoots::new();
        let env = env(&roots, FakeDatabaseTools::new().with_database("acme"));
        let ctx = through_zip(&env, true).await;

        let err = AddFilestore.run(ctx, &env).await.unwrap_err();
        assert!(matches!(err, DumpflowError::PreconditionViolation(_)));
    }

    #[tokio::test]
    async fn test_add_filestore_skipped_when_not_requested() {
        let roots = TestRoots::new();
        let env = env(&roots, FakeDatabaseTools::new().with_database("acme"));
        let ctx = through_zip(&env, false).await;

        let out = AddFilestore.run(ctx.clone(), &env).await.unwrap();
        assert_eq!(out, ctx);
    }

    #[tokio::test]
    async fn test_add_filestore_conflicting_path() {
        let roots = TestRoots::new();
        roots.write_filestore("acme", &[("f", b"x")]);
        let env = env(&roots, FakeDatabaseTools::new().with_database("acme"));
        let ctx = through_zip(&env, true).await;
        std::fs::create_dir(ctx.workdir.as_ref().unwrap().join("filestore")).unwrap();

        let err = AddFilestore.run(ctx, &env).await.unwrap_err();
        assert!(matches!(err, DumpflowError::FilesystemConflict { .. }));
    }

    #[tokio::test]
    async fn test_clean_workdir_keeps_archive_and_source() {
        let roots = TestRoots::new();
        roots.write_filestore("acme", &[("ab/0001", b"one")]);
        let env = env(&roots, FakeDatabaseTools::new().with_database("acme"));
        let ctx = AddFilestore.run(through_zip(&env, true).await, &env).await.unwrap();

        let ctx = CleanWorkdir.run(ctx, &env).await.unwrap();

        let workdir = ctx.workdir.clone().unwrap();
        let left: Vec<PathBuf> = std::fs::read_dir(&workdir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(left, vec![ctx.archive_path.clone().unwrap()]);
        assert!(roots.settings().filestore_path("acme").join("ab/0001").is_file());
    }

    #[test]
    fn test_filestore_policy_follows_settings() {
        let settings = Settings::default();
        let policy = AddFilestore.policy(&settings);
        assert_eq!(policy.timeout, Some(std::time::Duration::from_secs(240)));
        assert_eq!(policy.max_retries, 1);
        assert_eq!(DumpDb.policy(&settings), StagePolicy::default());
    }
}
