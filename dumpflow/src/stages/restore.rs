//! Stages of the restore chain.

use super::{blocking, Stage, StageEnv, StageKind};
use crate::archive::{self, FILESTORE_PREFIX};
use crate::core::{ContextField, FileInfo, JobContext};
use crate::errors::{DumpflowError, Result};
use crate::utils::generate_uuid;
use async_trait::async_trait;
use tracing::{info, warn};

/// Checks that the filestore target is free and the archive exists, then
/// allocates a scratch workdir.
///
/// Nothing is created unless both checks pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct InitRestore;

#[async_trait]
impl Stage for InitRestore {
    fn kind(&self) -> StageKind {
        StageKind::InitRestore
    }

    fn provides(&self) -> &'static [ContextField] {
        &[
            ContextField::FilestoreTarget,
            ContextField::SourceArchive,
            ContextField::Workdir,
        ]
    }

    async fn run(&self, mut ctx: JobContext, env: &StageEnv) -> Result<JobContext> {
        let target = env.settings.filestore_path(&ctx.database_name);
        if tokio::fs::symlink_metadata(&target).await.is_ok() {
            return Err(DumpflowError::precondition(format!(
                "filestore {} already exists",
                target.display()
            )));
        }

        let filename = ctx
            .source_filename
            .as_deref()
            .ok_or_else(|| DumpflowError::missing_input(self.name(), "source_filename"))?;
        let source = env.settings.input_root.join(filename);
        let is_file = tokio::fs::metadata(&source).await.map(|m| m.is_file()).unwrap_or(false);
        if !is_file {
            return Err(DumpflowError::precondition(format!(
                "archive {} does not exist",
                source.display()
            )));
        }

        if ctx.workdir.is_none() {
            tokio::fs::create_dir_all(&env.settings.output_root).await?;
            let workdir = env.settings.output_root.join(format!("restore-{}", generate_uuid()));
            tokio::fs::create_dir(&workdir).await?;
            ctx.workdir = Some(workdir);
        }
        ctx.filestore_target = Some(target);
        ctx.source_archive = Some(source);
        Ok(ctx)
    }
}

/// Extracts only the dump member into the scratch workdir.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnzipDump;

#[async_trait]
impl Stage for UnzipDump {
    fn kind(&self) -> StageKind {
        StageKind::UnzipDump
    }

    fn requires(&self) -> &'static [ContextField] {
        &[ContextField::SourceArchive, ContextField::Workdir]
    }

    fn provides(&self) -> &'static [ContextField] {
        &[ContextField::DumpInfo]
    }

    async fn run(&self, mut ctx: JobContext, _env: &StageEnv) -> Result<JobContext> {
        let source = ctx.require_source_archive(self.name())?.to_path_buf();
        let workdir = ctx.require_workdir(self.name())?.to_path_buf();

        let (format, info) = blocking(move || {
            let format = archive::detect_dump_format(&source)?;
            let dump = archive::extract_member(&source, format.member_name(), &workdir)?;
            Ok((format, FileInfo::digest(dump)?))
        })
        .await?;

        info!(job = %ctx.database_name, %format, size = info.size, "dump extracted");
        ctx.dump_format = format;
        ctx.dump_info = Some(info);
        Ok(ctx)
    }
}

/// Creates the target database; loses cleanly if it already exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct CreateDatabase;

#[async_trait]
impl Stage for CreateDatabase {
    fn kind(&self) -> StageKind {
        StageKind::CreateDatabase
    }

    fn requires(&self) -> &'static [ContextField] {
        &[ContextField::DumpInfo]
    }

    async fn run(&self, ctx: JobContext, env: &StageEnv) -> Result<JobContext> {
        env.tools.create_database(&ctx.database_name).await?;
        info!(job = %ctx.database_name, "database created");
        Ok(ctx)
    }
}

/// Loads the extracted dump into the new database.
#[derive(Debug, Default, Clone, Copy)]
pub struct RestoreDump;

#[async_trait]
impl Stage for RestoreDump {
    fn kind(&self) -> StageKind {
        StageKind::RestoreDump
    }

    fn requires(&self) -> &'static [ContextField] {
        &[ContextField::DumpInfo]
    }

    fn provides(&self) -> &'static [ContextField] {
        &[ContextField::RestoreInfo]
    }

    async fn run(&self, mut ctx: JobContext, env: &StageEnv) -> Result<JobContext> {
        let dump = ctx.require_dump(self.name())?.clone();
        env.tools
            .restore(&ctx.database_name, &dump.path, ctx.dump_format)
            .await?;
        info!(job = %ctx.database_name, "dump applied");
        ctx.restore_info = Some(dump);
        Ok(ctx)
    }
}

/// Extracts the filestore tree into place and drops the scratch workdir.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnzipFilestore;

#[async_trait]
impl Stage for UnzipFilestore {
    fn kind(&self) -> StageKind {
        StageKind::UnzipFilestore
    }

    fn requires(&self) -> &'static [ContextField] {
        &[
            ContextField::SourceArchive,
            ContextField::FilestoreTarget,
            ContextField::Workdir,
        ]
    }

    async fn run(&self, mut ctx: JobContext, _env: &StageEnv) -> Result<JobContext> {
        let source = ctx.require_source_archive(self.name())?.to_path_buf();
        let target = ctx.require_filestore_target(self.name())?.to_path_buf();
        let workdir = ctx.require_workdir(self.name())?.to_path_buf();

        let extracted = {
            let target = target.clone();
            blocking(move || archive::extract_tree(&source, FILESTORE_PREFIX, &target)).await?
        };
        match extracted {
            Some(summary) => {
                info!(job = %ctx.database_name, files = summary.files, "filestore restored");
                ctx.filestore_info = Some(FileInfo {
                    path: target,
                    size: summary.bytes,
                    sha256: None,
                });
            }
            None => info!(job = %ctx.database_name, "archive carries no filestore"),
        }

        if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(workdir = %workdir.display(), error = %e, "could not remove restore workdir");
            }
        }
        Ok(ctx)
    }
}
