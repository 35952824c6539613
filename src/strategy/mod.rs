// ABOUTME: Dump/restore strategy trait and the context shared by all backends
// ABOUTME: Holds the common validation sequence, artifact handling and supervised tool execution

pub mod container;
pub mod native;
pub mod shell;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, SyncMethod};
use crate::error::SyncError;
use crate::inspector::{validate_database_name, DatabaseInspector, SchemaAdmin, Side};
use crate::models::{DatabaseDescriptor, SyncResult, SyncTimings};
use crate::orchestrator::SyncOrchestrator;
use crate::process::{CommandRunner, ToolCommand, ToolOutput};
use crate::progress::{self, ProgressSampler};

pub use container::ContainerStrategy;
pub use native::NativeStrategy;
pub use shell::ShellStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    File,
    Directory,
}

/// A dump produced by one strategy and consumed by the same strategy's restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpArtifact {
    path: PathBuf,
    kind: ArtifactKind,
}

impl DumpArtifact {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: ArtifactKind::File,
        }
    }

    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: ArtifactKind::Directory,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn exists(&self) -> bool {
        match self.kind {
            ArtifactKind::File => self.path.is_file(),
            ArtifactKind::Directory => self.path.is_dir(),
        }
    }

    /// Remove the artifact from disk; a missing artifact is not an error
    pub fn remove(&self) -> std::io::Result<()> {
        let removed = match self.kind {
            ArtifactKind::File => std::fs::remove_file(&self.path),
            ArtifactKind::Directory => std::fs::remove_dir_all(&self.path),
        };
        match removed {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Remove the artifact, logging instead of failing
    pub fn remove_best_effort(&self) {
        match self.remove() {
            Ok(()) => debug!("Removed dump artifact {}", self.path.display()),
            Err(e) => warn!(
                "Failed to remove dump artifact {}: {}",
                self.path.display(),
                e
            ),
        }
    }

    fn prepare(&self) -> Result<()> {
        let result = match self.kind {
            ArtifactKind::File => match self.path.parent() {
                Some(parent) => std::fs::create_dir_all(parent),
                None => Ok(()),
            },
            ArtifactKind::Directory => std::fs::create_dir_all(&self.path),
        };
        result.map_err(|e| {
            SyncError::Io(format!("cannot prepare {}: {}", self.path.display(), e)).into()
        })
    }
}

/// Removes an artifact when dropped unless [`ArtifactGuard::keep`] is called
///
/// Covers every exit path between creating an artifact and handing it on,
/// including an early return through `?` or a dropped future.
pub struct ArtifactGuard {
    artifact: DumpArtifact,
    armed: bool,
}

impl ArtifactGuard {
    pub fn new(artifact: DumpArtifact) -> Self {
        Self {
            artifact,
            armed: true,
        }
    }

    pub fn artifact(&self) -> &DumpArtifact {
        &self.artifact
    }

    /// Disarm the guard and hand the artifact to the caller
    pub fn keep(mut self) -> DumpArtifact {
        self.armed = false;
        self.artifact.clone()
    }

    /// Remove the artifact now
    pub fn cleanup(self) {
        drop(self);
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        if self.armed {
            self.artifact.remove_best_effort();
        }
    }
}

/// How a supervised tool run reports progress
pub struct ToolProgress {
    pub message: String,
    pub total_bytes: u64,
    pub sampler: ProgressSampler,
}

impl ToolProgress {
    /// Dump progress: artifact size on disk against the source size
    pub fn dump(database: &str, artifact: &DumpArtifact, source_size: u64) -> Self {
        Self {
            message: format!("Dumping '{}'", database),
            total_bytes: source_size,
            sampler: ProgressSampler::ArtifactSize {
                path: artifact.path().to_path_buf(),
            },
        }
    }

    /// Restore progress: time-based estimate against the artifact size
    pub fn restore(database: &str, artifact: &DumpArtifact) -> Self {
        let total_bytes = progress::artifact_size(artifact.path()).unwrap_or(0);
        Self {
            message: format!("Restoring '{}' (estimated)", database),
            total_bytes,
            sampler: ProgressSampler::EstimatedRestore { total_bytes },
        }
    }
}

/// Everything a strategy needs besides its own tool knowledge
#[derive(Clone)]
pub struct StrategyContext {
    pub config: Arc<Config>,
    pub inspector: Arc<dyn DatabaseInspector>,
    pub admin: Arc<dyn SchemaAdmin>,
    pub runner: Arc<dyn CommandRunner>,
    pub cancel: CancellationToken,
    pub show_progress: bool,
}

impl StrategyContext {
    pub fn new(
        config: Arc<Config>,
        inspector: Arc<dyn DatabaseInspector>,
        admin: Arc<dyn SchemaAdmin>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            config,
            inspector,
            admin,
            runner,
            cancel: CancellationToken::new(),
            show_progress: true,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Validation steps shared by every strategy, up to tool checks
    ///
    /// Order: name safety, remote existence, remote probe, local probe.
    /// The first failing step decides the error.
    pub async fn check_source(&self, database: &str) -> Result<()> {
        validate_database_name(database)?;

        let exists = self
            .inspector
            .database_exists(database, Side::Remote)
            .await
            .context("Failed to check remote database")?;
        if !exists {
            return Err(SyncError::NotFound(format!(
                "database '{}' does not exist on {}",
                database,
                self.config.remote.label()
            ))
            .into());
        }

        for side in [Side::Remote, Side::Local] {
            let probe = self.inspector.test_connection(side).await;
            if !probe.connected {
                return Err(SyncError::Connectivity(format!(
                    "{} server {}:{} is not reachable: {}",
                    side,
                    probe.host,
                    probe.port,
                    probe.error.unwrap_or_else(|| "unknown error".to_string())
                ))
                .into());
            }
            debug!(
                "{} server {}:{} reachable (version {})",
                side,
                probe.host,
                probe.port,
                probe.server_version.as_deref().unwrap_or("unknown")
            );
        }
        Ok(())
    }

    /// Make sure dump artifacts can be written to the scratch directory
    pub fn check_scratch_dir(&self) -> Result<()> {
        let dir = &self.config.dump.scratch_dir;
        std::fs::create_dir_all(dir).map_err(|e| {
            SyncError::Io(format!("cannot create scratch directory {}: {}", dir.display(), e))
        })?;
        tempfile::NamedTempFile::new_in(dir).map_err(|e| {
            SyncError::Io(format!("scratch directory {} is not writable: {}", dir.display(), e))
        })?;
        Ok(())
    }

    /// Resolve a program and confirm it starts, e.g. `mysqldump --version`
    pub async fn require_tool(&self, program: &str, version_args: &[&str]) -> Result<PathBuf> {
        let tool = ToolCommand::new(program).tool_name();
        let path = self.runner.locate(program).ok_or_else(|| {
            SyncError::tool_unavailable(&tool, format!("'{}' was not found on PATH", program))
        })?;

        let command = ToolCommand::new(path.to_string_lossy()).args(version_args.iter().copied());
        let output = self
            .runner
            .run(command, self.cancel.clone())
            .await
            .with_context(|| format!("Failed to run {}", tool))?;
        if !output.success() {
            return Err(SyncError::tool_unavailable(&tool, output.combined()).into());
        }
        debug!("{} available: {}", tool, output.combined().lines().next().unwrap_or(""));
        Ok(path)
    }

    /// Unique scratch path such as `native_shop_20240102150405_3fa1.sql`
    pub fn artifact_path(&self, prefix: &str, database: &str, extension: Option<&str>) -> PathBuf {
        let mut name = format!(
            "{}_{}_{}_{:04x}",
            prefix,
            database,
            Utc::now().format("%Y%m%d%H%M%S"),
            rand::random::<u16>()
        );
        if let Some(ext) = extension {
            name.push('.');
            name.push_str(ext);
        }
        self.config.dump.scratch_dir.join(name)
    }

    pub async fn source_info(&self, database: &str) -> Result<DatabaseDescriptor> {
        self.inspector
            .get_database_info(database, Side::Remote)
            .await
            .with_context(|| format!("Failed to read size of remote database '{}'", database))
    }

    /// Dry-run result built from source metadata only
    pub async fn dry_run_result(&self, database: &str) -> Result<SyncResult> {
        let info = self.source_info(database).await?;
        let now = Utc::now();
        Ok(SyncResult::succeeded(
            database,
            info.size_bytes,
            info.table_count,
            SyncTimings {
                start_time: now,
                end_time: now,
                total: Duration::ZERO,
                dump: Duration::ZERO,
                restore: Duration::ZERO,
            },
        ))
    }

    /// Run a dump tool into `artifact`, removing the artifact if anything fails
    pub async fn dump_into(
        &self,
        database: &str,
        artifact: DumpArtifact,
        command: ToolCommand,
    ) -> Result<(SyncResult, Option<DumpArtifact>)> {
        let info = self.source_info(database).await?;
        let start_time = Utc::now();
        let started = Instant::now();

        let guard = ArtifactGuard::new(artifact);
        guard.artifact().prepare()?;

        let progress = ToolProgress::dump(database, guard.artifact(), info.size_bytes);
        self.run_tool(command, progress).await?;

        let size = progress::artifact_size(guard.artifact().path()).map_err(|e| {
            SyncError::Io(format!(
                "dump finished but {} is unreadable: {}",
                guard.artifact().path().display(),
                e
            ))
        })?;
        let elapsed = started.elapsed();
        info!(
            "Dump of '{}' written to {} ({} bytes)",
            database,
            guard.artifact().path().display(),
            size
        );

        let result = SyncResult::succeeded(
            database,
            size,
            info.table_count,
            SyncTimings {
                start_time,
                end_time: Utc::now(),
                total: elapsed,
                dump: elapsed,
                restore: Duration::ZERO,
            },
        );
        Ok((result, Some(guard.keep())))
    }

    /// Spawn a tool as its own task and supervise it with a progress bar
    pub async fn run_tool(&self, command: ToolCommand, progress: ToolProgress) -> Result<ToolOutput> {
        let tool = command.tool_name();
        info!("Running {}", command.display());

        let bar = progress::new_bar(self.show_progress, progress.total_bytes, progress.message);
        let cleanup = command.cancel_cleanup().cloned();
        let runner = Arc::clone(&self.runner);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move { runner.run(command, cancel).await });

        let joined = progress::supervise(handle, &bar, &progress.sampler).await;
        let outcome = match joined {
            Ok(output) => output.and_then(|o| o.ensure_success(&tool)),
            Err(e) => Err(anyhow!("{} task did not complete: {}", tool, e)),
        };

        match outcome {
            Ok(output) => {
                bar.finish();
                Ok(output)
            }
            Err(e) => {
                bar.abandon();
                if let (Some(SyncError::Cancelled), Some(cleanup)) = (SyncError::find(&e), cleanup) {
                    self.run_cancel_cleanup(cleanup).await;
                }
                Err(e)
            }
        }
    }

    /// Best-effort follow-up for a cancelled tool whose work outlives its process
    async fn run_cancel_cleanup(&self, cleanup: ToolCommand) {
        info!("Cleaning up after cancellation: {}", cleanup.display());
        // The run token is already cancelled
        match self.runner.run(cleanup, CancellationToken::new()).await {
            Ok(output) if output.success() => {}
            Ok(output) => warn!("Cleanup after cancellation failed: {}", output.combined()),
            Err(e) => warn!("Cleanup after cancellation failed: {:#}", e),
        }
    }

    /// Restore precondition, also the whole of a dry-run restore
    pub fn check_artifact(&self, artifact: &DumpArtifact) -> Result<()> {
        if artifact.exists() {
            Ok(())
        } else {
            Err(SyncError::Io(format!(
                "dump artifact {} does not exist",
                artifact.path().display()
            ))
            .into())
        }
    }

    /// Drop the local schema if present (optionally killing its sessions first), then create it
    pub async fn replace_local_schema(&self, database: &str, kill_sessions: bool) -> Result<()> {
        let exists = self
            .inspector
            .database_exists(database, Side::Local)
            .await
            .context("Failed to check local database")?;

        if exists {
            if kill_sessions {
                match self.admin.kill_sessions(database).await {
                    Ok(0) => {}
                    Ok(n) => info!("Killed {} session(s) using local '{}'", n, database),
                    Err(e) => warn!("Could not kill sessions on local '{}': {:#}", database, e),
                }
            }
            info!("Dropping local database '{}'", database);
            self.admin
                .drop_database(database)
                .await
                .with_context(|| format!("Failed to drop local database '{}'", database))?;
        }

        self.admin
            .create_database(database)
            .await
            .with_context(|| format!("Failed to create local database '{}'", database))
    }
}

/// Add the password to a mysql client command via `MYSQL_PWD`
pub(crate) fn with_mysql_password(command: ToolCommand, password: &str) -> ToolCommand {
    if password.is_empty() {
        command
    } else {
        command.secret_env("MYSQL_PWD", password)
    }
}

/// One way of moving a database from the remote server to the local one
#[async_trait]
pub trait DumpStrategy: Send + Sync {
    fn method(&self) -> SyncMethod;

    fn context(&self) -> &StrategyContext;

    /// Run every precondition check; no mutation happens here
    async fn validate(&self, database: &str) -> Result<()>;

    /// With `dry_run` no tool runs and no artifact is returned
    async fn create_dump(
        &self,
        database: &str,
        dry_run: bool,
    ) -> Result<(SyncResult, Option<DumpArtifact>)>;

    /// With `dry_run` only the artifact's existence is checked
    async fn restore_dump(&self, artifact: &DumpArtifact, database: &str, dry_run: bool)
        -> Result<()>;

    /// Command lines the strategy would run, with secrets masked
    fn planned_commands(&self, database: &str) -> Vec<String>;

    async fn execute_sync(&self, database: &str) -> Result<SyncResult> {
        SyncOrchestrator::new(self).run(database).await
    }
}

pub fn build_strategy(method: SyncMethod, ctx: StrategyContext) -> Box<dyn DumpStrategy> {
    match method {
        SyncMethod::Native => Box::new(NativeStrategy::new(ctx)),
        SyncMethod::Container => Box::new(ContainerStrategy::new(ctx)),
        SyncMethod::Shell => Box::new(ShellStrategy::new(ctx)),
    }
}
