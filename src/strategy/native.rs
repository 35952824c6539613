// ABOUTME: Native strategy using the mysqldump and mysql client binaries
// ABOUTME: Single-file SQL dump streamed to the scratch directory and replayed over stdin

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tracing::info;

use super::{with_mysql_password, DumpArtifact, DumpStrategy, StrategyContext, ToolProgress};
use crate::config::SyncMethod;
use crate::models::SyncResult;
use crate::process::ToolCommand;

const DUMP_FLAGS: &[&str] = &[
    "--single-transaction",
    "--routines",
    "--triggers",
    "--no-tablespaces",
    "--set-gtid-purged=OFF",
    "--opt",
    "--quick",
    "--compress",
    "--disable-keys",
    "--extended-insert",
];

const RESTORE_FLAGS: &[&str] = &["--compress", "--quick", "--max_allowed_packet=1G"];

pub struct NativeStrategy {
    ctx: StrategyContext,
}

impl NativeStrategy {
    pub fn new(ctx: StrategyContext) -> Self {
        Self { ctx }
    }

    fn dump_command(&self, database: &str, output: &Path) -> ToolCommand {
        let remote = &self.ctx.config.remote;
        let command = ToolCommand::new(&self.ctx.config.dump.mysqldump_path)
            .args(DUMP_FLAGS.iter().copied())
            .arg(format!("--host={}", remote.host))
            .arg(format!("--port={}", remote.port))
            .arg(format!("--user={}", remote.user))
            .arg(database)
            .stdout_to(output);
        with_mysql_password(command, &remote.password)
    }

    fn restore_command(&self, database: &str, input: &Path) -> ToolCommand {
        let local = &self.ctx.config.local;
        let command = ToolCommand::new(&self.ctx.config.dump.mysql_path)
            .arg(format!("--host={}", local.host))
            .arg(format!("--port={}", local.port))
            .arg(format!("--user={}", local.user))
            .args(RESTORE_FLAGS.iter().copied())
            .arg(database)
            .stdin_from(input);
        with_mysql_password(command, &local.password)
    }
}

#[async_trait]
impl DumpStrategy for NativeStrategy {
    fn method(&self) -> SyncMethod {
        SyncMethod::Native
    }

    fn context(&self) -> &StrategyContext {
        &self.ctx
    }

    async fn validate(&self, database: &str) -> Result<()> {
        self.ctx.check_source(database).await?;
        let dump = &self.ctx.config.dump;
        self.ctx.require_tool(&dump.mysqldump_path, &["--version"]).await?;
        self.ctx.require_tool(&dump.mysql_path, &["--version"]).await?;
        self.ctx.check_scratch_dir()
    }

    async fn create_dump(
        &self,
        database: &str,
        dry_run: bool,
    ) -> Result<(SyncResult, Option<DumpArtifact>)> {
        if dry_run {
            return Ok((self.ctx.dry_run_result(database).await?, None));
        }

        let path = self.ctx.artifact_path("native", database, Some("sql"));
        let command = self.dump_command(database, &path);
        self.ctx
            .dump_into(database, DumpArtifact::file(path), command)
            .await
    }

    async fn restore_dump(
        &self,
        artifact: &DumpArtifact,
        database: &str,
        dry_run: bool,
    ) -> Result<()> {
        self.ctx.check_artifact(artifact)?;
        if dry_run {
            return Ok(());
        }

        self.ctx.replace_local_schema(database, false).await?;

        let command = self.restore_command(database, artifact.path());
        self.ctx
            .run_tool(command, ToolProgress::restore(database, artifact))
            .await?;
        info!("Restored '{}' into {}", database, self.ctx.config.local.label());
        Ok(())
    }

    fn planned_commands(&self, database: &str) -> Vec<String> {
        let path = self.ctx.artifact_path("native", database, Some("sql"));
        vec![
            self.dump_command(database, &path).display(),
            self.restore_command(database, &path).display(),
        ]
    }
}
