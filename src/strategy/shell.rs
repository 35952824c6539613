// ABOUTME: MySQL Shell strategy using util dump-schemas and util load-dump
// ABOUTME: Locates mysqlsh on PATH, from configuration, or in standard install directories

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};

use super::{DumpArtifact, DumpStrategy, StrategyContext, ToolProgress};
use crate::config::{EndpointConfig, SyncMethod};
use crate::error::SyncError;
use crate::models::SyncResult;
use crate::process::ToolCommand;

const INSTALL_HINT: &str = "install MySQL Shell (https://dev.mysql.com/downloads/shell/) \
                            or set dump.mysqlsh_path";

/// Where installers put mysqlsh when it is not on PATH
pub fn standard_paths() -> &'static [&'static str] {
    if cfg!(windows) {
        &[
            r"C:\Program Files\MySQL\MySQL Shell 8.4\bin\mysqlsh.exe",
            r"C:\Program Files\MySQL\MySQL Shell 8.0\bin\mysqlsh.exe",
            r"C:\Program Files (x86)\MySQL\MySQL Shell 8.4\bin\mysqlsh.exe",
            r"C:\Program Files (x86)\MySQL\MySQL Shell 8.0\bin\mysqlsh.exe",
        ]
    } else {
        &[
            "/usr/bin/mysqlsh",
            "/usr/local/bin/mysqlsh",
            "/opt/mysql-shell/bin/mysqlsh",
        ]
    }
}

fn endpoint_uri(endpoint: &EndpointConfig) -> String {
    format!("mysql://{}@{}:{}", endpoint.user, endpoint.host, endpoint.port)
}

pub struct ShellStrategy {
    ctx: StrategyContext,
    mysqlsh: OnceLock<PathBuf>,
}

impl ShellStrategy {
    pub fn new(ctx: StrategyContext) -> Self {
        Self {
            ctx,
            mysqlsh: OnceLock::new(),
        }
    }

    /// Find the mysqlsh binary, caching the first successful lookup
    fn resolve_mysqlsh(&self) -> Result<PathBuf> {
        if let Some(path) = self.mysqlsh.get() {
            return Ok(path.clone());
        }

        let found = match &self.ctx.config.dump.mysqlsh_path {
            Some(configured) => self.ctx.runner.locate(configured).ok_or_else(|| {
                SyncError::tool_unavailable(
                    "mysqlsh",
                    format!("configured mysqlsh_path '{}' does not exist", configured),
                )
            })?,
            None => self
                .ctx
                .runner
                .locate("mysqlsh")
                .or_else(|| {
                    standard_paths()
                        .iter()
                        .map(PathBuf::from)
                        .find(|p| p.is_file())
                })
                .ok_or_else(|| {
                    SyncError::tool_unavailable(
                        "mysqlsh",
                        format!("MySQL Shell not found on PATH; {}", INSTALL_HINT),
                    )
                })?,
        };

        debug!("Using mysqlsh at {}", found.display());
        Ok(self.mysqlsh.get_or_init(|| found).clone())
    }

    fn program(&self) -> String {
        self.mysqlsh
            .get()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mysqlsh".to_string())
    }

    fn base_command(&self, endpoint: &EndpointConfig) -> ToolCommand {
        let command = ToolCommand::new(self.program())
            .env("MYSQLSH_TERM_COLOR_MODE", "nocolor")
            .arg("--uri")
            .arg(endpoint_uri(endpoint));
        if endpoint.password.is_empty() {
            command.arg("--no-password")
        } else {
            command
                .arg("--passwords-from-stdin")
                .stdin_secret(endpoint.password.as_str())
        }
    }

    fn dump_command(&self, database: &str, output_dir: &Path) -> ToolCommand {
        self.base_command(&self.ctx.config.remote)
            .args(["--", "util", "dump-schemas", database])
            .arg(format!("--outputUrl={}", output_dir.display()))
            .arg(format!("--threads={}", self.ctx.config.dump.threads))
            .args([
                "--consistent=false",
                "--skipConsistencyChecks",
                "--compression=zstd",
            ])
    }

    fn restore_command(&self, dump_dir: &Path) -> ToolCommand {
        self.base_command(&self.ctx.config.local)
            .args(["--", "util", "load-dump"])
            .arg(dump_dir.display().to_string())
            .arg(format!("--threads={}", self.ctx.config.dump.threads))
            .args([
                "--deferTableIndexes=all",
                "--resetProgress",
                "--ignoreVersion",
                "--skipBinlog=true",
            ])
    }

    fn planned_dir(&self, database: &str) -> PathBuf {
        self.ctx.artifact_path("mysqlsh", database, None)
    }
}

#[async_trait]
impl DumpStrategy for ShellStrategy {
    fn method(&self) -> SyncMethod {
        SyncMethod::Shell
    }

    fn context(&self) -> &StrategyContext {
        &self.ctx
    }

    async fn validate(&self, database: &str) -> Result<()> {
        self.ctx.check_source(database).await?;
        let mysqlsh = self.resolve_mysqlsh()?;
        self.ctx
            .require_tool(&mysqlsh.to_string_lossy(), &["--version"])
            .await?;
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

        self.resolve_mysqlsh()?;
        let dir = self.planned_dir(database);
        let command = self.dump_command(database, &dir);
        self.ctx
            .dump_into(database, DumpArtifact::directory(dir), command)
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

        self.resolve_mysqlsh()?;
        self.ctx
            .admin
            .enable_local_infile()
            .await
            .context("Failed to enable local_infile on the local server")?;
        self.ctx.replace_local_schema(database, true).await?;

        let command = self.restore_command(artifact.path());
        self.ctx
            .run_tool(command, ToolProgress::restore(database, artifact))
            .await?;
        info!("Restored '{}' into {}", database, self.ctx.config.local.label());
        Ok(())
    }

    fn planned_commands(&self, database: &str) -> Vec<String> {
        let dir = self.planned_dir(database);
        vec![
            self.dump_command(database, &dir).display(),
            self.restore_command(&dir).display(),
        ]
    }
}
