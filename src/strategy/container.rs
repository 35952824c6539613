// ABOUTME: Container strategy running mydumper and myloader through a container runtime
// ABOUTME: Parallel chunked dump into a bind-mounted scratch directory, restore with deferred indexes

use anyhow::Result;
use async_trait::async_trait;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{DumpArtifact, DumpStrategy, StrategyContext, ToolProgress};
use crate::config::{EndpointConfig, SyncMethod};
use crate::models::SyncResult;
use crate::process::ToolCommand;

/// Name under which containers reach the host when loopback is not shared
pub const HOST_ALIAS: &str = "host.docker.internal";

/// Label put on every container we start, so leftovers can be found later
pub const MANAGED_LABEL: &str = "dbsync.managed=true";

const CONTAINER_DUMP_DIR: &str = "/dump";

/// Unique per launch, e.g. `dbsync-mydumper-3f9a0c12`
fn container_name(tool: &str) -> String {
    format!("dbsync-{}-{:08x}", tool, rand::random::<u32>())
}

/// Host as seen from inside the container
///
/// Loopback addresses point at the container itself, so they are swapped for
/// [`HOST_ALIAS`] when `substitute_loopback` is set.
pub fn container_host(host: &str, substitute_loopback: bool) -> String {
    if substitute_loopback && is_loopback(host) {
        HOST_ALIAS.to_string()
    } else {
        host.to_string()
    }
}

fn is_loopback(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}

/// Host path in the form the runtime expects for `-v`
///
/// Windows paths such as `C:\Temp\dump` become `/c/Temp/dump`.
pub fn container_mount_path(path: &Path, windows: bool) -> String {
    let raw = path.to_string_lossy();
    if !windows {
        return raw.into_owned();
    }

    let forward = raw.replace('\\', "/");
    let mut chars = forward.chars();
    match (chars.next(), chars.next()) {
        (Some(drive), Some(':')) if drive.is_ascii_alphabetic() => {
            format!("/{}{}", drive.to_ascii_lowercase(), chars.as_str())
        }
        _ => forward,
    }
}

pub struct ContainerStrategy {
    ctx: StrategyContext,
}

impl ContainerStrategy {
    pub fn new(ctx: StrategyContext) -> Self {
        Self { ctx }
    }

    fn runtime(&self) -> &str {
        &self.ctx.config.dump.container_runtime
    }

    /// `docker run` of `tool` against `endpoint`, with the scratch directory mounted
    ///
    /// Each container gets its own name so a cancelled run can remove it; the
    /// password reaches the tool as `MYSQL_PWD`, passed through from our
    /// environment rather than written on any command line.
    fn docker_run(&self, tool: &str, endpoint: &EndpointConfig, host_dir: &Path) -> ToolCommand {
        let dump = &self.ctx.config.dump;
        let name = container_name(tool);
        let mount_source = std::path::absolute(host_dir).unwrap_or_else(|_| host_dir.to_path_buf());

        let mut command = ToolCommand::new(self.runtime())
            .args(["run", "--rm", "--network", "host", "--label", MANAGED_LABEL])
            .args(["--name", name.as_str()]);
        if !endpoint.password.is_empty() {
            command = command
                .args(["-e", "MYSQL_PWD"])
                .secret_env("MYSQL_PWD", endpoint.password.as_str());
        }

        let host = container_host(&endpoint.host, dump.container_loopback_alias);
        command
            .arg("-v")
            .arg(format!(
                "{}:{}",
                container_mount_path(&mount_source, cfg!(windows)),
                CONTAINER_DUMP_DIR
            ))
            .arg(&dump.mydumper_image)
            .arg(tool)
            .args(["--host", host.as_str()])
            .arg("--port")
            .arg(endpoint.port.to_string())
            .args(["--user", endpoint.user.as_str()])
            .on_cancel(ToolCommand::new(self.runtime()).args(["rm", "-f", name.as_str()]))
    }

    fn dump_command(&self, database: &str, host_dir: &Path) -> ToolCommand {
        let dump = &self.ctx.config.dump;
        let mut command = self
            .docker_run("mydumper", &self.ctx.config.remote, host_dir)
            .args(["--database", database, "--outputdir", CONTAINER_DUMP_DIR])
            .arg("--threads")
            .arg(dump.threads.to_string())
            .arg("--rows")
            .arg(dump.chunk_rows.to_string())
            .args([
                "--compress-protocol",
                "--triggers",
                "--routines",
                "--events",
                "--sync-thread-lock-mode=NO_LOCK",
                "--skip-constraints",
                "--skip-indexes",
                "--verbose",
                "3",
            ]);
        if dump.compress {
            command = command.arg("--compress");
        }
        command
    }

    fn restore_command(&self, database: &str, host_dir: &Path) -> ToolCommand {
        let threads = self.ctx.config.dump.threads;
        self.docker_run("myloader", &self.ctx.config.local, host_dir)
            .args(["--database", database, "--directory", CONTAINER_DUMP_DIR])
            .arg("--threads")
            .arg(threads.to_string())
            .arg("--max-threads-per-table")
            .arg(threads.to_string())
            .args(["--max-threads-for-schema-creation", "1"])
            .arg("--max-threads-for-index-creation")
            .arg(threads.to_string())
            .args([
                "--optimize-keys",
                "--skip-post",
                "--queries-per-transaction",
                "50000",
                "--skip-definer",
                "--verbose",
                "1",
            ])
    }

    /// Check the runtime daemon answers, e.g. `docker version`
    async fn check_runtime(&self) -> Result<()> {
        self.ctx
            .require_tool(self.runtime(), &["version", "--format", "{{.Server.Version}}"])
            .await?;
        Ok(())
    }

    /// Remove containers an interrupted earlier run left behind
    ///
    /// Only stopped ones: a running container may belong to another sync.
    async fn remove_stale_containers(&self) {
        let list = ToolCommand::new(self.runtime())
            .args(["ps", "-aq", "--filter"])
            .arg(format!("label={}", MANAGED_LABEL))
            .args(["--filter", "status=exited", "--filter", "status=created"]);
        let ids: Vec<String> = match self.ctx.runner.run(list, self.ctx.cancel.clone()).await {
            Ok(output) if output.success() => output
                .stdout
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            Ok(output) => {
                debug!("Listing stale containers failed: {}", output.combined());
                return;
            }
            Err(e) => {
                debug!("Listing stale containers failed: {:#}", e);
                return;
            }
        };
        if ids.is_empty() {
            return;
        }

        info!("Removing {} stale container(s) from an earlier run", ids.len());
        let remove = ToolCommand::new(self.runtime()).args(["rm", "-f"]).args(ids);
        match self.ctx.runner.run(remove, self.ctx.cancel.clone()).await {
            Ok(output) if output.success() => {}
            Ok(output) => warn!("Could not remove stale containers: {}", output.combined()),
            Err(e) => warn!("Could not remove stale containers: {:#}", e),
        }
    }

    fn planned_dir(&self, database: &str) -> PathBuf {
        self.ctx.artifact_path("mydumper", database, None)
    }
}

#[async_trait]
impl DumpStrategy for ContainerStrategy {
    fn method(&self) -> SyncMethod {
        SyncMethod::Container
    }

    fn context(&self) -> &StrategyContext {
        &self.ctx
    }

    async fn validate(&self, database: &str) -> Result<()> {
        self.ctx.check_source(database).await?;
        self.check_runtime().await?;
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

        self.remove_stale_containers().await;
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

        self.ctx.replace_local_schema(database, true).await?;

        let command = self.restore_command(database, artifact.path());
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
            self.restore_command(database, &dir).display(),
        ]
    }
}
