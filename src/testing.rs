// ABOUTME: In-memory stand-ins for the MySQL servers and the external tools
// ABOUTME: Record every call so strategy and orchestrator tests can assert on side effects

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, EndpointConfig};
use crate::error::SyncError;
use crate::inspector::{DatabaseInspector, SchemaAdmin, Side};
use crate::models::{ConnectionProbe, DatabaseDescriptor};
use crate::process::{CommandRunner, ToolCommand, ToolOutput};
use crate::strategy::StrategyContext;

pub fn test_config(scratch: &Path) -> Config {
    let mut config = Config::default();
    config.remote = EndpointConfig {
        host: "db.example.com".to_string(),
        port: 3306,
        user: "app".to_string(),
        password: "remote-secret".to_string(),
    };
    config.local = EndpointConfig {
        host: "127.0.0.1".to_string(),
        port: 3307,
        user: "root".to_string(),
        password: "local-secret".to_string(),
    };
    config.dump.scratch_dir = scratch.to_path_buf();
    config.dump.container_loopback_alias = false;
    config
}

pub fn test_context(db: Arc<FakeDatabase>, runner: Arc<FakeRunner>, scratch: &Path) -> StrategyContext {
    StrategyContext::new(Arc::new(test_config(scratch)), db.clone(), db, runner).with_progress(false)
}

fn descriptor(name: &str, size_bytes: u64, table_count: u64) -> DatabaseDescriptor {
    DatabaseDescriptor {
        name: name.to_string(),
        size_bytes,
        table_count,
        created_at: None,
    }
}

/// Both servers in memory
#[derive(Default)]
pub struct FakeDatabase {
    remote: Mutex<BTreeMap<String, DatabaseDescriptor>>,
    local: Mutex<BTreeMap<String, DatabaseDescriptor>>,
    unreachable: Vec<Side>,
    sessions: Mutex<HashMap<String, usize>>,
    admin_log: Mutex<Vec<String>>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote(self, name: &str, size_bytes: u64, table_count: u64) -> Self {
        self.remote
            .lock()
            .unwrap()
            .insert(name.to_string(), descriptor(name, size_bytes, table_count));
        self
    }

    pub fn with_local(self, name: &str, size_bytes: u64, table_count: u64) -> Self {
        self.local
            .lock()
            .unwrap()
            .insert(name.to_string(), descriptor(name, size_bytes, table_count));
        self
    }

    pub fn with_sessions(self, name: &str, count: usize) -> Self {
        self.sessions.lock().unwrap().insert(name.to_string(), count);
        self
    }

    pub fn unreachable(mut self, side: Side) -> Self {
        self.unreachable.push(side);
        self
    }

    pub fn admin_calls(&self) -> Vec<String> {
        self.admin_log.lock().unwrap().clone()
    }

    pub fn local_table_count(&self, name: &str) -> Option<u64> {
        self.local.lock().unwrap().get(name).map(|d| d.table_count)
    }

    pub fn database_exists_sync(&self, name: &str, side: Side) -> bool {
        self.server(side).lock().unwrap().contains_key(name)
    }

    /// What a successful restore tool does: local schemas take the source's tables
    pub fn load_from_remote(&self) {
        let remote = self.remote.lock().unwrap();
        let mut local = self.local.lock().unwrap();
        for (name, target) in local.iter_mut() {
            if let Some(source) = remote.get(name) {
                target.table_count = source.table_count;
                target.size_bytes = source.size_bytes;
            }
        }
    }

    fn server(&self, side: Side) -> &Mutex<BTreeMap<String, DatabaseDescriptor>> {
        match side {
            Side::Remote => &self.remote,
            Side::Local => &self.local,
        }
    }

    fn reachable(&self, side: Side) -> Result<()> {
        if self.unreachable.contains(&side) {
            return Err(SyncError::Connectivity(format!("{} server: connection refused", side)).into());
        }
        Ok(())
    }

    fn record(&self, call: String) {
        self.admin_log.lock().unwrap().push(call);
    }
}

#[async_trait]
impl DatabaseInspector for FakeDatabase {
    async fn test_connection(&self, side: Side) -> ConnectionProbe {
        let (host, port) = match side {
            Side::Remote => ("db.example.com", 3306),
            Side::Local => ("127.0.0.1", 3307),
        };
        let reachable = self.reachable(side);
        ConnectionProbe {
            host: host.to_string(),
            port,
            user: "test".to_string(),
            connected: reachable.is_ok(),
            server_version: reachable.is_ok().then(|| "8.0.36".to_string()),
            error: reachable.err().map(|e| e.to_string()),
        }
    }

    async fn list_databases(&self, side: Side) -> Result<Vec<DatabaseDescriptor>> {
        self.reachable(side)?;
        Ok(self.server(side).lock().unwrap().values().cloned().collect())
    }

    async fn database_exists(&self, name: &str, side: Side) -> Result<bool> {
        self.reachable(side)?;
        Ok(self.database_exists_sync(name, side))
    }

    async fn get_database_info(&self, name: &str, side: Side) -> Result<DatabaseDescriptor> {
        self.reachable(side)?;
        self.server(side)
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("database '{}'", name)).into())
    }
}

#[async_trait]
impl SchemaAdmin for FakeDatabase {
    async fn kill_sessions(&self, name: &str) -> Result<usize> {
        self.record(format!("kill {}", name));
        Ok(self.sessions.lock().unwrap().remove(name).unwrap_or(0))
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.record(format!("drop {}", name));
        self.local.lock().unwrap().remove(name);
        Ok(())
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        self.record(format!("create {}", name));
        self.local
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| descriptor(name, 0, 0));
        Ok(())
    }

    async fn enable_local_infile(&self) -> Result<()> {
        self.record("local_infile".to_string());
        Ok(())
    }
}

type Handler = Box<dyn Fn(&ToolCommand) -> ToolOutput + Send + Sync>;

/// Records commands instead of launching them
///
/// By default every command succeeds and dump commands leave a small
/// artifact behind where the real tool would write one.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<ToolCommand>>,
    missing: Vec<String>,
    handler: Option<Handler>,
    failures: Vec<(String, ToolOutput)>,
    cancel_on: Option<String>,
    restore_target: Option<Arc<FakeDatabase>>,
    listed_containers: Vec<String>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the default behaviour entirely
    pub fn with_handler(
        mut self,
        handler: impl Fn(&ToolCommand) -> ToolOutput + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn without_program(mut self, program: &str) -> Self {
        self.missing.push(program.to_string());
        self
    }

    /// Make the dump or restore run of `tool` exit with `output`
    pub fn failing_tool(mut self, tool: &str, output: ToolOutput) -> Self {
        self.failures.push((tool.to_string(), output));
        self
    }

    /// Make the dump or restore run of `tool` report cancellation
    pub fn cancelling_tool(mut self, tool: &str) -> Self {
        self.cancel_on = Some(tool.to_string());
        self
    }

    /// Successful restores copy table counts from remote to local
    pub fn restoring_into(mut self, db: Arc<FakeDatabase>) -> Self {
        self.restore_target = Some(db);
        self
    }

    /// Container ids a runtime `ps` reports
    pub fn listing_containers(mut self, ids: &[&str]) -> Self {
        self.listed_containers = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Dump and restore launches, leaving out version and housekeeping commands
    pub fn launched_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !is_housekeeping(c))
            .count()
    }
}

/// `mydumper` for `docker run ... mydumper ...`, else the program name
fn invoked_tool(command: &ToolCommand) -> String {
    for tool in ["mydumper", "myloader"] {
        if command.get_args().iter().any(|a| a == tool) {
            return tool.to_string();
        }
    }
    command.tool_name()
}

fn is_housekeeping(command: &ToolCommand) -> bool {
    matches!(
        command.get_args().first().map(String::as_str),
        Some("--version" | "version" | "ps" | "rm")
    )
}

fn is_restore(command: &ToolCommand) -> bool {
    let tool = invoked_tool(command);
    tool == "mysql" || tool == "myloader" || command.get_args().iter().any(|a| a == "load-dump")
}

/// Leave behind what a real dump tool would have written
fn write_dump_output(command: &ToolCommand) {
    if let Some(path) = command.stdout_file() {
        std::fs::write(path, "-- dump\nCREATE TABLE t (id INT);\n").unwrap();
        return;
    }

    let args = command.get_args();
    let dir = args
        .iter()
        .find_map(|a| a.strip_prefix("--outputUrl=").map(PathBuf::from))
        .or_else(|| {
            if invoked_tool(command) != "mydumper" {
                return None;
            }
            args.iter()
                .find_map(|a| a.strip_suffix(":/dump").map(PathBuf::from))
        });
    if let Some(dir) = dir {
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("metadata"), "Started dump\n").unwrap();
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        let name = ToolCommand::new(program).tool_name();
        if self.missing.iter().any(|m| *m == name || m == program) {
            None
        } else {
            Some(PathBuf::from(program))
        }
    }

    async fn run(&self, command: ToolCommand, _cancel: CancellationToken) -> Result<ToolOutput> {
        self.calls.lock().unwrap().push(command.clone());

        if let Some(handler) = &self.handler {
            return Ok(handler(&command));
        }
        if is_housekeeping(&command) {
            let listing = command.get_args().first().map(String::as_str) == Some("ps");
            return Ok(ToolOutput {
                status: Some(0),
                stdout: if listing {
                    self.listed_containers.join("\n")
                } else {
                    String::new()
                },
                stderr: String::new(),
            });
        }

        write_dump_output(&command);

        let tool = invoked_tool(&command);
        if self.cancel_on.as_deref() == Some(tool.as_str()) {
            return Err(SyncError::Cancelled.into());
        }
        if let Some((_, output)) = self.failures.iter().find(|(t, _)| *t == tool) {
            return Ok(output.clone());
        }
        if is_restore(&command) {
            if let Some(db) = &self.restore_target {
                db.load_from_remote();
            }
        }

        Ok(ToolOutput {
            status: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoked_tool_sees_through_container_runtime() {
        let cmd = ToolCommand::new("docker").args(["run", "--rm", "img", "myloader"]);
        assert_eq!(invoked_tool(&cmd), "myloader");
        assert!(is_restore(&cmd));
        assert!(!is_housekeeping(&cmd));
        assert_eq!(invoked_tool(&ToolCommand::new("/usr/bin/mysqldump")), "mysqldump");
    }
}
