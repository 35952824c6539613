// ABOUTME: Configuration for endpoints, dump tooling and logging
// ABOUTME: Layers defaults, an optional TOML file, .env files and DBSYNC_* variables

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "DBSYNC_";
const CONFIG_FILE_NAME: &str = "dbsync.toml";

/// Which toolchain moves the data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SyncMethod {
    /// mysqldump piped into the mysql client
    Native,
    /// mydumper/myloader run through a container runtime
    Container,
    /// MySQL Shell dump and load utilities
    Shell,
}

impl SyncMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMethod::Native => "native",
            SyncMethod::Container => "container",
            SyncMethod::Shell => "shell",
        }
    }
}

impl fmt::Display for SyncMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "mysqldump" => Ok(SyncMethod::Native),
            "container" | "mydumper" | "docker" => Ok(SyncMethod::Container),
            "shell" | "mysqlsh" => Ok(SyncMethod::Shell),
            other => bail!(
                "Unknown sync method '{}'. Expected one of: native, container, shell",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
        }
    }
}

impl EndpointConfig {
    /// `user@host:port`, safe to print
    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    pub method: SyncMethod,
    pub threads: u32,
    pub chunk_rows: u64,
    pub compress: bool,
    pub scratch_dir: PathBuf,
    pub connect_timeout_secs: u64,
    pub mysqldump_path: String,
    pub mysql_path: String,
    pub mysqlsh_path: Option<String>,
    pub container_runtime: String,
    pub mydumper_image: String,
    /// Replace loopback hosts with `host.docker.internal` inside containers
    pub container_loopback_alias: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            method: SyncMethod::Shell,
            threads: 8,
            chunk_rows: 100_000,
            compress: false,
            scratch_dir: std::env::temp_dir().join("dbsync"),
            connect_timeout_secs: 10,
            mysqldump_path: "mysqldump".to_string(),
            mysql_path: "mysql".to_string(),
            mysqlsh_path: None,
            container_runtime: "docker".to_string(),
            mydumper_image: "mydumper/mydumper:latest".to_string(),
            // Docker Desktop runs containers in a VM, so host networking does not
            // reach the host loopback there.
            container_loopback_alias: !cfg!(target_os = "linux"),
        }
    }
}

impl DumpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub remote: EndpointConfig,
    pub local: EndpointConfig,
    pub dump: DumpConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// Order of precedence (lowest first): built-in defaults, the TOML file,
    /// variables from `.env` files, then the process environment.
    ///
    /// # Arguments
    ///
    /// * `explicit_path` - A config file given on the command line. When set it
    ///   must exist; otherwise `./dbsync.toml` and `$HOME/.dbsync.toml` are
    ///   tried in turn.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let config = Self::resolve(explicit_path)?;
        config.validate()?;
        Ok(config)
    }

    /// Same sources as [`Config::load`], without validation
    pub fn resolve(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = match explicit_path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_paths().into_iter().find(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };

        load_env_files();
        config.apply_env(|key| std::env::var(key).ok())?;

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    /// Override fields from `DBSYNC_*` variables
    ///
    /// The lookup is injected so tests can feed a map instead of mutating the
    /// process environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };

        apply_endpoint_env(&mut self.remote, "REMOTE", &var)?;
        apply_endpoint_env(&mut self.local, "LOCAL", &var)?;

        if let Some(v) = var("DUMP_METHOD") {
            self.dump.method = v.parse()?;
        }
        if let Some(v) = var("DUMP_THREADS") {
            self.dump.threads = parse_number(&v, "DBSYNC_DUMP_THREADS")?;
        }
        if let Some(v) = var("DUMP_CHUNK_SIZE") {
            self.dump.chunk_rows = parse_number(&v, "DBSYNC_DUMP_CHUNK_SIZE")?;
        }
        if let Some(v) = var("DUMP_COMPRESS") {
            self.dump.compress = parse_bool(&v, "DBSYNC_DUMP_COMPRESS")?;
        }
        if let Some(v) = var("DUMP_SCRATCH_DIR") {
            self.dump.scratch_dir = PathBuf::from(v);
        }
        if let Some(v) = var("DUMP_TIMEOUT") {
            self.dump.connect_timeout_secs = parse_seconds(&v, "DBSYNC_DUMP_TIMEOUT")?;
        }
        if let Some(v) = var("DUMP_MYSQLDUMP_PATH") {
            self.dump.mysqldump_path = v;
        }
        if let Some(v) = var("DUMP_MYSQL_PATH") {
            self.dump.mysql_path = v;
        }
        if let Some(v) = var("DUMP_MYSQLSH_PATH") {
            self.dump.mysqlsh_path = Some(v);
        }
        if let Some(v) = var("DUMP_CONTAINER_RUNTIME") {
            self.dump.container_runtime = v;
        }
        if let Some(v) = var("DUMP_MYDUMPER_IMAGE") {
            self.dump.mydumper_image = v;
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.log.level = v;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (label, endpoint) in [("remote", &self.remote), ("local", &self.local)] {
            if endpoint.host.trim().is_empty() {
                bail!("{}.host is required", label);
            }
            if endpoint.port == 0 {
                bail!("{}.port must be between 1 and 65535", label);
            }
            if endpoint.user.trim().is_empty() {
                bail!("{}.user is required", label);
            }
        }

        if self.remote.host == self.local.host && self.remote.port == self.local.port {
            bail!(
                "remote and local endpoints both point at {}:{}; refusing to sync a server onto itself",
                self.remote.host,
                self.remote.port
            );
        }

        if self.dump.threads == 0 {
            bail!("dump.threads must be at least 1");
        }
        if self.dump.chunk_rows == 0 {
            bail!("dump.chunk_rows must be at least 1");
        }
        if self.dump.connect_timeout_secs == 0 {
            bail!("dump.connect_timeout_secs must be at least 1");
        }

        Ok(())
    }

    /// Copy with passwords masked, for display
    pub fn redacted(&self) -> Config {
        let mut copy = self.clone();
        for endpoint in [&mut copy.remote, &mut copy.local] {
            if !endpoint.password.is_empty() {
                endpoint.password = "********".to_string();
            }
        }
        copy
    }
}

fn apply_endpoint_env(
    endpoint: &mut EndpointConfig,
    side: &str,
    var: &impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(v) = var(&format!("{}_HOST", side)) {
        endpoint.host = v;
    }
    if let Some(v) = var(&format!("{}_PORT", side)) {
        endpoint.port = parse_number(&v, &format!("DBSYNC_{}_PORT", side))?;
    }
    if let Some(v) = var(&format!("{}_USER", side)) {
        endpoint.user = v;
    }
    if let Some(v) = var(&format!("{}_PASSWORD", side)) {
        endpoint.password = v;
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(value: &str, name: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{} must be a number, got '{}'", name, value))
}

fn parse_bool(value: &str, name: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("{} must be true or false, got '{}'", name, value),
    }
}

/// Accepts plain seconds or a trailing `s`/`m` unit ("300", "300s", "5m")
fn parse_seconds(value: &str, name: &str) -> Result<u64> {
    let trimmed = value.trim();
    if let Some(minutes) = trimmed.strip_suffix('m') {
        return Ok(parse_number::<u64>(minutes, name)? * 60);
    }
    parse_number(trimmed.strip_suffix('s').unwrap_or(trimmed), name)
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(home) = home_dir() {
        paths.push(home.join(format!(".{}", CONFIG_FILE_NAME)));
    }
    paths
}

/// Load the first `.env` file found; a missing file is not an error
fn load_env_files() {
    let mut candidates = Vec::new();
    if let Some(home) = home_dir() {
        candidates.push(home.join(".dbsync.env"));
    }
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        candidates.push(dir.join(".env"));
    }

    for path in candidates.into_iter().filter(|p| p.is_file()) {
        match dotenvy::from_path(&path) {
            Ok(()) => {
                tracing::debug!("Loaded environment from {}", path.display());
                return;
            }
            Err(e) => tracing::warn!("Ignoring unreadable env file {}: {}", path.display(), e),
        }
    }
}
