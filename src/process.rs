// ABOUTME: Launching external dump/restore tools as child processes
// ABOUTME: Command description with secret masking, and a cancellable tokio-based runner

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;

const MASK: &str = "********";

/// A fully described external command
///
/// Values registered with [`ToolCommand::secret`] or [`ToolCommand::secret_env`]
/// are masked whenever the command is displayed or logged.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    stdin_file: Option<PathBuf>,
    stdout_file: Option<PathBuf>,
    stdin_secret: Option<String>,
    secrets: Vec<String>,
    cancel_cleanup: Option<Box<ToolCommand>>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            stdin_file: None,
            stdout_file: None,
            stdin_secret: None,
            secrets: Vec::new(),
            cancel_cleanup: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Set an environment variable whose value must never be displayed
    pub fn secret_env(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        self.secret(value.clone()).env(key, value)
    }

    /// Register a value to mask in [`ToolCommand::display`]
    pub fn secret(mut self, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.secrets.push(value);
        }
        self
    }

    pub fn stdin_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    /// Feed a secret line to the process on stdin, keeping it off argv
    pub fn stdin_secret(mut self, value: impl Into<String>) -> Self {
        let value = value.into();
        self = self.secret(value.clone());
        self.stdin_secret = Some(value);
        self
    }

    /// Command to run if this one is cancelled, e.g. removing a container
    pub fn on_cancel(mut self, cleanup: ToolCommand) -> Self {
        self.cancel_cleanup = Some(Box::new(cleanup));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_envs(&self) -> &[(String, String)] {
        &self.envs
    }

    pub fn stdin_file(&self) -> Option<&Path> {
        self.stdin_file.as_deref()
    }

    pub fn stdout_file(&self) -> Option<&Path> {
        self.stdout_file.as_deref()
    }

    pub fn get_stdin_secret(&self) -> Option<&str> {
        self.stdin_secret.as_deref()
    }

    pub fn cancel_cleanup(&self) -> Option<&ToolCommand> {
        self.cancel_cleanup.as_deref()
    }

    /// Short name used in messages, e.g. `mysqldump` for `/usr/bin/mysqldump`
    pub fn tool_name(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone())
    }

    /// Shell-like rendering with secrets masked
    pub fn display(&self) -> String {
        let mut line = self.mask(&self.program);
        for arg in &self.args {
            line.push(' ');
            let masked = self.mask(arg);
            if masked.is_empty() || masked.contains(char::is_whitespace) {
                line.push_str(&format!("'{}'", masked));
            } else {
                line.push_str(&masked);
            }
        }
        if let Some(path) = &self.stdin_file {
            line.push_str(&format!(" < {}", path.display()));
        }
        if let Some(path) = &self.stdout_file {
            line.push_str(&format!(" > {}", path.display()));
        }
        line
    }

    fn mask(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), MASK))
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    /// Exit code; `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{}\n{}", out, err),
        }
    }

    /// Turn a non-zero exit into [`SyncError::ToolFailed`]
    pub fn ensure_success(self, tool: &str) -> Result<ToolOutput> {
        if self.success() {
            return Ok(self);
        }
        Err(SyncError::ToolFailed {
            tool: tool.to_string(),
            status: self.status,
            output: self.combined(),
        }
        .into())
    }
}

/// Launches external tools
///
/// The indirection lets tests observe exactly which commands a strategy
/// would launch without any of the tools installed.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Resolve a program on PATH (or an explicit path) without launching it
    fn locate(&self, program: &str) -> Option<PathBuf>;

    /// Run to completion, or until `cancel` fires
    ///
    /// A non-zero exit is not an error at this level; callers decide with
    /// [`ToolOutput::ensure_success`].
    async fn run(&self, command: ToolCommand, cancel: CancellationToken) -> Result<ToolOutput>;
}

/// Runner that spawns real processes with `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }

    async fn run(&self, command: ToolCommand, cancel: CancellationToken) -> Result<ToolOutput> {
        let tool = command.tool_name();
        tracing::debug!("Running: {}", command.display());

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if command.stdin_secret.is_some() {
            cmd.stdin(Stdio::piped());
        } else if let Some(path) = &command.stdin_file {
            let file = std::fs::File::open(path).map_err(|e| {
                SyncError::Io(format!("cannot open {} for {}: {}", path.display(), tool, e))
            })?;
            cmd.stdin(Stdio::from(file));
        } else {
            cmd.stdin(Stdio::null());
        }

        match &command.stdout_file {
            Some(path) => {
                let file = std::fs::File::create(path).map_err(|e| {
                    SyncError::Io(format!("cannot create {}: {}", path.display(), e))
                })?;
                cmd.stdout(Stdio::from(file));
            }
            None => {
                cmd.stdout(Stdio::piped());
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            SyncError::tool_unavailable(&tool, format!("failed to start {}: {}", command.program, e))
        })?;

        if let (Some(secret), Some(mut stdin)) = (&command.stdin_secret, child.stdin.take()) {
            // A tool that exits before reading reports its own error below
            if let Err(e) = stdin.write_all(format!("{}\n", secret).as_bytes()).await {
                tracing::debug!("{} closed stdin early: {}", tool, e);
            }
        }

        // Dropping the wait future drops the child, and kill_on_drop then
        // terminates the external process.
        tokio::select! {
            output = child.wait_with_output() => {
                let output = output.with_context(|| format!("Failed waiting for {}", tool))?;
                Ok(ToolOutput {
                    status: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            _ = cancel.cancelled() => {
                tracing::warn!("Cancellation requested, killing {}", tool);
                Err(SyncError::Cancelled.into())
            }
        }
    }
}
