// ABOUTME: Error categories for sync operations
// ABOUTME: Root causes carried inside anyhow chains and recovered with downcast_ref

use std::fmt;

#[derive(Debug)]
pub enum SyncError {
    /// Bad database name or system-schema target
    Validation(String),
    /// Source schema is absent
    NotFound(String),
    /// An endpoint could not be reached
    Connectivity(String),
    /// External binary or container runtime is missing
    ToolUnavailable { tool: String, detail: String },
    /// Scratch directory or artifact problems
    Io(String),
    /// External dump/restore process exited unsuccessfully
    ToolFailed {
        tool: String,
        status: Option<i32>,
        output: String,
    },
    /// Interrupted by the user
    Cancelled,
}

impl SyncError {
    pub fn tool_unavailable(tool: impl Into<String>, detail: impl Into<String>) -> Self {
        SyncError::ToolUnavailable {
            tool: tool.into(),
            detail: detail.into(),
        }
    }

    /// Short machine-readable category name, used in JSON output
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Validation(_) => "validation",
            SyncError::NotFound(_) => "not_found",
            SyncError::Connectivity(_) => "connectivity",
            SyncError::ToolUnavailable { .. } => "tool_unavailable",
            SyncError::Io(_) => "io",
            SyncError::ToolFailed { .. } => "tool_failed",
            SyncError::Cancelled => "cancelled",
        }
    }

    /// Find the categorised root cause inside an anyhow chain
    pub fn find(err: &anyhow::Error) -> Option<&SyncError> {
        err.chain().find_map(|cause| cause.downcast_ref::<SyncError>())
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyncError::Validation(msg) => write!(f, "Validation error: {}", msg),
            SyncError::NotFound(msg) => write!(f, "Not found: {}", msg),
            SyncError::Connectivity(msg) => write!(f, "Connection error: {}", msg),
            SyncError::ToolUnavailable { tool, detail } => {
                write!(f, "Tool unavailable: {} ({})", tool, detail)
            }
            SyncError::Io(msg) => write!(f, "IO error: {}", msg),
            SyncError::ToolFailed {
                tool,
                status,
                output,
            } => {
                match status {
                    Some(code) => write!(f, "{} exited with status {}", tool, code)?,
                    None => write!(f, "{} was terminated by a signal", tool)?,
                }
                if !output.trim().is_empty() {
                    write!(f, ": {}", output.trim())?;
                }
                Ok(())
            }
            SyncError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for SyncError {}
