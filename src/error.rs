//! Custom error types for mend.
//!
//! Stage-level failures inside the repair loop never surface here: they are
//! converted into a [`StopEvent`](crate::repair::StopEvent). The variants below
//! cover configuration problems, internal defects, and CLI plumbing.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for mend operations
#[derive(Error, Debug)]
pub enum MendError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Repair Loop Errors
    // =========================================================================
    /// A repair loop is already running for this runner
    #[error("Repair loop already running for task {task_id}")]
    LoopAlreadyRunning { task_id: String },

    /// Unknown stop reason name
    #[error("Unknown stop reason: {name}")]
    UnknownStopReason { name: String },

    // =========================================================================
    // Tool Errors
    // =========================================================================
    /// Missing required tool
    #[error("Missing required tool: {tool}")]
    MissingTool { tool: String },

    /// Tool execution failed
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MendError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a tool execution error
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    // =========================================================================
    // Exit status
    // =========================================================================

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::LoopAlreadyRunning { .. } => 4,
            Self::MissingTool { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for mend results
pub type Result<T> = std::result::Result<T, MendError>;
