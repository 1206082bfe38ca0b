//! Custom error types for the control loop.
//!
//! Every failure the loop can surface maps onto one variant of
//! [`RalphError`]. The classification helpers tell the caller which errors
//! are retried internally, which end the run, and which exit code the CLI
//! should report.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for loop operations
#[derive(Error, Debug)]
pub enum RalphError {
    // =========================================================================
    // Gate Errors
    // =========================================================================
    /// Call budget exhausted for the current window
    #[error("Call budget exhausted: {calls_made}/{limit} calls used, resets in {}s", .resets_in.as_secs())]
    AdmissionDenied {
        calls_made: u32,
        limit: u32,
        resets_in: Duration,
    },

    /// Circuit breaker is open and requires an explicit reset
    #[error("Circuit breaker is OPEN, halting execution: {reason}")]
    CircuitHalted { reason: String },

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Backend runner failed
    #[error("Backend '{backend}' failed: {message}")]
    Backend { backend: String, message: String },

    /// Backend runner did not finish in time
    #[error("Backend '{backend}' timed out after {}s", .timeout.as_secs())]
    BackendTimeout { backend: String, timeout: Duration },

    /// Prompt or task list could not be loaded
    #[error("Context error: {message}")]
    Context { message: String },

    /// External stop requested
    #[error("Loop cancelled")]
    Cancelled,

    /// State write or read failed
    #[error("Failed to persist {what}: {message}")]
    Persistence { what: String, message: String },

    /// Value in a status block could not be parsed as a number
    #[error("Invalid number: {input:?}")]
    InvalidNumber { input: String },

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

    /// Missing required file
    #[error("Missing required file: {}", .path.display())]
    MissingFile { path: PathBuf },

    /// Missing required tool
    #[error("Missing required tool: {tool}")]
    MissingTool { tool: String },

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

impl RalphError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a backend error
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a context error
    pub fn context(message: impl Into<String>) -> Self {
        Self::Context {
            message: message.into(),
        }
    }

    /// Create a persistence error
    pub fn persistence(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Persistence {
            what: what.into(),
            message: message.into(),
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

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error is recoverable without ending the run
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::AdmissionDenied { .. } | Self::Persistence { .. })
    }

    /// Check if this error is an external stop request rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error is fatal (requires operator action before resuming)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CircuitHalted { .. }
                | Self::MissingFile { .. }
                | Self::MissingTool { .. }
                | Self::Config { .. }
                | Self::InvalidConfig { .. }
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Cancelled => 0,
            Self::CircuitHalted { .. } => 3,
            Self::Backend { .. } | Self::BackendTimeout { .. } => 4,
            Self::Context { .. } => 5,
            Self::MissingFile { .. } | Self::MissingTool { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for loop results
pub type Result<T> = std::result::Result<T, RalphError>;
