//! Events emitted by the loop controller.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::BackendEvent;
use crate::circuit::BreakerState;

/// Controller status reported with every loop update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Starting,
    Running,
    Paused,
    Executing,
    RateLimited,
    CircuitOpen,
    BackendRunning,
    ExecutionError,
    ExecutionComplete,
    Stopped,
    Cancelled,
    Errored,
    Complete,
}

impl LoopStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Executing => "executing",
            Self::RateLimited => "rate_limited",
            Self::CircuitOpen => "circuit_open",
            Self::BackendRunning => "backend_running",
            Self::ExecutionError => "execution_error",
            Self::ExecutionComplete => "execution_complete",
            Self::Stopped => "stopped",
            Self::Cancelled => "cancelled",
            Self::Errored => "errored",
            Self::Complete => "complete",
        }
    }

    /// Returns true for statuses after which `run` has returned.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Cancelled | Self::Errored | Self::Complete
        )
    }
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Success,
    Warn,
    Error,
}

/// Event delivered to the controller's sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// Controller state changed.
    LoopUpdate {
        loop_index: u32,
        calls_used: u32,
        status: LoopStatus,
        circuit_state: BreakerState,
    },
    /// Human-readable progress message.
    Log { level: LogLevel, message: String },
    /// Forwarded backend event.
    Backend(BackendEvent),
}

/// Synchronous event callback.
pub type EventSink = Arc<dyn Fn(LoopEvent) + Send + Sync>;
