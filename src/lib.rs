//! Ralph for Codex - autonomous agent loop control
//!
//! Drives a code-generating backend (the Codex CLI) in a loop until the
//! project's fix plan is done, while keeping the loop from running away:
//! calls are budgeted per window, repeated failures or stagnation open a
//! circuit breaker, and every response is analyzed for completion.
//!
//! # Architecture
//!
//! - [`analysis`] - Status block parsing, heuristics and completion confidence
//! - [`backend`] - Backend runner trait, event model and the Codex CLI runner
//! - [`circuit`] - Failure and stagnation circuit breaker
//! - [`config`] - Loop settings loading and validation
//! - [`error`] - Custom error types and exit codes
//! - [`r#loop`] - Loop controller, call budget and project context
//! - [`state`] - Durable state store (files or memory)
//! - [`testing`] - Test doubles for the controller's collaborators
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ralph_codex::{CodexCliRunner, FileStateStore, LoopConfig, LoopController, ProjectContext};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = LoopConfig::load(".".as_ref())?;
//! let store = Arc::new(FileStateStore::for_project("."));
//! let runner = Arc::new(CodexCliRunner::new(".", store.clone()));
//! let context = Arc::new(ProjectContext::new("."));
//!
//! let mut controller = LoopController::new(config, runner, context, store);
//! controller.run(&CancellationToken::new()).await?;
//! ```

pub mod analysis;
pub mod backend;
pub mod circuit;
pub mod config;
pub mod error;
pub mod r#loop;
pub mod state;
pub mod testing;

// Re-export commonly used types
pub use error::{RalphError, Result};

pub use analysis::{analyze, AnalysisResult, OutputFormat, StatusRecord, TaskStatus};
pub use backend::{BackendEvent, BackendOutput, BackendRunner, CodexCliRunner};
pub use circuit::{BreakerConfig, BreakerState, BreakerStats, CircuitBreaker};
pub use config::LoopConfig;
pub use r#loop::{
    ContextProvider, ControllerStats, EventSink, LogLevel, LoopController, LoopEvent, LoopHandle,
    LoopStatus, PlanTask, ProjectContext, RateLimiter,
};
pub use state::{FileStateStore, MemoryStateStore, StateStore};
