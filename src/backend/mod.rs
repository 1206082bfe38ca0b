//! Backend runners.
//!
//! A backend is whatever produces code changes for a prompt. The controller
//! only sees the [`BackendRunner`] trait; [`CodexCliRunner`] drives the Codex
//! CLI as a subprocess.

pub mod codex;
pub mod events;

pub use codex::CodexCliRunner;
pub use events::BackendEvent;

use async_trait::async_trait;

use crate::error::Result;

/// Callback receiving events while a backend runs.
pub type EventCallback<'a> = &'a (dyn Fn(BackendEvent) + Send + Sync);

/// Result of one backend invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendOutput {
    /// Text handed to the analyzer.
    pub output: String,
    /// Session id reported by the backend, if any.
    pub session_id: Option<String>,
}

impl BackendOutput {
    #[must_use]
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            session_id: None,
        }
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Abstraction over the code-generating backend.
///
/// Enables testing the controller without spawning real processes.
///
/// # Example
///
/// ```rust,ignore
/// use ralph_codex::backend::{BackendRunner, BackendEvent};
///
/// async fn run_once(runner: &dyn BackendRunner, prompt: &str) -> Result<String> {
///     let print = |event: BackendEvent| println!("{event}");
///     Ok(runner.run(prompt, &print).await?.output)
/// }
/// ```
#[async_trait]
pub trait BackendRunner: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Runs the backend on `prompt`, forwarding events as they arrive.
    ///
    /// Dropping the returned future must abort the invocation.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be started or fails.
    async fn run(&self, prompt: &str, on_event: EventCallback<'_>) -> Result<BackendOutput>;

    /// Discards any session state so the next run starts fresh.
    async fn new_session(&self) -> Result<()>;
}
