//! Mock collaborators for the loop controller.
//!
//! These mocks provide controllable test doubles for the backend, the
//! project context and the state store, enabling deterministic unit tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{BackendEvent, BackendOutput, BackendRunner, EventCallback};
use crate::circuit::BreakerSnapshot;
use crate::error::{RalphError, Result};
use crate::r#loop::context::{ContextProvider, PlanTask};
use crate::r#loop::rate_limiter::CallBudget;
use crate::state::StateStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Debug, Clone)]
enum Scripted {
    Output(String),
    Error(String),
}

/// Scripted backend runner.
///
/// Responses are consumed in order; the last one repeats once the script
/// runs out. With no script every call succeeds with empty output.
///
/// # Example
///
/// ```rust,ignore
/// let runner = MockBackendRunner::new()
///     .with_output("working...")
///     .with_error("crashed")
///     .with_delay(Duration::from_millis(10));
///
/// let output = runner.run("prompt", &|_| {}).await?;
/// assert_eq!(runner.call_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MockBackendRunner {
    script: Vec<Scripted>,
    events: Vec<BackendEvent>,
    delay: Option<Duration>,
    session_id: Option<String>,
    call_count: AtomicU32,
    new_session_count: AtomicU32,
    prompts: Mutex<Vec<String>>,
}

impl MockBackendRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a successful response.
    #[must_use]
    pub fn with_output(mut self, output: &str) -> Self {
        self.script.push(Scripted::Output(output.to_string()));
        self
    }

    /// Appends a failing response.
    #[must_use]
    pub fn with_error(mut self, message: &str) -> Self {
        self.script.push(Scripted::Error(message.to_string()));
        self
    }

    /// Events emitted at the start of every call.
    #[must_use]
    pub fn with_events(mut self, events: Vec<BackendEvent>) -> Self {
        self.events = events;
        self
    }

    /// Sleeps before responding.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Session id reported with successful outputs.
    #[must_use]
    pub fn with_session_id(mut self, id: &str) -> Self {
        self.session_id = Some(id.to_string());
        self
    }

    /// Number of times `run` was called.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Number of times `new_session` was called.
    pub fn new_session_count(&self) -> u32 {
        self.new_session_count.load(Ordering::SeqCst)
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

#[async_trait]
impl BackendRunner for MockBackendRunner {
    fn name(&self) -> &str {
        "mock"
    }

    async fn run(&self, prompt: &str, on_event: EventCallback<'_>) -> Result<BackendOutput> {
        let call = self.call_count.fetch_add(1, Ordering::SeqCst) as usize;
        lock(&self.prompts).push(prompt.to_string());

        for event in &self.events {
            on_event(event.clone());
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .script
            .get(call)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or_else(|| Scripted::Output(String::new()));

        match scripted {
            Scripted::Output(output) => {
                let output = BackendOutput::new(output);
                Ok(match &self.session_id {
                    Some(id) => output.with_session_id(id.clone()),
                    None => output,
                })
            }
            Scripted::Error(message) => Err(RalphError::backend(self.name(), message)),
        }
    }

    async fn new_session(&self) -> Result<()> {
        self.new_session_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Context
// ============================================================================

/// In-memory prompt and task list.
#[derive(Debug, Default)]
pub struct MockContextProvider {
    prompt: String,
    tasks: Mutex<Vec<PlanTask>>,
    prompt_error: Option<String>,
    task_error: Option<String>,
}

impl MockContextProvider {
    #[must_use]
    pub fn new(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_tasks(self, tasks: Vec<PlanTask>) -> Self {
        *lock(&self.tasks) = tasks;
        self
    }

    /// Makes `prompt` fail with a context error.
    #[must_use]
    pub fn with_prompt_error(mut self, message: &str) -> Self {
        self.prompt_error = Some(message.to_string());
        self
    }

    /// Makes `load_tasks` fail with a context error.
    #[must_use]
    pub fn with_task_error(mut self, message: &str) -> Self {
        self.task_error = Some(message.to_string());
        self
    }

    /// Replaces the task list, e.g. to simulate the agent checking items off.
    pub fn set_tasks(&self, tasks: Vec<PlanTask>) {
        *lock(&self.tasks) = tasks;
    }
}

impl ContextProvider for MockContextProvider {
    fn prompt(&self) -> Result<String> {
        match &self.prompt_error {
            Some(message) => Err(RalphError::context(message.clone())),
            None => Ok(self.prompt.clone()),
        }
    }

    fn load_tasks(&self) -> Result<Vec<PlanTask>> {
        match &self.task_error {
            Some(message) => Err(RalphError::context(message.clone())),
            None => Ok(lock(&self.tasks).clone()),
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// State store whose every operation fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingStateStore;

impl FailingStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn fail<T>(what: &str) -> Result<T> {
        Err(RalphError::persistence(what, "store unavailable"))
    }
}

impl StateStore for FailingStateStore {
    fn load_breaker(&self) -> Result<Option<BreakerSnapshot>> {
        Self::fail("circuit breaker")
    }

    fn save_breaker(&self, _snapshot: &BreakerSnapshot) -> Result<()> {
        Self::fail("circuit breaker")
    }

    fn load_exit_signals(&self) -> Result<Vec<String>> {
        Self::fail("exit signals")
    }

    fn save_exit_signals(&self, _signals: &[String]) -> Result<()> {
        Self::fail("exit signals")
    }

    fn load_call_budget(&self) -> Result<Option<CallBudget>> {
        Self::fail("call budget")
    }

    fn save_call_budget(&self, _budget: &CallBudget) -> Result<()> {
        Self::fail("call budget")
    }

    fn load_session_id(&self) -> Result<Option<String>> {
        Self::fail("session id")
    }

    fn save_session_id(&self, _id: &str) -> Result<()> {
        Self::fail("session id")
    }

    fn clear_session_id(&self) -> Result<()> {
        Self::fail("session id")
    }
}
