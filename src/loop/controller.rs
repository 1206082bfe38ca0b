//! Loop controller.
//!
//! Sequences one iteration at a time:
//!
//! ```text
//! limiter gate -> breaker gate -> prompt + tasks -> backend run
//!     -> analyze output -> breaker update -> completion check
//! ```
//!
//! The controller is owned by a single task. Other tasks interact with it
//! through a [`CancellationToken`] (abort at the next suspension point) and a
//! [`LoopHandle`] (pause, resume, request stop).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::{
    all_complete, build_loop_context, inject_context, remaining_tasks, ContextProvider,
};
use super::events::{EventSink, LogLevel, LoopEvent, LoopStatus};
use super::rate_limiter::{RateLimiter, RateLimiterStats};
use crate::analysis::{analyze, AnalysisResult};
use crate::backend::{BackendEvent, BackendOutput, BackendRunner};
use crate::circuit::{BreakerStats, CircuitBreaker};
use crate::config::LoopConfig;
use crate::error::{RalphError, Result};
use crate::state::StateStore;

// ============================================================================
// Session and Handle
// ============================================================================

/// Per-run loop state owned by the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopSession {
    /// Zero-based index of the current iteration.
    pub loop_index: u32,
    pub should_stop: bool,
    /// Truncated echo of the previous iteration, carried into the next prompt.
    pub last_output_summary: String,
}

/// Cloneable remote control for a running controller.
///
/// Pausing takes effect between iterations; an in-flight backend call is
/// never interrupted.
#[derive(Debug, Clone, Default)]
pub struct LoopHandle {
    paused: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
}

impl LoopHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Asks the loop to stop before starting another iteration.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

/// Observability snapshot of the controller.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStats {
    pub loop_index: u32,
    pub max_loops: u32,
    pub successful_loops: u32,
    pub failed_loops: u32,
    pub should_stop: bool,
    pub paused: bool,
    pub last_output_summary: String,
    pub rate_limiter: RateLimiterStats,
    pub circuit_breaker: BreakerStats,
}

// ============================================================================
// Controller
// ============================================================================

/// Drives the backend until the work is done or a gate closes.
pub struct LoopController {
    config: LoopConfig,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    runner: Arc<dyn BackendRunner>,
    context: Arc<dyn ContextProvider>,
    store: Arc<dyn StateStore>,
    session: LoopSession,
    handle: LoopHandle,
    sink: Option<EventSink>,
    last_analysis: Option<AnalysisResult>,
    successful_loops: u32,
    failed_loops: u32,
}

impl std::fmt::Debug for LoopController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopController")
            .field("runner", &self.runner.name())
            .field("session", &self.session)
            .field("limiter", &self.limiter)
            .field("breaker", &self.breaker.state())
            .finish_non_exhaustive()
    }
}

impl LoopController {
    /// Creates a controller, restoring breaker and call budget from `store`.
    #[must_use]
    pub fn new(
        config: LoopConfig,
        runner: Arc<dyn BackendRunner>,
        context: Arc<dyn ContextProvider>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let limiter = RateLimiter::with_store(
            config.max_calls_per_hour,
            config.rate_window(),
            Arc::clone(&store),
        );
        let breaker = CircuitBreaker::load(config.breaker_config(), Arc::clone(&store));

        Self {
            config,
            limiter,
            breaker,
            runner,
            context,
            store,
            session: LoopSession::default(),
            handle: LoopHandle::new(),
            sink: None,
            last_analysis: None,
            successful_loops: 0,
            failed_loops: 0,
        }
    }

    /// Sets the callback receiving loop events.
    #[must_use]
    pub fn with_event_sink(mut self, sink: EventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Returns a handle for pausing or stopping from another task.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn session(&self) -> &LoopSession {
        &self.session
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Analysis of the most recent successful iteration.
    #[must_use]
    pub fn last_analysis(&self) -> Option<&AnalysisResult> {
        self.last_analysis.as_ref()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.handle.is_paused()
    }

    #[must_use]
    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            loop_index: self.session.loop_index,
            max_loops: self.config.effective_max_loops(),
            successful_loops: self.successful_loops,
            failed_loops: self.failed_loops,
            should_stop: self.session.should_stop,
            paused: self.handle.is_paused(),
            last_output_summary: self.session.last_output_summary.clone(),
            rate_limiter: self.limiter.stats(),
            circuit_breaker: self.breaker.stats(),
        }
    }

    // =========================================================================
    // Control
    // =========================================================================

    pub fn pause(&self) {
        self.handle.pause();
        self.emit_log(LogLevel::Info, "Loop paused");
    }

    pub fn resume(&self) {
        self.handle.resume();
        self.emit_log(LogLevel::Info, "Loop resumed");
    }

    /// Stops the loop and clears breaker and backend session state.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend session cannot be discarded.
    pub async fn graceful_exit(&mut self) -> Result<()> {
        info!("Performing graceful exit");
        self.session.should_stop = true;

        if let Err(e) = self.breaker.reset() {
            warn!("Failed to persist circuit breaker reset: {}", e);
        }

        self.runner.new_session().await
    }

    // =========================================================================
    // Main loop
    // =========================================================================

    /// Runs iterations until the work completes, a stop is requested, or an
    /// error ends the run.
    ///
    /// Cancellation returns [`RalphError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Every error except budget exhaustion ends the run and is returned.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.emit_log(
            LogLevel::Info,
            &format!(
                "Starting loop with {} (max {} loops, {} calls per window)",
                self.runner.name(),
                self.config.effective_max_loops(),
                self.config.max_calls_per_hour
            ),
        );
        self.emit_update(LoopStatus::Starting);

        let mut reported_pause = false;

        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled());
            }

            if self.session.should_stop || self.handle.stop_requested() {
                self.session.should_stop = true;
                self.emit_log(LogLevel::Success, "Loop stopped");
                self.emit_update(LoopStatus::Stopped);
                return Ok(());
            }

            if self.handle.is_paused() {
                if !reported_pause {
                    self.emit_update(LoopStatus::Paused);
                    reported_pause = true;
                }
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(self.cancelled()),
                    () = tokio::time::sleep(self.config.pause_poll_interval()) => {}
                }
                continue;
            }
            reported_pause = false;

            self.emit_update(LoopStatus::Running);

            if let Err(e) = self.execute_loop(cancel).await {
                if e.is_cancellation() {
                    return Err(self.cancelled());
                }
                self.emit_log(LogLevel::Error, &format!("Loop iteration error: {e}"));
                self.emit_update(LoopStatus::Errored);
                return Err(e);
            }

            if self.check_completion() {
                self.emit_log(
                    LogLevel::Success,
                    &format!("Loop complete after {} iterations", self.session.loop_index + 1),
                );
                self.emit_update(LoopStatus::Complete);
                return Ok(());
            }

            self.session.loop_index += 1;
        }
    }

    fn cancelled(&self) -> RalphError {
        self.emit_log(LogLevel::Warn, "Loop cancelled");
        self.emit_update(LoopStatus::Cancelled);
        RalphError::Cancelled
    }

    /// Runs a single iteration.
    ///
    /// # Errors
    ///
    /// Returns the gate, context, or backend error that prevented or failed
    /// the iteration.
    pub async fn execute_loop(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.emit_update(LoopStatus::Executing);

        if !self.limiter.can_make_call() {
            self.emit_log(
                LogLevel::Warn,
                &format!(
                    "Rate limit reached ({}), waiting for reset",
                    self.limiter.admission_denied()
                ),
            );
            self.emit_update(LoopStatus::RateLimited);
            return self.limiter.wait_for_reset(cancel).await;
        }

        if self.breaker.should_halt() {
            let reason = self
                .breaker
                .reason()
                .unwrap_or("circuit breaker is open")
                .to_string();
            self.emit_log(
                LogLevel::Error,
                &format!("Circuit breaker is OPEN, halting execution: {reason}"),
            );
            self.emit_update(LoopStatus::CircuitOpen);
            return Err(RalphError::CircuitHalted { reason });
        }

        let prompt = self.context.prompt()?;
        let tasks = self.context.load_tasks()?;
        let header = build_loop_context(
            self.session.loop_index + 1,
            self.breaker.state().as_str(),
            &remaining_tasks(&tasks),
            &self.session.last_output_summary,
        );
        let full_prompt = inject_context(&prompt, &header);

        self.emit_log(
            LogLevel::Info,
            &format!(
                "Loop {}: executing {}",
                self.session.loop_index + 1,
                self.runner.name()
            ),
        );
        self.emit_update(LoopStatus::BackendRunning);
        debug!("Prompt size: {} bytes", full_prompt.len());

        match self.invoke_backend(&full_prompt, cancel).await {
            Ok(output) => {
                self.on_success(&output);
                Ok(())
            }
            Err(e) if e.is_cancellation() => Err(e),
            Err(e @ RalphError::MissingTool { .. }) => Err(e),
            Err(e) => {
                self.on_failure(&e);
                Err(e)
            }
        }
    }

    async fn invoke_backend(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<BackendOutput> {
        let runner = Arc::clone(&self.runner);
        let sink = self.sink.clone();
        let forward = move |event: BackendEvent| {
            if let Some(sink) = &sink {
                sink(LoopEvent::Backend(event));
            }
        };
        let timeout = self.config.backend_timeout();

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(RalphError::Cancelled),
            result = tokio::time::timeout(timeout, runner.run(prompt, &forward)) => match result {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e @ (RalphError::Backend { .. }
                    | RalphError::MissingTool { .. }
                    | RalphError::Cancelled))) => Err(e),
                Ok(Err(e)) => Err(RalphError::backend(runner.name(), e.to_string())),
                Err(_) => Err(RalphError::BackendTimeout {
                    backend: runner.name().to_string(),
                    timeout,
                }),
            },
        }
    }

    fn on_failure(&mut self, error: &RalphError) {
        self.failed_loops += 1;
        self.session.last_output_summary = format!(
            "Error: {}",
            truncate_chars(&error.to_string(), self.config.summary_chars)
        );
        self.limiter.record_call();

        if let Err(e) = self.breaker.record_error(&error.to_string()) {
            warn!("Failed to persist circuit breaker state: {}", e);
        }

        self.emit_log(
            LogLevel::Error,
            &format!("{} execution failed: {error}", self.runner.name()),
        );
        self.emit_update(LoopStatus::ExecutionError);
    }

    fn on_success(&mut self, output: &BackendOutput) {
        self.successful_loops += 1;
        self.limiter.record_call();
        self.session.last_output_summary = format!(
            "Success: {}",
            truncate_chars(&output.output, self.config.summary_chars)
        );

        let loop_number = self.session.loop_index + 1;
        self.emit_log(
            LogLevel::Success,
            &format!("Loop {loop_number} completed successfully"),
        );
        self.emit_update(LoopStatus::ExecutionComplete);

        let mut signals = self.store.load_exit_signals().unwrap_or_else(|e| {
            warn!("Failed to load exit signals: {}", e);
            Vec::new()
        });
        let analysis = analyze(&output.output, &signals);
        debug!(
            "Analysis: status={} files={} errors={} confidence={:.2}",
            analysis.status.status,
            analysis.status.files_modified,
            analysis.has_errors,
            analysis.confidence
        );

        if analysis.exit_signal {
            self.emit_log(LogLevel::Info, "Exit signal detected in output");
            let marker = format!("loop_{loop_number}");
            if !signals.contains(&marker) {
                signals.push(marker);
                if let Err(e) = self.store.save_exit_signals(&signals) {
                    warn!("Failed to persist exit signals: {}", e);
                }
            }
            self.session.should_stop = true;
        }

        if analysis.is_confident_completion() {
            self.emit_log(LogLevel::Success, "High-confidence completion detected");
            self.session.should_stop = true;
        }

        if let Err(e) = self.breaker.record_result(
            self.session.loop_index,
            analysis.status.files_changed(),
            analysis.has_errors,
        ) {
            warn!("Failed to persist circuit breaker state: {}", e);
        }

        self.last_analysis = Some(analysis);
    }

    /// Decides whether the run is finished. True means stop.
    ///
    /// Stops when no plan task is left unchecked (an empty plan included),
    /// the breaker is open, the call budget is spent, or the loop cap is
    /// reached. A plan that cannot be read does not stop the loop.
    ///
    /// `max_loops` is the total number of iterations: the cap fires after
    /// iteration `max_loops` has run, not one iteration later.
    pub fn check_completion(&mut self) -> bool {
        match self.context.load_tasks() {
            Ok(tasks) if all_complete(&tasks) => {
                info!("All {} tasks complete", tasks.len());
                return self.stop();
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Could not read task list: {}", e);
                return false;
            }
        }

        if self.breaker.should_halt() {
            info!("Stopping: circuit breaker is open");
            return self.stop();
        }

        if !self.limiter.can_make_call() {
            info!("Stopping: call budget exhausted");
            return self.stop();
        }

        if self.session.loop_index + 1 >= self.config.effective_max_loops() {
            info!(
                "Stopping: reached max loops ({})",
                self.config.effective_max_loops()
            );
            return self.stop();
        }

        false
    }

    fn stop(&mut self) -> bool {
        self.session.should_stop = true;
        true
    }

    // =========================================================================
    // Events
    // =========================================================================

    fn emit(&self, event: LoopEvent) {
        if let Some(sink) = &self.sink {
            sink(event);
        }
    }

    fn emit_log(&self, level: LogLevel, message: &str) {
        self.emit(LoopEvent::Log {
            level,
            message: message.to_string(),
        });
    }

    fn emit_update(&self, status: LoopStatus) {
        debug!("Loop {} status: {}", self.session.loop_index + 1, status);
        self.emit(LoopEvent::LoopUpdate {
            loop_index: self.session.loop_index,
            calls_used: self.limiter.calls_made(),
            status,
            circuit_state: self.breaker.state(),
        });
    }
}

/// First `max_chars` characters of `text`.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::BreakerState;
    use crate::r#loop::context::PlanTask;
    use crate::state::MemoryStateStore;
    use crate::testing::{MockBackendRunner, MockContextProvider};
    use std::sync::Mutex;
    use std::time::Duration;

    const COMPLETE_OUTPUT: &str = "All done.\n---RALPH_STATUS---\nSTATUS: COMPLETE\nFILES_MODIFIED: 2\nEXIT_SIGNAL: true\n---END_RALPH_STATUS---";

    const PROGRESS_OUTPUT: &str =
        "---RALPH_STATUS---\nSTATUS: IN_PROGRESS\nFILES_MODIFIED: 1\n---END_RALPH_STATUS---";

    fn open_plan() -> Arc<MockContextProvider> {
        Arc::new(MockContextProvider::new("Build it").with_tasks(vec![
            PlanTask::new("first", true),
            PlanTask::new("second", false),
        ]))
    }

    fn controller(
        runner: Arc<MockBackendRunner>,
        context: Arc<MockContextProvider>,
        store: Arc<MemoryStateStore>,
        config: LoopConfig,
    ) -> LoopController {
        LoopController::new(config, runner, context, store)
    }

    fn recording_sink() -> (EventSink, Arc<Mutex<Vec<LoopEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&events);
        let sink: EventSink = Arc::new(move |event: LoopEvent| captured.lock().unwrap().push(event));
        (sink, events)
    }

    fn statuses(events: &Mutex<Vec<LoopEvent>>) -> Vec<LoopStatus> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                LoopEvent::LoopUpdate { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 200), "short");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn test_handle_flags() {
        let handle = LoopHandle::new();
        let remote = handle.clone();
        remote.pause();
        assert!(handle.is_paused());
        remote.resume();
        assert!(!handle.is_paused());
        remote.request_stop();
        assert!(handle.stop_requested());
    }

    #[test]
    fn test_all_tasks_complete_stops_without_backend_call() {
        let runner = Arc::new(MockBackendRunner::new());
        let context = Arc::new(
            MockContextProvider::new("p").with_tasks(vec![PlanTask::new("only", true)]),
        );
        let mut ctrl = controller(
            runner.clone(),
            context,
            Arc::new(MemoryStateStore::new()),
            LoopConfig::default(),
        );

        assert!(ctrl.check_completion());
        assert!(ctrl.session().should_stop);
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_plan_stops_after_first_loop() {
        let runner = Arc::new(MockBackendRunner::new().with_output(PROGRESS_OUTPUT));
        let mut ctrl = controller(
            runner.clone(),
            Arc::new(MockContextProvider::new("p")),
            Arc::new(MemoryStateStore::new()),
            LoopConfig::default().with_max_loops(7),
        );

        ctrl.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(runner.call_count(), 1);
        assert!(ctrl.session().should_stop);
    }

    #[test]
    fn test_unreadable_plan_does_not_complete() {
        let context = Arc::new(MockContextProvider::new("p").with_task_error("plan missing"));
        let mut ctrl = controller(
            Arc::new(MockBackendRunner::new()),
            context,
            Arc::new(MemoryStateStore::new()),
            LoopConfig::default(),
        );
        assert!(!ctrl.check_completion());
        assert!(!ctrl.session().should_stop);
    }

    #[tokio::test]
    async fn test_exit_signal_stops_and_persists_marker() {
        let runner = Arc::new(MockBackendRunner::new().with_output(COMPLETE_OUTPUT));
        let store = Arc::new(MemoryStateStore::new());
        let mut ctrl = controller(runner.clone(), open_plan(), store.clone(), LoopConfig::default());

        ctrl.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(runner.call_count(), 1);
        assert!(ctrl.session().should_stop);
        assert_eq!(store.load_exit_signals().unwrap(), vec!["loop_1".to_string()]);
        assert_eq!(ctrl.limiter().calls_made(), 1);
        assert!(ctrl.session().last_output_summary.starts_with("Success: All done."));
    }

    #[tokio::test]
    async fn test_prompt_carries_loop_context() {
        let runner = Arc::new(
            MockBackendRunner::new()
                .with_output(PROGRESS_OUTPUT)
                .with_output(COMPLETE_OUTPUT),
        );
        let mut ctrl = controller(
            runner.clone(),
            open_plan(),
            Arc::new(MemoryStateStore::new()),
            LoopConfig::default(),
        );

        ctrl.run(&CancellationToken::new()).await.unwrap();

        let prompts = runner.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].contains("Loop: 1\n"));
        assert!(prompts[0].contains("  1. second\n"));
        assert!(prompts[0].ends_with("Build it"));
        assert!(prompts[1].contains("Loop: 2\n"));
        assert!(prompts[1].contains("Previous Loop Summary:\nSuccess: ---RALPH_STATUS---"));
    }

    #[tokio::test]
    async fn test_backend_failure_ends_run_and_counts() {
        let runner = Arc::new(MockBackendRunner::new().with_error("boom"));
        let store = Arc::new(MemoryStateStore::new());
        let (sink, events) = recording_sink();
        let mut ctrl = controller(runner, open_plan(), store, LoopConfig::default())
            .with_event_sink(sink);

        let err = ctrl.run(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, RalphError::Backend { .. }));
        assert_eq!(ctrl.limiter().calls_made(), 1);
        assert_eq!(ctrl.breaker().stats().consecutive_failures, 1);
        assert!(ctrl.session().last_output_summary.starts_with("Error: "));
        let seen = statuses(&events);
        assert!(seen.contains(&LoopStatus::ExecutionError));
        assert_eq!(seen.last(), Some(&LoopStatus::Errored));
    }

    #[tokio::test]
    async fn test_failure_summary_is_truncated() {
        let stderr = "line of stderr output\n".repeat(40);
        let runner = Arc::new(MockBackendRunner::new().with_error(&stderr));
        let mut config = LoopConfig::default();
        config.summary_chars = 20;
        let mut ctrl = controller(runner, open_plan(), Arc::new(MemoryStateStore::new()), config);

        ctrl.run(&CancellationToken::new()).await.unwrap_err();

        let summary = &ctrl.session().last_output_summary;
        assert!(summary.starts_with("Error: "));
        assert_eq!(summary.chars().count(), "Error: ".len() + 20);
    }

    #[tokio::test]
    async fn test_repeated_failures_open_breaker_across_runs() {
        let store = Arc::new(MemoryStateStore::new());
        let runner = Arc::new(MockBackendRunner::new().with_error("crash"));

        for _ in 0..3 {
            let mut ctrl =
                controller(runner.clone(), open_plan(), store.clone(), LoopConfig::default());
            let err = ctrl.run(&CancellationToken::new()).await.unwrap_err();
            assert!(matches!(err, RalphError::Backend { .. }));
        }
        assert_eq!(runner.call_count(), 3);

        let mut ctrl = controller(runner.clone(), open_plan(), store, LoopConfig::default());
        assert_eq!(ctrl.breaker().state(), BreakerState::Halted);
        let err = ctrl.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RalphError::CircuitHalted { .. }));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(runner.call_count(), 3);
    }

    #[tokio::test]
    async fn test_max_loops_stops_cleanly() {
        let runner = Arc::new(MockBackendRunner::new().with_output(PROGRESS_OUTPUT));
        let mut ctrl = controller(
            runner.clone(),
            open_plan(),
            Arc::new(MemoryStateStore::new()),
            LoopConfig::default().with_max_loops(3),
        );

        ctrl.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(runner.call_count(), 3);
        assert_eq!(ctrl.stats().successful_loops, 3);
    }

    #[tokio::test]
    async fn test_exhausted_budget_stops_after_last_call() {
        let runner = Arc::new(MockBackendRunner::new().with_output(PROGRESS_OUTPUT));
        let mut ctrl = controller(
            runner.clone(),
            open_plan(),
            Arc::new(MemoryStateStore::new()),
            LoopConfig::default().with_max_calls(2).with_max_loops(10),
        );

        ctrl.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(runner.call_count(), 2);
        assert_eq!(ctrl.limiter().calls_remaining(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_budget_at_start_waits_and_cancels() {
        let store = Arc::new(MemoryStateStore::new());
        let mut spent = crate::r#loop::rate_limiter::CallBudget::new(1, Duration::from_secs(3600));
        spent.calls_made = 1;
        store.save_call_budget(&spent).unwrap();

        let runner = Arc::new(MockBackendRunner::new());
        let (sink, events) = recording_sink();
        let mut ctrl = controller(
            runner.clone(),
            open_plan(),
            store,
            LoopConfig::default().with_max_calls(1),
        )
        .with_event_sink(sink);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = ctrl.run(&cancel).await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(runner.call_count(), 0);
        let seen = statuses(&events);
        assert!(seen.contains(&LoopStatus::RateLimited));
        assert_eq!(seen.last(), Some(&LoopStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_during_backend_call_returns_promptly() {
        let runner = Arc::new(
            MockBackendRunner::new()
                .with_output(PROGRESS_OUTPUT)
                .with_delay(Duration::from_secs(30)),
        );
        let mut ctrl = controller(
            runner.clone(),
            open_plan(),
            Arc::new(MemoryStateStore::new()),
            LoopConfig::default(),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = ctrl.run(&cancel).await.unwrap_err();
        assert!(err.is_cancellation());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(ctrl.limiter().calls_made(), 0);
        assert_eq!(ctrl.breaker().stats().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_backend_timeout_is_recorded() {
        let runner = Arc::new(
            MockBackendRunner::new()
                .with_output(PROGRESS_OUTPUT)
                .with_delay(Duration::from_secs(30)),
        );
        let mut config = LoopConfig::default();
        config.backend_timeout_secs = 1;
        let mut ctrl = controller(runner, open_plan(), Arc::new(MemoryStateStore::new()), config);

        let err = ctrl.execute_loop(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RalphError::BackendTimeout { .. }));
        assert_eq!(ctrl.breaker().stats().consecutive_failures, 1);
        assert_eq!(ctrl.limiter().calls_made(), 1);
    }

    #[tokio::test]
    async fn test_context_error_propagates_without_call() {
        let runner = Arc::new(MockBackendRunner::new());
        let context = Arc::new(MockContextProvider::new("p").with_prompt_error("no prompt"));
        let mut ctrl = controller(
            runner.clone(),
            context,
            Arc::new(MemoryStateStore::new()),
            LoopConfig::default(),
        );

        let err = ctrl.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RalphError::Context { .. }));
        assert_eq!(runner.call_count(), 0);
        assert_eq!(ctrl.limiter().calls_made(), 0);
    }

    #[tokio::test]
    async fn test_paused_loop_waits_then_resumes() {
        let runner = Arc::new(MockBackendRunner::new().with_output(COMPLETE_OUTPUT));
        let config = LoopConfig::default().with_pause_poll_interval(Duration::from_millis(10));
        let mut ctrl = controller(
            runner.clone(),
            open_plan(),
            Arc::new(MemoryStateStore::new()),
            config,
        );

        let handle = ctrl.handle();
        ctrl.pause();
        assert!(ctrl.is_paused());

        let resumer = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            resumer.resume();
        });

        ctrl.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(runner.call_count(), 1);
        assert!(!handle.is_paused());
    }

    #[tokio::test]
    async fn test_cancel_while_paused() {
        let runner = Arc::new(MockBackendRunner::new());
        let config = LoopConfig::default().with_pause_poll_interval(Duration::from_secs(60));
        let (sink, events) = recording_sink();
        let mut ctrl = controller(runner.clone(), open_plan(), Arc::new(MemoryStateStore::new()), config)
            .with_event_sink(sink);
        ctrl.pause();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let err = ctrl.run(&cancel).await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(runner.call_count(), 0);
        assert!(statuses(&events).contains(&LoopStatus::Paused));
    }

    #[tokio::test]
    async fn test_request_stop_before_run() {
        let runner = Arc::new(MockBackendRunner::new());
        let mut ctrl = controller(
            runner.clone(),
            open_plan(),
            Arc::new(MemoryStateStore::new()),
            LoopConfig::default(),
        );
        ctrl.handle().request_stop();
        ctrl.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_graceful_exit_resets_breaker_and_session() {
        let store = Arc::new(MemoryStateStore::new());
        let runner = Arc::new(MockBackendRunner::new().with_error("crash"));
        let mut ctrl = controller(
            runner.clone(),
            open_plan(),
            store.clone(),
            LoopConfig {
                failure_threshold: 1,
                ..LoopConfig::default()
            },
        );

        let _ = ctrl.run(&CancellationToken::new()).await;
        assert!(ctrl.breaker().should_halt());

        ctrl.graceful_exit().await.unwrap();
        assert!(ctrl.session().should_stop);
        assert_eq!(ctrl.breaker().state(), BreakerState::Stable);
        assert_eq!(runner.new_session_count(), 1);
    }

    #[tokio::test]
    async fn test_backend_events_are_forwarded() {
        let runner = Arc::new(
            MockBackendRunner::new()
                .with_output(COMPLETE_OUTPUT)
                .with_events(vec![BackendEvent::Reasoning {
                    text: "thinking".into(),
                }]),
        );
        let (sink, events) = recording_sink();
        let mut ctrl = controller(
            runner,
            open_plan(),
            Arc::new(MemoryStateStore::new()),
            LoopConfig::default(),
        )
        .with_event_sink(sink);

        ctrl.run(&CancellationToken::new()).await.unwrap();

        let forwarded = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, LoopEvent::Backend(BackendEvent::Reasoning { .. })))
            .count();
        assert_eq!(forwarded, 1);
    }

    #[tokio::test]
    async fn test_stagnant_loops_open_breaker() {
        let runner = Arc::new(MockBackendRunner::new().with_output(
            "---RALPH_STATUS---\nSTATUS: IN_PROGRESS\nFILES_MODIFIED: 0\n---END_RALPH_STATUS---",
        ));
        let config = LoopConfig {
            stagnation_window: 2,
            stagnation_escalation: Some(1),
            ..LoopConfig::default()
        };
        let mut ctrl = controller(runner.clone(), open_plan(), Arc::new(MemoryStateStore::new()), config);

        ctrl.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(runner.call_count(), 3);
        assert_eq!(ctrl.breaker().state(), BreakerState::Halted);
        assert!(ctrl.session().should_stop);
    }
}
