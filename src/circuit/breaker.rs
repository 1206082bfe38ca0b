//! Failure and stagnation circuit breaker.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::types::{BreakerConfig, BreakerSnapshot, BreakerState, BreakerStats, Outcome};
use crate::error::Result;
use crate::state::StateStore;

/// Three-state fault detector gating backend calls.
///
/// Explicit errors halt quickly: `failure_threshold` consecutive failures go
/// straight to [`BreakerState::Halted`]. A full window of outcomes without
/// file changes moves the breaker to [`BreakerState::Probing`], and
/// `stagnation_escalation` further stagnant outcomes halt it. Only
/// [`CircuitBreaker::reset`] leaves the halted state.
///
/// Every mutation is persisted through the [`StateStore`]. Persistence
/// failures are returned to the caller, but the in-memory state has already
/// changed and stays authoritative.
pub struct CircuitBreaker {
    config: BreakerConfig,
    snapshot: BreakerSnapshot,
    store: Arc<dyn StateStore>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a breaker in the stable state without consulting the store.
    #[must_use]
    pub fn new(config: BreakerConfig, store: Arc<dyn StateStore>) -> Self {
        Self {
            config,
            snapshot: BreakerSnapshot::default(),
            store,
        }
    }

    /// Restores a breaker from the store, falling back to stable.
    #[must_use]
    pub fn load(config: BreakerConfig, store: Arc<dyn StateStore>) -> Self {
        let mut snapshot = match store.load_breaker() {
            Ok(Some(snapshot)) => {
                debug!("Restored circuit breaker in state {}", snapshot.state);
                snapshot
            }
            Ok(None) => BreakerSnapshot::default(),
            Err(e) => {
                warn!("Failed to load circuit breaker state, starting CLOSED: {}", e);
                BreakerSnapshot::default()
            }
        };

        while snapshot.recent_outcomes.len() > config.window_size {
            snapshot.recent_outcomes.pop_front();
        }

        Self {
            config,
            snapshot,
            store,
        }
    }

    // =========================================================================
    // Recording
    // =========================================================================

    /// Records an execution error.
    pub fn record_error(&mut self, message: &str) -> Result<()> {
        self.register_failure(message);
        self.persist()
    }

    /// Records the outcome of one iteration.
    pub fn record_result(
        &mut self,
        loop_index: u32,
        files_changed: u32,
        had_errors: bool,
    ) -> Result<()> {
        let outcome = Outcome {
            loop_index,
            files_changed,
            had_errors,
        };

        self.snapshot.recent_outcomes.push_back(outcome);
        while self.snapshot.recent_outcomes.len() > self.config.window_size {
            self.snapshot.recent_outcomes.pop_front();
        }

        if had_errors {
            self.register_failure(&format!("loop {} reported errors", loop_index + 1));
        } else {
            self.snapshot.consecutive_failures = 0;
        }

        self.evaluate_progress(&outcome);
        self.persist()
    }

    fn register_failure(&mut self, message: &str) {
        self.snapshot.consecutive_failures = self.snapshot.consecutive_failures.saturating_add(1);
        self.snapshot.last_error = Some(message.to_string());
        debug!(
            "Circuit breaker failure {}/{}: {}",
            self.snapshot.consecutive_failures, self.config.failure_threshold, message
        );

        if self.snapshot.consecutive_failures >= self.config.failure_threshold
            && !self.snapshot.state.is_halted()
        {
            let reason = format!(
                "{} consecutive failures (last: {})",
                self.snapshot.consecutive_failures, message
            );
            self.transition(BreakerState::Halted, reason);
        }
    }

    fn evaluate_progress(&mut self, outcome: &Outcome) {
        match self.snapshot.state {
            BreakerState::Halted => {}
            BreakerState::Stable => {
                let window = &self.snapshot.recent_outcomes;
                if window.len() >= self.config.window_size && window.iter().all(Outcome::is_stagnant)
                {
                    self.snapshot.stagnant_streak = 0;
                    let reason = format!(
                        "no files changed in the last {} loops",
                        self.config.window_size
                    );
                    self.transition(BreakerState::Probing, reason);
                }
            }
            BreakerState::Probing => {
                if outcome.is_stagnant() {
                    self.snapshot.stagnant_streak += 1;
                    if self.snapshot.stagnant_streak >= self.config.stagnation_escalation {
                        let reason = format!(
                            "no progress for {} loops after stagnation warning",
                            self.snapshot.stagnant_streak
                        );
                        self.transition(BreakerState::Halted, reason);
                    }
                } else {
                    self.snapshot.stagnant_streak = 0;
                    self.transition(
                        BreakerState::Stable,
                        format!("{} files changed", outcome.files_changed),
                    );
                }
            }
        }
    }

    fn transition(&mut self, to: BreakerState, reason: String) {
        let from = self.snapshot.state;
        if from == to {
            return;
        }

        match to {
            BreakerState::Halted => {
                self.snapshot.total_halts += 1;
                warn!("Circuit breaker {} -> {}: {}", from, to, reason);
            }
            BreakerState::Probing => warn!("Circuit breaker {} -> {}: {}", from, to, reason),
            BreakerState::Stable => info!("Circuit breaker {} -> {}: {}", from, to, reason),
        }

        self.snapshot.state = to;
        self.snapshot.reason = Some(reason);
        self.snapshot.last_transition_at = Utc::now();
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Returns true if backend calls must stop.
    #[must_use]
    pub fn should_halt(&self) -> bool {
        self.snapshot.state.is_halted()
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.snapshot.state
    }

    /// Why the breaker is in its current state.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.snapshot.reason.as_deref()
    }

    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    #[must_use]
    pub fn snapshot(&self) -> &BreakerSnapshot {
        &self.snapshot
    }

    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            state: self.snapshot.state,
            consecutive_failures: self.snapshot.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            stagnant_streak: self.snapshot.stagnant_streak,
            window_size: self.config.window_size,
            window_fill: self.snapshot.recent_outcomes.len(),
            files_changed_in_window: self
                .snapshot
                .recent_outcomes
                .iter()
                .fold(0u32, |acc, o| acc.saturating_add(o.files_changed)),
            last_transition_at: self.snapshot.last_transition_at,
            last_error: self.snapshot.last_error.clone(),
            reason: self.snapshot.reason.clone(),
            total_halts: self.snapshot.total_halts,
        }
    }

    // =========================================================================
    // Reset
    // =========================================================================

    /// Returns the breaker to the stable state and persists it.
    pub fn reset(&mut self) -> Result<()> {
        if self.snapshot.state != BreakerState::Stable {
            info!("Circuit breaker {} -> CLOSED: manual reset", self.snapshot.state);
        }

        let total_halts = self.snapshot.total_halts;
        self.snapshot = BreakerSnapshot {
            total_halts,
            ..BreakerSnapshot::default()
        };
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        self.store.save_breaker(&self.snapshot)
    }
}
