//! Core types for the circuit breaker.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version for persisted breaker snapshots.
pub const BREAKER_STATE_VERSION: u32 = 1;

/// Minimum supported version for backward compatibility.
pub const MIN_BREAKER_STATE_VERSION: u32 = 1;

/// Default number of consecutive failures before halting.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default number of outcomes kept for stagnation detection.
pub const DEFAULT_WINDOW_SIZE: usize = 5;

/// Breaker state.
///
/// Serialized with the classic circuit-breaker names so state files stay
/// readable by other tooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakerState {
    /// Normal operation.
    #[default]
    #[serde(rename = "CLOSED")]
    Stable,
    /// Backend is running but not making progress.
    #[serde(rename = "HALF_OPEN")]
    Probing,
    /// Execution halted until an explicit reset.
    #[serde(rename = "OPEN")]
    Halted,
}

impl BreakerState {
    /// Returns the persisted name of this state.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "CLOSED",
            Self::Probing => "HALF_OPEN",
            Self::Halted => "OPEN",
        }
    }

    /// Returns true if this state blocks further backend calls.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        matches!(self, Self::Halted)
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one loop iteration as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    /// Iteration index the outcome belongs to.
    pub loop_index: u32,
    /// Files the backend reported as modified.
    pub files_changed: u32,
    /// Whether the iteration produced errors.
    pub had_errors: bool,
}

impl Outcome {
    /// Returns true if the iteration made no observable progress.
    #[must_use]
    pub fn is_stagnant(&self) -> bool {
        self.files_changed == 0
    }
}

/// Thresholds that drive breaker transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that halt the breaker.
    pub failure_threshold: u32,
    /// Capacity of the recent outcome window.
    pub window_size: usize,
    /// Additional stagnant outcomes tolerated while probing before halting.
    pub stagnation_escalation: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_WINDOW_SIZE)
    }
}

impl BreakerConfig {
    /// Creates a config; stagnation escalation defaults to the failure threshold.
    #[must_use]
    pub fn new(failure_threshold: u32, window_size: usize) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            window_size: window_size.max(1),
            stagnation_escalation: failure_threshold.max(1),
        }
    }

    /// Overrides how many stagnant outcomes while probing trigger a halt.
    #[must_use]
    pub fn with_stagnation_escalation(mut self, escalation: u32) -> Self {
        self.stagnation_escalation = escalation.max(1);
        self
    }
}

/// Persisted breaker state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Schema version for forward compatibility.
    pub version: u32,
    /// Current state.
    pub state: BreakerState,
    /// Failures since the last clean outcome.
    pub consecutive_failures: u32,
    /// Stagnant outcomes observed since entering `Probing`.
    pub stagnant_streak: u32,
    /// Most recent outcomes, oldest first.
    pub recent_outcomes: VecDeque<Outcome>,
    /// When the state last changed.
    pub last_transition_at: DateTime<Utc>,
    /// Last error message recorded, if any.
    pub last_error: Option<String>,
    /// Why the breaker is in its current state.
    pub reason: Option<String>,
    /// Number of times the breaker has halted over its lifetime.
    pub total_halts: u32,
}

impl Default for BreakerSnapshot {
    fn default() -> Self {
        Self {
            version: BREAKER_STATE_VERSION,
            state: BreakerState::Stable,
            consecutive_failures: 0,
            stagnant_streak: 0,
            recent_outcomes: VecDeque::new(),
            last_transition_at: Utc::now(),
            last_error: None,
            reason: None,
            total_halts: 0,
        }
    }
}

impl BreakerSnapshot {
    /// Checks if the version is compatible.
    #[must_use]
    pub fn is_compatible_version(&self) -> bool {
        self.version >= MIN_BREAKER_STATE_VERSION && self.version <= BREAKER_STATE_VERSION
    }
}

/// Observability view of the breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub stagnant_streak: u32,
    pub window_size: usize,
    pub window_fill: usize,
    pub files_changed_in_window: u32,
    pub last_transition_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub reason: Option<String>,
    pub total_halts: u32,
}
