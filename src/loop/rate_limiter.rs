//! Call budget limiter.
//!
//! Caps the number of backend invocations per rolling window. The window
//! rolls over lazily: nothing happens on a timer, the next query after
//! `window_start + window_duration` resets the count.
//!
//! # Example
//!
//! ```rust,ignore
//! use ralph_codex::r#loop::rate_limiter::RateLimiter;
//! use std::time::Duration;
//!
//! let mut limiter = RateLimiter::new(100, Duration::from_secs(3600));
//! if limiter.can_make_call() {
//!     // invoke the backend
//!     limiter.record_call();
//! } else {
//!     limiter.wait_for_reset(&cancel).await?;
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RalphError, Result};
use crate::state::StateStore;

/// Default calls allowed per window.
pub const DEFAULT_MAX_CALLS: u32 = 100;

/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

// ============================================================================
// Call Budget
// ============================================================================

/// Calls made in the current window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallBudget {
    /// Start of the current window.
    pub window_start: DateTime<Utc>,
    /// Calls accepted since `window_start`.
    pub calls_made: u32,
    /// Maximum calls per window.
    pub limit: u32,
    /// Window length in milliseconds.
    pub window_duration_ms: u64,
}

impl CallBudget {
    /// Creates an empty budget whose window starts now.
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            window_start: Utc::now(),
            calls_made: 0,
            limit,
            window_duration_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Returns the window length.
    #[must_use]
    pub fn window_duration(&self) -> Duration {
        Duration::from_millis(self.window_duration_ms)
    }

    /// Time elapsed since the window started. A start in the future counts as zero.
    #[must_use]
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.window_start).to_std().unwrap_or(Duration::ZERO)
    }

    /// Returns true once the window has run its full length.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.elapsed_at(now) >= self.window_duration()
    }

    /// Time left until the window rolls over.
    #[must_use]
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        self.window_duration().saturating_sub(self.elapsed_at(now))
    }

    /// Starts a new window if the current one has expired.
    ///
    /// Returns true if a rollover happened.
    pub fn roll_over_at(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_expired_at(now) {
            self.window_start = now;
            self.calls_made = 0;
            true
        } else {
            false
        }
    }

    /// Calls still available, ignoring any pending rollover.
    #[must_use]
    pub fn remaining_calls(&self) -> u32 {
        self.limit.saturating_sub(self.calls_made)
    }
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// Snapshot of limiter counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimiterStats {
    pub calls_made: u32,
    pub calls_remaining: u32,
    pub limit: u32,
    pub window_start: DateTime<Utc>,
    pub resets_in_secs: u64,
}

/// Admission control for backend invocations.
pub struct RateLimiter {
    budget: CallBudget,
    store: Option<Arc<dyn StateStore>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("budget", &self.budget)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl RateLimiter {
    /// Creates a limiter with a fresh window.
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            budget: CallBudget::new(limit, window),
            store: None,
        }
    }

    /// Creates a limiter that restores and persists its budget.
    ///
    /// A stored window that is still live carries its call count over, so a
    /// restarted process cannot exceed the budget. Expired or unreadable
    /// budgets start a fresh window.
    #[must_use]
    pub fn with_store(limit: u32, window: Duration, store: Arc<dyn StateStore>) -> Self {
        let fresh = CallBudget::new(limit, window);
        let budget = match store.load_call_budget() {
            Ok(Some(saved)) => {
                let restored = CallBudget {
                    window_start: saved.window_start,
                    calls_made: saved.calls_made,
                    limit,
                    window_duration_ms: fresh.window_duration_ms,
                };
                if restored.is_expired_at(Utc::now()) {
                    fresh
                } else {
                    debug!(
                        "Restored call budget: {}/{} calls in current window",
                        restored.calls_made, limit
                    );
                    restored
                }
            }
            Ok(None) => fresh,
            Err(e) => {
                warn!("Failed to load call budget, starting fresh: {}", e);
                fresh
            }
        };

        Self {
            budget,
            store: Some(store),
        }
    }

    /// Returns true if a call may be made now, rolling an expired window over first.
    pub fn can_make_call(&mut self) -> bool {
        self.roll_over();
        self.budget.calls_made < self.budget.limit
    }

    /// Counts one accepted backend invocation.
    pub fn record_call(&mut self) {
        self.roll_over();
        self.budget.calls_made = self.budget.calls_made.saturating_add(1);
        debug!(
            "Recorded call {}/{}",
            self.budget.calls_made, self.budget.limit
        );
        self.persist();
    }

    /// Calls still available in the current window.
    #[must_use]
    pub fn calls_remaining(&self) -> u32 {
        if self.budget.is_expired_at(Utc::now()) {
            self.budget.limit
        } else {
            self.budget.remaining_calls()
        }
    }

    /// Calls made in the current window.
    #[must_use]
    pub fn calls_made(&self) -> u32 {
        if self.budget.is_expired_at(Utc::now()) {
            0
        } else {
            self.budget.calls_made
        }
    }

    /// Time left until the window rolls over.
    #[must_use]
    pub fn time_until_reset(&self) -> Duration {
        self.budget.remaining_at(Utc::now())
    }

    /// Returns the underlying budget.
    #[must_use]
    pub fn budget(&self) -> &CallBudget {
        &self.budget
    }

    /// Returns current counters.
    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            calls_made: self.calls_made(),
            calls_remaining: self.calls_remaining(),
            limit: self.budget.limit,
            window_start: self.budget.window_start,
            resets_in_secs: self.time_until_reset().as_secs(),
        }
    }

    /// Error describing the exhausted budget.
    #[must_use]
    pub fn admission_denied(&self) -> RalphError {
        RalphError::AdmissionDenied {
            calls_made: self.budget.calls_made,
            limit: self.budget.limit,
            resets_in: self.time_until_reset(),
        }
    }

    /// Waits until a call can be made again.
    ///
    /// Returns [`RalphError::Cancelled`] if the token fires first. The budget
    /// is re-checked after every wake, so an early wake just sleeps again.
    pub async fn wait_for_reset(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(RalphError::Cancelled);
            }
            if self.can_make_call() {
                return Ok(());
            }

            let wait = self.time_until_reset();
            info!(
                "Call budget exhausted ({}/{}), waiting {}s for reset",
                self.budget.calls_made,
                self.budget.limit,
                wait.as_secs()
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RalphError::Cancelled),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn roll_over(&mut self) {
        if self.budget.roll_over_at(Utc::now()) {
            debug!("Call budget window rolled over");
            self.persist();
        }
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_call_budget(&self.budget) {
                warn!("Failed to persist call budget: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;
    use chrono::Duration as ChronoDuration;
    use std::time::Instant;

    #[test]
    fn test_budget_allows_up_to_limit() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(3600));
        assert!(limiter.can_make_call());
        limiter.record_call();
        assert!(limiter.can_make_call());
        limiter.record_call();
        assert!(!limiter.can_make_call());
        assert_eq!(limiter.calls_made(), 2);
        assert_eq!(limiter.calls_remaining(), 0);
    }

    #[test]
    fn test_zero_limit_never_admits() {
        let mut limiter = RateLimiter::new(0, Duration::from_secs(60));
        assert!(!limiter.can_make_call());
    }

    #[test]
    fn test_expired_window_rolls_over() {
        let mut budget = CallBudget::new(1, Duration::from_secs(60));
        budget.calls_made = 1;
        budget.window_start = Utc::now() - ChronoDuration::seconds(61);

        let mut limiter = RateLimiter {
            budget,
            store: None,
        };
        assert_eq!(limiter.calls_made(), 0);
        assert!(limiter.can_make_call());
        assert_eq!(limiter.budget().calls_made, 0);
    }

    #[test]
    fn test_future_window_start_is_not_expired() {
        let mut budget = CallBudget::new(5, Duration::from_secs(60));
        budget.window_start = Utc::now() + ChronoDuration::seconds(30);
        assert!(!budget.is_expired_at(Utc::now()));
        assert_eq!(budget.elapsed_at(Utc::now()), Duration::ZERO);
    }

    #[test]
    fn test_time_until_reset_is_bounded_by_window() {
        let limiter = RateLimiter::new(5, Duration::from_secs(10));
        assert!(limiter.time_until_reset() <= Duration::from_secs(10));
        assert!(limiter.time_until_reset() > Duration::from_secs(9));
    }

    #[test]
    fn test_admission_denied_error() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(3600));
        limiter.record_call();
        let err = limiter.admission_denied();
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("1/1"));
    }

    #[test]
    fn test_budget_persisted_and_restored() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let mut limiter = RateLimiter::with_store(3, Duration::from_secs(3600), store.clone());
        limiter.record_call();
        limiter.record_call();

        let restored = RateLimiter::with_store(3, Duration::from_secs(3600), store);
        assert_eq!(restored.calls_made(), 2);
        assert_eq!(restored.calls_remaining(), 1);
    }

    #[test]
    fn test_expired_stored_budget_starts_fresh() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let mut old = CallBudget::new(3, Duration::from_secs(60));
        old.calls_made = 3;
        old.window_start = Utc::now() - ChronoDuration::seconds(120);
        store.save_call_budget(&old).unwrap();

        let mut limiter = RateLimiter::with_store(3, Duration::from_secs(60), store);
        assert_eq!(limiter.calls_made(), 0);
        assert!(limiter.can_make_call());
    }

    #[test]
    fn test_stats_reports_counters() {
        let mut limiter = RateLimiter::new(4, Duration::from_secs(3600));
        limiter.record_call();
        let stats = limiter.stats();
        assert_eq!(stats.calls_made, 1);
        assert_eq!(stats.calls_remaining, 3);
        assert_eq!(stats.limit, 4);
    }

    #[tokio::test]
    async fn test_wait_for_reset_cancelled() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(3600));
        limiter.record_call();
        limiter.record_call();
        assert!(!limiter.can_make_call());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = limiter.wait_for_reset(&cancel).await;
        assert!(matches!(result, Err(RalphError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!limiter.can_make_call());
    }

    #[tokio::test]
    async fn test_wait_for_reset_returns_after_rollover() {
        let mut limiter = RateLimiter::new(1, Duration::from_millis(40));
        limiter.record_call();
        assert!(!limiter.can_make_call());

        let cancel = CancellationToken::new();
        limiter
            .wait_for_reset(&cancel)
            .await
            .expect("window should roll over");
        assert!(limiter.can_make_call());
    }

    #[tokio::test]
    async fn test_wait_for_reset_immediate_when_available() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        assert!(limiter.wait_for_reset(&cancel).await.is_ok());
    }
}
