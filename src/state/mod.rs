//! Durable state for the control loop.
//!
//! The loop persists four things between process restarts: the circuit
//! breaker snapshot, the exit-signal markers already acted upon, the call
//! budget for the current window, and the backend session id. All of it goes
//! through the [`StateStore`] port so the controller never touches the
//! filesystem directly.
//!
//! # Backends
//!
//! - [`FileStateStore`]: JSON files under `<project>/.ralph/`, written
//!   atomically (temp file, fsync, rename) under an `fs2` lock.
//! - [`MemoryStateStore`]: in-process storage for tests and embedding.

mod memory;
mod persistence;

pub use memory::MemoryStateStore;
pub use persistence::{
    FileStateStore, BREAKER_FILE, CALL_BUDGET_FILE, EXIT_SIGNALS_FILE, SESSION_ID_FILE,
    STATE_DIR,
};

use crate::circuit::BreakerSnapshot;
use crate::error::Result;
use crate::r#loop::rate_limiter::CallBudget;

/// Storage port for loop state.
///
/// Loads return `Ok(None)` (or an empty list) when nothing has been stored.
/// Implementations must make every save atomic: a reader never observes a
/// partially written value.
pub trait StateStore: Send + Sync {
    /// Loads the persisted breaker snapshot.
    fn load_breaker(&self) -> Result<Option<BreakerSnapshot>>;

    /// Persists the breaker snapshot.
    fn save_breaker(&self, snapshot: &BreakerSnapshot) -> Result<()>;

    /// Loads exit-signal markers recorded so far, oldest first.
    fn load_exit_signals(&self) -> Result<Vec<String>>;

    /// Replaces the recorded exit-signal markers.
    fn save_exit_signals(&self, signals: &[String]) -> Result<()>;

    /// Loads the call budget of the last window.
    fn load_call_budget(&self) -> Result<Option<CallBudget>>;

    /// Persists the call budget.
    fn save_call_budget(&self, budget: &CallBudget) -> Result<()>;

    /// Loads the backend session id, if one was saved.
    fn load_session_id(&self) -> Result<Option<String>>;

    /// Persists the backend session id.
    fn save_session_id(&self, session_id: &str) -> Result<()>;

    /// Forgets the backend session id.
    fn clear_session_id(&self) -> Result<()>;
}
