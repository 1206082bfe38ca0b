//! Circuit breaker for the control loop.
//!
//! Separates hard failures (execution errors) from soft stagnation (loops
//! that change no files) so that a crashing backend halts fast while a
//! backend that is still thinking gets a few loops of grace.
//!
//! ```text
//!            window full of no-change loops
//!   CLOSED ──────────────────────────────────> HALF_OPEN
//!     ^  <────────── files changed ──────────     │
//!     │                                           │ escalation reached
//!     │ reset()                                   v
//!     └──────────────────────────────────────── OPEN
//!        (threshold consecutive errors from any state)
//! ```

mod breaker;
mod types;

pub use breaker::CircuitBreaker;
pub use types::{
    BreakerConfig, BreakerSnapshot, BreakerState, BreakerStats, Outcome, BREAKER_STATE_VERSION,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_WINDOW_SIZE, MIN_BREAKER_STATE_VERSION,
};
