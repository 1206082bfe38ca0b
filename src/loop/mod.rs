//! Loop control.
//!
//! - [`controller`] - Main loop that sequences gates, backend calls and analysis
//! - [`rate_limiter`] - Call budget per rolling window
//! - [`context`] - Prompt, fix plan and per-loop context header
//! - [`events`] - Status updates and log events for observers
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐     ┌──────────────┐     ┌────────────────┐
//! │ LoopController │────>│ RateLimiter  │     │ CircuitBreaker │
//! │                │────────────────────────> │                │
//! └────────────────┘     └──────────────┘     └────────────────┘
//!       │        │
//!       v        v
//! ┌───────────┐ ┌─────────────────┐
//! │ Backend   │ │ ContextProvider │
//! │ Runner    │ │                 │
//! └───────────┘ └─────────────────┘
//! ```

pub mod context;
pub mod controller;
pub mod events;
pub mod rate_limiter;

pub use context::{ContextProvider, PlanTask, ProjectContext};
pub use controller::{ControllerStats, LoopController, LoopHandle, LoopSession};
pub use events::{EventSink, LogLevel, LoopEvent, LoopStatus};
pub use rate_limiter::{CallBudget, RateLimiter, RateLimiterStats};
