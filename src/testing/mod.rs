//! Testing infrastructure.
//!
//! Test doubles for the controller's collaborators, so the loop can be
//! exercised without spawning a backend or touching the filesystem.
//!
//! # Example
//!
//! ```rust,ignore
//! use ralph_codex::testing::{MemoryStateStore, MockBackendRunner, MockContextProvider};
//!
//! let runner = MockBackendRunner::new().with_output("done");
//! let context = MockContextProvider::new("Build it");
//! let store = MemoryStateStore::new();
//! ```

pub mod mocks;

pub use crate::state::MemoryStateStore;
pub use mocks::{FailingStateStore, MockBackendRunner, MockContextProvider};
