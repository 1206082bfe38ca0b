//! In-memory state store.

use std::sync::{Mutex, MutexGuard};

use super::StateStore;
use crate::circuit::BreakerSnapshot;
use crate::error::{RalphError, Result};
use crate::r#loop::rate_limiter::CallBudget;

#[derive(Debug, Default)]
struct Slots {
    breaker: Option<BreakerSnapshot>,
    exit_signals: Vec<String>,
    call_budget: Option<CallBudget>,
    session_id: Option<String>,
}

/// State store that keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    slots: Mutex<Slots>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> Result<MutexGuard<'_, Slots>> {
        self.slots
            .lock()
            .map_err(|_| RalphError::persistence("memory state", "lock poisoned"))
    }
}

impl StateStore for MemoryStateStore {
    fn load_breaker(&self) -> Result<Option<BreakerSnapshot>> {
        Ok(self.slots()?.breaker.clone())
    }

    fn save_breaker(&self, snapshot: &BreakerSnapshot) -> Result<()> {
        self.slots()?.breaker = Some(snapshot.clone());
        Ok(())
    }

    fn load_exit_signals(&self) -> Result<Vec<String>> {
        Ok(self.slots()?.exit_signals.clone())
    }

    fn save_exit_signals(&self, signals: &[String]) -> Result<()> {
        self.slots()?.exit_signals = signals.to_vec();
        Ok(())
    }

    fn load_call_budget(&self) -> Result<Option<CallBudget>> {
        Ok(self.slots()?.call_budget.clone())
    }

    fn save_call_budget(&self, budget: &CallBudget) -> Result<()> {
        self.slots()?.call_budget = Some(budget.clone());
        Ok(())
    }

    fn load_session_id(&self) -> Result<Option<String>> {
        Ok(self.slots()?.session_id.clone())
    }

    fn save_session_id(&self, session_id: &str) -> Result<()> {
        self.slots()?.session_id = Some(session_id.to_string());
        Ok(())
    }

    fn clear_session_id(&self) -> Result<()> {
        self.slots()?.session_id = None;
        Ok(())
    }
}
