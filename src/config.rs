//! Loop configuration.
//!
//! Settings are read from `<project>/.ralph/settings.json` when present and
//! otherwise default. CLI flags override individual values afterwards.
//!
//! ```json
//! {
//!   "maxCallsPerHour": 50,
//!   "backendTimeoutSecs": 900,
//!   "failureThreshold": 4,
//!   "promptFile": "PROMPT.md"
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit::BreakerConfig;
use crate::error::{RalphError, Result};
use crate::r#loop::context::{DEFAULT_PLAN_FILE, DEFAULT_PROMPT_FILE};
use crate::state::STATE_DIR;

/// Settings file name inside the state directory.
pub const SETTINGS_FILE: &str = "settings.json";

fn default_max_calls() -> u32 {
    100
}

fn default_rate_window_secs() -> u64 {
    3600
}

fn default_backend_timeout_secs() -> u64 {
    600
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_stagnation_window() -> usize {
    5
}

fn default_summary_chars() -> usize {
    200
}

fn default_pause_poll_ms() -> u64 {
    100
}

fn default_prompt_file() -> String {
    DEFAULT_PROMPT_FILE.to_string()
}

fn default_plan_file() -> String {
    DEFAULT_PLAN_FILE.to_string()
}

fn default_backend_binary() -> String {
    crate::backend::codex::DEFAULT_CODEX_BINARY.to_string()
}

/// Tunables for one loop session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    /// Backend calls allowed per rate window.
    #[serde(default = "default_max_calls")]
    pub max_calls_per_hour: u32,

    /// Rate window length in seconds.
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,

    /// Loop iterations before stopping; defaults to `max_calls_per_hour`.
    #[serde(default)]
    pub max_loops: Option<u32>,

    /// Per-call backend timeout in seconds.
    #[serde(default = "default_backend_timeout_secs")]
    pub backend_timeout_secs: u64,

    /// Consecutive failures that open the circuit breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Loops inspected for stagnation.
    #[serde(default = "default_stagnation_window")]
    pub stagnation_window: usize,

    /// Stagnant loops tolerated while half-open; defaults to `failure_threshold`.
    #[serde(default)]
    pub stagnation_escalation: Option<u32>,

    /// Characters of output carried into the next loop's context.
    #[serde(default = "default_summary_chars")]
    pub summary_chars: usize,

    /// How often a paused loop checks for resume or cancellation.
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_interval_ms: u64,

    #[serde(default = "default_prompt_file")]
    pub prompt_file: String,

    #[serde(default = "default_plan_file")]
    pub plan_file: String,

    /// Executable used by the Codex runner.
    #[serde(default = "default_backend_binary")]
    pub backend_binary: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_calls_per_hour: default_max_calls(),
            rate_window_secs: default_rate_window_secs(),
            max_loops: None,
            backend_timeout_secs: default_backend_timeout_secs(),
            failure_threshold: default_failure_threshold(),
            stagnation_window: default_stagnation_window(),
            stagnation_escalation: None,
            summary_chars: default_summary_chars(),
            pause_poll_interval_ms: default_pause_poll_ms(),
            prompt_file: default_prompt_file(),
            plan_file: default_plan_file(),
            backend_binary: default_backend_binary(),
        }
    }
}

impl LoopConfig {
    /// Loads settings for a project, defaulting when no file exists.
    ///
    /// # Errors
    ///
    /// Returns [`RalphError::Config`] if the file exists but cannot be read or parsed.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = Self::settings_path(project_dir);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| RalphError::config_with_path(e.to_string(), path.clone()))?;
        serde_json::from_str(&content)
            .map_err(|e| RalphError::config_with_path(format!("failed to parse: {e}"), path))
    }

    /// Path of the settings file for a project.
    #[must_use]
    pub fn settings_path(project_dir: &Path) -> PathBuf {
        project_dir.join(STATE_DIR).join(SETTINGS_FILE)
    }

    // =========================================================================
    // Overrides
    // =========================================================================

    #[must_use]
    pub fn with_max_calls(mut self, calls: u32) -> Self {
        self.max_calls_per_hour = calls;
        self
    }

    #[must_use]
    pub fn with_backend_timeout_secs(mut self, secs: u64) -> Self {
        self.backend_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_max_loops(mut self, loops: u32) -> Self {
        self.max_loops = Some(loops);
        self
    }

    #[must_use]
    pub fn with_prompt_file(mut self, file: impl Into<String>) -> Self {
        self.prompt_file = file.into();
        self
    }

    #[must_use]
    pub fn with_rate_window(mut self, window: Duration) -> Self {
        self.rate_window_secs = window.as_secs();
        self
    }

    #[must_use]
    pub fn with_pause_poll_interval(mut self, interval: Duration) -> Self {
        self.pause_poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    // =========================================================================
    // Derived values
    // =========================================================================

    /// Effective iteration cap.
    #[must_use]
    pub fn effective_max_loops(&self) -> u32 {
        self.max_loops.unwrap_or(self.max_calls_per_hour)
    }

    #[must_use]
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    #[must_use]
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }

    #[must_use]
    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms)
    }

    /// Breaker thresholds derived from these settings.
    #[must_use]
    pub fn breaker_config(&self) -> BreakerConfig {
        let config = BreakerConfig::new(self.failure_threshold, self.stagnation_window);
        match self.stagnation_escalation {
            Some(escalation) => config.with_stagnation_escalation(escalation),
            None => config,
        }
    }

    /// Rejects values that would make the loop unusable.
    ///
    /// # Errors
    ///
    /// Returns [`RalphError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        let positive: [(&str, u64); 7] = [
            ("maxCallsPerHour", u64::from(self.max_calls_per_hour)),
            ("rateWindowSecs", self.rate_window_secs),
            ("maxLoops", u64::from(self.effective_max_loops())),
            ("backendTimeoutSecs", self.backend_timeout_secs),
            ("failureThreshold", u64::from(self.failure_threshold)),
            ("stagnationWindow", self.stagnation_window as u64),
            ("pausePollIntervalMs", self.pause_poll_interval_ms),
        ];

        for (field, value) in positive {
            if value == 0 {
                return Err(RalphError::invalid_config(field, "must be greater than zero"));
            }
        }

        if self.stagnation_escalation == Some(0) {
            return Err(RalphError::invalid_config(
                "stagnationEscalation",
                "must be greater than zero",
            ));
        }

        if self.prompt_file.trim().is_empty() {
            return Err(RalphError::invalid_config("promptFile", "must not be empty"));
        }
        if self.plan_file.trim().is_empty() {
            return Err(RalphError::invalid_config("planFile", "must not be empty"));
        }

        Ok(())
    }
}
