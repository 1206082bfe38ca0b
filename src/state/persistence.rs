//! File-backed state store with atomic writes.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::StateStore;
use crate::circuit::BreakerSnapshot;
use crate::error::{RalphError, Result};
use crate::r#loop::rate_limiter::CallBudget;

/// Directory under the project root that holds loop state.
pub const STATE_DIR: &str = ".ralph";

/// Circuit breaker snapshot file.
pub const BREAKER_FILE: &str = "circuit_breaker.json";

/// Exit-signal marker file.
pub const EXIT_SIGNALS_FILE: &str = "exit_signals.json";

/// Call budget file.
pub const CALL_BUDGET_FILE: &str = "call_budget.json";

/// Backend session id file (plain text).
pub const SESSION_ID_FILE: &str = "session_id";

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file suffix for concurrent access prevention.
const LOCK_SUFFIX: &str = ".lock";

/// State store writing one file per concern under a state directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Creates a store rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Creates a store at `<project>/.ralph`.
    #[must_use]
    pub fn for_project(project_dir: impl AsRef<Path>) -> Self {
        Self::new(project_dir.as_ref().join(STATE_DIR))
    }

    /// Returns the state directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of a state file.
    #[must_use]
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}{LOCK_SUFFIX}"))
    }

    /// Writes `contents` to `name` via temp file, fsync and rename.
    fn write_atomic(&self, name: &str, what: &str, contents: &[u8]) -> Result<()> {
        let to_err = |e: std::io::Error| RalphError::persistence(what, e.to_string());

        fs::create_dir_all(&self.dir).map_err(to_err)?;

        let lock_file = File::create(self.lock_path(name)).map_err(to_err)?;
        FileExt::lock_exclusive(&lock_file)
            .map_err(|e| RalphError::persistence(what, format!("failed to acquire lock: {e}")))?;

        let tmp_path = self.dir.join(format!("{name}{TMP_SUFFIX}"));
        let mut tmp_file = File::create(&tmp_path).map_err(to_err)?;
        tmp_file.write_all(contents).map_err(to_err)?;
        tmp_file.sync_all().map_err(to_err)?;

        fs::rename(&tmp_path, self.file_path(name)).map_err(to_err)?;
        debug!("Persisted {} to {}", what, self.file_path(name).display());

        Ok(())
    }

    /// Reads `name` under a shared lock. Missing file yields `None`.
    fn read_locked(&self, name: &str, what: &str) -> Result<Option<String>> {
        let to_err = |e: std::io::Error| RalphError::persistence(what, e.to_string());
        let path = self.file_path(name);

        if !path.exists() {
            return Ok(None);
        }

        let lock_path = self.lock_path(name);
        let _lock = if lock_path.exists() {
            let lock_file = File::open(&lock_path).map_err(to_err)?;
            FileExt::lock_shared(&lock_file).map_err(|e| {
                RalphError::persistence(what, format!("failed to acquire lock: {e}"))
            })?;
            Some(lock_file)
        } else {
            None
        };

        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(to_err(e)),
        };

        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(to_err)?;
        Ok(Some(contents))
    }

    fn save_json<T: Serialize>(&self, name: &str, what: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| RalphError::persistence(what, e.to_string()))?;
        self.write_atomic(name, what, json.as_bytes())
    }

    /// Loads a JSON file; a corrupt file is deleted and treated as absent.
    fn load_json<T: DeserializeOwned>(&self, name: &str, what: &str) -> Result<Option<T>> {
        let Some(contents) = self.read_locked(name, what)? else {
            return Ok(None);
        };

        match serde_json::from_str(&contents) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                let path = self.file_path(name);
                warn!(
                    "Corrupted {} file at {}: {}. Deleting and starting fresh.",
                    what,
                    path.display(),
                    e
                );
                let _ = fs::remove_file(&path);
                Ok(None)
            }
        }
    }
}

impl StateStore for FileStateStore {
    fn load_breaker(&self) -> Result<Option<BreakerSnapshot>> {
        let Some(snapshot) = self.load_json::<BreakerSnapshot>(BREAKER_FILE, "breaker state")?
        else {
            return Ok(None);
        };

        if !snapshot.is_compatible_version() {
            warn!(
                "Incompatible breaker state version {} (supported: {}). Starting fresh.",
                snapshot.version,
                crate::circuit::BREAKER_STATE_VERSION
            );
            let _ = fs::remove_file(self.file_path(BREAKER_FILE));
            return Ok(None);
        }

        Ok(Some(snapshot))
    }

    fn save_breaker(&self, snapshot: &BreakerSnapshot) -> Result<()> {
        self.save_json(BREAKER_FILE, "breaker state", snapshot)
    }

    fn load_exit_signals(&self) -> Result<Vec<String>> {
        Ok(self
            .load_json::<Vec<String>>(EXIT_SIGNALS_FILE, "exit signals")?
            .unwrap_or_default())
    }

    fn save_exit_signals(&self, signals: &[String]) -> Result<()> {
        self.save_json(EXIT_SIGNALS_FILE, "exit signals", &signals)
    }

    fn load_call_budget(&self) -> Result<Option<CallBudget>> {
        self.load_json(CALL_BUDGET_FILE, "call budget")
    }

    fn save_call_budget(&self, budget: &CallBudget) -> Result<()> {
        self.save_json(CALL_BUDGET_FILE, "call budget", budget)
    }

    fn load_session_id(&self) -> Result<Option<String>> {
        let contents = self.read_locked(SESSION_ID_FILE, "session id")?;
        Ok(contents
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    fn save_session_id(&self, session_id: &str) -> Result<()> {
        self.write_atomic(SESSION_ID_FILE, "session id", session_id.trim().as_bytes())
    }

    fn clear_session_id(&self) -> Result<()> {
        let path = self.file_path(SESSION_ID_FILE);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RalphError::persistence("session id", e.to_string())),
        }
    }
}
