//! Codex CLI backend.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::events::{thread_id, BackendEvent};
use super::{BackendOutput, BackendRunner, EventCallback};
use crate::error::{RalphError, Result};
use crate::state::StateStore;

/// Default executable name.
pub const DEFAULT_CODEX_BINARY: &str = "codex";

/// Stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 5;

/// Runs `codex exec --json` as a subprocess.
///
/// The prompt is written to stdin and the JSONL event stream is read from
/// stdout. The thread id from `thread.started` is saved through the state
/// store and passed back as `resume <id>` on the next run. The child is
/// killed if the run future is dropped.
pub struct CodexCliRunner {
    binary: String,
    base_args: Vec<String>,
    working_dir: PathBuf,
    store: Arc<dyn StateStore>,
}

impl std::fmt::Debug for CodexCliRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodexCliRunner")
            .field("binary", &self.binary)
            .field("base_args", &self.base_args)
            .field("working_dir", &self.working_dir)
            .finish_non_exhaustive()
    }
}

impl CodexCliRunner {
    /// Creates a runner executing `codex` in `working_dir`.
    #[must_use]
    pub fn new(working_dir: impl AsRef<Path>, store: Arc<dyn StateStore>) -> Self {
        Self {
            binary: DEFAULT_CODEX_BINARY.to_string(),
            base_args: Vec::new(),
            working_dir: working_dir.as_ref().to_path_buf(),
            store,
        }
    }

    /// Uses a different executable name or path.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Arguments placed before the codex arguments (e.g. a wrapper script).
    #[must_use]
    pub fn with_base_args(mut self, args: Vec<String>) -> Self {
        self.base_args = args;
        self
    }

    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Builds the argument list for a run.
    #[must_use]
    pub fn build_args(&self, session_id: Option<&str>) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.extend(
            ["exec", "--json", "--skip-git-repo-check"]
                .iter()
                .map(ToString::to_string),
        );
        if let Some(id) = session_id {
            args.push("resume".to_string());
            args.push(id.to_string());
        }
        args
    }

    fn resolve_binary(&self) -> Result<PathBuf> {
        which::which(&self.binary).map_err(|_| RalphError::MissingTool {
            tool: self.binary.clone(),
        })
    }

    fn current_session(&self) -> Option<String> {
        match self.store.load_session_id() {
            Ok(id) => id,
            Err(e) => {
                warn!("Failed to load Codex session id: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl BackendRunner for CodexCliRunner {
    fn name(&self) -> &str {
        "codex"
    }

    async fn run(&self, prompt: &str, on_event: EventCallback<'_>) -> Result<BackendOutput> {
        let program = self.resolve_binary()?;
        let session = self.current_session();
        let args = self.build_args(session.as_deref());
        debug!("Executing: {} {}", program.display(), args.join(" "));

        let mut child = Command::new(&program)
            .args(&args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RalphError::backend(self.name(), format!("failed to spawn: {e}")))?;

        // Feed stdin while stdout is read so neither side blocks on a full pipe.
        let stdin_task = child.stdin.take().map(|mut stdin| {
            let prompt = prompt.to_owned();
            tokio::spawn(async move {
                stdin.write_all(prompt.as_bytes()).await?;
                stdin.flush().await
            })
        });

        // Drain stderr concurrently so a chatty child cannot block on a full pipe.
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RalphError::backend(self.name(), "stdout not captured"))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut messages: Vec<String> = Vec::new();
        let mut raw = String::new();
        let mut thread: Option<String> = None;

        while let Some(line) = lines.next_line().await? {
            raw.push_str(&line);
            raw.push('\n');

            let Ok(value) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
                continue;
            };
            if let Some(id) = thread_id(&value) {
                thread = Some(id);
            }
            if let Some(event) = BackendEvent::from_json(&value) {
                if let BackendEvent::Message { text } = &event {
                    messages.push(text.clone());
                }
                on_event(event);
            }
        }

        let status = child.wait().await?;
        if let Some(task) = stdin_task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Codex did not read the whole prompt: {}", e),
                Err(e) => warn!("Prompt writer task failed: {}", e),
            }
        }
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            let tail: Vec<&str> = stderr.lines().rev().take(STDERR_TAIL_LINES).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(RalphError::backend(
                self.name(),
                format!("exited with {status}: {}", tail.join(" | ")),
            ));
        }

        if let Some(id) = &thread {
            if let Err(e) = self.store.save_session_id(id) {
                warn!("Failed to save Codex session id: {}", e);
            }
        }

        let message = messages.join("\n").trim().to_string();
        let output = if message.is_empty() {
            raw.trim().to_string()
        } else {
            message
        };

        Ok(BackendOutput {
            output,
            session_id: thread,
        })
    }

    async fn new_session(&self) -> Result<()> {
        debug!("Discarding Codex session");
        self.store.clear_session_id()
    }
}
