//! Project context: prompt, fix plan, and the per-loop context header.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{RalphError, Result};

/// Default prompt file.
pub const DEFAULT_PROMPT_FILE: &str = "PROMPT.md";

/// Default task list file.
pub const DEFAULT_PLAN_FILE: &str = "@fix_plan.md";

/// Remaining tasks listed in the loop context header.
pub const MAX_CONTEXT_TASKS: usize = 5;

/// Files whose presence marks a project root.
const ROOT_MARKERS: [&str; 4] = [DEFAULT_PROMPT_FILE, DEFAULT_PLAN_FILE, "@AGENT.md", ".git"];

/// A checklist item from the fix plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTask {
    pub text: String,
    pub completed: bool,
}

impl PlanTask {
    #[must_use]
    pub fn new(text: impl Into<String>, completed: bool) -> Self {
        Self {
            text: text.into(),
            completed,
        }
    }
}

/// Supplies the prompt and task list for each loop.
pub trait ContextProvider: Send + Sync {
    /// Returns the base prompt.
    ///
    /// # Errors
    ///
    /// Returns [`RalphError::Context`] if the prompt cannot be read.
    fn prompt(&self) -> Result<String>;

    /// Returns the current task list.
    ///
    /// # Errors
    ///
    /// Returns [`RalphError::Context`] if the task list cannot be read.
    fn load_tasks(&self) -> Result<Vec<PlanTask>>;
}

/// Reads `PROMPT.md` and `@fix_plan.md` from a project directory.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    root: PathBuf,
    prompt_file: PathBuf,
    plan_file: PathBuf,
}

impl ProjectContext {
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            prompt_file: PathBuf::from(DEFAULT_PROMPT_FILE),
            plan_file: PathBuf::from(DEFAULT_PLAN_FILE),
        }
    }

    /// Overrides the prompt file (relative paths resolve against the root).
    #[must_use]
    pub fn with_prompt_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.prompt_file = path.into();
        self
    }

    /// Overrides the plan file (relative paths resolve against the root).
    #[must_use]
    pub fn with_plan_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.plan_file = path.into();
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn prompt_path(&self) -> PathBuf {
        self.root.join(&self.prompt_file)
    }

    #[must_use]
    pub fn plan_path(&self) -> PathBuf {
        self.root.join(&self.plan_file)
    }

    /// Checks that both the prompt and the plan exist.
    ///
    /// # Errors
    ///
    /// Returns [`RalphError::MissingFile`] for the first file not found.
    pub fn validate(&self) -> Result<()> {
        for path in [self.prompt_path(), self.plan_path()] {
            if !path.is_file() {
                return Err(RalphError::MissingFile { path });
            }
        }
        Ok(())
    }

    fn read(path: &Path) -> Result<String> {
        fs::read_to_string(path)
            .map_err(|e| RalphError::context(format!("failed to read {}: {e}", path.display())))
    }
}

impl ContextProvider for ProjectContext {
    fn prompt(&self) -> Result<String> {
        Self::read(&self.prompt_path())
    }

    fn load_tasks(&self) -> Result<Vec<PlanTask>> {
        Ok(parse_plan(&Self::read(&self.plan_path())?))
    }
}

/// Walks up from `start` to the first directory containing a project marker.
#[must_use]
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| ROOT_MARKERS.iter().any(|marker| dir.join(marker).exists()))
        .map(Path::to_path_buf)
}

fn checkbox_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[-*]\s+\[([ xX])\]\s+(.+)$").ok())
        .as_ref()
}

/// Extracts checklist items (`- [ ] task`, `- [x] task`) from plan markdown.
#[must_use]
pub fn parse_plan(content: &str) -> Vec<PlanTask> {
    let Some(re) = checkbox_regex() else {
        return Vec::new();
    };

    content
        .lines()
        .filter_map(|line| re.captures(line.trim()))
        .map(|caps| PlanTask::new(caps[2].trim(), &caps[1] != " "))
        .collect()
}

/// Returns true if no task is left unchecked. An empty plan counts as done.
#[must_use]
pub fn all_complete(tasks: &[PlanTask]) -> bool {
    tasks.iter().all(|t| t.completed)
}

/// Texts of unchecked tasks, in plan order.
#[must_use]
pub fn remaining_tasks(tasks: &[PlanTask]) -> Vec<String> {
    tasks
        .iter()
        .filter(|t| !t.completed)
        .map(|t| t.text.clone())
        .collect()
}

/// Builds the header prepended to the prompt on every loop.
#[must_use]
pub fn build_loop_context(
    loop_number: u32,
    breaker_state: &str,
    remaining: &[String],
    previous_summary: &str,
) -> String {
    let mut ctx = String::from("\n--- RALPH LOOP CONTEXT ---\n");
    ctx.push_str(&format!("Loop: {loop_number}\n"));
    ctx.push_str(&format!("Circuit Breaker: {breaker_state}\n"));

    if !remaining.is_empty() {
        ctx.push_str("\nRemaining Tasks:\n");
        for (i, task) in remaining.iter().take(MAX_CONTEXT_TASKS).enumerate() {
            ctx.push_str(&format!("  {}. {}\n", i + 1, task));
        }
        if remaining.len() > MAX_CONTEXT_TASKS {
            ctx.push_str(&format!(
                "  ... and {} more\n",
                remaining.len() - MAX_CONTEXT_TASKS
            ));
        }
    }

    if !previous_summary.is_empty() {
        ctx.push_str(&format!("\nPrevious Loop Summary:\n{previous_summary}\n"));
    }

    ctx.push_str("--- END LOOP CONTEXT ---\n\n");
    ctx
}

/// Prepends the loop context to the prompt.
#[must_use]
pub fn inject_context(prompt: &str, context: &str) -> String {
    format!("{context}{prompt}")
}
