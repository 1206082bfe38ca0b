//! RALPH_STATUS block parsing.
//!
//! The backend is asked to end each response with a block such as:
//!
//! ```text
//! ---RALPH_STATUS---
//! STATUS: COMPLETE
//! TASKS_COMPLETED_THIS_LOOP: 3
//! FILES_MODIFIED: 5
//! TESTS_STATUS: PASSING
//! WORK_TYPE: implementation
//! EXIT_SIGNAL: true
//! RECOMMENDATION: Review changes
//! ---END_RALPH_STATUS---
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{RalphError, Result};

/// Opening marker of a status block.
pub const STATUS_START_MARKER: &str = "---RALPH_STATUS---";

/// Closing marker of a status block.
pub const STATUS_END_MARKER: &str = "---END_RALPH_STATUS---";

/// Task status reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Complete,
    Blocked,
    InProgress,
    #[default]
    Unknown,
}

impl TaskStatus {
    /// Parses a STATUS value. Unrecognized values map to `Unknown`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "COMPLETE" => Self::Complete,
            "BLOCKED" => Self::Blocked,
            "IN_PROGRESS" => Self::InProgress,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "COMPLETE",
            Self::Blocked => "BLOCKED",
            Self::InProgress => "IN_PROGRESS",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed contents of a status block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: TaskStatus,
    pub tasks_completed: i64,
    pub files_modified: i64,
    pub tests_status: Option<String>,
    pub work_type: Option<String>,
    pub exit_signal: bool,
    pub recommendation: Option<String>,
}

impl StatusRecord {
    /// Files modified, clamped to zero.
    #[must_use]
    pub fn files_changed(&self) -> u32 {
        u32::try_from(self.files_modified.max(0)).unwrap_or(u32::MAX)
    }
}

/// Parses the status block out of `text`.
///
/// Both markers must be present with the end marker after the start marker;
/// otherwise the default (`Unknown`, zero-valued) record is returned.
#[must_use]
pub fn parse_ralph_status(text: &str) -> StatusRecord {
    let mut record = StatusRecord::default();

    let Some(start) = text.find(STATUS_START_MARKER) else {
        return record;
    };
    let body_start = start + STATUS_START_MARKER.len();
    let Some(end) = text[body_start..].find(STATUS_END_MARKER) else {
        return record;
    };
    let body = &text[body_start..body_start + end];

    for line in body.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "STATUS" => record.status = TaskStatus::parse(value),
            "TASKS_COMPLETED_THIS_LOOP" => {
                record.tasks_completed = parse_number(value).unwrap_or(0);
            }
            "FILES_MODIFIED" => record.files_modified = parse_number(value).unwrap_or(0),
            "TESTS_STATUS" => record.tests_status = Some(value.to_string()),
            "WORK_TYPE" => record.work_type = Some(value.to_string()),
            "EXIT_SIGNAL" => record.exit_signal = value.eq_ignore_ascii_case("true"),
            "RECOMMENDATION" => record.recommendation = Some(value.to_string()),
            _ => {}
        }
    }

    record
}

/// Parses a leading, optionally signed, integer and ignores what follows.
///
/// `"123 files"` gives 123; `""` and `"abc"` are errors.
pub fn parse_number(text: &str) -> Result<i64> {
    let invalid = || RalphError::InvalidNumber {
        input: text.to_string(),
    };

    let trimmed = text.trim_start();
    let sign_len = usize::from(trimmed.starts_with(['-', '+']));
    let digits_len = trimmed[sign_len..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();

    if digits_len == 0 {
        return Err(invalid());
    }

    trimmed[..sign_len + digits_len]
        .parse::<i64>()
        .map_err(|_| invalid())
}
