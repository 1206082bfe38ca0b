//! Response analysis for backend output.
//!
//! Everything here is a pure function of the output text (plus the exit
//! signals already seen). The controller turns the resulting
//! [`AnalysisResult`] into stop/continue decisions and breaker updates.
//!
//! - [`status`] - RALPH_STATUS block parsing
//! - [`heuristics`] - format, keyword and error-line detection
//!
//! # Confidence bands
//!
//! | Status                     | Confidence   |
//! |----------------------------|--------------|
//! | BLOCKED                    | 0.05 - 0.15  |
//! | IN_PROGRESS / UNKNOWN      | 0.40 - 0.60  |
//! | COMPLETE                   | 0.70 - 0.80  |
//! | COMPLETE + EXIT_SIGNAL     | 0.85 - 1.00  |
//!
//! Error lines lower non-blocked scores by 0.1; a repeated exit signal adds
//! 0.05. The result is always clamped to `[0, 1]`.

pub mod heuristics;
pub mod status;

pub use heuristics::{detect_completion_keywords, detect_format, extract_errors, OutputFormat};
pub use status::{
    parse_number, parse_ralph_status, StatusRecord, TaskStatus, STATUS_END_MARKER,
    STATUS_START_MARKER,
};

use serde::{Deserialize, Serialize};

/// Keyword hits beyond this add nothing to confidence.
const KEYWORD_CAP: usize = 5;

/// Confidence at or above which a COMPLETE status ends the loop.
pub const COMPLETION_CONFIDENCE: f64 = 0.9;

/// Signals extracted from one backend response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub format: OutputFormat,
    pub status: StatusRecord,
    pub has_errors: bool,
    pub error_lines: Vec<String>,
    pub completion_keywords: usize,
    pub exit_signal: bool,
    pub confidence: f64,
}

impl AnalysisResult {
    /// Returns true if the backend reported completion with high confidence.
    #[must_use]
    pub fn is_confident_completion(&self) -> bool {
        self.status.status == TaskStatus::Complete && self.confidence >= COMPLETION_CONFIDENCE
    }
}

/// Analyzes one backend response.
///
/// `seen_exit_signals` are markers recorded for earlier loops; when one
/// exists and this response signals exit again, confidence is nudged up.
#[must_use]
pub fn analyze(text: &str, seen_exit_signals: &[String]) -> AnalysisResult {
    let format = detect_format(text);
    let status = parse_ralph_status(text);
    let completion_keywords = detect_completion_keywords(text);
    let error_lines = extract_errors(text);

    let has_errors = !error_lines.is_empty() || status.status == TaskStatus::Blocked;
    let exit_signal = status.exit_signal;

    let mut confidence = calculate_confidence(&status, completion_keywords, text);
    if exit_signal && !seen_exit_signals.is_empty() {
        confidence = (confidence + 0.05).clamp(0.0, 1.0);
    }

    AnalysisResult {
        format,
        status,
        has_errors,
        error_lines,
        completion_keywords,
        exit_signal,
        confidence,
    }
}

/// Scores how likely the task is genuinely finished.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn calculate_confidence(status: &StatusRecord, keyword_count: usize, text: &str) -> f64 {
    let keywords = keyword_count.min(KEYWORD_CAP) as f64;

    let base = match status.status {
        TaskStatus::Blocked => return (0.05 + 0.02 * keywords).clamp(0.0, 1.0),
        TaskStatus::Complete if status.exit_signal => 0.85 + 0.03 * keywords,
        TaskStatus::Complete => 0.7 + 0.02 * keywords,
        TaskStatus::InProgress | TaskStatus::Unknown => 0.4 + 0.04 * keywords,
    };

    let penalty = if extract_errors(text).is_empty() { 0.0 } else { 0.1 };
    (base - penalty).clamp(0.0, 1.0)
}
