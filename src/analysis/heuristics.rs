//! Text heuristics over backend output.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Overall shape of a backend payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Starts with a JSON object or array.
    Structured,
    /// Anything else.
    Freeform,
}

/// Classifies the payload by its first non-whitespace character.
#[must_use]
pub fn detect_format(text: &str) -> OutputFormat {
    match text.trim_start().chars().next() {
        Some('{' | '[') => OutputFormat::Structured,
        _ => OutputFormat::Freeform,
    }
}

fn completion_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\bdone\b",
            r"(?i)\bcomplete\b",
            r"(?i)\bcompleted\b",
            r"(?i)\bfinished\b",
            r"(?i)\ball set\b",
            r"(?i)\bready to \w+",
            r"(?i)\bnothing to do\b",
            r"(?i)\bno more work\b",
            r"(?i)\btask complete\b",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Counts completion phrases. Overlapping phrases each count.
#[must_use]
pub fn detect_completion_keywords(text: &str) -> usize {
    completion_patterns()
        .iter()
        .map(|re| re.find_iter(text).count())
        .sum()
}

fn exception_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bexception\b").ok())
        .as_ref()
}

fn structured_field_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    // "is_error": false / is_error = false / error_count: 0
    RE.get_or_init(|| {
        Regex::new(r#"^[\s{,\[]*(?:"([^"]+)"|([A-Za-z0-9]+[_.-][A-Za-z0-9_.-]+))\s*[:=]"#).ok()
    })
    .as_ref()
}

/// Returns true if the line is a key/value pair whose key names an error field.
fn is_structured_error_field(line: &str) -> bool {
    let Some(re) = structured_field_regex() else {
        return false;
    };
    re.captures(line)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|key| {
            let key = key.as_str().to_ascii_lowercase();
            key.contains("error") || key.contains("exception")
        })
        .unwrap_or(false)
}

/// Collects lines that look like error reports.
///
/// A line qualifies when it starts with `error:` or `fatal:` (any case) or
/// contains the word `exception`. Payload fields such as `"is_error": false`
/// are not error reports and are skipped.
#[must_use]
pub fn extract_errors(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !is_structured_error_field(line))
        .filter(|line| {
            let lower = line.to_ascii_lowercase();
            lower.starts_with("error:")
                || lower.starts_with("fatal:")
                || exception_regex().is_some_and(|re| re.is_match(line))
        })
        .map(ToString::to_string)
        .collect()
}
