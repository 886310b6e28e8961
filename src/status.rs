//! Heuristic status detection over raw agent output.
//!
//! The agent does not report a structured status we can rely on, so the
//! classifier looks for keywords. `completed` and `error` can both be set for
//! the same text; callers decide precedence. The helpers here treat a
//! non-zero exit code as an error no matter what the output says, and only
//! consult the classifier to detect completion despite a non-zero code or an
//! error despite a zero code.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::executor::ExecutionResult;

const COMPLETION_WORDS: &[&str] = &["completed", "done", "success", "finished"];
const ERROR_WORDS: &[&str] = &["error", "failed", "exception", "fatal"];
const CONFIRMATION_WORDS: &[&str] = &["approve", "confirm", "review", "permission"];

/// Number of characters kept in [`OutputStatus::summary`].
pub const SUMMARY_CHARS: usize = 200;

static PROGRESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:progress|step|working|processing)[:\s]+(.+)").unwrap()
});

/// Status inferred from agent output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputStatus {
    pub completed: bool,
    pub error: bool,
    pub needs_confirmation: bool,
    pub progress: Vec<String>,
    pub summary: String,
}

fn contains_any(haystack: &str, words: &[&str]) -> bool {
    words.iter().any(|w| haystack.contains(w))
}

/// Classify raw output text.
pub fn classify(output: &str) -> OutputStatus {
    let lower = output.to_lowercase();

    let progress = PROGRESS_PATTERN
        .find_iter(output)
        .map(|m| m.as_str().trim().to_string())
        .collect();

    let summary: String = output
        .chars()
        .take(SUMMARY_CHARS)
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect();

    OutputStatus {
        completed: contains_any(&lower, COMPLETION_WORDS),
        error: contains_any(&lower, ERROR_WORDS),
        needs_confirmation: contains_any(&lower, CONFIRMATION_WORDS),
        progress,
        summary: summary.trim().to_string(),
    }
}

/// Stdout if it has anything, otherwise stderr.
pub fn primary_output(result: &ExecutionResult) -> &str {
    if result.stdout.is_empty() {
        &result.stderr
    } else {
        &result.stdout
    }
}

/// Whether a task finished.
///
/// A zero exit code always counts as completed. Otherwise the output is
/// checked for completion keywords.
pub fn is_task_completed(result: Option<&ExecutionResult>) -> bool {
    let Some(result) = result else {
        return false;
    };
    if result.code == Some(0) {
        return true;
    }
    classify(primary_output(result)).completed
}

/// Whether a task should be reported as failed.
///
/// Missing results and non-zero exit codes are always errors. A zero exit
/// code is an error only if the output mentions one.
pub fn has_task_error(result: Option<&ExecutionResult>) -> bool {
    let Some(result) = result else {
        return true;
    };
    if result.code != Some(0) {
        return true;
    }
    classify(primary_output(result)).error
}
