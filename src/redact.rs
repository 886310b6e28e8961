//! Redaction of credential-shaped substrings in captured agent output.

use std::sync::LazyLock;

use regex::Regex;

/// Replacement for anything that looks like an API key.
pub const REDACTED_PLACEHOLDER: &str = "[API_KEY_FILTERED]";

static SECRET_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sk-[A-Za-z0-9]{32,}").unwrap());

/// Replace every secret-shaped token in `text` with [`REDACTED_PLACEHOLDER`].
///
/// The placeholder itself never matches the pattern, so applying this twice
/// gives the same result as applying it once.
pub fn redact(text: &str) -> String {
    SECRET_PATTERN
        .replace_all(text, REDACTED_PLACEHOLDER)
        .into_owned()
}

/// Count secret-shaped tokens in `text`.
pub fn secret_count(text: &str) -> usize {
    SECRET_PATTERN.find_iter(text).count()
}
