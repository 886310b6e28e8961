//! Shared utility functions used across the codebase.

/// Parse a boolean-ish string.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// everything else maps to `false`.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

/// Collapse every run of whitespace into a single space and trim the ends.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Take at most `max_chars` characters from `text`.
///
/// Counts `char`s rather than bytes so multi-byte text is never split inside
/// a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Truncate `text` to `max_chars` characters, appending `marker` when
/// anything was cut.
pub fn truncate_with_marker(text: &str, max_chars: usize, marker: &str) -> String {
    let truncated = truncate_chars(text, max_chars);
    if truncated.len() == text.len() {
        text.to_string()
    } else {
        format!("{}{}", truncated, marker)
    }
}
