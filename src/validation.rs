//! Input validation for untrusted task text.
//!
//! This is a denylist gate, not a sandbox: it rejects oversized input, shell
//! metacharacters and a handful of obviously destructive command shapes. The
//! agent still runs with whatever privileges the relay process has.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Maximum accepted input length, in characters.
pub const MAX_INPUT_CHARS: usize = 1000;

/// Characters that are never allowed in task text.
pub const FORBIDDEN_CHARS: &[char] = &[';', '&', '|', '`', '$', '<', '>'];

/// Dangerous command patterns (matched case-insensitively).
const DANGEROUS_PATTERNS: &[&str] = &[
    r"rm\s+-rf",
    r"sudo\s+",
    r"chmod\s+777",
    r">\s+/dev/",
    r"curl\s+.*\|",
    r"wget\s+.*\|",
];

static DANGEROUS_REGEXES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    DANGEROUS_PATTERNS
        .iter()
        .map(|pattern| {
            let regex = Regex::new(&format!("(?i){}", pattern))
                .expect("dangerous command patterns are valid regexes");
            (*pattern, regex)
        })
        .collect()
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("input too long ({len} characters, max {max})")]
    TooLong { len: usize, max: usize },

    #[error("forbidden character: {0}")]
    ForbiddenChar(char),

    #[error("dangerous command detected")]
    DangerousCommand { pattern: &'static str },
}

/// Gate applied to task text before it reaches the agent.
pub trait InputValidator: Send + Sync {
    /// Return the sanitized text, or the reason it was rejected.
    fn validate(&self, text: &str) -> Result<String, ValidationError>;
}

/// Default validator: length limit, forbidden characters and dangerous
/// command patterns.
#[derive(Debug, Clone)]
pub struct DenylistValidator {
    max_chars: usize,
}

impl DenylistValidator {
    pub fn new() -> Self {
        Self {
            max_chars: MAX_INPUT_CHARS,
        }
    }

    pub fn with_max_chars(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl Default for DenylistValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl InputValidator for DenylistValidator {
    fn validate(&self, text: &str) -> Result<String, ValidationError> {
        let len = text.chars().count();
        if len > self.max_chars {
            return Err(ValidationError::TooLong {
                len,
                max: self.max_chars,
            });
        }

        if let Some(c) = FORBIDDEN_CHARS.iter().find(|c| text.contains(**c)) {
            return Err(ValidationError::ForbiddenChar(*c));
        }

        for (pattern, regex) in DANGEROUS_REGEXES.iter() {
            if regex.is_match(text) {
                return Err(ValidationError::DangerousCommand { pattern });
            }
        }

        Ok(text.trim().to_string())
    }
}

/// Validate with the default denylist.
pub fn validate_input(text: &str) -> Result<String, ValidationError> {
    DenylistValidator::new().validate(text)
}
