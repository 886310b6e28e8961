//! Task message parsing.
//!
//! Grammar (best effort, not a real parser):
//!
//! ```text
//! [prefix] description [--project <path>] [--model <name>]
//! ```
//!
//! Flags may appear anywhere and use `:` or whitespace as the separator. Only
//! the first occurrence of each flag is honored but every occurrence is
//! removed from the description. Flag values end at the next whitespace, so
//! paths containing spaces cannot be expressed.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::task::{Task, DEFAULT_MODEL};
use crate::util::collapse_whitespace;

static PROJECT_FLAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)--project[:\s]+(\S+)").unwrap());
static MODEL_FLAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)--model[:\s]+(\S+)").unwrap());

/// Leading command markers ("execute task:", "task:", "do:", "run:").
static COMMAND_PREFIXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"^执行任务[：:]\s*", r"^任务[：:]\s*", r"^do[：:]\s*", r"^run[：:]\s*"]
        .iter()
        .map(|p| Regex::new(&format!("(?i){}", p)).unwrap())
        .collect()
});

/// Parses free-text chat messages into [`Task`]s.
#[derive(Debug, Clone, Default)]
pub struct TaskParser {
    project_root: String,
    /// Short project names that `--project` may use instead of a path.
    project_aliases: HashMap<String, String>,
}

impl TaskParser {
    pub fn new(project_root: impl Into<String>) -> Self {
        Self {
            project_root: project_root.into(),
            project_aliases: HashMap::new(),
        }
    }

    pub fn with_aliases(mut self, aliases: HashMap<String, String>) -> Self {
        self.project_aliases = aliases;
        self
    }

    pub fn project_root(&self) -> &str {
        &self.project_root
    }

    pub fn parse(&self, message: &str) -> Task {
        let clean = collapse_whitespace(message);

        let project_path = PROJECT_FLAG
            .captures(&clean)
            .map(|caps| self.resolve_project(&caps[1]))
            .unwrap_or_else(|| self.project_root.clone());

        let model = MODEL_FLAG
            .captures(&clean)
            .map(|caps| caps[1].to_string())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let stripped = PROJECT_FLAG.replace_all(&clean, "");
        let stripped = MODEL_FLAG.replace_all(&stripped, "");
        let mut description = collapse_whitespace(&stripped);

        if let Some(prefix) = COMMAND_PREFIXES.iter().find(|p| p.is_match(&description)) {
            description = prefix.replace(&description, "").trim().to_string();
        }

        if description.is_empty() {
            description = clean;
        }

        Task::new(description, project_path).with_model(model)
    }

    fn resolve_project(&self, spec: &str) -> String {
        self.project_aliases
            .get(spec)
            .cloned()
            .unwrap_or_else(|| spec.to_string())
    }
}

/// Whether `message` carries an explicit `--project` flag.
pub fn has_project_flag(message: &str) -> bool {
    PROJECT_FLAG.is_match(message)
}
