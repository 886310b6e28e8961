//! Task definition and advisory task checks.
//!
//! # Lifecycle
//! ```text
//! parsed / ingested -> queued -> executed once -> callback -> dropped
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::executor::{ExecutionError, ExecutionResult, OutputSink};

/// Model used when a request does not name one.
pub const DEFAULT_MODEL: &str = "auto";

/// Models the agent is known to accept.
pub const KNOWN_MODELS: &[&str] = &[
    "auto",
    "opus-4.6-thinking",
    "sonnet-4.5-thinking",
    "gpt-5.3-codex",
    "gpt-5.2",
];

pub fn is_known_model(model: &str) -> bool {
    KNOWN_MODELS.contains(&model)
}

/// Unique identifier for a task, used to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a task's callback receives.
pub type TaskOutcome = Result<ExecutionResult, ExecutionError>;

/// Completion callback, invoked exactly once per executed task.
///
/// `Sync` so that runners can hold `&Task` across awaits on any thread.
pub type TaskCallback = Box<dyn FnOnce(&TaskOutcome) + Send + Sync + 'static>;

/// A single unit of work for the agent.
pub struct Task {
    pub id: TaskId,
    /// Instruction passed to the agent as its prompt.
    pub description: String,
    /// Working directory for the agent. Empty means "use the configured default".
    pub project_path: String,
    pub model: String,
    /// Receives stdout records while the agent runs.
    pub output: Option<OutputSink>,
    callback: Option<TaskCallback>,
}

impl Task {
    pub fn new(description: impl Into<String>, project_path: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            description: description.into(),
            project_path: project_path.into(),
            model: DEFAULT_MODEL.to_string(),
            output: None,
            callback: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_output(mut self, sink: OutputSink) -> Self {
        self.output = Some(sink);
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&TaskOutcome) + Send + Sync + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Hand the outcome to the callback, if any. Consumes the callback so it
    /// cannot fire twice.
    pub fn complete(&mut self, outcome: &TaskOutcome) {
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("project_path", &self.project_path)
            .field("model", &self.model)
            .field("output", &self.output.is_some())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Result of the advisory pre-flight check.
///
/// Only used for diagnostics. The queue never rejects a task because of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskCheck {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl TaskCheck {
    pub fn run(task: &Task) -> Self {
        let mut errors = Vec::new();

        if task.description.trim().is_empty() {
            errors.push("Task description is required".to_string());
        }

        if !task.project_path.is_empty() && !Path::new(&task.project_path).exists() {
            errors.push(format!("Project path does not exist: {}", task.project_path));
        }

        if !is_known_model(&task.model) {
            errors.push(format!(
                "Invalid model: {}. Valid models: {}",
                task.model,
                KNOWN_MODELS.join(", ")
            ));
        }

        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}
