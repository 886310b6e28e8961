//! Boundary between a chat frontend and the task daemon.
//!
//! A frontend hands every inbound message to [`RequestHandler::handle`] and
//! sends back the single reply it returns. The handler applies, in order:
//! allow-list, rate limit, project switching, project selection prompt,
//! parsing, input validation and finally submission to the daemon, waiting
//! for the task's outcome.
//!
//! [`RequestHandler::handle_with_progress`] additionally streams periodic
//! progress updates (new agent output, or a "still working" ping) to a
//! channel while the task runs.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::{Config, DEFAULT_REPLY_MAX_CHARS};
use crate::daemon::TaskDaemon;
use crate::executor::{ExecutionError, ExecutionResult, OutputRecord};
use crate::parser::{has_project_flag, TaskParser};
use crate::projects::ProjectRegistry;
use crate::rate_limit::RateLimiter;
use crate::session::SessionStore;
use crate::task::{TaskCheck, TaskOutcome};
use crate::util::{truncate_chars, truncate_with_marker};
use crate::validation::{DenylistValidator, InputValidator, ValidationError, MAX_INPUT_CHARS};

const OUTPUT_TRUNCATED: &str = "\n\n... (output truncated, see the logs for the full text)";
const ERROR_TRUNCATED: &str = "\n\n... (error output truncated)";
const ERROR_DETAIL_CHARS: usize = 1000;
const PROGRESS_TRUNCATED: &str = "\n\n... (progress truncated)";
const PROGRESS_MAX_CHARS: usize = 3000;

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Receives progress updates while a task runs.
pub type ProgressSender = mpsc::UnboundedSender<String>;

/// A message from the chat frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Stable sender id, used for the allow-list, rate limiting and sessions.
    pub identity: String,
    pub text: String,
}

impl InboundMessage {
    pub fn new(identity: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            text: text.into(),
        }
    }
}

pub struct RequestHandler {
    daemon: TaskDaemon,
    parser: TaskParser,
    projects: ProjectRegistry,
    sessions: SessionStore,
    limiter: StdMutex<RateLimiter>,
    allowed: HashSet<String>,
    validator: Arc<dyn InputValidator>,
    reply_max_chars: usize,
    progress_interval: Duration,
}

impl RequestHandler {
    /// A handler with no allowed identities, no projects, default rate
    /// limits and in-memory sessions.
    pub fn new(daemon: TaskDaemon, parser: TaskParser) -> Self {
        Self {
            daemon,
            parser,
            projects: ProjectRegistry::default(),
            sessions: SessionStore::in_memory(),
            limiter: StdMutex::new(RateLimiter::default()),
            allowed: HashSet::new(),
            validator: Arc::new(DenylistValidator::new()),
            reply_max_chars: DEFAULT_REPLY_MAX_CHARS,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    /// Build a handler from configuration.
    pub fn from_config(config: &Config, daemon: TaskDaemon, sessions: SessionStore) -> Self {
        let projects = config.project_registry();
        let parser = TaskParser::new(config.default_project_root.clone())
            .with_aliases(projects.aliases().clone());

        Self::new(daemon, parser)
            .with_projects(projects)
            .with_sessions(sessions)
            .with_rate_limiter(RateLimiter::new(
                config.rate_limit_max,
                config.rate_limit_window,
            ))
            .with_allowed_identities(config.allowed_user_ids.iter().cloned())
            .with_reply_max_chars(config.reply_max_chars)
            .with_progress_interval(config.progress_interval)
    }

    pub fn with_projects(mut self, projects: ProjectRegistry) -> Self {
        self.projects = projects;
        self
    }

    pub fn with_sessions(mut self, sessions: SessionStore) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = StdMutex::new(limiter);
        self
    }

    pub fn with_allowed_identities<I>(mut self, identities: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.allowed = identities.into_iter().collect();
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn InputValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_reply_max_chars(mut self, max_chars: usize) -> Self {
        self.reply_max_chars = max_chars;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Process one message and produce its reply.
    pub async fn handle(&self, message: InboundMessage) -> String {
        self.respond(message, None).await
    }

    /// Like [`handle`](Self::handle), sending progress updates to `progress`
    /// every progress interval until the reply is ready.
    pub async fn handle_with_progress(
        &self,
        message: InboundMessage,
        progress: ProgressSender,
    ) -> String {
        self.respond(message, Some(progress)).await
    }

    async fn respond(&self, message: InboundMessage, progress: Option<ProgressSender>) -> String {
        let InboundMessage { identity, text } = message;
        let text = text.trim();

        if text.is_empty() {
            return "❌ Empty message, please send a task description.".to_string();
        }

        if !self.allowed.contains(&identity) {
            warn!("Rejected message from unauthorized identity {}", identity);
            return "❌ Unauthorized\n\nYour user id is not on the allow list. Ask an administrator to add it."
                .to_string();
        }

        let (allowed, max, window) = {
            let mut limiter = self.limiter.lock().unwrap_or_else(|e| e.into_inner());
            (
                limiter.allow(&identity),
                limiter.max_requests(),
                limiter.window(),
            )
        };
        if !allowed {
            warn!("Rate limit hit for {}", identity);
            return format!(
                "⚠️ Too many requests, please try again later\n\nLimit: {} messages per {} seconds",
                max,
                window.as_secs()
            );
        }

        if let Some(hit) = self.projects.match_trigger(text) {
            if let Err(e) = self
                .sessions
                .set(&identity, &hit.project_path, &hit.trigger)
                .await
            {
                warn!("Failed to persist project selection for {}: {}", identity, e);
            }
            return format!(
                "✅ Switched to project: {}\nPath: {}\n\nFollowing messages will use this project.",
                hit.trigger, hit.project_path
            );
        }

        let explicit_project = has_project_flag(text);
        let remembered = self.sessions.get(&identity).await;

        if !self.projects.is_empty() && remembered.is_none() && !explicit_project {
            return format!(
                "You have not selected a project yet:\n\n{}\n\nSend a trigger word to switch project (e.g. `switch to <trigger>`).",
                self.projects.display_list()
            );
        }

        let mut task = self.parser.parse(text);
        if let Some(session) = remembered.filter(|_| !explicit_project) {
            task.project_path = session.project_path;
        }
        match self.validator.validate(&task.description) {
            Ok(clean) => task.description = clean,
            Err(e) => {
                warn!("Input validation failed for {}: {}", identity, e);
                return validation_reply(&e);
            }
        }

        let check = TaskCheck::run(&task);
        if !check.valid {
            warn!("Task {} has issues: {}", task.id, check.errors.join("; "));
        }

        info!(
            "Submitting task {} from {} (project: {}, model: {})",
            task.id, identity, task.project_path, task.model
        );

        let reporter = match progress {
            Some(updates) => {
                let (sink, records) = mpsc::unbounded_channel();
                task = task.with_output(sink);
                Some(tokio::spawn(report_progress(
                    records,
                    updates,
                    self.progress_interval,
                )))
            }
            None => None,
        };

        let (tx, rx) = oneshot::channel();
        let max_chars = self.reply_max_chars;
        let task = task.with_callback(move |outcome| {
            let _ = tx.send(format_outcome(outcome, max_chars));
        });
        self.daemon.enqueue(task);

        let reply = rx.await.unwrap_or_else(|_| {
            "❌ Execution error\n\nThe task was dropped before it finished.".to_string()
        });
        if let Some(reporter) = reporter {
            reporter.abort();
        }
        reply
    }
}

/// Forward agent output as periodic progress updates until `records` closes
/// or the receiver of `updates` goes away.
async fn report_progress(
    mut records: mpsc::UnboundedReceiver<OutputRecord>,
    updates: ProgressSender,
    every: Duration,
) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    let mut fresh: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            record = records.recv() => match record {
                Some(record) => {
                    let text = record.text();
                    if !text.trim().is_empty() {
                        fresh.push(text);
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                let elapsed = format_elapsed(started.elapsed());
                let update = if fresh.is_empty() {
                    format!("⏳ Still working ({})", elapsed)
                } else {
                    let body = fresh.join("\n");
                    fresh.clear();
                    format!(
                        "📊 Progress update (running for {})\n\n{}",
                        elapsed,
                        truncate_with_marker(&body, PROGRESS_MAX_CHARS, PROGRESS_TRUNCATED)
                    )
                };
                if updates.send(update).is_err() {
                    break;
                }
            }
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}m{}s", secs / 60, secs % 60)
}

/// Render a task outcome as a reply.
pub fn format_outcome(outcome: &TaskOutcome, max_chars: usize) -> String {
    match outcome {
        Ok(result) => format_result(result, max_chars),
        Err(ExecutionError::Validation(e)) => validation_reply(e),
        Err(ExecutionError::Timeout { timeout }) => format!(
            "❌ Task timed out\n\nThe task ran longer than {} seconds and was stopped.\nTry a smaller task or split it up.",
            timeout.as_secs()
        ),
        Err(e) => format!(
            "❌ Execution error\n\nError: {}\n\nCheck the logs for details.",
            truncate_chars(&e.to_string(), ERROR_DETAIL_CHARS)
        ),
    }
}

fn format_result(result: &ExecutionResult, max_chars: usize) -> String {
    let output = result.final_output();

    if result.success && !output.is_error {
        let text = if output.text.trim().is_empty() {
            "Task succeeded with no output."
        } else {
            output.text.trim()
        };
        let duration = output
            .duration
            .map(|d| format!("\n⏱️ Duration: {:.2}s", d.as_secs_f64()))
            .unwrap_or_default();
        return format!(
            "✅ Task completed{}\n\n{}",
            duration,
            truncate_with_marker(text, max_chars, OUTPUT_TRUNCATED)
        );
    }

    let code = result.code.unwrap_or(-1);
    let detail = [result.stderr.trim(), output.text.trim()]
        .into_iter()
        .find(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Task failed with exit code {}", code));

    format!(
        "❌ Task failed (code: {})\n\n{}",
        code,
        truncate_with_marker(&detail, max_chars, ERROR_TRUNCATED)
    )
}

fn validation_reply(error: &ValidationError) -> String {
    format!(
        "❌ Input validation failed\n\nError: {}\n\nMake sure the request:\n- contains none of ; & | ` $ < >\n- contains no dangerous commands\n- is at most {} characters long",
        error, MAX_INPUT_CHARS
    )
}
