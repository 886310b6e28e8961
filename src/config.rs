//! Configuration management for agent-relay.
//!
//! Configuration can be set via environment variables:
//! - `DEFAULT_PROJECT_ROOT` - Optional. Working directory for tasks without `--project`. Defaults to the current directory.
//! - `CURSOR_AGENT_PATH` - Optional. Agent executable. Defaults to `agent`.
//! - `USE_PROXY` - Optional. Whether to inject proxy variables. Defaults to `true`.
//! - `PROXY_URL` - Optional. Proxy used when `HTTP_PROXY`/`HTTPS_PROXY` are unset. Defaults to `http://127.0.0.1:7890`.
//! - `ALLOWED_USER_IDS` - Optional. Comma-separated identities allowed to submit tasks. Empty means nobody.
//! - `TASK_TIMEOUT_SECS` - Optional. Wall-clock limit per task. Defaults to `300`.
//! - `TASK_INBOX_PATH` - Optional. Enables the file inbox at this path.
//! - `INBOX_POLL_MS` - Optional. Inbox poll interval. Defaults to `1000`.
//! - `RATE_LIMIT_MAX` - Optional. Requests per window and identity. Defaults to `5`.
//! - `RATE_LIMIT_WINDOW_SECS` - Optional. Rate limit window. Defaults to `60`.
//! - `SESSION_FILE` - Optional. Where project selections are persisted. In memory when unset.
//! - `REPLY_MAX_CHARS` - Optional. Reply body limit. Defaults to `3500`.
//! - `PROGRESS_INTERVAL_SECS` - Optional. How often running tasks report progress. Defaults to `30`.
//! - `AGENT_RELAY_CONFIG` - Optional. JSON file with `allowed_user_ids`, `default_project_root`,
//!   `cursor_agent_path`, `allowed_projects` and `project_trigger_mapping`. Environment variables
//!   win over values from the file.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::executor::{ExecutorConfig, DEFAULT_PROXY_URL, DEFAULT_TIMEOUT};
use crate::handler::DEFAULT_PROGRESS_INTERVAL;
use crate::projects::{ProjectRegistry, ProjectTriggers};
use crate::rate_limit::{DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW};
use crate::util::parse_bool;

pub const DEFAULT_AGENT_PATH: &str = "agent";
pub const DEFAULT_REPLY_MAX_CHARS: usize = 3500;
pub const DEFAULT_INBOX_POLL: Duration = Duration::from_millis(1000);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// User ids appear as numbers or strings in config files.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UserId {
    Number(i64),
    Text(String),
}

impl UserId {
    fn into_string(self) -> String {
        match self {
            UserId::Number(n) => n.to_string(),
            UserId::Text(s) => s.trim().to_string(),
        }
    }
}

/// Shape of the optional JSON config file.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    allowed_user_ids: Vec<UserId>,
    #[serde(default)]
    default_project_root: Option<String>,
    #[serde(default)]
    cursor_agent_path: Option<String>,
    #[serde(default)]
    allowed_projects: HashMap<String, String>,
    #[serde(default)]
    project_trigger_mapping: BTreeMap<String, ProjectTriggers>,
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Working directory for tasks that do not name a project
    pub default_project_root: String,

    /// Agent executable
    pub agent_path: String,

    pub use_proxy: bool,
    pub proxy_url: String,

    /// Identities allowed to submit tasks
    pub allowed_user_ids: HashSet<String>,

    pub task_timeout: Duration,

    /// File inbox, disabled when `None`
    pub inbox_path: Option<PathBuf>,
    pub inbox_poll_interval: Duration,

    pub rate_limit_max: usize,
    pub rate_limit_window: Duration,

    /// Where project selections are persisted, in memory when `None`
    pub session_file: Option<PathBuf>,

    pub reply_max_chars: usize,

    /// How often a running task sends a progress update
    pub progress_interval: Duration,

    /// Short project names usable with `--project`
    pub allowed_projects: HashMap<String, String>,

    /// Project name -> path and trigger words
    pub project_trigger_mapping: BTreeMap<String, ProjectTriggers>,
}

impl Config {
    /// Load configuration from environment variables and the optional
    /// `AGENT_RELAY_CONFIG` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let file = match var("AGENT_RELAY_CONFIG") {
            Some(path) => load_file(PathBuf::from(path))?,
            None => FileConfig::default(),
        };

        let default_project_root = var("DEFAULT_PROJECT_ROOT")
            .or(file.default_project_root)
            .unwrap_or_else(|| {
                std::env::current_dir()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| ".".to_string())
            });

        let agent_path = var("CURSOR_AGENT_PATH")
            .or(file.cursor_agent_path)
            .unwrap_or_else(|| DEFAULT_AGENT_PATH.to_string());

        let use_proxy = var("USE_PROXY").map(|v| parse_bool(&v)).unwrap_or(true);
        let proxy_url = var("PROXY_URL").unwrap_or_else(|| DEFAULT_PROXY_URL.to_string());

        let allowed_user_ids = match var("ALLOWED_USER_IDS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect(),
            None => file
                .allowed_user_ids
                .into_iter()
                .map(UserId::into_string)
                .filter(|id| !id.is_empty())
                .collect(),
        };

        let task_timeout = Duration::from_secs(parse_var(
            &var,
            "TASK_TIMEOUT_SECS",
            DEFAULT_TIMEOUT.as_secs(),
        )?);
        let inbox_poll_interval = Duration::from_millis(parse_var(
            &var,
            "INBOX_POLL_MS",
            DEFAULT_INBOX_POLL.as_millis() as u64,
        )?);
        let rate_limit_max = parse_var(&var, "RATE_LIMIT_MAX", DEFAULT_MAX_REQUESTS)?;
        let rate_limit_window = Duration::from_secs(parse_var(
            &var,
            "RATE_LIMIT_WINDOW_SECS",
            DEFAULT_WINDOW.as_secs(),
        )?);
        let reply_max_chars = parse_var(&var, "REPLY_MAX_CHARS", DEFAULT_REPLY_MAX_CHARS)?;
        let progress_interval = Duration::from_secs(parse_var(
            &var,
            "PROGRESS_INTERVAL_SECS",
            DEFAULT_PROGRESS_INTERVAL.as_secs(),
        )?);

        for (key, zero) in [
            ("TASK_TIMEOUT_SECS", task_timeout.is_zero()),
            ("INBOX_POLL_MS", inbox_poll_interval.is_zero()),
            ("RATE_LIMIT_WINDOW_SECS", rate_limit_window.is_zero()),
            ("PROGRESS_INTERVAL_SECS", progress_interval.is_zero()),
        ] {
            if zero {
                return Err(ConfigError::InvalidValue(
                    key.to_string(),
                    "must be greater than zero".to_string(),
                ));
            }
        }

        Ok(Self {
            default_project_root,
            agent_path,
            use_proxy,
            proxy_url,
            allowed_user_ids,
            task_timeout,
            inbox_path: var("TASK_INBOX_PATH").map(PathBuf::from),
            inbox_poll_interval,
            rate_limit_max,
            rate_limit_window,
            session_file: var("SESSION_FILE").map(PathBuf::from),
            reply_max_chars,
            progress_interval,
            allowed_projects: file.allowed_projects,
            project_trigger_mapping: file.project_trigger_mapping,
        })
    }

    /// Create a config with defaults for everything but the project root
    /// and agent (useful for testing).
    pub fn new(default_project_root: impl Into<String>, agent_path: impl Into<String>) -> Self {
        Self {
            default_project_root: default_project_root.into(),
            agent_path: agent_path.into(),
            use_proxy: true,
            proxy_url: DEFAULT_PROXY_URL.to_string(),
            allowed_user_ids: HashSet::new(),
            task_timeout: DEFAULT_TIMEOUT,
            inbox_path: None,
            inbox_poll_interval: DEFAULT_INBOX_POLL,
            rate_limit_max: DEFAULT_MAX_REQUESTS,
            rate_limit_window: DEFAULT_WINDOW,
            session_file: None,
            reply_max_chars: DEFAULT_REPLY_MAX_CHARS,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            allowed_projects: HashMap::new(),
            project_trigger_mapping: BTreeMap::new(),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            agent_path: self.agent_path.clone(),
            default_project_root: self.default_project_root.clone(),
            proxy_url: self.use_proxy.then(|| self.proxy_url.clone()),
            timeout: self.task_timeout,
        }
    }

    pub fn project_registry(&self) -> ProjectRegistry {
        ProjectRegistry::new(
            self.project_trigger_mapping.clone(),
            self.allowed_projects.clone(),
        )
    }
}

fn load_file(path: PathBuf) -> Result<FileConfig, ConfigError> {
    let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::ParseFile { path, source })
}

fn parse_var<T, V>(var: &V, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), format!("{}", e))),
        None => Ok(default),
    }
}
