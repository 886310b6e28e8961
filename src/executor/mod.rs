//! Runs the CLI agent for a single task.
//!
//! One call spawns one process:
//!
//! ```text
//! <agent> --model <model> -p --force --output-format json <description>
//! ```
//!
//! Stdout is read line by line, forwarded to an optional sink and captured in
//! full. The whole run is bounded by a wall-clock timeout; when it expires the
//! agent's process group is killed and the call fails with
//! [`ExecutionError::Timeout`]. Captured output is redacted before it leaves
//! this module.

pub mod records;

pub use records::{final_output, FinalOutput, OutputRecord};

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::redact::{redact, secret_count};
use crate::task::Task;
use crate::validation::{DenylistValidator, InputValidator, ValidationError};

/// Default wall-clock budget for one agent run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Local proxy used when the environment does not configure one.
pub const DEFAULT_PROXY_URL: &str = "http://127.0.0.1:7890";

/// Hosts that must always bypass the proxy.
const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1"];

/// Receives decoded stdout records while the agent runs.
pub type OutputSink = mpsc::UnboundedSender<OutputRecord>;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("input validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to spawn agent '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("agent timed out after {} seconds", .timeout.as_secs())]
    Timeout { timeout: Duration },

    #[error("I/O error while running agent: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of one agent process that ran to exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    /// Exit code, `None` if the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn new(code: Option<i32>, stdout: String, stderr: String, duration: Duration) -> Self {
        Self {
            code,
            stdout,
            stderr,
            success: code == Some(0),
            duration,
        }
    }

    /// The agent's final answer, see [`records::final_output`].
    pub fn final_output(&self) -> FinalOutput {
        final_output(&self.stdout)
    }
}

/// Settings for spawning the agent.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Agent executable, looked up on `PATH` when not absolute.
    pub agent_path: String,
    /// Working directory used when a task does not set one.
    pub default_project_root: String,
    /// Proxy for `HTTP_PROXY`/`HTTPS_PROXY` when those are unset. `None`
    /// leaves them alone.
    pub proxy_url: Option<String>,
    pub timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            agent_path: "agent".to_string(),
            default_project_root: String::new(),
            proxy_url: Some(DEFAULT_PROXY_URL.to_string()),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Something that can run a task to completion.
///
/// The daemon only talks to this trait so tests can substitute a fake.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &Task) -> Result<ExecutionResult, ExecutionError>;
}

/// Spawns the agent process for tasks.
pub struct ProcessExecutor {
    config: ExecutorConfig,
    validator: Arc<dyn InputValidator>,
}

impl ProcessExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            validator: Arc::new(DenylistValidator::new()),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn InputValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run the agent for `task`.
    ///
    /// The description is validated again here even if the caller already
    /// did, since this can be called directly.
    pub async fn execute(
        &self,
        task: &Task,
        sink: Option<OutputSink>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let description = self.validator.validate(&task.description)?;
        let program = &self.config.agent_path;

        let mut cmd = Command::new(program);
        cmd.args(agent_args(&task.model, &description))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so a timeout also reaches anything the agent forks.
        #[cfg(unix)]
        cmd.process_group(0);

        let work_dir = self.working_dir(task);
        if let Some(dir) = work_dir {
            cmd.current_dir(dir);
        }

        for (key, value) in proxy_env(self.config.proxy_url.as_deref(), |key| {
            std::env::var(key).ok()
        }) {
            cmd.env(key, value);
        }

        info!(
            "Spawning agent for task {}: model={}, directory={:?}, prompt={:?}",
            task.id,
            task.model,
            work_dir,
            crate::util::truncate_chars(&description, 100)
        );

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn agent '{}': {}", program, e);
            ExecutionError::Spawn {
                program: program.clone(),
                message: e.to_string(),
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "failed to capture agent stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "failed to capture agent stderr"))?;

        let run = async {
            let (out, err) = tokio::join!(read_stdout(stdout, sink), read_all(stderr));
            let status = child.wait().await?;
            Ok::<_, io::Error>((status, out?, err?))
        };
        let outcome = tokio::time::timeout(self.config.timeout, run).await;

        match outcome {
            Ok(Ok((status, stdout, stderr))) => {
                let secrets = secret_count(&stdout) + secret_count(&stderr);
                if secrets > 0 {
                    warn!("Redacted {} credential(s) from task {} output", secrets, task.id);
                }
                let result =
                    ExecutionResult::new(status.code(), redact(&stdout), redact(&stderr), started.elapsed());
                info!(
                    "Task {} finished with code {:?} in {:.1}s",
                    task.id,
                    result.code,
                    result.duration.as_secs_f64()
                );
                Ok(result)
            }
            Ok(Err(e)) => {
                error!("I/O error while running task {}: {}", task.id, e);
                kill_process_group(&child);
                if let Err(kill_err) = child.kill().await {
                    debug!("Agent already exited: {}", kill_err);
                }
                Err(ExecutionError::Io(e))
            }
            Err(_) => {
                warn!(
                    "Task {} exceeded {}s, killing agent",
                    task.id,
                    self.config.timeout.as_secs()
                );
                kill_process_group(&child);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill agent process: {}", e);
                }
                Err(ExecutionError::Timeout {
                    timeout: self.config.timeout,
                })
            }
        }
    }

    fn working_dir<'a>(&'a self, task: &'a Task) -> Option<&'a str> {
        [
            task.project_path.as_str(),
            self.config.default_project_root.as_str(),
        ]
        .into_iter()
        .find(|dir| !dir.trim().is_empty())
    }
}

#[async_trait]
impl TaskRunner for ProcessExecutor {
    async fn run(&self, task: &Task) -> Result<ExecutionResult, ExecutionError> {
        self.execute(task, task.output.clone()).await
    }
}

/// SIGKILL the child's process group. Must run before the child is reaped,
/// while its pid still names the group.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    if let Some(pid) = child.id() {
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            debug!(
                "killpg({}) failed: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

/// Arguments passed to the agent.
pub fn agent_args(model: &str, description: &str) -> Vec<String> {
    vec![
        "--model".to_string(),
        model.to_string(),
        "-p".to_string(),
        "--force".to_string(),
        "--output-format".to_string(),
        "json".to_string(),
        description.to_string(),
    ]
}

/// Proxy variables to set on the agent's environment.
///
/// `HTTP_PROXY`/`HTTPS_PROXY` fall back to `proxy_url` only when `lookup`
/// finds them unset or blank. `NO_PROXY` keeps any existing entries and
/// always gains the loopback hosts.
pub fn proxy_env<F>(proxy_url: Option<&str>, lookup: F) -> Vec<(String, String)>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = Vec::new();

    if let Some(proxy) = proxy_url {
        for key in ["HTTP_PROXY", "HTTPS_PROXY"] {
            let already_set = lookup(key).is_some_and(|v| !v.trim().is_empty());
            if !already_set {
                env.push((key.to_string(), proxy.to_string()));
            }
        }
    }

    let mut no_proxy: Vec<String> = lookup("NO_PROXY")
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    for host in LOOPBACK_HOSTS {
        if !no_proxy.iter().any(|h| h == host) {
            no_proxy.push(host.to_string());
        }
    }
    env.push(("NO_PROXY".to_string(), no_proxy.join(",")));

    env
}

async fn read_stdout<R>(reader: R, sink: Option<OutputSink>) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut captured = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        // Splits on raw bytes so a multi-byte character is never cut in half.
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            break;
        }
        captured.extend_from_slice(&line);
        if let Some(sink) = &sink {
            let text = String::from_utf8_lossy(&line);
            forward_line(sink, text.trim_end_matches(['\n', '\r']));
        }
    }

    Ok(String::from_utf8_lossy(&captured).into_owned())
}

fn forward_line(sink: &OutputSink, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let record = OutputRecord::from_line(&redact(line));
    if sink.send(record).is_err() {
        debug!("Output receiver dropped, discarding agent output line");
    }
}

async fn read_all<R>(mut reader: R) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
