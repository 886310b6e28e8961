//! File inbox: a JSON array that other processes drop tasks into.
//!
//! The watcher polls the file, claims it by renaming it to
//! `<inbox>.claimed`, writes a fresh `[]` in its place and enqueues the
//! claimed entries in order. A writer still holding the old file open after
//! the rename can lose its write; callers that need more than best effort
//! should talk to the daemon directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TaskDaemon;
use crate::task::Task;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const EMPTY_INBOX: &str = "[]";

#[derive(Debug, Error)]
pub enum InboxError {
    #[error("inbox I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("inbox at {path} is not a task array: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One task request written by an external process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    pub task_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl InboxEntry {
    pub fn into_task(self, default_project_root: &str) -> Task {
        let project_path = self
            .project_path
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| default_project_root.to_string());
        let task = Task::new(self.task_description, project_path);
        match self.model.filter(|m| !m.trim().is_empty()) {
            Some(model) => task.with_model(model),
            None => task,
        }
    }
}

/// Polls an inbox file and feeds its entries to a [`TaskDaemon`].
#[derive(Debug, Clone)]
pub struct InboxWatcher {
    path: PathBuf,
    interval: Duration,
    default_project_root: String,
}

impl InboxWatcher {
    pub fn new(path: impl Into<PathBuf>, default_project_root: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            interval: DEFAULT_POLL_INTERVAL,
            default_project_root: default_project_root.into(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the inbox (and its directory) holding `[]` if it is missing.
    pub async fn ensure_exists(&self) -> Result<(), InboxError> {
        if fs::try_exists(&self.path).await.map_err(|e| self.io_error(e))? {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        fs::write(&self.path, EMPTY_INBOX)
            .await
            .map_err(|e| self.io_error(e))
    }

    /// Read the inbox once, enqueue its entries and clear it.
    ///
    /// The file is claimed (renamed away) before anything is enqueued, so a
    /// batch runs at most once even when the inbox cannot be rewritten.
    /// Returns how many tasks were enqueued. A missing or empty file is not an
    /// error. Entries with a blank description are dropped.
    pub async fn poll_once(&self, daemon: &TaskDaemon) -> Result<usize, InboxError> {
        let Some(entries) = self.read_entries(&self.path).await? else {
            return Ok(0);
        };
        if entries.is_empty() {
            return Ok(0);
        }

        let claim_path = self.claim_path();
        fs::rename(&self.path, &claim_path)
            .await
            .map_err(|e| self.io_error(e))?;

        if let Err(e) = self.clear().await {
            warn!("Could not recreate inbox {}: {}", self.path.display(), e);
        }

        // Re-read the claim: a writer may have appended between the first
        // read and the rename.
        let entries = match self.read_entries(&claim_path).await {
            Ok(Some(entries)) => entries,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(
                    "Claimed inbox is unreadable, left at {}: {}",
                    claim_path.display(),
                    e
                );
                return Err(e);
            }
        };
        if let Err(e) = fs::remove_file(&claim_path).await {
            debug!("Could not remove {}: {}", claim_path.display(), e);
        }

        let mut enqueued = 0;
        for entry in entries {
            if entry.task_description.trim().is_empty() {
                debug!("Skipping inbox entry without a description");
                continue;
            }
            daemon.enqueue(entry.into_task(&self.default_project_root));
            enqueued += 1;
        }

        info!("Picked up {} task(s) from {}", enqueued, self.path.display());
        Ok(enqueued)
    }

    fn claim_path(&self) -> PathBuf {
        self.path.with_extension("json.claimed")
    }

    /// `None` when the file is missing or blank.
    async fn read_entries(&self, path: &Path) -> Result<Option<Vec<InboxEntry>>, InboxError> {
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(InboxError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| InboxError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Poll until `cancel` fires.
    pub fn spawn(self, daemon: TaskDaemon, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.ensure_exists().await {
                debug!("Could not create inbox: {}", e);
            }
            info!(
                "Watching task inbox {} every {}ms",
                self.path.display(),
                self.interval.as_millis()
            );

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Inbox watcher stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.poll_once(&daemon).await {
                            debug!("Inbox poll failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    async fn clear(&self) -> Result<(), InboxError> {
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, EMPTY_INBOX)
            .await
            .map_err(|e| self.io_error(e))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| self.io_error(e))
    }

    fn io_error(&self, source: std::io::Error) -> InboxError {
        InboxError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionError, ExecutionResult, TaskRunner};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Remembers (description, project, model) of every task it runs.
    #[derive(Default)]
    struct Collecting {
        seen: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl TaskRunner for Collecting {
        async fn run(&self, task: &Task) -> Result<ExecutionResult, ExecutionError> {
            self.seen.lock().unwrap().push((
                task.description.clone(),
                task.project_path.clone(),
                task.model.clone(),
            ));
            Ok(ExecutionResult::new(
                Some(0),
                String::new(),
                String::new(),
                Duration::ZERO,
            ))
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<Collecting>, TaskDaemon) {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(Collecting::default());
        let daemon = TaskDaemon::new(runner.clone());
        (dir, runner, daemon)
    }

    #[test]
    fn entry_uses_camel_case_and_defaults() {
        let entry: InboxEntry =
            serde_json::from_str(r#"{"taskDescription":"fix build"}"#).unwrap();
        let task = entry.into_task("/srv/root");
        assert_eq!(task.description, "fix build");
        assert_eq!(task.project_path, "/srv/root");
        assert_eq!(task.model, "auto");

        let entry: InboxEntry = serde_json::from_str(
            r#"{"projectPath":"/w","taskDescription":"t","model":"gpt-5.2"}"#,
        )
        .unwrap();
        let task = entry.into_task("/srv/root");
        assert_eq!(task.project_path, "/w");
        assert_eq!(task.model, "gpt-5.2");
    }

    #[tokio::test]
    async fn poll_enqueues_in_order_and_clears_file() {
        let (dir, runner, daemon) = setup();
        let path = dir.path().join("inbox.json");
        std::fs::write(
            &path,
            r#"[
                {"projectPath": "/a", "taskDescription": "first", "model": "gpt-5.2"},
                {"taskDescription": "second"}
            ]"#,
        )
        .unwrap();

        let watcher = InboxWatcher::new(&path, "/default");
        assert_eq!(watcher.poll_once(&daemon).await.unwrap(), 2);
        daemon.wait_idle().await;

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(
            *runner.seen.lock().unwrap(),
            vec![
                ("first".to_string(), "/a".to_string(), "gpt-5.2".to_string()),
                ("second".to_string(), "/default".to_string(), "auto".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn empty_or_missing_inbox_is_a_no_op() {
        let (dir, runner, daemon) = setup();
        let path = dir.path().join("inbox.json");
        let watcher = InboxWatcher::new(&path, "");

        assert_eq!(watcher.poll_once(&daemon).await.unwrap(), 0);
        assert!(!path.exists());

        std::fs::write(&path, "[]").unwrap();
        assert_eq!(watcher.poll_once(&daemon).await.unwrap(), 0);
        assert!(runner.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_inbox_is_reported_and_left_alone() {
        let (dir, _runner, daemon) = setup();
        let path = dir.path().join("inbox.json");
        std::fs::write(&path, "{not an array").unwrap();

        let watcher = InboxWatcher::new(&path, "");
        let err = watcher.poll_once(&daemon).await.unwrap_err();
        assert!(matches!(err, InboxError::Parse { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{not an array");
    }

    #[tokio::test]
    async fn batch_runs_once_when_inbox_cannot_be_rewritten() {
        let (dir, runner, daemon) = setup();
        let path = dir.path().join("inbox.json");
        std::fs::write(&path, r#"[{"taskDescription":"deploy once"}]"#).unwrap();
        // Rewriting `[]` goes through this temp path; a directory there makes it fail.
        std::fs::create_dir(path.with_extension("json.tmp")).unwrap();

        let watcher = InboxWatcher::new(&path, "");
        assert_eq!(watcher.poll_once(&daemon).await.unwrap(), 1);
        for _ in 0..2 {
            assert_eq!(watcher.poll_once(&daemon).await.unwrap(), 0);
        }
        daemon.wait_idle().await;

        let runs: Vec<String> = runner.seen.lock().unwrap().iter().map(|s| s.0.clone()).collect();
        assert_eq!(runs, vec!["deploy once"]);
        assert!(!path.with_extension("json.claimed").exists());
    }

    #[tokio::test]
    async fn nothing_runs_when_the_inbox_cannot_be_claimed() {
        let (dir, runner, daemon) = setup();
        let path = dir.path().join("inbox.json");
        std::fs::write(&path, r#"[{"taskDescription":"deploy once"}]"#).unwrap();
        let claim = path.with_extension("json.claimed");
        std::fs::create_dir(&claim).unwrap();
        std::fs::write(claim.join("occupied"), "x").unwrap();

        let watcher = InboxWatcher::new(&path, "");
        for _ in 0..3 {
            assert!(matches!(
                watcher.poll_once(&daemon).await,
                Err(InboxError::Io { .. })
            ));
        }
        daemon.wait_idle().await;

        assert!(runner.seen.lock().unwrap().is_empty());
        assert!(std::fs::read_to_string(&path).unwrap().contains("deploy once"));
    }

    #[tokio::test]
    async fn blank_descriptions_are_skipped() {
        let (dir, runner, daemon) = setup();
        let path = dir.path().join("inbox.json");
        std::fs::write(
            &path,
            r#"[{"taskDescription":"  "},{"taskDescription":"real"}]"#,
        )
        .unwrap();

        let watcher = InboxWatcher::new(&path, "");
        assert_eq!(watcher.poll_once(&daemon).await.unwrap(), 1);
        daemon.wait_idle().await;
        assert_eq!(runner.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ensure_exists_creates_parent_and_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/inbox.json");
        let watcher = InboxWatcher::new(&path, "");
        watcher.ensure_exists().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");

        std::fs::write(&path, r#"[{"taskDescription":"keep"}]"#).unwrap();
        watcher.ensure_exists().await.unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("keep"));
    }

    #[tokio::test]
    async fn spawned_watcher_picks_up_tasks_until_cancelled() {
        let (dir, runner, daemon) = setup();
        let path = dir.path().join("inbox.json");
        let cancel = CancellationToken::new();
        let handle = InboxWatcher::new(&path, "")
            .with_interval(Duration::from_millis(20))
            .spawn(daemon.clone(), cancel.clone());

        // Give the watcher time to create the file before writing to it.
        for _ in 0..50 {
            if std::fs::read_to_string(&path).is_ok_and(|raw| raw == "[]") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        std::fs::write(&path, r#"[{"taskDescription":"from file"}]"#).unwrap();

        for _ in 0..100 {
            if !runner.seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(runner.seen.lock().unwrap()[0].0, "from file");
    }
}
