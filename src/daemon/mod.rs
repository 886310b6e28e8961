//! Serialized task queue.
//!
//! A [`TaskDaemon`] owns a FIFO of pending tasks and a processing flag. At
//! most one task runs at a time per daemon:
//!
//! ```text
//! Idle --enqueue--> Processing --queue empty--> Idle
//!                     |    ^
//!                     +----+ next task
//! ```
//!
//! `enqueue` pushes the task and, if the daemon is idle, flips the flag and
//! spawns a drain loop. The drain pops one task at a time, runs it, fires its
//! callback and only then looks at the queue again. Both the flag flip and
//! the pop happen under the same lock, so two drains can never overlap. A
//! failing task is logged and the drain moves on.

pub mod inbox;

pub use inbox::{InboxEntry, InboxError, InboxWatcher};

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::executor::TaskRunner;
use crate::status::{classify, has_task_error, primary_output};
use crate::task::{Task, TaskOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Idle,
    Processing,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Task>,
    processing: bool,
}

struct Inner {
    runner: Arc<dyn TaskRunner>,
    state: StdMutex<QueueState>,
    idle: Notify,
}

/// Handle to a task daemon. Clones share the same queue.
#[derive(Clone)]
pub struct TaskDaemon {
    inner: Arc<Inner>,
}

impl TaskDaemon {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                state: StdMutex::new(QueueState::default()),
                idle: Notify::new(),
            }),
        }
    }

    /// Append a task and start draining if the daemon is idle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, task: Task) {
        let (start_drain, queued) = {
            let mut state = self.inner.lock();
            state.queue.push_back(task);
            let start = !state.processing;
            if start {
                state.processing = true;
            }
            (start, state.queue.len())
        };

        debug!("Task queued ({} pending)", queued);

        if start_drain {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                inner.drain().await;
            });
        }
    }

    /// Number of tasks waiting to run (excluding the one in flight).
    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn state(&self) -> DaemonState {
        if self.inner.lock().processing {
            DaemonState::Processing
        } else {
            DaemonState::Idle
        }
    }

    /// Wait until the queue is empty and nothing is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state() == DaemonState::Idle {
                return;
            }
            notified.await;
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = self.lock();
                let next = state.queue.pop_front();
                if next.is_none() {
                    state.processing = false;
                }
                next.map(|task| (task, state.queue.len()))
            };

            let Some((task, remaining)) = next else {
                debug!("Task queue drained");
                self.idle.notify_waiters();
                return;
            };

            info!(
                "Executing task {}: {} (model: {}, {} queued behind it)",
                task.id,
                crate::util::truncate_chars(&task.description, 100),
                task.model,
                remaining
            );

            // Run on its own tokio task so a panicking runner cannot leave the
            // processing flag stuck.
            let runner = Arc::clone(&self.runner);
            let handle = tokio::spawn(async move {
                let outcome = runner.run(&task).await;
                (task, outcome)
            });

            match handle.await {
                Ok((mut task, outcome)) => {
                    log_outcome(&task, &outcome);
                    let fired = catch_unwind(AssertUnwindSafe(|| task.complete(&outcome)));
                    if fired.is_err() {
                        error!("Callback for task {} panicked", task.id);
                    }
                }
                Err(e) => error!("Task runner aborted: {}", e),
            }
        }
    }
}

fn log_outcome(task: &Task, outcome: &TaskOutcome) {
    match outcome {
        Ok(result) => {
            let status = classify(primary_output(result));
            if has_task_error(Some(result)) {
                warn!(
                    "Task {} completed with code {:?} and errors: {}",
                    task.id, result.code, status.summary
                );
            } else {
                info!("Task {} completed with code {:?}", task.id, result.code);
            }
            if status.needs_confirmation {
                warn!("Task {} output asks for confirmation", task.id);
            }
        }
        Err(e) => error!("Error executing task {}: {}", task.id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionError, ExecutionResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Log = Arc<StdMutex<Vec<String>>>;

    /// Records "spawn <description>" and succeeds after a short delay.
    struct RecordingRunner {
        log: Log,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl RecordingRunner {
        fn new(log: Log, delay: Duration) -> Self {
            Self {
                log,
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TaskRunner for RecordingRunner {
        async fn run(&self, task: &Task) -> Result<ExecutionResult, ExecutionError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.log.lock().unwrap().push(format!("spawn {}", task.description));
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if task.description == "slow" {
                return Err(ExecutionError::Timeout {
                    timeout: Duration::from_millis(1),
                });
            }
            Ok(ExecutionResult::new(
                Some(0),
                format!("{} done", task.description),
                String::new(),
                self.delay,
            ))
        }
    }

    fn recorded_task(name: &str, log: &Log) -> Task {
        let log = Arc::clone(log);
        let label = name.to_string();
        Task::new(name, "").with_callback(move |outcome| {
            let tag = if outcome.is_ok() { "ok" } else { "err" };
            log.lock().unwrap().push(format!("callback {} {}", label, tag));
        })
    }

    #[tokio::test]
    async fn runs_tasks_in_fifo_order_with_callbacks_between() {
        let log: Log = Arc::default();
        let runner = Arc::new(RecordingRunner::new(log.clone(), Duration::from_millis(10)));
        let daemon = TaskDaemon::new(runner.clone());

        for name in ["A", "B", "C"] {
            daemon.enqueue(recorded_task(name, &log));
        }
        daemon.wait_idle().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "spawn A", "callback A ok", "spawn B", "callback B ok", "spawn C",
                "callback C ok"
            ]
        );
        assert_eq!(runner.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(daemon.state(), DaemonState::Idle);
        assert_eq!(daemon.pending(), 0);
    }

    #[tokio::test]
    async fn tasks_enqueued_while_processing_run_after_queued_ones() {
        let log: Log = Arc::default();
        let runner = Arc::new(RecordingRunner::new(log.clone(), Duration::from_millis(5)));
        let daemon = TaskDaemon::new(runner);

        let handle = daemon.clone();
        let late_log = log.clone();
        let first = Task::new("A", "").with_callback(move |_| {
            late_log.lock().unwrap().push("callback A".to_string());
            handle.enqueue(Task::new("D", ""));
        });

        daemon.enqueue(first);
        daemon.enqueue(Task::new("B", ""));
        daemon.enqueue(Task::new("C", ""));
        daemon.wait_idle().await;

        let spawns: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.starts_with("spawn"))
            .cloned()
            .collect();
        assert_eq!(spawns, vec!["spawn A", "spawn B", "spawn C", "spawn D"]);
    }

    #[tokio::test]
    async fn failed_task_does_not_stop_the_queue() {
        let log: Log = Arc::default();
        let runner = Arc::new(RecordingRunner::new(log.clone(), Duration::from_millis(1)));
        let daemon = TaskDaemon::new(runner);

        daemon.enqueue(recorded_task("slow", &log));
        daemon.enqueue(recorded_task("next", &log));
        daemon.wait_idle().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["spawn slow", "callback slow err", "spawn next", "callback next ok"]
        );
    }

    #[tokio::test]
    async fn panicking_callback_does_not_wedge_the_daemon() {
        let log: Log = Arc::default();
        let runner = Arc::new(RecordingRunner::new(log.clone(), Duration::from_millis(1)));
        let daemon = TaskDaemon::new(runner);

        daemon.enqueue(Task::new("boom", "").with_callback(|_| panic!("callback failure")));
        daemon.enqueue(recorded_task("after", &log));
        daemon.wait_idle().await;

        assert!(log.lock().unwrap().contains(&"callback after ok".to_string()));
        assert_eq!(daemon.state(), DaemonState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_enqueues_never_overlap() {
        let log: Log = Arc::default();
        let runner = Arc::new(RecordingRunner::new(log.clone(), Duration::from_millis(2)));
        let daemon = TaskDaemon::new(runner.clone());

        let mut producers = Vec::new();
        for p in 0..4 {
            let daemon = daemon.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..5 {
                    daemon.enqueue(Task::new(format!("p{p}-{i}"), ""));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }
        daemon.wait_idle().await;

        assert_eq!(runner.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(log.lock().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn idle_daemon_reports_idle_immediately() {
        let runner = Arc::new(RecordingRunner::new(Arc::default(), Duration::ZERO));
        let daemon = TaskDaemon::new(runner);
        assert_eq!(daemon.state(), DaemonState::Idle);
        daemon.wait_idle().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timed_out_agent_is_reported_and_queue_continues() {
        use crate::executor::{ExecutorConfig, ProcessExecutor};
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("agent.sh");
        // $7 is the task description.
        std::fs::write(
            &script,
            "#!/bin/sh\ncase \"$7\" in\n  slow) exec sleep 5 ;;\n  *) echo finished ;;\nesac\n",
        )
        .expect("write script");
        let mut perms = std::fs::metadata(&script).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).expect("chmod");

        let executor = ProcessExecutor::new(ExecutorConfig {
            agent_path: script.to_string_lossy().into_owned(),
            timeout: Duration::from_millis(300),
            ..ExecutorConfig::default()
        });
        let daemon = TaskDaemon::new(Arc::new(executor));

        let outcomes: Arc<StdMutex<Vec<String>>> = Arc::default();
        for name in ["slow", "fast"] {
            let outcomes = outcomes.clone();
            daemon.enqueue(Task::new(name, "").with_callback(move |outcome| {
                let entry = match outcome {
                    Ok(result) => format!("ok {}", result.stdout.trim()),
                    Err(ExecutionError::Timeout { .. }) => "timeout".to_string(),
                    Err(other) => format!("error {other}"),
                };
                outcomes.lock().unwrap().push(entry);
            }));
        }
        daemon.wait_idle().await;

        assert_eq!(*outcomes.lock().unwrap(), vec!["timeout", "ok finished"]);
    }
}
