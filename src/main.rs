//! agent-relay - task daemon entry point
//!
//! Runs the task daemon and, when `TASK_INBOX_PATH` is set, feeds it from the
//! inbox file until Ctrl-C.

use std::sync::Arc;

use agent_relay::{config::Config, InboxWatcher, ProcessExecutor, TaskDaemon};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: agent={}, project_root={}, timeout={}s, proxy={}",
        config.agent_path,
        config.default_project_root,
        config.task_timeout.as_secs(),
        if config.use_proxy {
            config.proxy_url.as_str()
        } else {
            "(disabled)"
        }
    );

    let executor = ProcessExecutor::new(config.executor_config());
    let daemon = TaskDaemon::new(Arc::new(executor));
    let cancel = CancellationToken::new();

    let watcher = match &config.inbox_path {
        Some(path) => {
            let watcher = InboxWatcher::new(path, config.default_project_root.clone())
                .with_interval(config.inbox_poll_interval);
            Some(watcher.spawn(daemon.clone(), cancel.clone()))
        }
        None => {
            warn!("TASK_INBOX_PATH is not set; nothing will feed the daemon");
            None
        }
    };

    info!("Task daemon started");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    cancel.cancel();
    if let Some(handle) = watcher {
        if let Err(e) = handle.await {
            warn!("Inbox watcher ended abnormally: {}", e);
        }
    }

    if daemon.pending() > 0 {
        warn!("Dropping {} queued task(s)", daemon.pending());
    }

    Ok(())
}
