//! Line-oriented console frontend.
//!
//! Reads one request per stdin line and prints the reply, acting as a local
//! stand-in for a chat frontend. Lines starting with `@<identity> ` are sent
//! as that identity; other lines use the identity given as the first
//! argument (default `console`).
//!
//! The console identity is allowed automatically when no allow-list is
//! configured. Progress updates for running tasks are printed as they arrive.

use std::sync::Arc;

use agent_relay::session::SessionStore;
use agent_relay::{config::Config, InboundMessage, ProcessExecutor, RequestHandler, TaskDaemon};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Split an optional `@identity ` prefix off a console line.
fn split_identity<'a>(line: &'a str, default_identity: &'a str) -> (&'a str, &'a str) {
    if let Some(rest) = line.strip_prefix('@') {
        if let Some((identity, text)) = rest.split_once(char::is_whitespace) {
            if !identity.is_empty() {
                return (identity, text.trim_start());
            }
        }
    }
    (default_identity, line)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout carries only replies.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let identity = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "console".to_string());

    let mut config = Config::from_env()?;
    if config.allowed_user_ids.is_empty() {
        info!("No allow-list configured, allowing console identity '{}'", identity);
        config.allowed_user_ids.insert(identity.clone());
    }

    let sessions = match &config.session_file {
        Some(path) => SessionStore::load(path).await,
        None => SessionStore::in_memory(),
    };
    let today = chrono::Local::now().date_naive();
    if let Err(e) = sessions.cleanup_expired(today).await {
        warn!("Failed to clean up expired sessions: {}", e);
    }

    let executor = ProcessExecutor::new(config.executor_config());
    let daemon = TaskDaemon::new(Arc::new(executor));
    let handler = RequestHandler::from_config(&config, daemon, sessions);

    let (progress, mut updates) = tokio::sync::mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            println!("{}\n", update);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (sender, text) = split_identity(line, &identity);
        let reply = handler
            .handle_with_progress(InboundMessage::new(sender, text), progress.clone())
            .await;
        println!("{}\n", reply);
    }

    Ok(())
}
