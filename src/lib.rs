//! # agent-relay
//!
//! Runs a command-line coding agent on behalf of chat requests.
//!
//! This library provides:
//! - Parsing of free-text requests into tasks (`--project`, `--model`, command prefixes)
//! - Best-effort input validation and output redaction
//! - A single-worker task daemon that never runs two agents at once
//! - A process executor with streaming output capture and a hard timeout
//! - Project switching by trigger word, remembered per user until midnight
//!
//! ## Architecture
//!
//! ```text
//!   chat frontend ──► RequestHandler ──┐
//!                                      ├──► TaskDaemon (FIFO) ──► ProcessExecutor ──► agent
//!   inbox file ────► InboxWatcher ─────┘
//! ```
//!
//! ## Task Flow
//! 1. Message arrives with a sender identity
//! 2. Allow-list, rate limit and project selection are checked
//! 3. Message is parsed and validated into a `Task`
//! 4. Task is queued; the daemon runs it when every earlier task is done
//! 5. Agent output is redacted, classified and turned into one reply
//!
//! ## Modules
//! - `handler`: request boundary for chat frontends
//! - `daemon`: serialized queue and the file inbox
//! - `executor`: agent subprocess and its NDJSON output records
//! - `parser`, `validation`, `redact`, `status`: text processing

pub mod config;
pub mod daemon;
pub mod executor;
pub mod handler;
pub mod parser;
pub mod projects;
pub mod rate_limit;
pub mod redact;
pub mod session;
pub mod status;
pub mod task;
pub mod util;
pub mod validation;

pub use config::Config;
pub use daemon::{DaemonState, InboxWatcher, TaskDaemon};
pub use executor::{ExecutionError, ExecutionResult, ProcessExecutor, TaskRunner};
pub use handler::{InboundMessage, RequestHandler};
pub use task::{Task, TaskId};
