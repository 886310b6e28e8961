//! Per-identity project selection.
//!
//! Remembers which project a user switched to with a trigger word. A
//! selection is valid for the calendar day it was made on and expires at the
//! next local midnight. When a storage path is configured the map is written
//! to disk as pretty JSON after every change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to write sessions to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode sessions: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSession {
    pub project_path: String,
    pub trigger_word: String,
    /// Local date the selection was made.
    pub date: NaiveDate,
}

impl ProjectSession {
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.date < today
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, ProjectSession>>,
    storage_path: Option<PathBuf>,
}

impl SessionStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            storage_path: None,
        }
    }

    /// Load sessions from `path`, starting empty when it is missing or
    /// unreadable.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let storage_path = path.into();

        let sessions = match fs::read_to_string(&storage_path).await {
            Ok(raw) => match serde_json::from_str::<HashMap<String, ProjectSession>>(&raw) {
                Ok(sessions) => {
                    tracing::info!(
                        "Loaded {} session(s) from {}",
                        sessions.len(),
                        storage_path.display()
                    );
                    sessions
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse sessions at {}: {}, starting empty",
                        storage_path.display(),
                        e
                    );
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                tracing::warn!(
                    "Failed to read sessions at {}: {}, starting empty",
                    storage_path.display(),
                    e
                );
                HashMap::new()
            }
        };

        Self {
            sessions: RwLock::new(sessions),
            storage_path: Some(storage_path),
        }
    }

    pub fn storage_path(&self) -> Option<&Path> {
        self.storage_path.as_deref()
    }

    /// The identity's current selection, if it has not expired.
    pub async fn get(&self, identity: &str) -> Option<ProjectSession> {
        self.get_on(identity, today()).await
    }

    /// Like [`get`](Self::get) with an explicit current date. Expired
    /// selections are removed.
    pub async fn get_on(&self, identity: &str, today: NaiveDate) -> Option<ProjectSession> {
        let session = self.sessions.read().await.get(identity).cloned()?;
        if !session.is_expired(today) {
            return Some(session);
        }

        if let Err(e) = self.clear(identity).await {
            tracing::warn!("Failed to drop expired session for {}: {}", identity, e);
        }
        None
    }

    pub async fn set(
        &self,
        identity: &str,
        project_path: &str,
        trigger_word: &str,
    ) -> Result<(), SessionError> {
        self.set_on(identity, project_path, trigger_word, today()).await
    }

    pub async fn set_on(
        &self,
        identity: &str,
        project_path: &str,
        trigger_word: &str,
        today: NaiveDate,
    ) -> Result<(), SessionError> {
        let session = ProjectSession {
            project_path: project_path.to_string(),
            trigger_word: trigger_word.to_string(),
            date: today,
        };
        self.sessions
            .write()
            .await
            .insert(identity.to_string(), session);
        self.save().await?;
        tracing::info!(
            "{} switched to project {} (trigger: {})",
            identity,
            project_path,
            trigger_word
        );
        Ok(())
    }

    /// Forget the identity's selection. Returns whether one existed.
    pub async fn clear(&self, identity: &str) -> Result<bool, SessionError> {
        let removed = self.sessions.write().await.remove(identity).is_some();
        if removed {
            self.save().await?;
            tracing::info!("Cleared project selection for {}", identity);
        }
        Ok(removed)
    }

    /// Drop every selection made before `today`. Returns how many went.
    pub async fn cleanup_expired(&self, today: NaiveDate) -> Result<usize, SessionError> {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let before = sessions.len();
            sessions.retain(|_, session| !session.is_expired(today));
            before - sessions.len()
        };
        if removed > 0 {
            self.save().await?;
            tracing::info!("Removed {} expired session(s)", removed);
        }
        Ok(removed)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn save(&self) -> Result<(), SessionError> {
        let Some(path) = &self.storage_path else {
            return Ok(());
        };

        let contents = {
            let sessions = self.sessions.read().await;
            serde_json::to_string_pretty(&*sessions)?
        };

        let io_err = |source| SessionError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, contents).await.map_err(io_err)?;
        fs::rename(&tmp_path, path).await.map_err(io_err)?;
        tracing::debug!("Saved sessions to {}", path.display());
        Ok(())
    }
}
