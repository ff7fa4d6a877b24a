use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::conversation_store::ConversationState;
use crate::settings::{config_dir, SettingsError};

/// Fixed storage key of the persisted conversation blob.
pub const STORAGE_KEY: &str = "chat-storage";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to resolve config directory: {0}")]
    Config(#[from] SettingsError),
    #[error("failed to read conversation state at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse conversation state at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to create state directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize conversation state: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write conversation state at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to move unreadable conversation state {path} aside: {source}")]
    Quarantine {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where the conversation store keeps its whole-state snapshot.
pub trait StatePersistence: Send + Sync {
    fn load(&self) -> Result<Option<ConversationState>, PersistenceError>;

    fn save(&self, state: &ConversationState) -> Result<(), PersistenceError>;

    /// Moves a snapshot that failed to parse out of the way so the next save
    /// does not overwrite it. Returns where it went, if anywhere.
    fn quarantine(&self) -> Result<Option<PathBuf>, PersistenceError> {
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct FileStatePersistence {
    path: PathBuf,
}

impl FileStatePersistence {
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatePersistence for FileStatePersistence {
    fn load(&self) -> Result<Option<ConversationState>, PersistenceError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let raw = fs::read_to_string(&self.path).map_err(|source| PersistenceError::Read {
            path: self.path.clone(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| PersistenceError::Parse {
                path: self.path.clone(),
                source,
            })
    }

    fn save(&self, state: &ConversationState) -> Result<(), PersistenceError> {
        if let Some(parent_dir) = self.path.parent() {
            fs::create_dir_all(parent_dir).map_err(|source| PersistenceError::CreateDir {
                path: parent_dir.to_path_buf(),
                source,
            })?;
        }

        let rendered = serde_json::to_string(state)
            .map_err(|source| PersistenceError::Serialize { source })?;
        fs::write(&self.path, rendered).map_err(|source| PersistenceError::Write {
            path: self.path.clone(),
            source,
        })
    }

    fn quarantine(&self) -> Result<Option<PathBuf>, PersistenceError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mut backup = self.path.clone().into_os_string();
        backup.push(format!(
            ".corrupt-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S%3f")
        ));
        let backup = PathBuf::from(backup);
        fs::rename(&self.path, &backup).map_err(|source| PersistenceError::Quarantine {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(backup))
    }
}

/// Keeps the last saved snapshot in memory.
#[derive(Debug, Default)]
pub struct MemoryStatePersistence {
    saved: Mutex<Option<ConversationState>>,
}

impl MemoryStatePersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn saved(&self) -> Option<ConversationState> {
        self.saved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl StatePersistence for MemoryStatePersistence {
    fn load(&self) -> Result<Option<ConversationState>, PersistenceError> {
        Ok(self.saved())
    }

    fn save(&self, state: &ConversationState) -> Result<(), PersistenceError> {
        *self
            .saved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(state.clone());
        Ok(())
    }
}

pub fn default_state_path() -> Result<PathBuf, PersistenceError> {
    Ok(config_dir()?.join(format!("{STORAGE_KEY}.json")))
}
