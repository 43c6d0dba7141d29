use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RewindError {
    #[error("Application not found: {0}")]
    AppNotFound(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Broken snapshot chain at {snapshot_id}: parent {parent_id} is no longer retained")]
    BrokenChain {
        snapshot_id: String,
        parent_id: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Launch error: {0}")]
    Launch(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Coarse classification used by callers that report failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Storage,
    Launch,
    Internal,
}

impl RewindError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RewindError::AppNotFound(_) | RewindError::SnapshotNotFound(_) => ErrorKind::NotFound,
            RewindError::BrokenChain { .. }
            | RewindError::Storage(_)
            | RewindError::Io(_)
            | RewindError::Serialization(_) => ErrorKind::Storage,
            RewindError::Launch(_) => ErrorKind::Launch,
            RewindError::Configuration(_) | RewindError::Unknown(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<anyhow::Error> for RewindError {
    fn from(err: anyhow::Error) -> Self {
        RewindError::Unknown(err.to_string())
    }
}

impl From<toml::de::Error> for RewindError {
    fn from(err: toml::de::Error) -> Self {
        RewindError::Configuration(err.to_string())
    }
}
