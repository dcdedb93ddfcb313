use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::remote::RemoteError;
use crate::storage::{BackupError, StorageError};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Sync is not configured")]
    NotConfigured,
    #[error("Credentials not found")]
    CredentialsMissing,
    #[error("Keyring error: {0}")]
    Keyring(String),
    #[error("No merge is waiting for a resolution")]
    NoPendingMerge,
    #[error("No pre-fetch backup to revert to")]
    NoPreFetchBackup,
    #[error("Nothing has been synced to the remote yet")]
    NothingOnRemote,
    #[error("{0} is the live sync blob")]
    LiveBlob(String),
}

/// Coarse classification used for status messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncErrorKind {
    Network,
    Conflict,
    Authorization,
    Storage,
    Malformed,
    Unknown,
}

impl SyncError {
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            SyncError::Remote(e) => match e {
                RemoteError::Transport(_)
                | RemoteError::Timeout(_)
                | RemoteError::Server { .. }
                | RemoteError::Unreachable { .. } => SyncErrorKind::Network,
                RemoteError::Conflict => SyncErrorKind::Conflict,
                RemoteError::Unauthorized => SyncErrorKind::Authorization,
                RemoteError::Payload { .. } => SyncErrorKind::Malformed,
                RemoteError::InvalidUrl(_) | RemoteError::NotFound(_) => SyncErrorKind::Unknown,
            },
            SyncError::Storage(_) | SyncError::Io(_) => SyncErrorKind::Storage,
            SyncError::Backup(_) | SyncError::Json(_) => SyncErrorKind::Malformed,
            SyncError::CredentialsMissing | SyncError::Keyring(_) => SyncErrorKind::Authorization,
            _ => SyncErrorKind::Unknown,
        }
    }

    /// Short message suitable for a status line
    pub fn status_message(&self) -> String {
        match self.kind() {
            SyncErrorKind::Network => format!("Network unreachable: {}", self),
            SyncErrorKind::Conflict => "Remote changed during sync; sync again to merge".to_string(),
            SyncErrorKind::Authorization => "Authorization failed; check the API key".to_string(),
            SyncErrorKind::Storage => format!("Local storage error: {}", self),
            SyncErrorKind::Malformed => format!("Remote data is unreadable: {}", self),
            SyncErrorKind::Unknown => format!("Sync failed: {}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
