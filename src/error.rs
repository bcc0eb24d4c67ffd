use crate::integrations::reminders::ReminderStoreError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("missing required configuration: {}", .0.join(", "))]
    MissingConfig(Vec<&'static str>),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("reminders access denied: {0}")]
    PermissionDenied(String),

    #[error("another sync run holds the state lock {} (remove it if no run is active)", .path.display())]
    StateLocked { path: PathBuf },

    #[error("sync state error: {0}")]
    State(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("HTTP {status}: {detail}")]
    Http { status: u16, detail: String },

    #[error("reminders store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Errors that stop the whole run rather than a single operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::MissingConfig(_)
                | SyncError::Config(_)
                | SyncError::PermissionDenied(_)
                | SyncError::StateLocked { .. }
                | SyncError::State(_)
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Request(err.to_string())
    }
}

impl From<ReminderStoreError> for SyncError {
    fn from(err: ReminderStoreError) -> Self {
        match err {
            ReminderStoreError::PermissionDenied(msg) => SyncError::PermissionDenied(msg),
            other => SyncError::Store(other.to_string()),
        }
    }
}
