use crate::backup::BackupError;
use crate::client::ClientError;
use crate::core_types::Height;
use crate::session_tree::SessionTreeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionsError {
    #[error("Session tree error: {0}")]
    SessionTree(#[from] SessionTreeError),

    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid session metadata: {0}")]
    InvalidMetadata(String),

    #[error("{op} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        op: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{stage} window closed at height {close_height}, now at {height}")]
    WindowClosed {
        stage: &'static str,
        close_height: Height,
        height: Height,
    },

    #[error("Shutdown requested")]
    Cancelled,
}
