//! Session Tree Backup
//!
//! Full JSON snapshots of session trees written to a secondary directory,
//! periodically and on lifecycle events, with count-bounded retention and
//! restore.
//!
//! # Directory Structure
//!
//! ```text
//! <backup_dir>/
//! └── <supplier>/
//!     └── <session_id>/
//!         ├── session_<supplier>_<session_id>_<ts>.json
//!         └── session_<supplier>_<session_id>_<ts>.json   # newest wins on restore
//! ```

pub mod kvstore;
pub mod manager;
pub mod restore;
pub mod snapshot;

pub use kvstore::BackupKvStore;
pub use manager::BackupManager;
pub use restore::restore_session_tree;
pub use snapshot::SessionSnapshot;

use crate::mined_relay_wal::WalError;
use crate::session_tree::SessionTreeError;
use crate::smst::SmstError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid backup directory: {0}")]
    InvalidDirectory(String),

    #[error("Session tree error: {0}")]
    SessionTree(#[from] SessionTreeError),

    #[error("Trie error: {0}")]
    Smst(#[from] SmstError),

    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("Restored root does not match claimed root for session {session_id}")]
    RootMismatch { session_id: String },
}

/// Backup triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupEvent {
    Periodic,
    SessionClose,
    ClaimGeneration,
    GracefulShutdown,
}

impl BackupEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupEvent::Periodic => "periodic",
            BackupEvent::SessionClose => "session_close",
            BackupEvent::ClaimGeneration => "claim_generation",
            BackupEvent::GracefulShutdown => "graceful_shutdown",
        }
    }
}

impl fmt::Display for BackupEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: bool,
    pub backup_dir: String,
    /// 0 disables the periodic trigger
    pub interval_seconds: u64,
    pub on_session_close: bool,
    pub on_claim_generation: bool,
    pub on_graceful_shutdown: bool,
    /// Snapshots kept per session directory; <= 0 keeps everything
    pub retain_backup_count: i64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backup_dir: "./data/backups".to_string(),
            interval_seconds: 0,
            on_session_close: false,
            on_claim_generation: false,
            on_graceful_shutdown: false,
            retain_backup_count: 0,
        }
    }
}

impl BackupConfig {
    pub fn validate(&self) -> Result<(), BackupError> {
        if self.enabled && self.backup_dir.trim().is_empty() {
            return Err(BackupError::InvalidDirectory(
                "backup_dir must be set when backups are enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn event_enabled(&self, event: BackupEvent) -> bool {
        if !self.enabled {
            return false;
        }
        match event {
            BackupEvent::Periodic => self.interval_seconds > 0,
            BackupEvent::SessionClose => self.on_session_close,
            BackupEvent::ClaimGeneration => self.on_claim_generation,
            BackupEvent::GracefulShutdown => self.on_graceful_shutdown,
        }
    }
}
