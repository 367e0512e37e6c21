//! Mined-Relay Write-Ahead Log
//!
//! Per-session append-only log of mined relays. Replaying it rebuilds the
//! in-memory session trie after a crash.
//!
//! # File Layout
//!
//! ```text
//! ┌─────────────┬──────────┬──────────────────────────────────┐
//! │ version     │ 1 byte   │ WAL_VERSION, written once        │
//! ├─────────────┼──────────┼──────────────────────────────────┤
//! │ payload_len │ 4 bytes  │ u32 LE                           │  ┐
//! │ weight      │ 8 bytes  │ u64 LE compute units             │  │ repeated
//! │ relay_hash  │ 32 bytes │ trie key                         │  │ per relay
//! │ payload     │ N bytes  │ serialized relay (trie value)    │  ┘
//! └─────────────┴──────────┴──────────────────────────────────┘
//! ```

pub mod reader;
pub mod recovery;
pub mod writer;

pub use reader::WalReader;
pub use recovery::{WalRecovery, rebuild_smst, replay};
pub use writer::MinedRelayWal;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Current frame layout version.
pub const WAL_VERSION: u8 = 1;

/// Frame header: payload_len + weight + relay_hash.
pub const FRAME_HEADER_SIZE: usize = 4 + 8 + 32;

/// Upper bound on a single payload; anything larger is treated as corruption.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported WAL version {found} (expected {expected})")]
    UnsupportedVersion { found: u8, expected: u8 },

    #[error("Truncated WAL frame at offset {offset}")]
    Truncated { offset: u64 },

    #[error("Corrupt WAL frame at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("Payload of {len} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("WAL writer failed and no longer accepts writes")]
    Failed,

    #[error("WAL is closed")]
    Closed,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub relay_hash: [u8; 32],
    pub weight: u64,
    pub payload: Vec<u8>,
}

impl WalEntry {
    /// Append the frame encoding to `buf`.
    pub fn encode_into(relay_hash: &[u8; 32], payload: &[u8], weight: u64, buf: &mut Vec<u8>) {
        buf.reserve(FRAME_HEADER_SIZE + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&weight.to_le_bytes());
        buf.extend_from_slice(relay_hash);
        buf.extend_from_slice(payload);
    }
}

/// Flush policy for the mined-relay WAL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WalConfig {
    /// Buffered bytes that trigger a write + fsync.
    pub flush_threshold_bytes: usize,
    /// Period of the background flush timer.
    pub flush_interval_secs: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            flush_threshold_bytes: 10 * 1024 * 1024,
            flush_interval_secs: 10,
        }
    }
}

/// `<store_root>/mined_relays/<supplier>/<session_id>.wal`
pub fn wal_path(store_root: &Path, supplier: &str, session_id: &str) -> PathBuf {
    store_root
        .join("mined_relays")
        .join(supplier)
        .join(format!("{}.wal", session_id))
}
