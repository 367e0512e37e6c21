//! Relayer Sessions
//!
//! Drives every session tree from relay insertion to on-chain settlement,
//! one block at a time.
//!
//! ```text
//!   MinedRelay ──▶ insert_relays ──▶ SessionsIndex ──▶ SessionTree.update
//!
//!   Block ──▶ on_block ──┬──▶ claim pipeline per session whose claim window opened
//!                        │      seed(claim open) → flush → wait(earliest)
//!                        │      → submit_claim → close mirror → seed(proof open)
//!                        │      → seed(earliest proof-1) → prove → submit_proof
//!                        │      → delete
//!                        └──▶ delete sessions past their proof window
//! ```
//!
//! On restart, persisted sessions are reclassified against the current height
//! (`reclassify`) and re-attached from their WAL or committed store.

pub mod error;
pub mod index;
pub mod manager;
pub mod reclassify;
pub mod retry;
pub mod state;
pub mod windows;

pub use error::SessionsError;
pub use index::{SessionMetadata, SessionsIndex};
pub use manager::{FailedSession, LoadSummary, RelayerSessionsManager, SettlementStage};
pub use reclassify::{DropReason, Reclass, reclassify};
pub use retry::{RetryConfig, retry_with_backoff};
pub use state::SessionLifecycle;

use crate::mined_relay_wal::WalConfig;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct RelayerSessionsConfig {
    /// Root of live stores and WALs
    pub store_root: PathBuf,
    /// Second copy of every live store; `None` disables mirroring
    pub mirror_root: Option<PathBuf>,
    pub wal: WalConfig,
    pub retry: RetryConfig,
    /// Capacity of the failed-session report channel
    pub failed_channel_capacity: usize,
}

impl Default for RelayerSessionsConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("./data/smt"),
            mirror_root: None,
            wal: WalConfig::default(),
            retry: RetryConfig::default(),
            failed_channel_capacity: 1024,
        }
    }
}
