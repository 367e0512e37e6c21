//! Relay Settlement - proof-of-relay settlement core
//!
//! Decides which served relays count toward reward, accumulates them into a
//! per-session sparse Merkle sum trie, survives crashes through a WAL and
//! snapshots, and submits claims and proofs inside their block windows.
//!
//! # Modules
//!
//! - [`difficulty`] - Relay mining difficulty arithmetic
//! - [`miner`] - Difficulty filter from served to mined relays
//! - [`smst`] - Sparse Merkle sum trie, stores and proofs
//! - [`mined_relay_wal`] - Per-session append-only relay log
//! - [`session_tree`] - Per-session trie state machine
//! - [`backup`] - Snapshot backup, retention and restore
//! - [`client`] - Chain client traits and the block notifier
//! - [`relayer_sessions`] - Block-driven claim/proof orchestration
//! - [`config`] / [`logging`] - YAML config and tracing setup

// Core types - must be first!
pub mod core_types;
pub mod relay;
pub mod serde_hex;

// Settlement components
pub mod backup;
pub mod client;
pub mod difficulty;
pub mod mined_relay_wal;
pub mod miner;
pub mod relayer_sessions;
pub mod session_tree;
pub mod smst;

// Ambient
pub mod config;
pub mod logging;

// Convenient re-exports at crate root
pub use backup::{BackupConfig, BackupEvent, BackupManager, SessionSnapshot};
pub use client::{BlockNotifier, ProofParams, QueryClient, SharedParams, TxClient};
pub use core_types::{Block, Height, SessionHeader, SessionKey};
pub use mined_relay_wal::{MinedRelayWal, WalConfig};
pub use miner::Miner;
pub use relay::{MinedRelay, Relay};
pub use relayer_sessions::{RelayerSessionsConfig, RelayerSessionsManager, SessionLifecycle};
pub use session_tree::{SessionTree, SessionTreeState};
pub use smst::{Smst, SmstProof, SmstRoot};
