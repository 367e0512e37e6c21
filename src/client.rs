//! External collaborator contracts.
//!
//! The chain is reached through two narrow async traits; block commits arrive
//! through a [`BlockNotifier`] hub. Nothing in here knows about RPC transport.

use crate::core_types::{Block, Height, SessionHeader};
use crate::smst::SmstRoot;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Block height {got} does not advance past {latest}")]
    NonIncreasingHeight { latest: Height, got: Height },
}

// ============================================================
// PARAMETERS
// ============================================================

/// Session and window offsets from the shared module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedParams {
    pub num_blocks_per_session: u64,
    pub grace_period_end_offset_blocks: u64,
    pub claim_window_open_offset_blocks: u64,
    pub claim_window_close_offset_blocks: u64,
    pub proof_window_open_offset_blocks: u64,
    pub proof_window_close_offset_blocks: u64,
}

impl Default for SharedParams {
    fn default() -> Self {
        Self {
            num_blocks_per_session: 4,
            grace_period_end_offset_blocks: 1,
            claim_window_open_offset_blocks: 1,
            claim_window_close_offset_blocks: 4,
            proof_window_open_offset_blocks: 0,
            proof_window_close_offset_blocks: 4,
        }
    }
}

/// When a submitted claim must be backed by a proof.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProofParams {
    /// Claims whose estimated compute units reach this always need a proof
    pub proof_requirement_threshold: u64,
    /// Chance that a claim below the threshold is sampled for a proof
    pub proof_request_probability: f64,
}

impl Default for ProofParams {
    fn default() -> Self {
        Self {
            proof_requirement_threshold: 20,
            proof_request_probability: 0.25,
        }
    }
}

// ============================================================
// CHAIN CLIENTS
// ============================================================

#[async_trait]
pub trait TxClient: Send + Sync {
    async fn submit_claim(
        &self,
        header: &SessionHeader,
        supplier: &str,
        root: &SmstRoot,
    ) -> Result<(), ClientError>;

    async fn submit_proof(
        &self,
        header: &SessionHeader,
        supplier: &str,
        proof: &[u8],
    ) -> Result<(), ClientError>;
}

#[async_trait]
pub trait QueryClient: Send + Sync {
    async fn shared_params(&self) -> Result<SharedParams, ClientError>;

    async fn proof_params(&self) -> Result<ProofParams, ClientError>;

    /// Governance minimum leading-zero bits for relay mining
    async fn min_difficulty_bits(&self) -> Result<u32, ClientError>;

    async fn compute_units_per_relay(&self, service_id: &str) -> Result<u64, ClientError>;

    /// Current relay difficulty target hash of a service
    async fn relay_difficulty_target(&self, service_id: &str) -> Result<Vec<u8>, ClientError>;

    async fn claim_exists(&self, supplier: &str, session_id: &str) -> Result<bool, ClientError>;

    /// Committed block at exactly `height`
    async fn block_at(&self, height: Height) -> Result<Block, ClientError>;
}

// ============================================================
// BLOCK NOTIFIER
// ============================================================

/// Blocks kept for exact-height lookups by late waiters.
const BLOCK_HISTORY: usize = 256;

struct NotifierState {
    latest: Option<Block>,
    history: BTreeMap<Height, Block>,
}

/// Fan-out hub for committed blocks.
///
/// Heights must strictly increase. A bounded history lets a waiter that
/// subscribes late still see the exact block it asked for.
pub struct BlockNotifier {
    tx: broadcast::Sender<Block>,
    state: Mutex<NotifierState>,
}

impl BlockNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            state: Mutex::new(NotifierState {
                latest: None,
                history: BTreeMap::new(),
            }),
        }
    }

    pub fn publish(&self, block: Block) -> Result<(), ClientError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(latest) = &state.latest
                && block.height <= latest.height
            {
                return Err(ClientError::NonIncreasingHeight {
                    latest: latest.height,
                    got: block.height,
                });
            }
            state.history.insert(block.height, block.clone());
            while state.history.len() > BLOCK_HISTORY {
                state.history.pop_first();
            }
            state.latest = Some(block.clone());
        }
        debug!(height = block.height, "Block published");
        // No subscribers is fine
        let _ = self.tx.send(block);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Block> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Option<Block> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latest
            .clone()
    }

    /// Block at exactly `height`, if it is still in history.
    pub fn block_at(&self, height: Height) -> Option<Block> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .get(&height)
            .cloned()
    }

    /// Earliest known block at or past `height`.
    fn known_at_or_after(&self, height: Height) -> Option<Block> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &state.latest {
            Some(latest) if latest.height >= height => state
                .history
                .range(height..)
                .next()
                .map(|(_, b)| b.clone())
                .or_else(|| Some(latest.clone())),
            _ => None,
        }
    }

    /// First block at or past `height`; `None` once `cancel` fires.
    pub async fn wait_for_block(&self, height: Height, cancel: &CancellationToken) -> Option<Block> {
        // Subscribe before checking the cache so a concurrent publish is not missed
        let mut rx = self.tx.subscribe();
        if let Some(block) = self.known_at_or_after(height) {
            return Some(block);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                received = rx.recv() => match received {
                    Ok(block) if block.height >= height => return Some(block),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, target_height = height, "Block waiter lagged");
                        if let Some(block) = self.known_at_or_after(height) {
                            return Some(block);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }
}

// ============================================================
// STREAM MERGE
// ============================================================

/// Options owned by one merge.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    /// Stop the merge after forwarding the first error
    pub fail_fast: bool,
    pub capacity: usize,
}

/// Merge `sources` into a single receiver.
///
/// Items are forwarded in arrival order. Without `fail_fast` every source is
/// drained to completion; with it the merge ends after the first `Err`. The
/// merge also ends as soon as the returned receiver is dropped.
pub fn merge_streams<T, E>(
    sources: Vec<mpsc::Receiver<Result<T, E>>>,
    options: MergeOptions,
) -> (mpsc::Receiver<Result<T, E>>, JoinHandle<()>)
where
    T: Send + 'static,
    E: Send + 'static,
{
    let (tx, rx) = mpsc::channel(options.capacity.max(1));
    let streams: Vec<BoxStream<'static, Result<T, E>>> = sources
        .into_iter()
        .map(|source| {
            stream::unfold(source, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
                .boxed()
        })
        .collect();

    let handle = tokio::spawn(async move {
        let mut merged = stream::select_all(streams);
        loop {
            let item = tokio::select! {
                _ = tx.closed() => {
                    debug!("Merged stream consumer gone");
                    break;
                }
                next = merged.next() => match next {
                    Some(item) => item,
                    None => break,
                },
            };
            let failed = item.is_err();
            if tx.send(item).await.is_err() {
                break;
            }
            if failed && options.fail_fast {
                debug!("Merged stream stopped on first error");
                break;
            }
        }
    });

    (rx, handle)
}
