//! Relay Miner
//!
//! Filters served relays down to the reward-eligible ("mined") ones.
//!
//! ```text
//!   Relay ──bincode──▶ bytes ──sha256──▶ hash
//!                                         │
//!            leading zero bits >= min ────┤
//!            hash < service target (opt) ─┴──▶ MinedRelay
//! ```
//!
//! Dropping a relay that does not meet difficulty is normal operation and is
//! only traced at debug level.

use crate::client::{ClientError, MergeOptions, QueryClient, merge_streams};
use crate::core_types::Height;
use crate::difficulty::{count_leading_zero_bits, is_volume_applicable};
use crate::relay::{MinedRelay, Relay};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct MinerStats {
    pub seen: u64,
    pub mined: u64,
    pub dropped: u64,
}

pub struct Miner {
    min_difficulty_bits: u32,
    query: Option<Arc<dyn QueryClient>>,
    /// Difficulty target per (service, session start height)
    targets: RwLock<FxHashMap<String, (Height, Vec<u8>)>>,
}

impl Miner {
    /// Miner with a fixed threshold and no per-service targets.
    pub fn new(min_difficulty_bits: u32) -> Self {
        Self {
            min_difficulty_bits,
            query: None,
            targets: RwLock::new(FxHashMap::default()),
        }
    }

    /// Miner using the governance threshold, fetching service targets on demand.
    pub async fn from_query(query: Arc<dyn QueryClient>) -> Result<Self, ClientError> {
        let min_difficulty_bits = query.min_difficulty_bits().await?;
        info!(min_difficulty_bits, "Relay miner configured from chain");
        Ok(Self {
            min_difficulty_bits,
            query: Some(query),
            targets: RwLock::new(FxHashMap::default()),
        })
    }

    pub fn min_difficulty_bits(&self) -> u32 {
        self.min_difficulty_bits
    }

    /// Pin the target for `service_id` from `session_start` onward.
    pub fn set_difficulty_target(&self, service_id: &str, session_start: Height, target: Vec<u8>) {
        let mut targets = self.targets.write().unwrap_or_else(PoisonError::into_inner);
        match targets.get(service_id) {
            Some((start, _)) if *start > session_start => {}
            _ => {
                targets.insert(service_id.to_string(), (session_start, target));
            }
        }
    }

    fn target_for(&self, service_id: &str, session_start: Height) -> Option<Vec<u8>> {
        let targets = self.targets.read().unwrap_or_else(PoisonError::into_inner);
        targets
            .get(service_id)
            .filter(|(start, _)| *start == session_start)
            .map(|(_, t)| t.clone())
    }

    async fn refresh_target(&self, relay: &Relay) {
        let Some(query) = &self.query else {
            return;
        };
        let header = relay.session_header();
        if self
            .target_for(&header.service_id, header.session_start_block_height)
            .is_some()
        {
            return;
        }
        match query.relay_difficulty_target(&header.service_id).await {
            Ok(target) => self.set_difficulty_target(
                &header.service_id,
                header.session_start_block_height,
                target,
            ),
            Err(e) => warn!(
                service_id = %header.service_id,
                error = %e,
                "Failed to fetch relay difficulty target, using threshold only"
            ),
        }
    }

    /// Serialize, hash and filter one relay.
    pub fn mine_relay(&self, relay: &Relay) -> Option<MinedRelay> {
        let bytes = match bincode::serialize(relay) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to serialize relay, dropping");
                return None;
            }
        };
        let hash: [u8; 32] = Sha256::digest(&bytes).into();

        let bits = match count_leading_zero_bits(&hash) {
            Ok(bits) => bits,
            Err(e) => {
                warn!(error = %e, "Degenerate relay hash, dropping");
                return None;
            }
        };
        if bits < self.min_difficulty_bits {
            debug!(bits, min = self.min_difficulty_bits, "Relay below difficulty threshold");
            return None;
        }

        let header = relay.session_header();
        if let Some(target) = self.target_for(&header.service_id, header.session_start_block_height)
            && !is_volume_applicable(&hash, &target)
        {
            debug!(service_id = %header.service_id, "Relay not volume applicable");
            return None;
        }

        Some(MinedRelay {
            relay: relay.clone(),
            bytes,
            hash,
        })
    }

    /// Mine every relay from `rx` into `tx` until either side closes.
    pub async fn mine_relays(&self, mut rx: mpsc::Receiver<Relay>, tx: mpsc::Sender<MinedRelay>) -> MinerStats {
        let mut stats = MinerStats::default();
        while let Some(relay) = rx.recv().await {
            stats.seen += 1;
            self.refresh_target(&relay).await;
            match self.mine_relay(&relay) {
                Some(mined) => {
                    stats.mined += 1;
                    if tx.send(mined).await.is_err() {
                        warn!("Mined relay consumer closed, stopping miner");
                        break;
                    }
                }
                None => stats.dropped += 1,
            }
        }
        info!(
            seen = stats.seen,
            mined = stats.mined,
            dropped = stats.dropped,
            "Relay miner stopped"
        );
        stats
    }

    pub fn spawn(
        self: Arc<Self>,
        rx: mpsc::Receiver<Relay>,
        capacity: usize,
    ) -> (mpsc::Receiver<MinedRelay>, JoinHandle<MinerStats>) {
        let (tx, out) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(async move { self.mine_relays(rx, tx).await });
        (out, handle)
    }

    /// Mine relays from several serving frontends.
    ///
    /// Source errors are logged and skipped; every source is drained. The
    /// returned handle completes once mining stopped and the merge and
    /// forwarding tasks behind it have been joined.
    pub fn spawn_merged<E>(
        self: Arc<Self>,
        sources: Vec<mpsc::Receiver<Result<Relay, E>>>,
        capacity: usize,
    ) -> (mpsc::Receiver<MinedRelay>, JoinHandle<MinerStats>)
    where
        E: fmt::Display + Send + 'static,
    {
        let (mut merged, merge_handle) = merge_streams(
            sources,
            MergeOptions {
                fail_fast: false,
                capacity,
            },
        );
        let (relay_tx, relay_rx) = mpsc::channel(capacity.max(1));
        let forward = tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = relay_tx.closed() => break,
                    next = merged.recv() => match next {
                        Some(item) => item,
                        None => break,
                    },
                };
                match item {
                    Ok(relay) => {
                        if relay_tx.send(relay).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Relay source error"),
                }
            }
            // Unblocks a merge still sending into a consumer that went away
            drop(merged);
            if let Err(e) = merge_handle.await {
                error!(error = %e, "Relay source merge ended abnormally");
            }
        });

        let (tx, out) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(async move {
            let stats = self.mine_relays(relay_rx, tx).await;
            if let Err(e) = forward.await {
                error!(error = %e, "Relay forwarder ended abnormally");
            }
            stats
        });
        (out, handle)
    }
}
