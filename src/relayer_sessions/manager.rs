//! Relayer Sessions Manager - block-driven claim/proof orchestration.

use super::index::{SessionMetadata, SessionsIndex, load_metadata, write_metadata};
use super::reclassify::{Reclass, needs_claim_lookup, reclassify};
use super::retry::retry_with_backoff;
use super::state::SessionLifecycle;
use super::windows::{
    claim_window_close_height, claim_window_open_height, earliest_claim_commit_height,
    earliest_proof_commit_height, proof_path, proof_requirement, proof_window_close_height,
    proof_window_open_height, session_grace_period_end_height,
};
use super::{RelayerSessionsConfig, SessionsError};
use crate::backup::manager::BackupTargets;
use crate::backup::{BackupEvent, BackupManager, restore_session_tree};
use crate::client::{BlockNotifier, ClientError, QueryClient, SharedParams, TxClient};
use crate::core_types::{Block, Height, SessionHeader, SessionKey};
use crate::mined_relay_wal;
use crate::relay::MinedRelay;
use crate::session_tree::{
    BackupSource, SessionTree, SessionTreeError, restore_store_from_mirror, store_path,
};
use crate::smst::SmstRoot;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::fmt;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ============================================================
// REPORTS
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementStage {
    Claim,
    Proof,
}

impl SettlementStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStage::Claim => "claim",
            SettlementStage::Proof => "proof",
        }
    }
}

impl fmt::Display for SettlementStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A session dropped because its settlement could not complete.
#[derive(Debug, Clone)]
pub struct FailedSession {
    pub key: SessionKey,
    pub session_header: SessionHeader,
    pub stage: SettlementStage,
    pub error: String,
}

/// Outcome of a restart pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub retained: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
struct SessionStatus {
    lifecycle: SessionLifecycle,
    claim_submitted: bool,
    pipeline_running: bool,
}

impl SessionStatus {
    fn active() -> Self {
        Self {
            lifecycle: SessionLifecycle::Active,
            claim_submitted: false,
            pipeline_running: false,
        }
    }
}

// ============================================================
// MANAGER
// ============================================================

pub struct RelayerSessionsManager {
    config: RelayerSessionsConfig,
    index: SessionsIndex,
    tx_client: Arc<dyn TxClient>,
    query_client: Arc<dyn QueryClient>,
    notifier: Arc<BlockNotifier>,
    backup: Option<Arc<BackupManager>>,
    statuses: Mutex<FxHashMap<SessionKey, SessionStatus>>,
    compute_units: Mutex<FxHashMap<String, u64>>,
    /// Last shared params seen by the block loop
    shared_params: Mutex<Option<SharedParams>>,
    failed_tx: mpsc::Sender<FailedSession>,
    failed_rx: Mutex<Option<mpsc::Receiver<FailedSession>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RelayerSessionsManager {
    pub fn new(
        config: RelayerSessionsConfig,
        tx_client: Arc<dyn TxClient>,
        query_client: Arc<dyn QueryClient>,
        notifier: Arc<BlockNotifier>,
        backup: Option<Arc<BackupManager>>,
    ) -> Arc<Self> {
        let (failed_tx, failed_rx) = mpsc::channel(config.failed_channel_capacity.max(1));
        let index = SessionsIndex::new(config.store_root.clone(), config.wal.clone())
            .with_mirror_root(config.mirror_root.clone());
        Arc::new(Self {
            config,
            index,
            tx_client,
            query_client,
            notifier,
            backup,
            statuses: Mutex::new(FxHashMap::default()),
            compute_units: Mutex::new(FxHashMap::default()),
            shared_params: Mutex::new(None),
            failed_tx,
            failed_rx: Mutex::new(Some(failed_rx)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn index(&self) -> &SessionsIndex {
        &self.index
    }

    pub fn lifecycle(&self, key: &SessionKey) -> Option<SessionLifecycle> {
        locked(&self.statuses).get(key).map(|s| s.lifecycle)
    }

    /// Receiver of sessions that exhausted their retries. Can be taken once.
    pub fn take_failed_sessions(&self) -> Option<mpsc::Receiver<FailedSession>> {
        locked(&self.failed_rx).take()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn set_lifecycle(&self, key: &SessionKey, lifecycle: SessionLifecycle) {
        let mut statuses = locked(&self.statuses);
        let status = statuses.entry(key.clone()).or_insert_with(SessionStatus::active);
        debug!(key = %key, from = %status.lifecycle, to = %lifecycle, "Session lifecycle transition");
        status.lifecycle = lifecycle;
        if lifecycle.is_terminal() {
            status.pipeline_running = false;
        }
    }

    /// Compute units per relay of `service_id`, cached for the process lifetime.
    pub async fn compute_units_per_relay(&self, service_id: &str) -> Result<u64, ClientError> {
        let cached = locked(&self.compute_units).get(service_id).copied();
        if let Some(cu) = cached {
            return Ok(cu);
        }
        let cu = self.query_client.compute_units_per_relay(service_id).await?;
        locked(&self.compute_units).insert(service_id.to_string(), cu);
        Ok(cu)
    }

    async fn wait_for_block(&self, height: Height) -> Result<Block, SessionsError> {
        self.notifier
            .wait_for_block(height, &self.cancel)
            .await
            .ok_or(SessionsError::Cancelled)
    }

    /// The block at exactly `height`, for seeding window offsets and proof paths.
    ///
    /// Waits until the chain reaches `height`, then falls back to querying the
    /// chain when the notifier history no longer holds that height.
    async fn seed_block(&self, height: Height) -> Result<Block, SessionsError> {
        let reached = self.wait_for_block(height).await?;
        if reached.height == height {
            return Ok(reached);
        }
        if let Some(block) = self.notifier.block_at(height) {
            return Ok(block);
        }
        debug!(height, latest = reached.height, "Seed block not in history, querying chain");
        let block = retry_with_backoff(&self.config.retry, "block_at", &self.cancel, || {
            self.query_client.block_at(height)
        })
        .await?;
        Ok(block)
    }

    fn persist_metadata(&self, tree: &SessionTree, claim_submitted: bool) {
        let metadata = SessionMetadata::for_tree(tree, claim_submitted);
        if let Err(e) = write_metadata(self.index.store_root(), &metadata) {
            warn!(key = %tree.key(), error = %e, "Failed to persist session metadata");
        }
    }

    async fn backup_event(&self, tree: &SessionTree, event: BackupEvent) {
        let Some(backup) = &self.backup else {
            return;
        };
        if !backup.config().event_enabled(event) {
            return;
        }
        let cu = match self.compute_units_per_relay(&tree.header().service_id).await {
            Ok(cu) => cu,
            Err(e) => {
                warn!(key = %tree.key(), event = %event, error = %e, "Skipping backup, compute units unavailable");
                return;
            }
        };
        if let Err(e) = backup.backup_on_event(tree, event, cu) {
            error!(key = %tree.key(), event = %event, error = %e, "Session backup failed");
        }
    }

    /// Delete a tree's store and WAL and drop it from the index.
    ///
    /// A tree whose files could not be removed stays indexed; the expiry
    /// sweep in `on_block` retries the delete.
    fn remove_tree(&self, tree: &SessionTree, lifecycle: SessionLifecycle) {
        let key = tree.key();
        match tree.delete() {
            Ok(()) => {
                self.index.remove_session(&key);
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to delete session tree storage, will retry"),
        }
        self.set_lifecycle(&key, lifecycle);
    }

    /// Remove on-disk state of a persisted session that is not in the index.
    fn discard_persisted(&self, metadata: &SessionMetadata) {
        let supplier = &metadata.supplier_operator_address;
        let session_id = &metadata.session_header.session_id;
        let root = self.index.store_root();
        let store = store_path(root, supplier, session_id);
        if let Err(e) = fs::remove_dir_all(&store)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %store.display(), error = %e, "Failed to remove session store");
        }
        let wal = mined_relay_wal::wal_path(root, supplier, session_id);
        if let Err(e) = fs::remove_file(&wal)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %wal.display(), error = %e, "Failed to remove session WAL");
        }
        if let Some(mirror_root) = self.index.mirror_root() {
            let mirror = store_path(mirror_root, supplier, session_id);
            if let Err(e) = fs::remove_dir_all(&mirror)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %mirror.display(), error = %e, "Failed to remove session store mirror");
            }
        }
    }

    /// Re-attach a flushed session, rebuilding a lost live store from its mirror.
    fn reattach_flushed(&self, metadata: &SessionMetadata, root: SmstRoot) -> Result<SessionTree, SessionsError> {
        let header = &metadata.session_header;
        let supplier = &metadata.supplier_operator_address;
        let store_root = self.index.store_root();
        let reopen = || SessionTree::from_flushed(header.clone(), supplier, store_root, self.config.wal.clone(), root);
        match (reopen(), self.index.mirror_root()) {
            (Ok(tree), _) => Ok(tree),
            (Err(e), Some(mirror_root)) => {
                warn!(key = %metadata.key(), error = %e, "Live store unusable, restoring from mirror");
                let copied = restore_store_from_mirror(store_root, mirror_root, supplier, &header.session_id)?;
                info!(key = %metadata.key(), entries = copied, "Live store restored from mirror");
                Ok(reopen()?)
            }
            (Err(e), None) => Err(e.into()),
        }
    }

    async fn claim_found(
        &self,
        height: Height,
        params: &SharedParams,
        header: &SessionHeader,
        supplier: &str,
        known_submitted: bool,
    ) -> Result<bool, SessionsError> {
        if known_submitted {
            return Ok(true);
        }
        if !needs_claim_lookup(height, params, header) {
            return Ok(false);
        }
        Ok(self
            .query_client
            .claim_exists(supplier, &header.session_id)
            .await?)
    }

    fn register_retained(&self, tree: Arc<SessionTree>, reclass: Reclass) -> bool {
        let key = tree.key();
        if !self.index.insert(tree) {
            return false;
        }
        let claim_submitted = reclass == Reclass::RetainForProof;
        let lifecycle = if claim_submitted {
            SessionLifecycle::ProofWindowOpen
        } else {
            SessionLifecycle::Active
        };
        locked(&self.statuses).insert(
            key,
            SessionStatus {
                lifecycle,
                claim_submitted,
                pipeline_running: false,
            },
        );
        true
    }

    // --------------------------------------------------------
    // Restart
    // --------------------------------------------------------

    /// Re-attach sessions persisted under the store root.
    ///
    /// Open sessions are rebuilt from their WAL, flushed ones from their
    /// committed store.
    pub async fn load_persisted(&self, current_height: Height) -> Result<LoadSummary, SessionsError> {
        let mut summary = LoadSummary::default();
        let persisted = load_metadata(self.index.store_root())?;
        if persisted.is_empty() {
            return Ok(summary);
        }
        let params = self.query_client.shared_params().await?;

        for metadata in persisted {
            let key = metadata.key();
            if self.index.contains(&key) {
                summary.skipped += 1;
                continue;
            }
            let header = &metadata.session_header;
            let supplier = &metadata.supplier_operator_address;
            let found = self
                .claim_found(current_height, &params, header, supplier, metadata.claim_submitted)
                .await?;

            let reclass = reclassify(current_height, &params, header, found);
            if let Reclass::Delete(reason) = reclass {
                info!(key = %key, reason = %reason, height = current_height, "Discarding persisted session");
                self.discard_persisted(&metadata);
                summary.deleted += 1;
                continue;
            }

            let rebuilt = match metadata.claimed_root()? {
                Some(root) => self.reattach_flushed(&metadata, root),
                None => SessionTree::from_wal(
                    header.clone(),
                    supplier,
                    self.index.store_root(),
                    self.config.wal.clone(),
                )
                .map_err(SessionsError::from),
            };
            match rebuilt {
                Ok(tree) => {
                    if let Some(mirror_root) = self.index.mirror_root() {
                        tree.attach_mirror(mirror_root);
                    }
                    let tree = Arc::new(tree);
                    if found && !metadata.claim_submitted {
                        self.persist_metadata(&tree, true);
                    }
                    if self.register_retained(tree, reclass) {
                        summary.retained += 1;
                    } else {
                        summary.skipped += 1;
                    }
                }
                Err(e) => {
                    // Files are left in place for manual recovery
                    error!(key = %key, error = %e, "Failed to rebuild persisted session");
                    summary.failed += 1;
                }
            }
        }

        info!(
            retained = summary.retained,
            deleted = summary.deleted,
            skipped = summary.skipped,
            failed = summary.failed,
            height = current_height,
            "Persisted sessions loaded"
        );
        Ok(summary)
    }

    /// Restore sessions from the newest backups. Sessions already in the
    /// index are left alone.
    pub async fn restore_from_backup(&self, current_height: Height) -> Result<LoadSummary, SessionsError> {
        let mut summary = LoadSummary::default();
        let Some(backup) = &self.backup else {
            return Ok(summary);
        };
        let snapshots = backup.restore_all()?;
        if snapshots.is_empty() {
            return Ok(summary);
        }
        let params = self.query_client.shared_params().await?;

        for snapshot in snapshots {
            let header = &snapshot.session_header;
            let supplier = &snapshot.supplier_operator_address;
            let key = SessionKey::new(supplier, header);
            if self.index.contains(&key) {
                summary.skipped += 1;
                continue;
            }

            let found = self
                .claim_found(current_height, &params, header, supplier, false)
                .await?;
            let reclass = reclassify(current_height, &params, header, found);
            if let Reclass::Delete(reason) = reclass {
                info!(key = %key, reason = %reason, "Backup no longer settleable, skipping");
                summary.deleted += 1;
                continue;
            }

            match restore_session_tree(&snapshot, self.index.store_root(), self.config.wal.clone()) {
                Ok(tree) => {
                    if let Some(mirror_root) = self.index.mirror_root() {
                        tree.attach_mirror(mirror_root);
                    }
                    let tree = Arc::new(tree);
                    self.persist_metadata(&tree, found);
                    if self.register_retained(tree, reclass) {
                        summary.retained += 1;
                    } else {
                        summary.skipped += 1;
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to restore session from backup");
                    summary.failed += 1;
                }
            }
        }

        info!(
            retained = summary.retained,
            deleted = summary.deleted,
            skipped = summary.skipped,
            failed = summary.failed,
            "Sessions restored from backup"
        );
        Ok(summary)
    }

    // --------------------------------------------------------
    // Relay insertion
    // --------------------------------------------------------

    /// Add one mined relay to its session tree, weighted by compute units.
    pub async fn insert_relay(&self, relay: &MinedRelay) -> Result<(), SessionsError> {
        let header = relay.relay.session_header();
        let supplier = relay.relay.supplier_operator_address();

        let cached_params = *locked(&self.shared_params);
        if let (Some(params), Some(latest)) = (cached_params, self.notifier.latest())
            && latest.height > session_grace_period_end_height(&params, header.session_end_block_height)
        {
            return Err(SessionsError::SessionTree(SessionTreeError::Closed));
        }

        let cu = self.compute_units_per_relay(&header.service_id).await?;
        let (tree, created) = self.index.ensure_tree(header, supplier)?;
        if created {
            locked(&self.statuses)
                .entry(tree.key())
                .or_insert_with(SessionStatus::active);
            info!(
                key = %tree.key(),
                service_id = %header.service_id,
                compute_units_per_relay = cu,
                "New session tree"
            );
        }
        tree.update(&relay.hash, &relay.bytes, cu)?;
        Ok(())
    }

    /// Consume mined relays until the stream ends or the manager stops.
    pub fn insert_relays(self: &Arc<Self>, mut rx: mpsc::Receiver<MinedRelay>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut inserted = 0u64;
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(relay) => match manager.insert_relay(&relay).await {
                            Ok(()) => inserted += 1,
                            Err(e) => warn!(
                                session_id = %relay.relay.session_header().session_id,
                                error = %e,
                                "Mined relay not inserted"
                            ),
                        },
                        None => break,
                    },
                }
            }
            info!(inserted, "Relay insertion stopped");
        })
    }

    // --------------------------------------------------------
    // Block handling
    // --------------------------------------------------------

    /// Start claim pipelines for due sessions and drop expired ones.
    pub async fn on_block(self: &Arc<Self>, block: &Block) {
        let params = match self.query_client.shared_params().await {
            Ok(params) => params,
            Err(e) => {
                warn!(height = block.height, error = %e, "Shared params unavailable, skipping block");
                return;
            }
        };
        *locked(&self.shared_params) = Some(params);

        for tree in self.index.sessions_to_claim(block.height, &params) {
            self.maybe_start_pipeline(tree, params, block.height);
        }

        for tree in self.index.expired_sessions(block.height, &params) {
            let running = locked(&self.statuses)
                .get(&tree.key())
                .is_some_and(|s| s.pipeline_running);
            if running {
                continue;
            }
            warn!(key = %tree.key(), height = block.height, "Session expired before settlement");
            self.remove_tree(&tree, SessionLifecycle::Dropped);
        }
    }

    fn maybe_start_pipeline(self: &Arc<Self>, tree: Arc<SessionTree>, params: SharedParams, height: Height) {
        let key = tree.key();
        let skip_claim = {
            let mut statuses = locked(&self.statuses);
            let status = statuses.entry(key.clone()).or_insert_with(SessionStatus::active);
            if status.pipeline_running || status.lifecycle.is_terminal() {
                return;
            }
            if let Err(SessionTreeError::AlreadyClaiming) = tree.start_claiming() {
                // Restored mid-claim with no pipeline behind it
                let end = tree.header().session_end_block_height;
                if height > proof_window_close_height(&params, end) {
                    return;
                }
                debug!(key = %key, "Resuming settlement of restored session");
            }
            status.pipeline_running = true;
            status.claim_submitted
        };

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.drive_pipeline(tree, params, skip_claim).await;
        });
        self.track(handle);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = locked(&self.tasks);
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    async fn drive_pipeline(self: Arc<Self>, tree: Arc<SessionTree>, params: SharedParams, skip_claim: bool) {
        let key = tree.key();
        match self.run_pipeline(&tree, &params, skip_claim).await {
            Ok(lifecycle) => self.set_lifecycle(&key, lifecycle),
            Err(SessionsError::Cancelled) => {
                debug!(key = %key, "Settlement interrupted by shutdown");
                if let Some(status) = locked(&self.statuses).get_mut(&key) {
                    status.pipeline_running = false;
                }
            }
            Err(e) => {
                let stage = match self.lifecycle(&key) {
                    Some(SessionLifecycle::ProofWindowOpen) => SettlementStage::Proof,
                    _ => SettlementStage::Claim,
                };
                error!(key = %key, stage = %stage, error = %e, "Session settlement failed");
                self.report_failed(&tree, stage, &e);
                self.backup_event(&tree, BackupEvent::SessionClose).await;
                self.remove_tree(&tree, SessionLifecycle::Dropped);
            }
        }
    }

    fn report_failed(&self, tree: &SessionTree, stage: SettlementStage, err: &SessionsError) {
        let report = FailedSession {
            key: tree.key(),
            session_header: tree.header().clone(),
            stage,
            error: err.to_string(),
        };
        if let Err(e) = self.failed_tx.try_send(report) {
            warn!(key = %tree.key(), error = %e, "Failed session report dropped");
        }
    }

    /// Claim, prove and delete one session.
    async fn run_pipeline(
        &self,
        tree: &SessionTree,
        params: &SharedParams,
        skip_claim: bool,
    ) -> Result<SessionLifecycle, SessionsError> {
        let key = tree.key();
        let header = tree.header().clone();
        let supplier = tree.supplier_operator_address().to_string();
        let end = header.session_end_block_height;
        let retry = &self.config.retry;

        // ---- Claim ----
        let root: SmstRoot = if skip_claim {
            tree.flush()?
        } else {
            self.set_lifecycle(&key, SessionLifecycle::ClaimWindowOpen);
            let claim_open = claim_window_open_height(params, end);
            let seed = self.seed_block(claim_open).await?;
            let earliest = earliest_claim_commit_height(params, end, &seed.hash, &supplier);

            let root = tree.flush()?;
            self.persist_metadata(tree, false);
            if root.is_empty() {
                info!(key = %key, "Session tree empty, nothing to claim");
                self.remove_tree(tree, SessionLifecycle::Dropped);
                return Ok(SessionLifecycle::Dropped);
            }

            let block = self.wait_for_block(earliest).await?;
            let close = claim_window_close_height(params, end);
            if block.height > close {
                return Err(SessionsError::WindowClosed {
                    stage: "claim",
                    close_height: close,
                    height: block.height,
                });
            }

            retry_with_backoff(retry, "submit_claim", &self.cancel, || {
                self.tx_client.submit_claim(&header, &supplier, &root)
            })
            .await?;
            if let Some(status) = locked(&self.statuses).get_mut(&key) {
                status.claim_submitted = true;
            }
            self.persist_metadata(tree, true);
            info!(
                key = %key,
                height = block.height,
                root_sum = root.sum(),
                root_count = root.count(),
                "Claim submitted"
            );
            if let Err(e) = tree.close_mirror() {
                warn!(key = %key, error = %e, "Failed to close live store mirror");
            }
            self.backup_event(tree, BackupEvent::ClaimGeneration).await;
            root
        };

        // ---- Proof ----
        self.set_lifecycle(&key, SessionLifecycle::ProofWindowOpen);
        let proof_open = proof_window_open_height(params, end);
        let open_seed = self.seed_block(proof_open).await?;
        let earliest = earliest_proof_commit_height(params, end, &open_seed.hash, &supplier);
        let seed_block = self.seed_block(earliest.saturating_sub(1)).await?;

        let proof_params = retry_with_backoff(retry, "proof_params", &self.cancel, || {
            self.query_client.proof_params()
        })
        .await?;
        let target = retry_with_backoff(retry, "relay_difficulty_target", &self.cancel, || {
            self.query_client.relay_difficulty_target(&header.service_id)
        })
        .await?;

        let requirement = proof_requirement(&root, &target, &proof_params, &seed_block.hash);
        if requirement.is_required() {
            let proof = tree.prove_closest(proof_path(&seed_block.hash))?;
            let proof_bytes = proof.to_bytes().map_err(SessionTreeError::from)?;

            let block = self.wait_for_block(earliest).await?;
            let close = proof_window_close_height(params, end);
            if block.height > close {
                return Err(SessionsError::WindowClosed {
                    stage: "proof",
                    close_height: close,
                    height: block.height,
                });
            }

            retry_with_backoff(retry, "submit_proof", &self.cancel, || {
                self.tx_client.submit_proof(&header, &supplier, &proof_bytes)
            })
            .await?;
            info!(key = %key, height = block.height, requirement = %requirement, "Proof submitted");
        } else {
            info!(key = %key, "Proof not required");
        }

        // ---- Settle ----
        self.backup_event(tree, BackupEvent::SessionClose).await;
        self.remove_tree(tree, SessionLifecycle::Settled);
        info!(key = %key, "Session settled");
        Ok(SessionLifecycle::Settled)
    }

    // --------------------------------------------------------
    // Run / stop
    // --------------------------------------------------------

    fn spawn_block_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut rx = self.notifier.subscribe();
        tokio::spawn(async move {
            if let Some(latest) = manager.notifier.latest() {
                manager.on_block(&latest).await;
            }
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(block) => manager.on_block(&block).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Block loop lagged");
                            if let Some(latest) = manager.notifier.latest() {
                                manager.on_block(&latest).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            info!("Block loop stopped");
        })
    }

    /// Spawn the block loop, relay insertion and periodic backups.
    pub fn start(self: &Arc<Self>, mined: mpsc::Receiver<MinedRelay>) {
        let mut handles = vec![self.spawn_block_loop(), self.insert_relays(mined)];
        if let Some(backup) = &self.backup {
            let targets: Arc<dyn BackupTargets> = Arc::clone(self) as Arc<dyn BackupTargets>;
            if let Some(handle) = backup.spawn_periodic(targets, self.cancel.child_token()) {
                handles.push(handle);
            }
        }
        locked(&self.tasks).extend(handles);
        info!(sessions = self.index.len(), "Relayer sessions manager started");
    }

    /// Cancel every task, close the session WALs and take the
    /// graceful-shutdown backup.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *locked(&self.tasks));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Task ended abnormally");
            }
        }

        let trees = self.index.all();
        for tree in &trees {
            // Flushes buffered relays and stops the WAL flush timer
            if let Err(e) = tree.wal().close() {
                warn!(key = %tree.key(), error = %e, "WAL close on shutdown failed");
            }
            self.backup_event(tree, BackupEvent::GracefulShutdown).await;
        }
        info!(sessions = trees.len(), "Relayer sessions manager stopped");
    }
}

#[async_trait]
impl BackupTargets for RelayerSessionsManager {
    async fn backup_targets(&self) -> Vec<(Arc<dyn BackupSource>, u64)> {
        let mut targets: Vec<(Arc<dyn BackupSource>, u64)> = Vec::new();
        for tree in self.index.all() {
            if tree.state().is_terminal() {
                continue;
            }
            match self.compute_units_per_relay(&tree.header().service_id).await {
                Ok(cu) => targets.push((tree as Arc<dyn BackupSource>, cu)),
                Err(e) => warn!(key = %tree.key(), error = %e, "Skipping periodic backup"),
            }
        }
        targets
    }
}
