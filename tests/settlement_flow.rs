//! End-to-end settlement against an in-memory chain.
//!
//! Shared params (defaults): session 1..=4, claim window [6, 10],
//! proof window [10, 14].

use async_trait::async_trait;
use relay_settlement::backup::{BackupConfig, BackupManager};
use relay_settlement::client::{ClientError, ProofParams, QueryClient, SharedParams, TxClient};
use relay_settlement::relay::{
    RelayRequest, RelayRequestMetadata, RelayResponse, RelayResponseMetadata,
};
use relay_settlement::relayer_sessions::{
    LoadSummary, RelayerSessionsConfig, RelayerSessionsManager, RetryConfig, SessionLifecycle,
    SettlementStage,
};
use relay_settlement::{
    Block, BlockNotifier, Miner, Relay, SessionHeader, SessionKey, SmstProof, SmstRoot, WalConfig,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

const SUPPLIER: &str = "pokt1supplier";
const COMPUTE_UNITS: u64 = 7;

// ============================================================
// MOCK CHAIN
// ============================================================

#[derive(Default)]
struct MockChain {
    claims: Mutex<Vec<(String, SmstRoot)>>,
    proofs: Mutex<Vec<(String, Vec<u8>)>>,
    existing_claims: Mutex<HashSet<String>>,
    reject_claims: AtomicBool,
    block_queries: Mutex<Vec<u64>>,
}

#[async_trait]
impl TxClient for MockChain {
    async fn submit_claim(
        &self,
        header: &SessionHeader,
        _supplier: &str,
        root: &SmstRoot,
    ) -> Result<(), ClientError> {
        if self.reject_claims.load(Ordering::SeqCst) {
            return Err(ClientError::Rpc("node unavailable".into()));
        }
        self.claims
            .lock()
            .unwrap()
            .push((header.session_id.clone(), *root));
        Ok(())
    }

    async fn submit_proof(
        &self,
        header: &SessionHeader,
        _supplier: &str,
        proof: &[u8],
    ) -> Result<(), ClientError> {
        self.proofs
            .lock()
            .unwrap()
            .push((header.session_id.clone(), proof.to_vec()));
        Ok(())
    }
}

#[async_trait]
impl QueryClient for MockChain {
    async fn shared_params(&self) -> Result<SharedParams, ClientError> {
        Ok(SharedParams::default())
    }

    async fn proof_params(&self) -> Result<ProofParams, ClientError> {
        // every claim needs a proof
        Ok(ProofParams {
            proof_requirement_threshold: 0,
            proof_request_probability: 1.0,
        })
    }

    async fn min_difficulty_bits(&self) -> Result<u32, ClientError> {
        Ok(0)
    }

    async fn compute_units_per_relay(&self, _service_id: &str) -> Result<u64, ClientError> {
        Ok(COMPUTE_UNITS)
    }

    async fn relay_difficulty_target(&self, _service_id: &str) -> Result<Vec<u8>, ClientError> {
        Ok(vec![0xff; 32])
    }

    async fn claim_exists(&self, _supplier: &str, session_id: &str) -> Result<bool, ClientError> {
        Ok(self.existing_claims.lock().unwrap().contains(session_id))
    }

    async fn block_at(&self, height: u64) -> Result<Block, ClientError> {
        self.block_queries.lock().unwrap().push(height);
        Ok(chain_block(height))
    }
}

// ============================================================
// HELPERS
// ============================================================

fn chain_block(height: u64) -> Block {
    Block::new(height, vec![height as u8; 32])
}

fn header(session_id: &str) -> SessionHeader {
    SessionHeader {
        service_id: "anvil".to_string(),
        application_address: "pokt1app".to_string(),
        session_id: session_id.to_string(),
        session_start_block_height: 1,
        session_end_block_height: 4,
    }
}

fn relay(session_id: &str, n: u32) -> Relay {
    let header = header(session_id);
    Relay {
        req: RelayRequest {
            meta: RelayRequestMetadata {
                session_header: header.clone(),
                supplier_operator_address: SUPPLIER.to_string(),
            },
            payload: format!("eth_blockNumber #{}", n).into_bytes(),
        },
        res: RelayResponse {
            meta: RelayResponseMetadata {
                session_header: header,
            },
            payload: format!("0x{:x}", n).into_bytes(),
        },
    }
}

fn sessions_config(store: &Path) -> RelayerSessionsConfig {
    RelayerSessionsConfig {
        store_root: store.to_path_buf(),
        mirror_root: None,
        wal: WalConfig::default(),
        retry: RetryConfig {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
        },
        failed_channel_capacity: 16,
    }
}

fn backup_manager(dir: &Path) -> Arc<BackupManager> {
    Arc::new(
        BackupManager::new(BackupConfig {
            enabled: true,
            backup_dir: dir.display().to_string(),
            interval_seconds: 0,
            on_session_close: true,
            on_claim_generation: true,
            on_graceful_shutdown: true,
            retain_backup_count: 3,
        })
        .unwrap(),
    )
}

fn manager(
    store: &Path,
    chain: &Arc<MockChain>,
    notifier: &Arc<BlockNotifier>,
    backup: Option<Arc<BackupManager>>,
) -> Arc<RelayerSessionsManager> {
    manager_with_config(sessions_config(store), chain, notifier, backup)
}

fn manager_with_config(
    config: RelayerSessionsConfig,
    chain: &Arc<MockChain>,
    notifier: &Arc<BlockNotifier>,
    backup: Option<Arc<BackupManager>>,
) -> Arc<RelayerSessionsManager> {
    RelayerSessionsManager::new(
        config,
        Arc::clone(chain) as Arc<dyn TxClient>,
        Arc::clone(chain) as Arc<dyn QueryClient>,
        Arc::clone(notifier),
        backup,
    )
}

fn key(session_id: &str) -> SessionKey {
    SessionKey::new(SUPPLIER, &header(session_id))
}

async fn wait_until(what: &str, f: impl Fn() -> bool) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn publish_blocks(notifier: &BlockNotifier, heights: std::ops::RangeInclusive<u64>) {
    for h in heights {
        notifier.publish(chain_block(h)).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Start `manager`, mine `n` relays per session and wait until every
/// session tree holds them.
async fn serve_relays(manager: &Arc<RelayerSessionsManager>, sessions: &[(&str, u32)]) {
    let miner = Arc::new(Miner::new(0));
    let (relay_tx, relay_rx) = mpsc::channel(64);
    let (mined_rx, _miner_handle) = miner.spawn(relay_rx, 64);
    manager.start(mined_rx);
    for &(session_id, n) in sessions {
        for i in 0..n {
            relay_tx.send(relay(session_id, i)).await.unwrap();
        }
    }
    for &(session_id, n) in sessions {
        let tree_key = key(session_id);
        wait_until("relays inserted", || {
            manager
                .index()
                .get(&tree_key)
                .and_then(|t| t.current_root())
                .is_some_and(|r| r.count() == u64::from(n))
        })
        .await;
    }
}

// ============================================================
// TESTS
// ============================================================

#[tokio::test]
async fn test_session_settles_claim_then_proof() {
    let store = TempDir::new().unwrap();
    let mirrors = TempDir::new().unwrap();
    let backups = TempDir::new().unwrap();
    let chain = Arc::new(MockChain::default());
    let notifier = Arc::new(BlockNotifier::new(64));
    let config = RelayerSessionsConfig {
        mirror_root: Some(mirrors.path().to_path_buf()),
        ..sessions_config(store.path())
    };
    let manager = manager_with_config(
        config,
        &chain,
        &notifier,
        Some(backup_manager(backups.path())),
    );

    serve_relays(&manager, &[("s1", 20)]).await;
    let tree = manager.index().get(&key("s1")).unwrap();
    let store_dir = tree.store_path().to_path_buf();
    let wal_path = tree.wal_path().to_path_buf();
    let mirror_dir = tree.mirror_path().unwrap();
    assert!(wal_path.exists());

    publish_blocks(&notifier, 1..=16).await;
    wait_until("settlement", || {
        manager.lifecycle(&key("s1")) == Some(SessionLifecycle::Settled)
    })
    .await;

    let claims = chain.claims.lock().unwrap().clone();
    assert_eq!(claims.len(), 1);
    let root = claims[0].1;
    assert_eq!(root.count(), 20);
    assert_eq!(root.sum(), 20 * COMPUTE_UNITS);

    let proofs = chain.proofs.lock().unwrap().clone();
    assert_eq!(proofs.len(), 1);
    let proof = SmstProof::from_bytes(&proofs[0].1).unwrap();
    assert!(proof.verify_closest(&root));

    assert!(manager.index().is_empty());
    assert!(!store_dir.exists());
    assert!(!wal_path.exists());
    assert!(!mirror_dir.exists());
    // claim-generation and session-close snapshots
    let session_backups = backups.path().join(SUPPLIER).join("s1");
    assert_eq!(std::fs::read_dir(session_backups).unwrap().count(), 2);

    manager.stop().await;
}

#[tokio::test]
async fn test_relay_accepted_until_grace_period_ends() {
    let store = TempDir::new().unwrap();
    let chain = Arc::new(MockChain::default());
    let notifier = Arc::new(BlockNotifier::new(64));
    let manager = manager(store.path(), &chain, &notifier, None);
    let miner = Miner::new(0);

    serve_relays(&manager, &[("s1", 2)]).await;
    // session ends at 4, grace period ends at 5
    publish_blocks(&notifier, 1..=5).await;
    let late = miner.mine_relay(&relay("s1", 100)).unwrap();
    manager.insert_relay(&late).await.unwrap();

    publish_blocks(&notifier, 6..=6).await;
    let too_late = miner.mine_relay(&relay("s1", 101)).unwrap();
    assert!(manager.insert_relay(&too_late).await.is_err());

    publish_blocks(&notifier, 7..=16).await;
    wait_until("settlement", || {
        manager.lifecycle(&key("s1")) == Some(SessionLifecycle::Settled)
    })
    .await;
    let claims = chain.claims.lock().unwrap().clone();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].1.count(), 3);

    manager.stop().await;
}

#[tokio::test]
async fn test_seed_block_missing_from_history_is_queried() {
    let store = TempDir::new().unwrap();
    let chain = Arc::new(MockChain::default());
    let notifier = Arc::new(BlockNotifier::new(64));
    let manager = manager(store.path(), &chain, &notifier, None);

    serve_relays(&manager, &[("s1", 5)]).await;
    // the claim window opens at 6, which this node never sees
    publish_blocks(&notifier, 1..=4).await;
    publish_blocks(&notifier, 7..=16).await;
    wait_until("settlement", || {
        manager.lifecycle(&key("s1")) == Some(SessionLifecycle::Settled)
    })
    .await;

    let queried = chain.block_queries.lock().unwrap().clone();
    assert_eq!(queried, vec![6]);
    assert_eq!(chain.claims.lock().unwrap().len(), 1);
    assert_eq!(chain.proofs.lock().unwrap().len(), 1);

    manager.stop().await;
}

#[tokio::test]
async fn test_exhausted_claim_retries_are_reported() {
    let store = TempDir::new().unwrap();
    let chain = Arc::new(MockChain::default());
    chain.reject_claims.store(true, Ordering::SeqCst);
    let notifier = Arc::new(BlockNotifier::new(64));
    let manager = manager(store.path(), &chain, &notifier, None);
    let mut failed = manager.take_failed_sessions().unwrap();
    assert!(manager.take_failed_sessions().is_none());

    serve_relays(&manager, &[("s1", 3)]).await;
    publish_blocks(&notifier, 1..=12).await;

    let report = tokio::time::timeout(Duration::from_secs(5), failed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.key, key("s1"));
    assert_eq!(report.stage, SettlementStage::Claim);
    assert!(report.error.contains("submit_claim"));

    wait_until("session dropped", || {
        manager.lifecycle(&key("s1")) == Some(SessionLifecycle::Dropped)
    })
    .await;
    assert!(manager.index().is_empty());
    assert!(chain.proofs.lock().unwrap().is_empty());

    manager.stop().await;
}

#[tokio::test]
async fn test_restart_reloads_open_session_from_wal() {
    let store = TempDir::new().unwrap();
    let chain = Arc::new(MockChain::default());
    let notifier = Arc::new(BlockNotifier::new(64));

    let expected = {
        let first = manager(store.path(), &chain, &notifier, None);
        serve_relays(&first, &[("s1", 12)]).await;
        let root = first.index().get(&key("s1")).unwrap().current_root();
        first.stop().await;
        root
    };

    let second = manager(store.path(), &chain, &notifier, None);
    let summary = second.load_persisted(3).await.unwrap();
    assert_eq!(
        summary,
        LoadSummary {
            retained: 1,
            ..Default::default()
        }
    );
    let tree = second.index().get(&key("s1")).unwrap();
    assert_eq!(tree.current_root(), expected);
    assert_eq!(second.lifecycle(&key("s1")), Some(SessionLifecycle::Active));
}

#[tokio::test]
async fn test_restart_drops_session_that_missed_its_claim() {
    let store = TempDir::new().unwrap();
    let chain = Arc::new(MockChain::default());
    let notifier = Arc::new(BlockNotifier::new(64));

    {
        let first = manager(store.path(), &chain, &notifier, None);
        serve_relays(&first, &[("missed", 4), ("claimed", 4)]).await;
        first.stop().await;
    }
    chain
        .existing_claims
        .lock()
        .unwrap()
        .insert("claimed".to_string());

    // past the claim window (10), inside the proof window (14)
    let second = manager(store.path(), &chain, &notifier, None);
    let summary = second.load_persisted(12).await.unwrap();
    assert_eq!(summary.retained, 1);
    assert_eq!(summary.deleted, 1);
    assert!(second.index().get(&key("missed")).is_none());
    assert!(!store.path().join(SUPPLIER).join("missed").exists());
    assert_eq!(
        second.lifecycle(&key("claimed")),
        Some(SessionLifecycle::ProofWindowOpen)
    );
}

#[tokio::test]
async fn test_claimed_session_store_rebuilt_from_mirror() {
    let store = TempDir::new().unwrap();
    let mirrors = TempDir::new().unwrap();
    let chain = Arc::new(MockChain::default());
    let notifier = Arc::new(BlockNotifier::new(64));
    let config = RelayerSessionsConfig {
        mirror_root: Some(mirrors.path().to_path_buf()),
        ..sessions_config(store.path())
    };

    let root = {
        let first = manager_with_config(config.clone(), &chain, &notifier, None);
        serve_relays(&first, &[("s1", 6)]).await;
        // the earliest claim height falls in [6, 9]; the proof window opens at 10
        publish_blocks(&notifier, 1..=9).await;
        wait_until("claim submitted", || !chain.claims.lock().unwrap().is_empty()).await;
        first.stop().await;
        chain.claims.lock().unwrap()[0].1
    };
    chain
        .existing_claims
        .lock()
        .unwrap()
        .insert("s1".to_string());

    // live trie lost, session metadata kept
    let store_file = store.path().join(SUPPLIER).join("s1").join("store.bin");
    std::fs::remove_file(&store_file).unwrap();

    let second = manager_with_config(config, &chain, &notifier, None);
    let summary = second.load_persisted(11).await.unwrap();
    assert_eq!(summary.retained, 1);
    let tree = second.index().get(&key("s1")).unwrap();
    assert_eq!(tree.claimed_root(), Some(root));
    assert!(tree.prove_closest([4u8; 32]).unwrap().verify_closest(&root));
}

#[tokio::test]
async fn test_restore_from_backup_after_store_loss() {
    let store = TempDir::new().unwrap();
    let backups = TempDir::new().unwrap();
    let chain = Arc::new(MockChain::default());
    let notifier = Arc::new(BlockNotifier::new(64));

    let expected = {
        let first = manager(
            store.path(),
            &chain,
            &notifier,
            Some(backup_manager(backups.path())),
        );
        serve_relays(&first, &[("s1", 9)]).await;
        let root = first.index().get(&key("s1")).unwrap().current_root();
        // graceful-shutdown snapshot
        first.stop().await;
        root
    };
    std::fs::remove_dir_all(store.path()).unwrap();

    let second = manager(
        store.path(),
        &chain,
        &notifier,
        Some(backup_manager(backups.path())),
    );
    assert_eq!(second.load_persisted(2).await.unwrap(), LoadSummary::default());
    let summary = second.restore_from_backup(2).await.unwrap();
    assert_eq!(summary.retained, 1);

    let tree = second.index().get(&key("s1")).unwrap();
    assert_eq!(tree.current_root(), expected);

    // restored sessions are persisted again and survive another restart
    let third = manager(store.path(), &chain, &notifier, None);
    assert_eq!(third.load_persisted(2).await.unwrap().retained, 1);
}
