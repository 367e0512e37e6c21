//! Rebuild a session tree from a snapshot.
//!
//! ```text
//!   smt_entries ──▶ fresh FileKvStore ──import(smt_root)──▶ trie
//!                                                             │
//!                                        reweight(compute_units_per_relay)
//!                                                             │
//!                  claimed_root? ──yes──▶ Flushed (root must match claim)
//!                                └─no───▶ Open (WAL rewritten from leaves)
//! ```

use super::{BackupError, SessionSnapshot};
use crate::mined_relay_wal::{self, WalConfig};
use crate::session_tree::{SessionTree, store_path};
use crate::smst::{FileKvStore, KvStore, Smst, SmstProof, SmstRoot, path_for_key};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{info, warn};

/// Restore one session tree from `snapshot` under `store_root`.
pub fn restore_session_tree(
    snapshot: &SessionSnapshot,
    store_root: &Path,
    wal_config: WalConfig,
) -> Result<SessionTree, BackupError> {
    let supplier = snapshot.supplier_operator_address.as_str();
    let session_id = snapshot.session_id();
    let header = snapshot.session_header.clone();

    let store = FileKvStore::open(store_path(store_root, supplier, session_id))?;
    store.clear_all()?;
    for entry in &snapshot.smt_entries {
        store.set(&entry.key, &entry.value)?;
    }
    store.flush()?;

    let snapshot_root = SmstRoot::from_bytes(&snapshot.smt_root)?;
    let mut smst = Smst::import(&store, &snapshot_root)?;

    let weight = snapshot.compute_units_per_relay.unwrap_or_else(|| {
        warn!(
            session_id = %session_id,
            supplier = %supplier,
            "Snapshot has no compute units per relay, defaulting leaf weight to 1"
        );
        1
    });
    let reweighted = smst.reweight_leaves(weight);
    let rebuilt_root = smst.root();
    if rebuilt_root != snapshot_root {
        warn!(
            session_id = %session_id,
            supplier = %supplier,
            reweighted,
            snapshot_root = %snapshot_root,
            rebuilt_root = %rebuilt_root,
            "Restored root differs from snapshot root"
        );
    }

    let tree = match &snapshot.claimed_root {
        Some(claimed_bytes) => {
            let claimed = SmstRoot::from_bytes(claimed_bytes)?;
            if rebuilt_root != claimed {
                return Err(BackupError::RootMismatch {
                    session_id: session_id.to_string(),
                });
            }
            if reweighted > 0 {
                smst.commit(&store)?;
                store.flush()?;
            }
            drop(store);
            SessionTree::from_flushed(header, supplier, store_root, wal_config, claimed)?
        }
        None => {
            drop(store);
            restore_open(header, supplier, store_root, wal_config, smst)?
        }
    };

    tree.set_claiming(snapshot.is_claiming);
    if let Some(bytes) = &snapshot.compact_proof_bz {
        match SmstProof::from_bytes(bytes) {
            Ok(proof) => tree.set_cached_proof(proof),
            Err(e) => warn!(session_id = %session_id, error = %e, "Dropping undecodable cached proof"),
        }
    }

    info!(
        session_id = %session_id,
        supplier = %supplier,
        state = %tree.state(),
        leaves = rebuilt_root.count(),
        "Session tree restored from backup"
    );
    Ok(tree)
}

/// Open tree seeded with `smst` and a WAL rewritten from its leaves.
///
/// Relay keys are the sha256 of the relay bytes, so each leaf's key is
/// recovered from its value. Leaves whose recovered key does not hash to
/// their path stay in the trie but cannot be replayed after a crash.
fn restore_open(
    header: crate::core_types::SessionHeader,
    supplier: &str,
    store_root: &Path,
    wal_config: WalConfig,
    smst: Smst,
) -> Result<SessionTree, BackupError> {
    let wal_path = mined_relay_wal::wal_path(store_root, supplier, &header.session_id);
    match std::fs::remove_file(&wal_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut frames = Vec::with_capacity(smst.len());
    let mut unreplayable = 0usize;
    for leaf in smst.leaves() {
        let key: [u8; 32] = Sha256::digest(&leaf.value).into();
        if path_for_key(&key) != leaf.path {
            unreplayable += 1;
            continue;
        }
        frames.push((key, leaf.value.clone(), leaf.weight));
    }
    if unreplayable > 0 {
        warn!(
            session_id = %header.session_id,
            supplier = %supplier,
            unreplayable,
            "Restored leaves with unrecoverable keys are not covered by the WAL"
        );
    }

    let tree = SessionTree::build(header, supplier, store_root, wal_config, smst)?;
    for (key, value, weight) in &frames {
        tree.wal().append(key, value, *weight)?;
    }
    tree.wal().flush()?;
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupConfig, BackupManager};
    use crate::core_types::SessionHeader;
    use crate::session_tree::{BackupSource, SessionTreeState};
    use tempfile::TempDir;

    fn header() -> SessionHeader {
        SessionHeader {
            service_id: "svc".to_string(),
            application_address: "app".to_string(),
            session_id: "s1".to_string(),
            session_start_block_height: 1,
            session_end_block_height: 4,
        }
    }

    fn relay(i: u32) -> ([u8; 32], Vec<u8>) {
        let bytes = format!("relay-{}", i).into_bytes();
        (Sha256::digest(&bytes).into(), bytes)
    }

    fn filled_tree(store: &Path, n: u32, weight: u64) -> SessionTree {
        let tree = SessionTree::new(header(), "sup", store, WalConfig::default()).unwrap();
        for i in 0..n {
            let (k, v) = relay(i);
            tree.update(&k, &v, weight).unwrap();
        }
        tree
    }

    #[test]
    fn test_open_tree_round_trip() {
        let live = TempDir::new().unwrap();
        let tree = filled_tree(live.path(), 10, 3);
        let expected = tree.current_root().unwrap();
        let snapshot = SessionSnapshot::capture(&tree, 3).unwrap();

        let target = TempDir::new().unwrap();
        let restored = restore_session_tree(&snapshot, target.path(), WalConfig::default()).unwrap();
        assert_eq!(restored.state(), SessionTreeState::Open);
        assert_eq!(restored.current_root(), Some(expected));

        // WAL was rewritten and replays to the same root
        let recovered = mined_relay_wal::rebuild_smst(restored.wal_path()).unwrap();
        assert_eq!(recovered.entries, 10);
        assert_eq!(recovered.smst.root(), expected);

        // still accepts relays
        let (k, v) = relay(100);
        restored.update(&k, &v, 3).unwrap();
        assert_eq!(restored.flush().unwrap().count(), 11);
    }

    #[test]
    fn test_flushed_tree_round_trip_through_manager() {
        let live = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        let tree = filled_tree(live.path(), 6, 2);
        let root = tree.flush().unwrap();
        tree.start_claiming().unwrap();
        let proof = tree.prove_closest([9u8; 32]).unwrap();

        let manager = BackupManager::new(BackupConfig {
            enabled: true,
            backup_dir: backups.path().display().to_string(),
            ..Default::default()
        })
        .unwrap();
        manager.backup_session(&tree, 2).unwrap();

        let snapshots = manager.restore_all().unwrap();
        assert_eq!(snapshots.len(), 1);

        let target = TempDir::new().unwrap();
        let restored =
            restore_session_tree(&snapshots[0], target.path(), WalConfig::default()).unwrap();
        assert_eq!(restored.state(), SessionTreeState::Proven);
        assert_eq!(restored.claimed_root(), Some(root));
        assert!(restored.is_claiming());
        assert_eq!(restored.prove_closest([9u8; 32]).unwrap(), proof);
        assert_eq!(restored.snapshot_meta().proof_path, Some([9u8; 32]));
    }

    #[test]
    fn test_legacy_snapshot_defaults_weight() {
        let live = TempDir::new().unwrap();
        let tree = filled_tree(live.path(), 4, 7);
        let mut snapshot = SessionSnapshot::capture(&tree, 7).unwrap();
        snapshot.compute_units_per_relay = None;

        let target = TempDir::new().unwrap();
        let restored = restore_session_tree(&snapshot, target.path(), WalConfig::default()).unwrap();
        let root = restored.current_root().unwrap();
        assert_eq!(root.count(), 4);
        assert_eq!(root.sum(), 4);
    }

    #[test]
    fn test_reweight_breaking_claim_is_rejected() {
        let live = TempDir::new().unwrap();
        let tree = filled_tree(live.path(), 4, 5);
        tree.flush().unwrap();
        let mut snapshot = SessionSnapshot::capture(&tree, 5).unwrap();
        snapshot.compute_units_per_relay = Some(6);

        let target = TempDir::new().unwrap();
        assert!(matches!(
            restore_session_tree(&snapshot, target.path(), WalConfig::default()),
            Err(BackupError::RootMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_node_is_error() {
        let live = TempDir::new().unwrap();
        let tree = filled_tree(live.path(), 4, 1);
        let mut snapshot = SessionSnapshot::capture(&tree, 1).unwrap();
        snapshot.smt_entries.truncate(1);

        let target = TempDir::new().unwrap();
        assert!(matches!(
            restore_session_tree(&snapshot, target.path(), WalConfig::default()),
            Err(BackupError::Smst(_))
        ));
    }
}
