//! In-memory index of live session trees, plus their on-disk metadata.
//!
//! ```text
//!   supplier ─▶ session end height ─▶ session id ─▶ Arc<SessionTree>
//! ```
//!
//! One lock covers the whole index; relay insertion and the block handler
//! both go through it. Each tree's metadata is written as `session.json`
//! inside its live store directory and disappears with the store.

use super::SessionsError;
use super::windows::{claim_window_open_height, proof_window_close_height};
use crate::client::SharedParams;
use crate::core_types::{Height, SessionHeader, SessionKey};
use crate::mined_relay_wal::WalConfig;
use crate::session_tree::{SessionTree, store_path};
use crate::smst::SmstRoot;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

pub const METADATA_FILE: &str = "session.json";

type TreesByEndHeight = BTreeMap<Height, FxHashMap<String, Arc<SessionTree>>>;

// ============================================================
// METADATA
// ============================================================

/// What a restart needs to re-attach a session tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMetadata {
    pub session_header: SessionHeader,
    pub supplier_operator_address: String,
    #[serde(default, with = "crate::serde_hex::opt_bytes")]
    pub claimed_root: Option<Vec<u8>>,
    #[serde(default)]
    pub claim_submitted: bool,
}

impl SessionMetadata {
    pub fn for_tree(tree: &SessionTree, claim_submitted: bool) -> Self {
        Self {
            session_header: tree.header().clone(),
            supplier_operator_address: tree.supplier_operator_address().to_string(),
            claimed_root: tree.claimed_root().map(|r| r.as_bytes().to_vec()),
            claim_submitted,
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.supplier_operator_address, &self.session_header)
    }

    pub fn claimed_root(&self) -> Result<Option<SmstRoot>, SessionsError> {
        self.claimed_root
            .as_deref()
            .map(SmstRoot::from_bytes)
            .transpose()
            .map_err(|e| SessionsError::InvalidMetadata(e.to_string()))
    }
}

/// Atomically write `metadata` into the tree's store directory.
pub fn write_metadata(store_root: &Path, metadata: &SessionMetadata) -> Result<PathBuf, SessionsError> {
    let dir = store_path(
        store_root,
        &metadata.supplier_operator_address,
        &metadata.session_header.session_id,
    );
    fs::create_dir_all(&dir)?;
    let path = dir.join(METADATA_FILE);
    let tmp = dir.join(format!("{}.tmp", METADATA_FILE));
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer(&mut writer, metadata)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Every readable `<store_root>/<supplier>/<session_id>/session.json`.
///
/// Unreadable entries are skipped with a warning.
pub fn load_metadata(store_root: &Path) -> Result<Vec<SessionMetadata>, SessionsError> {
    let mut out = Vec::new();
    if !store_root.exists() {
        return Ok(out);
    }
    for supplier in fs::read_dir(store_root)? {
        let supplier = supplier?;
        if !supplier.file_type()?.is_dir() {
            continue;
        }
        for session in fs::read_dir(supplier.path())? {
            let session = session?;
            let path = session.path().join(METADATA_FILE);
            if !path.is_file() {
                continue;
            }
            let parsed = File::open(&path)
                .map_err(SessionsError::from)
                .and_then(|f| Ok(serde_json::from_reader(BufReader::new(f))?));
            match parsed {
                Ok(metadata) => out.push(metadata),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session metadata"),
            }
        }
    }
    Ok(out)
}

// ============================================================
// INDEX
// ============================================================

pub struct SessionsIndex {
    store_root: PathBuf,
    wal_config: WalConfig,
    /// Root of live store mirrors, if mirroring is on
    mirror_root: Option<PathBuf>,
    trees: Mutex<FxHashMap<String, TreesByEndHeight>>,
}

impl SessionsIndex {
    pub fn new(store_root: impl Into<PathBuf>, wal_config: WalConfig) -> Self {
        Self {
            store_root: store_root.into(),
            wal_config,
            mirror_root: None,
            trees: Mutex::new(FxHashMap::default()),
        }
    }

    /// Mirror the live store of every tree created from now on.
    pub fn with_mirror_root(mut self, mirror_root: Option<PathBuf>) -> Self {
        self.mirror_root = mirror_root;
        self
    }

    pub fn mirror_root(&self) -> Option<&Path> {
        self.mirror_root.as_deref()
    }

    pub fn store_root(&self) -> &Path {
        &self.store_root
    }

    pub fn wal_config(&self) -> &WalConfig {
        &self.wal_config
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<String, TreesByEndHeight>> {
        self.trees.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tree for (supplier, session), created on first use.
    ///
    /// Returns the tree and whether it was just created.
    pub fn ensure_tree(
        &self,
        header: &SessionHeader,
        supplier: &str,
    ) -> Result<(Arc<SessionTree>, bool), SessionsError> {
        let mut trees = self.lock();
        let sessions = trees
            .entry(supplier.to_string())
            .or_default()
            .entry(header.session_end_block_height)
            .or_default();
        if let Some(tree) = sessions.get(&header.session_id) {
            return Ok((Arc::clone(tree), false));
        }

        let tree = Arc::new(SessionTree::new(
            header.clone(),
            supplier,
            &self.store_root,
            self.wal_config.clone(),
        )?);
        if let Some(mirror_root) = &self.mirror_root {
            tree.attach_mirror(mirror_root);
        }
        write_metadata(&self.store_root, &SessionMetadata::for_tree(&tree, false))?;
        sessions.insert(header.session_id.clone(), Arc::clone(&tree));

        debug!(key = %tree.key(), "Session tree added to index");
        Ok((tree, true))
    }

    /// Insert an already built tree; an existing tree for the same key wins.
    pub fn insert(&self, tree: Arc<SessionTree>) -> bool {
        let header = tree.header();
        let mut trees = self.lock();
        let sessions = trees
            .entry(tree.supplier_operator_address().to_string())
            .or_default()
            .entry(header.session_end_block_height)
            .or_default();
        if sessions.contains_key(&header.session_id) {
            return false;
        }
        sessions.insert(header.session_id.clone(), Arc::clone(&tree));
        true
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<SessionTree>> {
        self.lock()
            .get(&key.supplier_operator_address)
            .and_then(|by_height| by_height.get(&key.session_end_height))
            .and_then(|sessions| sessions.get(&key.session_id))
            .cloned()
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.get(key).is_some()
    }

    /// Drop a tree from the index, pruning emptied levels.
    pub fn remove_session(&self, key: &SessionKey) -> Option<Arc<SessionTree>> {
        let mut trees = self.lock();
        let by_height = trees.get_mut(&key.supplier_operator_address)?;
        let sessions = by_height.get_mut(&key.session_end_height)?;
        let removed = sessions.remove(&key.session_id);
        if sessions.is_empty() {
            by_height.remove(&key.session_end_height);
        }
        if by_height.is_empty() {
            trees.remove(&key.supplier_operator_address);
        }
        if removed.is_some() {
            debug!(key = %key, "Session tree removed from index");
        }
        removed
    }

    /// Trees whose claim window has opened at `height`.
    pub fn sessions_to_claim(&self, height: Height, params: &SharedParams) -> Vec<Arc<SessionTree>> {
        self.collect(|end| claim_window_open_height(params, end) <= height)
    }

    /// Trees whose proof window closed before `height`.
    pub fn expired_sessions(&self, height: Height, params: &SharedParams) -> Vec<Arc<SessionTree>> {
        self.collect(|end| proof_window_close_height(params, end) < height)
    }

    pub fn all(&self) -> Vec<Arc<SessionTree>> {
        self.collect(|_| true)
    }

    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .flat_map(|by_height| by_height.values())
            .map(|sessions| sessions.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn collect(&self, include_end: impl Fn(Height) -> bool) -> Vec<Arc<SessionTree>> {
        let trees = self.lock();
        let mut out = Vec::new();
        for by_height in trees.values() {
            for (end, sessions) in by_height {
                if include_end(*end) {
                    out.extend(sessions.values().cloned());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn header(id: &str, end: Height) -> SessionHeader {
        SessionHeader {
            service_id: "svc".to_string(),
            application_address: "app".to_string(),
            session_id: id.to_string(),
            session_start_block_height: end - 3,
            session_end_block_height: end,
        }
    }

    fn params() -> SharedParams {
        SharedParams {
            num_blocks_per_session: 4,
            grace_period_end_offset_blocks: 1,
            claim_window_open_offset_blocks: 1,
            claim_window_close_offset_blocks: 4,
            proof_window_open_offset_blocks: 0,
            proof_window_close_offset_blocks: 4,
        }
    }

    #[test]
    fn test_ensure_tree_is_unique_per_session() {
        let dir = TempDir::new().unwrap();
        let index = SessionsIndex::new(dir.path(), WalConfig::default());
        let (a, created_a) = index.ensure_tree(&header("s1", 4), "sup").unwrap();
        let (b, created_b) = index.ensure_tree(&header("s1", 4), "sup").unwrap();
        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));

        index.ensure_tree(&header("s2", 4), "sup").unwrap();
        index.ensure_tree(&header("s1", 4), "other").unwrap();
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_remove_session_prunes_levels() {
        let dir = TempDir::new().unwrap();
        let index = SessionsIndex::new(dir.path(), WalConfig::default());
        let (tree, _) = index.ensure_tree(&header("s1", 4), "sup").unwrap();

        assert!(index.remove_session(&tree.key()).is_some());
        assert!(index.remove_session(&tree.key()).is_none());
        assert!(index.is_empty());
        assert!(index.lock().is_empty());
    }

    #[test]
    fn test_claim_and_expiry_selection() {
        let dir = TempDir::new().unwrap();
        let index = SessionsIndex::new(dir.path(), WalConfig::default());
        // end 4: claim opens 6, proof closes 14; end 8: claim opens 10
        index.ensure_tree(&header("early", 4), "sup").unwrap();
        index.ensure_tree(&header("late", 8), "sup").unwrap();

        // grace period of "early" ends at 5
        assert!(index.sessions_to_claim(5, &params()).is_empty());
        let due = index.sessions_to_claim(6, &params());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].header().session_id, "early");
        assert_eq!(index.sessions_to_claim(9, &params()).len(), 1);
        assert_eq!(index.sessions_to_claim(10, &params()).len(), 2);

        assert!(index.expired_sessions(14, &params()).is_empty());
        assert_eq!(index.expired_sessions(15, &params()).len(), 1);
    }

    #[test]
    fn test_new_trees_are_mirrored() {
        let dir = TempDir::new().unwrap();
        let mirrors = TempDir::new().unwrap();
        let index = SessionsIndex::new(dir.path(), WalConfig::default())
            .with_mirror_root(Some(mirrors.path().to_path_buf()));
        let (tree, _) = index.ensure_tree(&header("s1", 4), "sup").unwrap();
        tree.update(&[1u8; 32], b"relay", 1).unwrap();
        tree.flush().unwrap();
        assert!(tree.has_open_mirror());
        assert!(mirrors.path().join("sup").join("s1").exists());
    }

    #[test]
    fn test_metadata_written_and_reloaded() {
        let dir = TempDir::new().unwrap();
        let index = SessionsIndex::new(dir.path(), WalConfig::default());
        let (tree, _) = index.ensure_tree(&header("s1", 4), "sup").unwrap();
        tree.update(&[1u8; 32], b"relay", 1).unwrap();
        let root = tree.flush().unwrap();
        write_metadata(dir.path(), &SessionMetadata::for_tree(&tree, true)).unwrap();

        let loaded = load_metadata(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key(), tree.key());
        assert!(loaded[0].claim_submitted);
        assert_eq!(loaded[0].claimed_root().unwrap(), Some(root));
    }

    #[test]
    fn test_load_metadata_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let bad = dir.path().join("sup").join("broken");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join(METADATA_FILE), b"not json").unwrap();
        // WAL directory has no metadata and is ignored
        fs::create_dir_all(dir.path().join("mined_relays").join("sup")).unwrap();

        assert!(load_metadata(dir.path()).unwrap().is_empty());
    }
}
