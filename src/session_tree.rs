//! Session Tree
//!
//! Owns the sum trie for one (supplier, session) and walks it through
//! `Open → Flushed → Proven → Deleted`.
//!
//! ```text
//!   update ──▶ [Open] ──flush──▶ [Flushed] ──prove_closest──▶ [Proven]
//!                 │                  │                           │
//!                 └──────────────────┴────────── delete ─────────┴──▶ [Deleted]
//! ```
//!
//! Every update is appended to the session WAL before it touches the trie.
//! Flush commits the trie into the live store and releases the in-memory trie;
//! proofs re-import it from the store on demand.
//!
//! With a mirror root configured, the live store is a [`BackupKvStore`] that
//! writes every committed node to a second store under
//! `<mirror_root>/<supplier>/<session_id>`. The mirror is closed once the
//! claim is on chain and removed together with the tree.

use crate::backup::BackupKvStore;
use crate::core_types::{SessionHeader, SessionKey};
use crate::mined_relay_wal::{self, MinedRelayWal, WalConfig, WalError};
use crate::smst::{FileKvStore, KvStore, PATH_SIZE, Smst, SmstError, SmstProof, SmstRoot};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionTreeError {
    #[error("session tree is closed to updates")]
    Closed,

    #[error("session tree must be flushed before proving")]
    NotClosed,

    #[error("proof already generated for a different path")]
    ProofPathMismatch,

    #[error("session tree is already marked as claiming")]
    AlreadyClaiming,

    #[error("session tree has been deleted")]
    Deleted,

    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("Trie error: {0}")]
    Smst(#[from] SmstError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================
// STATE
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionTreeState {
    /// Accepting updates
    Open,
    /// Root computed and committed to the live store
    Flushed,
    /// Closest proof generated and cached
    Proven,
    /// Terminal: store and WAL removed
    Deleted,
}

impl SessionTreeState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionTreeState::Deleted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionTreeState::Open => "OPEN",
            SessionTreeState::Flushed => "FLUSHED",
            SessionTreeState::Proven => "PROVEN",
            SessionTreeState::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for SessionTreeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================
// BACKUP SEAM
// ============================================================

/// One raw entry of the live backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafEntry {
    #[serde(with = "crate::serde_hex::bytes")]
    pub key: Vec<u8>,
    #[serde(with = "crate::serde_hex::bytes")]
    pub value: Vec<u8>,
}

/// Everything a snapshot records besides the store entries.
#[derive(Debug, Clone)]
pub struct TreeSnapshotMeta {
    pub session_header: SessionHeader,
    pub supplier_operator_address: String,
    pub claimed_root: Option<SmstRoot>,
    pub proof_path: Option<[u8; PATH_SIZE]>,
    pub proof_bytes: Option<Vec<u8>>,
    pub is_claiming: bool,
}

/// What the backup manager is allowed to see of a session tree.
pub trait BackupSource: Send + Sync {
    /// Commit in-memory nodes into the live store without closing the tree.
    /// Returns the root the store now holds.
    fn commit_pending(&self) -> Result<SmstRoot, SessionTreeError>;

    /// Raw key/value entries of the live store.
    fn export_leaves(&self) -> Result<Vec<LeafEntry>, SessionTreeError>;

    fn snapshot_meta(&self) -> TreeSnapshotMeta;
}

// ============================================================
// SESSION TREE
// ============================================================

/// Live store of a session, optionally mirrored.
pub type LiveStore = BackupKvStore<FileKvStore, FileKvStore>;

struct TreeInner {
    state: SessionTreeState,
    /// Present only while Open
    smst: Option<Smst>,
    /// Live store, opened lazily
    store: Option<LiveStore>,
    mirror_path: Option<PathBuf>,
    /// Set once the mirror stops receiving writes
    mirror_closed: bool,
    claimed_root: Option<SmstRoot>,
    proof: Option<SmstProof>,
    proof_path: Option<[u8; PATH_SIZE]>,
}

pub struct SessionTree {
    header: SessionHeader,
    supplier_operator_address: String,
    store_path: PathBuf,
    wal: Arc<MinedRelayWal>,
    is_claiming: AtomicBool,
    inner: Mutex<TreeInner>,
}

impl fmt::Debug for SessionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTree")
            .field("session_id", &self.header.session_id)
            .field("supplier", &self.supplier_operator_address)
            .field("state", &self.state())
            .finish()
    }
}

/// `<store_root>/<supplier>/<session_id>`
pub fn store_path(store_root: &Path, supplier: &str, session_id: &str) -> PathBuf {
    store_root.join(supplier).join(session_id)
}

impl SessionTree {
    /// Fresh Open tree with an empty trie and a new (or appended) WAL.
    pub fn new(
        header: SessionHeader,
        supplier: &str,
        store_root: &Path,
        wal_config: WalConfig,
    ) -> Result<Self, SessionTreeError> {
        Self::build(header, supplier, store_root, wal_config, Smst::new())
    }

    /// Open tree rebuilt by replaying the session WAL.
    pub fn from_wal(
        header: SessionHeader,
        supplier: &str,
        store_root: &Path,
        wal_config: WalConfig,
    ) -> Result<Self, SessionTreeError> {
        let wal_path = mined_relay_wal::wal_path(store_root, supplier, &header.session_id);
        let smst = if wal_path.exists() {
            mined_relay_wal::rebuild_smst(&wal_path)?.smst
        } else {
            warn!(
                session_id = %header.session_id,
                supplier = %supplier,
                "No WAL found for open session, starting empty"
            );
            Smst::new()
        };
        Self::build(header, supplier, store_root, wal_config, smst)
    }

    /// Flushed tree re-attached to its committed store and claimed root.
    pub fn from_flushed(
        header: SessionHeader,
        supplier: &str,
        store_root: &Path,
        wal_config: WalConfig,
        claimed_root: SmstRoot,
    ) -> Result<Self, SessionTreeError> {
        let tree = Self::build(header, supplier, store_root, wal_config, Smst::new())?;
        tree.wal.close()?;
        let mut inner = tree.lock();
        inner.smst = None;
        inner.state = SessionTreeState::Flushed;
        inner.claimed_root = Some(claimed_root);
        drop(inner);
        tree.verify_store()?;
        Ok(tree)
    }

    pub(crate) fn build(
        header: SessionHeader,
        supplier: &str,
        store_root: &Path,
        wal_config: WalConfig,
        smst: Smst,
    ) -> Result<Self, SessionTreeError> {
        let store_path = store_path(store_root, supplier, &header.session_id);
        std::fs::create_dir_all(&store_path)?;

        let wal_path = mined_relay_wal::wal_path(store_root, supplier, &header.session_id);
        let wal = Arc::new(MinedRelayWal::open(&wal_path, wal_config)?);
        if tokio::runtime::Handle::try_current().is_ok() {
            wal.start_flush_timer();
        }

        debug!(
            session_id = %header.session_id,
            supplier = %supplier,
            leaves = smst.len(),
            "Session tree created"
        );

        Ok(Self {
            header,
            supplier_operator_address: supplier.to_string(),
            store_path,
            wal,
            is_claiming: AtomicBool::new(false),
            inner: Mutex::new(TreeInner {
                state: SessionTreeState::Open,
                smst: Some(smst),
                store: None,
                mirror_path: None,
                mirror_closed: false,
                claimed_root: None,
                proof: None,
                proof_path: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TreeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The live store, opened (with its mirror while that is still open) on first use.
    fn live_store<'a>(&self, inner: &'a mut TreeInner) -> Result<&'a LiveStore, SessionTreeError> {
        if inner.store.is_none() {
            let primary = FileKvStore::open(&self.store_path)?;
            let store = match &inner.mirror_path {
                Some(path) if !inner.mirror_closed => {
                    BackupKvStore::new(primary, FileKvStore::open(path)?)
                }
                _ => BackupKvStore::primary_only(primary),
            };
            inner.store = Some(store);
        }
        inner.store.as_ref().ok_or(SessionTreeError::Closed)
    }

    /// Mirror the live store under `mirror_root`.
    ///
    /// Only an Open tree starts writing to the mirror; for a tree that is
    /// already flushed the mirror path is only remembered so `delete` can
    /// clean it up.
    pub fn attach_mirror(&self, mirror_root: &Path) {
        let mut inner = self.lock();
        if inner.mirror_path.is_some() || inner.state.is_terminal() {
            return;
        }
        inner.mirror_path = Some(store_path(
            mirror_root,
            &self.supplier_operator_address,
            &self.header.session_id,
        ));
        inner.mirror_closed = inner.state != SessionTreeState::Open;
        // Reopen lazily so the next commit goes through the mirror
        inner.store = None;
    }

    pub fn mirror_path(&self) -> Option<PathBuf> {
        self.lock().mirror_path.clone()
    }

    pub fn has_open_mirror(&self) -> bool {
        self.lock()
            .store
            .as_ref()
            .is_some_and(|store| store.has_backup())
    }

    /// Flush and detach the mirror; the live store keeps serving proofs.
    pub fn close_mirror(&self) -> Result<(), SessionTreeError> {
        let mut inner = self.lock();
        if inner.mirror_closed || inner.mirror_path.is_none() {
            return Ok(());
        }
        if let Some(store) = &inner.store {
            store.close_backup()?;
        }
        inner.mirror_closed = true;
        debug!(session_id = %self.header.session_id, "Live store mirror closed");
        Ok(())
    }

    /// Check that the live store holds the claimed trie.
    pub fn verify_store(&self) -> Result<(), SessionTreeError> {
        let mut inner = self.lock();
        let root = inner.claimed_root.ok_or(SessionTreeError::NotClosed)?;
        let store = self.live_store(&mut inner)?;
        Smst::import(store, &root)?;
        Ok(())
    }

    // --------------------------------------------------------
    // Accessors
    // --------------------------------------------------------

    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    pub fn supplier_operator_address(&self) -> &str {
        &self.supplier_operator_address
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.supplier_operator_address, &self.header)
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn wal_path(&self) -> &Path {
        self.wal.path()
    }

    pub fn state(&self) -> SessionTreeState {
        self.lock().state
    }

    pub fn claimed_root(&self) -> Option<SmstRoot> {
        self.lock().claimed_root
    }

    pub fn proof(&self) -> Option<SmstProof> {
        self.lock().proof.clone()
    }

    pub fn proof_path(&self) -> Option<[u8; PATH_SIZE]> {
        self.lock().proof_path
    }

    /// Root of the live trie while Open, the claimed root afterwards.
    pub fn current_root(&self) -> Option<SmstRoot> {
        let inner = self.lock();
        match (&inner.smst, inner.claimed_root) {
            (Some(smst), _) => Some(smst.root()),
            (None, root) => root,
        }
    }

    pub fn is_claiming(&self) -> bool {
        self.is_claiming.load(Ordering::SeqCst)
    }

    /// Mark the tree as entering the claim pipeline; only the first call wins.
    pub fn start_claiming(&self) -> Result<(), SessionTreeError> {
        if self.is_claiming.swap(true, Ordering::SeqCst) {
            return Err(SessionTreeError::AlreadyClaiming);
        }
        Ok(())
    }

    pub(crate) fn set_claiming(&self, claiming: bool) {
        self.is_claiming.store(claiming, Ordering::SeqCst);
    }

    pub(crate) fn set_cached_proof(&self, proof: SmstProof) {
        let mut inner = self.lock();
        inner.proof_path = Some(proof.path);
        inner.proof = Some(proof);
        if inner.state == SessionTreeState::Flushed {
            inner.state = SessionTreeState::Proven;
        }
    }

    pub(crate) fn wal(&self) -> &Arc<MinedRelayWal> {
        &self.wal
    }

    // --------------------------------------------------------
    // Operations
    // --------------------------------------------------------

    /// Append to the WAL, then apply to the trie with `weight` as the leaf weight.
    pub fn update(&self, key: &[u8; 32], value: &[u8], weight: u64) -> Result<(), SessionTreeError> {
        let mut inner = self.lock();
        match inner.state {
            SessionTreeState::Open => {}
            SessionTreeState::Deleted => return Err(SessionTreeError::Deleted),
            _ => return Err(SessionTreeError::Closed),
        }
        let smst = inner.smst.as_mut().ok_or(SessionTreeError::Closed)?;

        self.wal.append(key, value, weight)?;
        smst.update(key, value, weight);
        Ok(())
    }

    /// Compute the root, commit it to the live store and stop accepting updates.
    ///
    /// Repeated calls return the cached root.
    pub fn flush(&self) -> Result<SmstRoot, SessionTreeError> {
        let mut inner = self.lock();
        if let Some(root) = inner.claimed_root {
            return Ok(root);
        }
        if inner.state == SessionTreeState::Deleted {
            return Err(SessionTreeError::Deleted);
        }

        let smst = inner.smst.take().ok_or(SessionTreeError::Closed)?;
        let committed = self.live_store(&mut inner).and_then(|store| {
            let root = smst.commit(store)?;
            store.flush()?;
            Ok(root)
        });
        let root = match committed {
            Ok(root) => root,
            Err(e) => {
                inner.smst = Some(smst);
                return Err(e);
            }
        };

        // WAL stays on disk until settlement
        if let Err(e) = self.wal.close() {
            warn!(session_id = %self.header.session_id, error = %e, "WAL close on flush failed");
        }

        inner.claimed_root = Some(root);
        inner.state = SessionTreeState::Flushed;

        info!(
            session_id = %self.header.session_id,
            supplier = %self.supplier_operator_address,
            root_sum = root.sum(),
            root_count = root.count(),
            "Session tree flushed"
        );
        Ok(root)
    }

    /// Closest-leaf proof for `path`, generated once and cached.
    pub fn prove_closest(&self, path: [u8; PATH_SIZE]) -> Result<SmstProof, SessionTreeError> {
        let mut inner = self.lock();
        match inner.state {
            SessionTreeState::Open => return Err(SessionTreeError::NotClosed),
            SessionTreeState::Deleted => return Err(SessionTreeError::Deleted),
            SessionTreeState::Flushed | SessionTreeState::Proven => {}
        }

        if let Some(proof) = &inner.proof {
            if inner.proof_path != Some(path) {
                return Err(SessionTreeError::ProofPathMismatch);
            }
            return Ok(proof.clone());
        }

        let root = inner.claimed_root.ok_or(SessionTreeError::NotClosed)?;
        let store = self.live_store(&mut inner)?;
        let smst = Smst::import(store, &root)?;
        let proof = smst.prove_closest(&path)?;

        inner.proof = Some(proof.clone());
        inner.proof_path = Some(path);
        inner.state = SessionTreeState::Proven;

        debug!(
            session_id = %self.header.session_id,
            path = %hex::encode(path),
            "Closest proof generated"
        );
        Ok(proof)
    }

    /// Remove the live store, its mirror and the WAL. Terminal.
    ///
    /// The tree only becomes Deleted once every file is gone; after a failed
    /// removal it keeps its state and `delete` can be retried.
    ///
    /// The owning index drops its entry separately through
    /// `SessionsIndex::remove_session`.
    pub fn delete(&self) -> Result<(), SessionTreeError> {
        let mut inner = self.lock();
        if inner.state == SessionTreeState::Deleted {
            return Ok(());
        }

        match inner.store.take() {
            Some(store) => {
                if let Err(e) = store.close_backup() {
                    warn!(session_id = %self.header.session_id, error = %e, "Mirror close on delete failed");
                }
                store.primary().destroy()?;
            }
            None => FileKvStore::open(&self.store_path)?.destroy()?,
        }
        if let Some(mirror) = &inner.mirror_path {
            remove_dir(mirror)?;
        }
        self.wal.close_and_remove()?;

        inner.state = SessionTreeState::Deleted;
        inner.smst = None;
        inner.proof = None;

        info!(
            session_id = %self.header.session_id,
            supplier = %self.supplier_operator_address,
            "Session tree deleted"
        );
        Ok(())
    }
}

/// Rebuild a lost live store from the mirror of the same session.
///
/// Returns the number of entries copied; a missing mirror copies nothing.
pub fn restore_store_from_mirror(
    store_root: &Path,
    mirror_root: &Path,
    supplier: &str,
    session_id: &str,
) -> Result<usize, SessionTreeError> {
    let mirror = store_path(mirror_root, supplier, session_id);
    if !mirror.exists() {
        return Ok(0);
    }
    let store = BackupKvStore::new(
        FileKvStore::open(store_path(store_root, supplier, session_id))?,
        FileKvStore::open(&mirror)?,
    );
    Ok(store.restore_from_backup()?)
}

fn remove_dir(path: &Path) -> Result<(), SessionTreeError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl BackupSource for SessionTree {
    fn commit_pending(&self) -> Result<SmstRoot, SessionTreeError> {
        let mut inner = self.lock();
        match inner.state {
            SessionTreeState::Deleted => Err(SessionTreeError::Deleted),
            SessionTreeState::Flushed | SessionTreeState::Proven => {
                inner.claimed_root.ok_or(SessionTreeError::NotClosed)
            }
            SessionTreeState::Open => {
                let smst = inner.smst.take().ok_or(SessionTreeError::Closed)?;
                let committed = self.live_store(&mut inner).and_then(|store| {
                    let root = smst.commit(store)?;
                    store.flush()?;
                    Ok(root)
                });
                inner.smst = Some(smst);
                committed
            }
        }
    }

    fn export_leaves(&self) -> Result<Vec<LeafEntry>, SessionTreeError> {
        let mut inner = self.lock();
        if inner.state == SessionTreeState::Deleted {
            return Err(SessionTreeError::Deleted);
        }
        let entries = self.live_store(&mut inner)?.entries()?;
        Ok(entries
            .into_iter()
            .map(|(key, value)| LeafEntry { key, value })
            .collect())
    }

    fn snapshot_meta(&self) -> TreeSnapshotMeta {
        let inner = self.lock();
        TreeSnapshotMeta {
            session_header: self.header.clone(),
            supplier_operator_address: self.supplier_operator_address.clone(),
            claimed_root: inner.claimed_root,
            proof_path: inner.proof_path,
            proof_bytes: inner.proof.as_ref().and_then(|p| p.to_bytes().ok()),
            is_claiming: self.is_claiming(),
        }
    }
}
