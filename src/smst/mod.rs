//! Sparse Merkle Sum Trie
//!
//! Authenticated key-value trie where every leaf carries a `u64` weight and
//! every inner node commits to the sum of the weights beneath it.
//!
//! # Layout
//!
//! ```text
//! path      = sha256(key)                      (256 bits, MSB first)
//! leaf      = sha256(0x00 ‖ path ‖ sha256(value) ‖ weight_be)
//! inner     = sha256(0x01 ‖ l.hash ‖ l.sum_be ‖ r.hash ‖ r.sum_be)
//! empty     = [0; 32], sum 0
//! root      = hash(32) ‖ sum_be(8) ‖ count_be(8)
//! ```
//!
//! A leaf sits at the shallowest depth where its path prefix is unique.
//! Committed nodes are stored in a [`KvStore`] keyed by their hash, so a
//! tree can be re-imported from any committed root.

pub mod proof;
pub mod store;

pub use proof::SmstProof;
pub use store::{FileKvStore, KvStore, MemKvStore};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const PATH_SIZE: usize = 32;
pub const HASH_SIZE: usize = 32;
pub const ROOT_SIZE: usize = HASH_SIZE + 16;

const LEAF_PREFIX: u8 = 0x00;
const INNER_PREFIX: u8 = 0x01;
const EMPTY_HASH: [u8; HASH_SIZE] = [0u8; HASH_SIZE];

#[derive(Debug, Error)]
pub enum SmstError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Store corrupt: {0}")]
    Corrupt(String),

    #[error("Node {0} missing from store")]
    MissingNode(String),

    #[error("Cannot prove against an empty tree")]
    EmptyTree,

    #[error("Invalid root length: {0}")]
    InvalidRoot(usize),

    #[error("No leaf at path {0}")]
    LeafNotFound(String),
}

// ============================================================
// ROOT
// ============================================================

/// Serialized trie root: hash, total weight and leaf count.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmstRoot([u8; ROOT_SIZE]);

impl SmstRoot {
    pub fn new(hash: [u8; HASH_SIZE], sum: u64, count: u64) -> Self {
        let mut bytes = [0u8; ROOT_SIZE];
        bytes[..HASH_SIZE].copy_from_slice(&hash);
        bytes[HASH_SIZE..HASH_SIZE + 8].copy_from_slice(&sum.to_be_bytes());
        bytes[HASH_SIZE + 8..].copy_from_slice(&count.to_be_bytes());
        Self(bytes)
    }

    pub fn empty() -> Self {
        Self::new(EMPTY_HASH, 0, 0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SmstError> {
        let arr: [u8; ROOT_SIZE] = bytes
            .try_into()
            .map_err(|_| SmstError::InvalidRoot(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn hash(&self) -> [u8; HASH_SIZE] {
        let mut h = [0u8; HASH_SIZE];
        h.copy_from_slice(&self.0[..HASH_SIZE]);
        h
    }

    pub fn sum(&self) -> u64 {
        read_u64_be(&self.0[HASH_SIZE..HASH_SIZE + 8])
    }

    pub fn count(&self) -> u64 {
        read_u64_be(&self.0[HASH_SIZE + 8..])
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

impl std::fmt::Debug for SmstRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SmstRoot({}, sum={}, count={})",
            hex::encode(self.hash()),
            self.sum(),
            self.count()
        )
    }
}

impl std::fmt::Display for SmstRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

fn read_u64_be(bytes: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(bytes);
    u64::from_be_bytes(b)
}

// ============================================================
// NODES
// ============================================================

/// Hash and weight sum of a subtree, as committed by its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDigest {
    pub hash: [u8; HASH_SIZE],
    pub sum: u64,
}

impl NodeDigest {
    pub const EMPTY: NodeDigest = NodeDigest {
        hash: EMPTY_HASH,
        sum: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.hash == EMPTY_HASH
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub path: [u8; PATH_SIZE],
    pub value: Vec<u8>,
    pub weight: u64,
}

#[derive(Debug, Clone)]
enum Node {
    Empty,
    Leaf(Leaf),
    Inner(Box<Inner>),
}

#[derive(Debug, Clone)]
struct Inner {
    left: Node,
    right: Node,
    sum: u64,
    count: u64,
}

/// On-store node encoding.
#[derive(Debug, Serialize, Deserialize)]
enum StoredNode {
    Leaf {
        path: [u8; PATH_SIZE],
        value: Vec<u8>,
        weight: u64,
    },
    Inner {
        left: NodeDigest,
        right: NodeDigest,
    },
}

pub fn path_for_key(key: &[u8]) -> [u8; PATH_SIZE] {
    Sha256::digest(key).into()
}

/// Bit `depth` of `path`, most significant bit first.
#[inline]
pub(crate) fn bit_at(path: &[u8; PATH_SIZE], depth: usize) -> u8 {
    (path[depth / 8] >> (7 - (depth % 8))) & 1
}

pub(crate) fn leaf_digest(path: &[u8; PATH_SIZE], value: &[u8], weight: u64) -> NodeDigest {
    let value_hash = Sha256::digest(value);
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(path);
    hasher.update(value_hash);
    hasher.update(weight.to_be_bytes());
    NodeDigest {
        hash: hasher.finalize().into(),
        sum: weight,
    }
}

pub(crate) fn inner_digest(left: &NodeDigest, right: &NodeDigest) -> NodeDigest {
    let mut hasher = Sha256::new();
    hasher.update([INNER_PREFIX]);
    hasher.update(left.hash);
    hasher.update(left.sum.to_be_bytes());
    hasher.update(right.hash);
    hasher.update(right.sum.to_be_bytes());
    NodeDigest {
        hash: hasher.finalize().into(),
        sum: left.sum.saturating_add(right.sum),
    }
}

impl Node {
    fn sum(&self) -> u64 {
        match self {
            Node::Empty => 0,
            Node::Leaf(l) => l.weight,
            Node::Inner(i) => i.sum,
        }
    }

    fn count(&self) -> u64 {
        match self {
            Node::Empty => 0,
            Node::Leaf(_) => 1,
            Node::Inner(i) => i.count,
        }
    }

    fn digest(&self) -> NodeDigest {
        match self {
            Node::Empty => NodeDigest::EMPTY,
            Node::Leaf(l) => leaf_digest(&l.path, &l.value, l.weight),
            Node::Inner(i) => inner_digest(&i.left.digest(), &i.right.digest()),
        }
    }

    fn inner(left: Node, right: Node) -> Node {
        let sum = left.sum().saturating_add(right.sum());
        let count = left.count() + right.count();
        Node::Inner(Box::new(Inner {
            left,
            right,
            sum,
            count,
        }))
    }

    fn insert(self, leaf: Leaf, depth: usize) -> Node {
        match self {
            Node::Empty => Node::Leaf(leaf),
            Node::Leaf(existing) if existing.path == leaf.path => Node::Leaf(leaf),
            Node::Leaf(existing) => split(existing, leaf, depth),
            Node::Inner(inner) => {
                let Inner { left, right, .. } = *inner;
                if bit_at(&leaf.path, depth) == 0 {
                    Node::inner(left.insert(leaf, depth + 1), right)
                } else {
                    Node::inner(left, right.insert(leaf, depth + 1))
                }
            }
        }
    }

    fn find(&self, path: &[u8; PATH_SIZE], depth: usize) -> Option<&Leaf> {
        match self {
            Node::Empty => None,
            Node::Leaf(l) if &l.path == path => Some(l),
            Node::Leaf(_) => None,
            Node::Inner(i) => {
                if bit_at(path, depth) == 0 {
                    i.left.find(path, depth + 1)
                } else {
                    i.right.find(path, depth + 1)
                }
            }
        }
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Leaf>) {
        match self {
            Node::Empty => {}
            Node::Leaf(l) => out.push(l),
            Node::Inner(i) => {
                i.left.collect_leaves(out);
                i.right.collect_leaves(out);
            }
        }
    }

    fn commit(&self, store: &dyn KvStore) -> Result<NodeDigest, SmstError> {
        match self {
            Node::Empty => Ok(NodeDigest::EMPTY),
            Node::Leaf(l) => {
                let digest = leaf_digest(&l.path, &l.value, l.weight);
                let stored = StoredNode::Leaf {
                    path: l.path,
                    value: l.value.clone(),
                    weight: l.weight,
                };
                store.set(&digest.hash, &encode_node(&stored)?)?;
                Ok(digest)
            }
            Node::Inner(i) => {
                let left = i.left.commit(store)?;
                let right = i.right.commit(store)?;
                let digest = inner_digest(&left, &right);
                store.set(&digest.hash, &encode_node(&StoredNode::Inner { left, right })?)?;
                Ok(digest)
            }
        }
    }

    fn load(store: &dyn KvStore, digest: &NodeDigest) -> Result<Node, SmstError> {
        if digest.is_empty() {
            return Ok(Node::Empty);
        }
        let bytes = store
            .get(&digest.hash)?
            .ok_or_else(|| SmstError::MissingNode(hex::encode(digest.hash)))?;
        let stored: StoredNode =
            bincode::deserialize(&bytes).map_err(|e| SmstError::Codec(e.to_string()))?;
        match stored {
            StoredNode::Leaf {
                path,
                value,
                weight,
            } => Ok(Node::Leaf(Leaf {
                path,
                value,
                weight,
            })),
            StoredNode::Inner { left, right } => Ok(Node::inner(
                Node::load(store, &left)?,
                Node::load(store, &right)?,
            )),
        }
    }
}

/// Push two leaves down until their paths diverge.
fn split(a: Leaf, b: Leaf, depth: usize) -> Node {
    let (bit_a, bit_b) = (bit_at(&a.path, depth), bit_at(&b.path, depth));
    if bit_a == bit_b {
        let child = split(a, b, depth + 1);
        if bit_a == 0 {
            Node::inner(child, Node::Empty)
        } else {
            Node::inner(Node::Empty, child)
        }
    } else if bit_a == 0 {
        Node::inner(Node::Leaf(a), Node::Leaf(b))
    } else {
        Node::inner(Node::Leaf(b), Node::Leaf(a))
    }
}

fn encode_node(node: &StoredNode) -> Result<Vec<u8>, SmstError> {
    bincode::serialize(node).map_err(|e| SmstError::Codec(e.to_string()))
}

// ============================================================
// TRIE
// ============================================================

/// In-memory sparse Merkle sum trie.
#[derive(Debug, Clone)]
pub struct Smst {
    root: Node,
}

impl Default for Smst {
    fn default() -> Self {
        Self::new()
    }
}

impl Smst {
    pub fn new() -> Self {
        Self { root: Node::Empty }
    }

    /// Insert or replace the leaf for `key`.
    pub fn update(&mut self, key: &[u8], value: &[u8], weight: u64) {
        self.update_at_path(path_for_key(key), value.to_vec(), weight);
    }

    pub fn update_at_path(&mut self, path: [u8; PATH_SIZE], value: Vec<u8>, weight: u64) {
        let root = std::mem::replace(&mut self.root, Node::Empty);
        self.root = root.insert(
            Leaf {
                path,
                value,
                weight,
            },
            0,
        );
    }

    /// Value and weight stored for `key`.
    pub fn get(&self, key: &[u8]) -> Option<(&[u8], u64)> {
        self.root
            .find(&path_for_key(key), 0)
            .map(|l| (l.value.as_slice(), l.weight))
    }

    pub fn root(&self) -> SmstRoot {
        let digest = self.root.digest();
        SmstRoot::new(digest.hash, digest.sum, self.root.count())
    }

    pub fn leaves(&self) -> Vec<&Leaf> {
        let mut out = Vec::with_capacity(self.root.count() as usize);
        self.root.collect_leaves(&mut out);
        out
    }

    pub fn len(&self) -> usize {
        self.root.count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every node into `store`, returning the committed root.
    pub fn commit(&self, store: &dyn KvStore) -> Result<SmstRoot, SmstError> {
        let digest = self.root.commit(store)?;
        Ok(SmstRoot::new(digest.hash, digest.sum, self.root.count()))
    }

    /// Rebuild a trie from nodes previously committed to `store`.
    pub fn import(store: &dyn KvStore, root: &SmstRoot) -> Result<Self, SmstError> {
        let digest = NodeDigest {
            hash: root.hash(),
            sum: root.sum(),
        };
        let node = Node::load(store, &digest)?;
        let smst = Self { root: node };
        if smst.root() != *root {
            return Err(SmstError::Corrupt(format!(
                "imported root {:?} does not match requested {:?}",
                smst.root(),
                root
            )));
        }
        Ok(smst)
    }

    /// Set every leaf whose weight differs from `weight`; returns how many changed.
    pub fn reweight_leaves(&mut self, weight: u64) -> usize {
        let stale: Vec<Leaf> = self
            .leaves()
            .into_iter()
            .filter(|l| l.weight != weight)
            .cloned()
            .collect();
        let changed = stale.len();
        for leaf in stale {
            self.update_at_path(leaf.path, leaf.value, weight);
        }
        changed
    }

    /// Proof for the leaf closest to `path`.
    ///
    /// Walks down following `path`'s bits and takes the sibling whenever the
    /// preferred branch is empty.
    pub fn prove_closest(&self, path: &[u8; PATH_SIZE]) -> Result<SmstProof, SmstError> {
        let mut node = &self.root;
        let mut siblings = Vec::new();
        let mut depth = 0usize;

        loop {
            match node {
                Node::Empty => return Err(SmstError::EmptyTree),
                Node::Leaf(leaf) => {
                    return Ok(SmstProof {
                        path: *path,
                        leaf_path: leaf.path,
                        leaf_value: leaf.value.clone(),
                        leaf_weight: leaf.weight,
                        siblings,
                    });
                }
                Node::Inner(inner) => {
                    let (preferred, other) = if bit_at(path, depth) == 0 {
                        (&inner.left, &inner.right)
                    } else {
                        (&inner.right, &inner.left)
                    };
                    let (next, sibling) = if matches!(preferred, Node::Empty) {
                        (other, preferred)
                    } else {
                        (preferred, other)
                    };
                    siblings.push(sibling.digest());
                    node = next;
                    depth += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: u32, weight: u64) -> Smst {
        let mut smst = Smst::new();
        for i in 0..n {
            let key = format!("relay-{}", i);
            smst.update(key.as_bytes(), format!("payload-{}", i).as_bytes(), weight);
        }
        smst
    }

    #[test]
    fn test_empty_root() {
        let smst = Smst::new();
        assert_eq!(smst.root(), SmstRoot::empty());
        assert!(smst.root().is_empty());
    }

    #[test]
    fn test_sum_and_count() {
        let smst = filled(10, 7);
        let root = smst.root();
        assert_eq!(root.count(), 10);
        assert_eq!(root.sum(), 70);
        assert_eq!(smst.get(b"relay-3"), Some((&b"payload-3"[..], 7)));
        assert_eq!(smst.get(b"missing"), None);
    }

    #[test]
    fn test_root_is_insertion_order_independent() {
        let mut a = Smst::new();
        let mut b = Smst::new();
        for i in 0..20u32 {
            a.update(&i.to_be_bytes(), b"v", 1);
        }
        for i in (0..20u32).rev() {
            b.update(&i.to_be_bytes(), b"v", 1);
        }
        assert_eq!(a.root(), b.root());
    }

    #[test]
    fn test_update_replaces_leaf() {
        let mut smst = filled(3, 1);
        smst.update(b"relay-1", b"other", 5);
        assert_eq!(smst.root().count(), 3);
        assert_eq!(smst.root().sum(), 7);
    }

    #[test]
    fn test_weight_changes_root() {
        let a = filled(4, 1);
        let b = filled(4, 2);
        assert_ne!(a.root().hash(), b.root().hash());
    }

    #[test]
    fn test_commit_and_import() {
        let smst = filled(50, 3);
        let store = MemKvStore::new();
        let root = smst.commit(&store).unwrap();
        assert_eq!(root, smst.root());

        let imported = Smst::import(&store, &root).unwrap();
        assert_eq!(imported.root(), root);
        assert_eq!(imported.len(), 50);
    }

    #[test]
    fn test_import_missing_node_fails() {
        let smst = filled(5, 1);
        let root = smst.root();
        let store = MemKvStore::new();
        assert!(matches!(
            Smst::import(&store, &root),
            Err(SmstError::MissingNode(_))
        ));
    }

    #[test]
    fn test_reweight_restores_root() {
        let expected = filled(12, 4);
        let mut smst = filled(12, 1);
        assert_eq!(smst.reweight_leaves(4), 12);
        assert_eq!(smst.root(), expected.root());
        assert_eq!(smst.reweight_leaves(4), 0);
    }

    #[test]
    fn test_prove_closest_verifies() {
        let smst = filled(25, 2);
        let root = smst.root();
        for seed in 0u8..8 {
            let path = path_for_key(&[seed]);
            let proof = smst.prove_closest(&path).unwrap();
            assert!(proof.verify_closest(&root));
        }
    }

    #[test]
    fn test_prove_closest_empty_tree() {
        let smst = Smst::new();
        assert!(matches!(
            smst.prove_closest(&[0u8; PATH_SIZE]),
            Err(SmstError::EmptyTree)
        ));
    }

    #[test]
    fn test_root_bytes_roundtrip() {
        let root = filled(3, 9).root();
        let parsed = SmstRoot::from_bytes(root.as_bytes()).unwrap();
        assert_eq!(parsed, root);
        assert!(SmstRoot::from_bytes(&[0u8; 10]).is_err());
    }
}
