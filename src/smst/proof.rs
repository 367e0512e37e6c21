use super::{NodeDigest, PATH_SIZE, SmstError, SmstRoot, bit_at, inner_digest, leaf_digest};
use serde::{Deserialize, Serialize};

/// Closest-leaf inclusion proof.
///
/// `siblings[d]` is the digest of the subtree beside the proven leaf at
/// depth `d`. The leaf's own path bits say which side it sits on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmstProof {
    /// Path the proof was requested for.
    pub path: [u8; PATH_SIZE],
    pub leaf_path: [u8; PATH_SIZE],
    pub leaf_value: Vec<u8>,
    pub leaf_weight: u64,
    pub siblings: Vec<NodeDigest>,
}

impl SmstProof {
    /// Recompute the root digest implied by this proof.
    pub fn compute_root(&self) -> NodeDigest {
        let mut current = leaf_digest(&self.leaf_path, &self.leaf_value, self.leaf_weight);
        for (depth, sibling) in self.siblings.iter().enumerate().rev() {
            current = if bit_at(&self.leaf_path, depth) == 0 {
                inner_digest(&current, sibling)
            } else {
                inner_digest(sibling, &current)
            };
        }
        current
    }

    /// Inclusion of the leaf under `root`. Says nothing about whether the
    /// leaf is the closest one to `path`; see [`SmstProof::verify_closest`].
    pub fn verify(&self, root: &SmstRoot) -> bool {
        let computed = self.compute_root();
        computed.hash == root.hash() && computed.sum == root.sum()
    }

    /// Inclusion plus closeness: wherever the leaf path leaves `path`, the
    /// subtree on the `path` side must be empty, so no leaf follows `path`
    /// further than the proven one.
    pub fn verify_closest(&self, root: &SmstRoot) -> bool {
        let diverges_into_occupied = self.siblings.iter().enumerate().any(|(depth, sibling)| {
            bit_at(&self.leaf_path, depth) != bit_at(&self.path, depth) && !sibling.is_empty()
        });
        !diverges_into_occupied && self.verify(root)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SmstError> {
        bincode::serialize(self).map_err(|e| SmstError::Codec(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SmstError> {
        bincode::deserialize(bytes).map_err(|e| SmstError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Smst, path_for_key};
    use super::*;

    #[test]
    fn test_single_leaf_proof() {
        let mut smst = Smst::new();
        smst.update(b"only", b"value", 10);
        let proof = smst.prove_closest(&[0xffu8; PATH_SIZE]).unwrap();
        assert!(proof.siblings.is_empty());
        assert_eq!(proof.leaf_path, path_for_key(b"only"));
        assert!(proof.verify(&smst.root()));
    }

    #[test]
    fn test_tampered_proof_fails() {
        let mut smst = Smst::new();
        for i in 0..10u8 {
            smst.update(&[i], b"v", 1);
        }
        let root = smst.root();
        let mut proof = smst.prove_closest(&path_for_key(b"seed")).unwrap();
        proof.leaf_weight += 1;
        assert!(!proof.verify(&root));
    }

    #[test]
    fn test_closest_proof_for_other_path_is_rejected() {
        let mut smst = Smst::new();
        for i in 0..16u8 {
            smst.update(&[i], b"v", 2);
        }
        let root = smst.root();
        let a = path_for_key(&[3]);
        let b = path_for_key(&[11]);

        let proof = smst.prove_closest(&b).unwrap();
        assert_eq!(proof.leaf_path, b);
        assert!(proof.verify_closest(&root));
        assert!(smst.prove_closest(&[0x5au8; PATH_SIZE]).unwrap().verify_closest(&root));

        // leaf `a` is included but is not the closest leaf to `b`
        let mut forged = smst.prove_closest(&a).unwrap();
        forged.path = b;
        assert!(forged.verify(&root));
        assert!(!forged.verify_closest(&root));
    }

    #[test]
    fn test_proof_bytes() {
        let mut smst = Smst::new();
        for i in 0..4u8 {
            smst.update(&[i], b"v", 3);
        }
        let proof = smst.prove_closest(&[0u8; PATH_SIZE]).unwrap();
        let decoded = SmstProof::from_bytes(&proof.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, proof);
    }
}
