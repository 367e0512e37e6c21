//! Session, claim and proof window arithmetic.
//!
//! ```text
//!  session end
//!      │ +claim_open_offset+1     +claim_close_offset
//!      ▼─────────────▶ claim open ────────────▶ claim close
//!                                                   │ +proof_open_offset
//!                                                   ▼────▶ proof open ──+proof_close_offset──▶ proof close
//! ```
//!
//! Earliest commit heights inside a window are spread per supplier by a
//! block-hash seed, so every node derives the same height from the same chain.

use crate::client::{ProofParams, SharedParams};
use crate::core_types::Height;
use crate::difficulty::relay_difficulty_multiplier;
use crate::smst::{PATH_SIZE, SmstRoot};
use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use std::fmt;

// ============================================================
// SESSIONS
// ============================================================

/// First block of the session containing `height` (heights start at 1).
pub fn session_start_height(params: &SharedParams, height: Height) -> Height {
    let n = params.num_blocks_per_session;
    if n == 0 || height == 0 {
        return 0;
    }
    height - ((height - 1) % n)
}

pub fn session_end_height(params: &SharedParams, height: Height) -> Height {
    let start = session_start_height(params, height);
    if params.num_blocks_per_session == 0 {
        return start;
    }
    start + params.num_blocks_per_session - 1
}

/// Last height at which relays for a session ending at `session_end` are served.
pub fn session_grace_period_end_height(params: &SharedParams, session_end: Height) -> Height {
    session_end + params.grace_period_end_offset_blocks
}

// ============================================================
// WINDOWS
// ============================================================

pub fn claim_window_open_height(params: &SharedParams, session_end: Height) -> Height {
    session_end + params.claim_window_open_offset_blocks + 1
}

pub fn claim_window_close_height(params: &SharedParams, session_end: Height) -> Height {
    claim_window_open_height(params, session_end) + params.claim_window_close_offset_blocks
}

pub fn proof_window_open_height(params: &SharedParams, session_end: Height) -> Height {
    claim_window_close_height(params, session_end) + params.proof_window_open_offset_blocks
}

pub fn proof_window_close_height(params: &SharedParams, session_end: Height) -> Height {
    proof_window_open_height(params, session_end) + params.proof_window_close_offset_blocks
}

/// Deterministic offset in `[0, window)` from `sha256(block_hash ‖ supplier)`.
fn seeded_offset(block_hash: &[u8], supplier: &str, window: u64) -> u64 {
    if window == 0 {
        return 0;
    }
    let mut hasher = Sha256::new();
    hasher.update(block_hash);
    hasher.update(supplier.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let seed = u64::from_be_bytes(head) & (u64::MAX >> 1);
    seed % window
}

/// Earliest height `supplier` may commit its claim.
///
/// `claim_open_block_hash` is the hash of the block right before the claim
/// window opens.
pub fn earliest_claim_commit_height(
    params: &SharedParams,
    session_end: Height,
    claim_open_block_hash: &[u8],
    supplier: &str,
) -> Height {
    claim_window_open_height(params, session_end)
        + seeded_offset(
            claim_open_block_hash,
            supplier,
            params.claim_window_close_offset_blocks,
        )
}

/// Earliest height `supplier` may commit its proof.
pub fn earliest_proof_commit_height(
    params: &SharedParams,
    session_end: Height,
    proof_open_block_hash: &[u8],
    supplier: &str,
) -> Height {
    proof_window_open_height(params, session_end)
        + seeded_offset(
            proof_open_block_hash,
            supplier,
            params.proof_window_close_offset_blocks,
        )
}

// ============================================================
// PROOFS
// ============================================================

/// Trie path the proof must be closest to.
pub fn proof_path(seed_block_hash: &[u8]) -> [u8; PATH_SIZE] {
    Sha256::digest(seed_block_hash).into()
}

/// Uniform sample in `[0, 1]` from `sha256(seed_block_hash ‖ root)`.
pub fn proof_requirement_sample(seed_block_hash: &[u8], root: &SmstRoot) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(seed_block_hash);
    hasher.update(root.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head) as f64 / u64::MAX as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofRequirement {
    /// Estimated compute units reached the threshold
    Threshold,
    /// Sampled below the request probability
    Probabilistic,
    NotRequired,
}

impl ProofRequirement {
    pub fn is_required(&self) -> bool {
        !matches!(self, ProofRequirement::NotRequired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProofRequirement::Threshold => "threshold",
            ProofRequirement::Probabilistic => "probabilistic",
            ProofRequirement::NotRequired => "not_required",
        }
    }
}

impl fmt::Display for ProofRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Decide whether the claim with `root` has to be proven.
///
/// The root sum counts mined compute units only; it is scaled by the
/// difficulty multiplier to estimate what was actually serviced. An
/// undefined multiplier (all-zero target) leaves the sum unscaled.
pub fn proof_requirement(
    root: &SmstRoot,
    difficulty_target: &[u8],
    params: &ProofParams,
    seed_block_hash: &[u8],
) -> ProofRequirement {
    let estimated = match relay_difficulty_multiplier(difficulty_target) {
        Ok(multiplier) => multiplier.scale(root.sum()),
        Err(_) => BigUint::from(root.sum()),
    };
    if estimated >= BigUint::from(params.proof_requirement_threshold) {
        return ProofRequirement::Threshold;
    }
    if proof_requirement_sample(seed_block_hash, root) <= params.proof_request_probability {
        return ProofRequirement::Probabilistic;
    }
    ProofRequirement::NotRequired
}
