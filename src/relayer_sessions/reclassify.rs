//! Restart reclassification of persisted sessions.

use super::windows::{claim_window_close_height, claim_window_open_height, proof_window_close_height};
use crate::client::SharedParams;
use crate::core_types::{Height, SessionHeader};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The proof window already closed; nothing can be settled
    ProofWindowClosed,
    /// The claim window closed without a claim on chain
    ClaimWindowMissed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::ProofWindowClosed => "proof_window_closed",
            DropReason::ClaimWindowMissed => "claim_window_missed",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclass {
    Delete(DropReason),
    /// Claim already on chain; only the proof remains
    RetainForProof,
    /// Still active or claimable
    Retain,
}

impl Reclass {
    pub fn is_retained(&self) -> bool {
        !matches!(self, Reclass::Delete(_))
    }
}

/// Whether the chain must be asked for an existing claim before reclassifying.
///
/// Before the claim window opens no claim can exist.
pub fn needs_claim_lookup(height: Height, params: &SharedParams, header: &SessionHeader) -> bool {
    height >= claim_window_open_height(params, header.session_end_block_height)
}

/// Classify a persisted session at `height`.
pub fn reclassify(
    height: Height,
    params: &SharedParams,
    header: &SessionHeader,
    claim_found: bool,
) -> Reclass {
    let end = header.session_end_block_height;
    if height > proof_window_close_height(params, end) {
        return Reclass::Delete(DropReason::ProofWindowClosed);
    }
    if claim_found {
        return Reclass::RetainForProof;
    }
    if height > claim_window_close_height(params, end) {
        return Reclass::Delete(DropReason::ClaimWindowMissed);
    }
    Reclass::Retain
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> SessionHeader {
        SessionHeader {
            service_id: "svc".to_string(),
            application_address: "app".to_string(),
            session_id: "s1".to_string(),
            session_start_block_height: 1,
            session_end_block_height: 4,
        }
    }

    // claim window [6, 10], proof window [10, 14]
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
    fn test_past_proof_window_is_deleted() {
        assert_eq!(
            reclassify(15, &params(), &header(), true),
            Reclass::Delete(DropReason::ProofWindowClosed)
        );
        assert_eq!(
            reclassify(15, &params(), &header(), false),
            Reclass::Delete(DropReason::ProofWindowClosed)
        );
    }

    #[test]
    fn test_past_claim_window_depends_on_claim() {
        assert_eq!(
            reclassify(11, &params(), &header(), false),
            Reclass::Delete(DropReason::ClaimWindowMissed)
        );
        assert_eq!(
            reclassify(11, &params(), &header(), true),
            Reclass::RetainForProof
        );
    }

    #[test]
    fn test_active_and_claimable_are_retained() {
        assert_eq!(reclassify(3, &params(), &header(), false), Reclass::Retain);
        assert_eq!(reclassify(8, &params(), &header(), false), Reclass::Retain);
        assert_eq!(reclassify(10, &params(), &header(), false), Reclass::Retain);
        assert_eq!(reclassify(8, &params(), &header(), true), Reclass::RetainForProof);
    }

    #[test]
    fn test_claim_lookup_starts_at_window_open() {
        assert!(!needs_claim_lookup(5, &params(), &header()));
        assert!(needs_claim_lookup(6, &params(), &header()));
        assert!(needs_claim_lookup(20, &params(), &header()));
    }
}
