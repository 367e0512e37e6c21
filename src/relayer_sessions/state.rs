//! Settlement lifecycle of one session, as seen by the manager.

use std::fmt;

/// ```text
///   Active ──▶ ClaimWindowOpen ──▶ ProofWindowOpen ──▶ Settled
///     │               │                   │
///     └───────────────┴───────────────────┴──────────▶ Dropped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionLifecycle {
    /// Accepting relays
    Active,

    /// Waiting for the earliest claim height, then flushing and claiming
    ClaimWindowOpen,

    /// Claim on chain, waiting to prove
    ProofWindowOpen,

    /// Terminal: proof submitted (or not required), tree deleted
    Settled,

    /// Terminal: window missed, retries exhausted or restart reclassification
    Dropped,
}

impl SessionLifecycle {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionLifecycle::Settled | SessionLifecycle::Dropped)
    }

    /// Whether relays may still be added
    #[inline]
    pub fn accepts_relays(&self) -> bool {
        matches!(self, SessionLifecycle::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionLifecycle::Active => "ACTIVE",
            SessionLifecycle::ClaimWindowOpen => "CLAIM_WINDOW_OPEN",
            SessionLifecycle::ProofWindowOpen => "PROOF_WINDOW_OPEN",
            SessionLifecycle::Settled => "SETTLED",
            SessionLifecycle::Dropped => "DROPPED",
        }
    }
}

impl fmt::Display for SessionLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
