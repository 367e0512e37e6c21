//! Relay request/response pairs as served, and their mined form.

use crate::core_types::SessionHeader;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRequestMetadata {
    pub session_header: SessionHeader,
    pub supplier_operator_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub meta: RelayRequestMetadata,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResponseMetadata {
    pub session_header: SessionHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResponse {
    pub meta: RelayResponseMetadata,
    pub payload: Vec<u8>,
}

/// A served relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    pub req: RelayRequest,
    pub res: RelayResponse,
}

impl Relay {
    pub fn session_header(&self) -> &SessionHeader {
        &self.req.meta.session_header
    }

    pub fn supplier_operator_address(&self) -> &str {
        &self.req.meta.supplier_operator_address
    }
}

/// A relay admitted by the miner. `hash` is sha256 over `bytes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinedRelay {
    pub relay: Relay,
    pub bytes: Vec<u8>,
    pub hash: [u8; 32],
}
