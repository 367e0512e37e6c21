//! Core domain types shared by every component.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Block height
pub type Height = u64;

/// Session identity and bounds. Immutable once the session exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHeader {
    pub service_id: String,
    pub application_address: String,
    pub session_id: String,
    pub session_start_block_height: Height,
    pub session_end_block_height: Height,
}

/// Index key of one session tree: (supplier, session end height, session id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub supplier_operator_address: String,
    pub session_end_height: Height,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(supplier: &str, header: &SessionHeader) -> Self {
        Self {
            supplier_operator_address: supplier.to_string(),
            session_end_height: header.session_end_block_height,
            session_id: header.session_id.clone(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.supplier_operator_address, self.session_id, self.session_end_height
        )
    }
}

/// Committed block notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub height: Height,
    pub hash: Vec<u8>,
}

impl Block {
    pub fn new(height: Height, hash: impl Into<Vec<u8>>) -> Self {
        Self {
            height,
            hash: hash.into(),
        }
    }
}
