//! Snapshot document and file naming.

use crate::core_types::SessionHeader;
use crate::session_tree::{BackupSource, LeafEntry};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::BackupError;

/// One backup of one session tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    #[serde(default = "SessionSnapshot::legacy_version")]
    pub format_version: u32,
    pub session_header: SessionHeader,
    pub supplier_operator_address: String,
    #[serde(default, with = "crate::serde_hex::opt_bytes")]
    pub claimed_root: Option<Vec<u8>>,
    #[serde(default, with = "crate::serde_hex::opt_bytes")]
    pub proof_path: Option<Vec<u8>>,
    #[serde(default, with = "crate::serde_hex::opt_bytes")]
    pub compact_proof_bz: Option<Vec<u8>>,
    pub is_claiming: bool,
    /// Unix seconds
    pub backup_timestamp: i64,
    pub smt_entries: Vec<LeafEntry>,
    #[serde(with = "crate::serde_hex::bytes")]
    pub smt_root: Vec<u8>,
    /// Absent in snapshots written before weights were recorded
    #[serde(default)]
    pub compute_units_per_relay: Option<u64>,
}

impl SessionSnapshot {
    pub const FORMAT_VERSION: u32 = 1;

    fn legacy_version() -> u32 {
        0
    }

    /// Capture `source`, committing any pending nodes first.
    pub fn capture(
        source: &dyn BackupSource,
        compute_units_per_relay: u64,
    ) -> Result<Self, BackupError> {
        let smt_root = source.commit_pending()?;
        let smt_entries = source.export_leaves()?;
        let meta = source.snapshot_meta();

        Ok(Self {
            format_version: Self::FORMAT_VERSION,
            session_header: meta.session_header,
            supplier_operator_address: meta.supplier_operator_address,
            claimed_root: meta.claimed_root.map(|r| r.as_bytes().to_vec()),
            proof_path: meta.proof_path.map(|p| p.to_vec()),
            compact_proof_bz: meta.proof_bytes,
            is_claiming: meta.is_claiming,
            backup_timestamp: chrono::Utc::now().timestamp(),
            smt_entries,
            smt_root: smt_root.as_bytes().to_vec(),
            compute_units_per_relay: Some(compute_units_per_relay),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_header.session_id
    }
}

/// `<backup_dir>/<supplier>/<session_id>`
pub fn session_backup_dir(backup_dir: &Path, supplier: &str, session_id: &str) -> PathBuf {
    backup_dir.join(supplier).join(session_id)
}

/// `session_<supplier>_<session_id>_<unix_nanos>.json`
pub fn snapshot_file_name(supplier: &str, session_id: &str, unix_nanos: i64) -> String {
    format!("session_{}_{}_{}.json", supplier, session_id, unix_nanos)
}
