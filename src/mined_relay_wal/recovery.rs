//! Rebuild a session trie from its WAL.

use super::{WalEntry, WalError, WalReader};
use crate::smst::Smst;
use std::path::Path;

/// Trie reconstructed from a WAL file.
#[derive(Debug)]
pub struct WalRecovery {
    pub smst: Smst,
    /// Frames replayed.
    pub entries: usize,
}

/// Feed every frame of `path` to `f`, in file order. Returns the frame count.
///
/// Stops at the first truncated or malformed frame.
pub fn replay(
    path: impl AsRef<Path>,
    mut f: impl FnMut(WalEntry),
) -> Result<usize, WalError> {
    let mut reader = WalReader::open(path)?;
    let mut entries = 0usize;
    while let Some(entry) = reader.read_entry()? {
        f(entry);
        entries += 1;
    }
    Ok(entries)
}

/// Replay every frame of `path` into a fresh trie.
///
/// Any truncated or malformed frame aborts the reconstruction.
pub fn rebuild_smst(path: impl AsRef<Path>) -> Result<WalRecovery, WalError> {
    let path = path.as_ref();
    let mut smst = Smst::new();
    let entries = replay(path, |entry| {
        smst.update(&entry.relay_hash, &entry.payload, entry.weight);
    })?;

    let root = smst.root();
    tracing::info!(
        path = %path.display(),
        entries,
        root_sum = root.sum(),
        "Session trie rebuilt from WAL"
    );

    Ok(WalRecovery { smst, entries })
}
