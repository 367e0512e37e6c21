//! Key-value stores backing a session trie.
//!
//! Trie nodes are committed into a [`KvStore`] keyed by node digest. The
//! in-memory store backs tests and transient trees; the file store is the
//! live on-disk store for one session.

use super::SmstError;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// Minimal key-value contract used by the trie and the backup layer.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SmstError>;
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), SmstError>;
    fn delete(&self, key: &[u8]) -> Result<(), SmstError>;
    /// Every entry, ordered by key.
    fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SmstError>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Make all previous writes durable.
    fn flush(&self) -> Result<(), SmstError>;
    fn clear_all(&self) -> Result<(), SmstError>;
}

// ============================================================
// IN-MEMORY STORE
// ============================================================

#[derive(Debug, Default)]
pub struct MemKvStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SmstError> {
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), SmstError> {
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), SmstError> {
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(key);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SmstError> {
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn len(&self) -> usize {
        self.map.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn flush(&self) -> Result<(), SmstError> {
        Ok(())
    }

    fn clear_all(&self) -> Result<(), SmstError> {
        self.map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

// ============================================================
// FILE STORE
// ============================================================

const STORE_MAGIC: &[u8; 4] = b"SMKV";
const STORE_FILE: &str = "store.bin";

/// Directory-backed store.
///
/// Entries are held in memory and written as a single checksummed file on
/// [`KvStore::flush`]:
///
/// ```text
/// <dir>/store.bin = [MAGIC 4B]["crc32" 4B LE][bincode(entries)]
/// ```
///
/// The file is replaced through a temp file + rename, so a crash during
/// flush leaves the previous version intact.
#[derive(Debug)]
pub struct FileKvStore {
    dir: PathBuf,
    inner: MemKvStore,
}

impl FileKvStore {
    /// Open (or create) the store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, SmstError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let inner = MemKvStore::new();
        let data_path = dir.join(STORE_FILE);
        if data_path.exists() {
            let bytes = fs::read(&data_path)?;
            for (k, v) in decode_store_file(&bytes)? {
                inner.set(&k, &v)?;
            }
        }

        tracing::debug!(path = %dir.display(), entries = inner.len(), "KV store opened");
        Ok(Self { dir, inner })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Remove the store directory and everything in it.
    pub fn destroy(&self) -> Result<(), SmstError> {
        self.inner.clear_all()?;
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SmstError> {
        self.inner.get(key)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), SmstError> {
        self.inner.set(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<(), SmstError> {
        self.inner.delete(key)
    }

    fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SmstError> {
        self.inner.entries()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn flush(&self) -> Result<(), SmstError> {
        fs::create_dir_all(&self.dir)?;
        let entries = self.inner.entries()?;
        let body = bincode::serialize(&entries).map_err(|e| SmstError::Codec(e.to_string()))?;
        let checksum = crc32fast::hash(&body);

        let tmp_path = self.dir.join(format!("{}.tmp", STORE_FILE));
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(STORE_MAGIC)?;
            writer.write_all(&checksum.to_le_bytes())?;
            writer.write_all(&body)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, self.dir.join(STORE_FILE))?;
        Ok(())
    }

    fn clear_all(&self) -> Result<(), SmstError> {
        self.inner.clear_all()
    }
}

fn decode_store_file(bytes: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SmstError> {
    if bytes.len() < 8 || &bytes[..4] != STORE_MAGIC {
        return Err(SmstError::Corrupt("invalid store header".into()));
    }
    let expected = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let body = &bytes[8..];
    let actual = crc32fast::hash(body);
    if actual != expected {
        return Err(SmstError::Corrupt(format!(
            "store checksum mismatch: expected {:08x}, got {:08x}",
            expected, actual
        )));
    }
    bincode::deserialize(body).map_err(|e| SmstError::Codec(e.to_string()))
}
