//! Dual-write key-value store.
//!
//! Reads are served by the primary only. Writes go to the primary first and,
//! once that succeeds, to the backup; a failing backup never fails the write.

use crate::smst::{KvStore, SmstError};
use std::sync::{PoisonError, RwLock};
use tracing::{info, warn};

pub struct BackupKvStore<P: KvStore, B: KvStore> {
    primary: P,
    backup: RwLock<Option<B>>,
}

impl<P: KvStore, B: KvStore> BackupKvStore<P, B> {
    pub fn new(primary: P, backup: B) -> Self {
        Self {
            primary,
            backup: RwLock::new(Some(backup)),
        }
    }

    /// Store with no backup attached; behaves like `primary`.
    pub fn primary_only(primary: P) -> Self {
        Self {
            primary,
            backup: RwLock::new(None),
        }
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn has_backup(&self) -> bool {
        self.backup
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Flush and detach the backup; later writes reach the primary only.
    pub fn close_backup(&self) -> Result<(), SmstError> {
        let mut guard = self.backup.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(backup) = guard.take() {
            backup.flush()?;
            info!(entries = backup.len(), "Backup store closed");
        }
        Ok(())
    }

    /// Copy every backup entry into the primary; returns the number copied.
    pub fn restore_from_backup(&self) -> Result<usize, SmstError> {
        let guard = self.backup.read().unwrap_or_else(PoisonError::into_inner);
        let Some(backup) = guard.as_ref() else {
            return Ok(0);
        };
        let entries = backup.entries()?;
        for (key, value) in &entries {
            self.primary.set(key, value)?;
        }
        self.primary.flush()?;
        info!(entries = entries.len(), "Primary store restored from backup");
        Ok(entries.len())
    }

    fn mirror(&self, op: &str, f: impl FnOnce(&B) -> Result<(), SmstError>) {
        let guard = self.backup.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(backup) = guard.as_ref()
            && let Err(e) = f(backup)
        {
            warn!(op, error = %e, "Backup store write failed");
        }
    }
}

impl<P: KvStore, B: KvStore> KvStore for BackupKvStore<P, B> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SmstError> {
        self.primary.get(key)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), SmstError> {
        self.primary.set(key, value)?;
        self.mirror("set", |b| b.set(key, value));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), SmstError> {
        self.primary.delete(key)?;
        self.mirror("delete", |b| b.delete(key));
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SmstError> {
        self.primary.entries()
    }

    fn len(&self) -> usize {
        self.primary.len()
    }

    fn flush(&self) -> Result<(), SmstError> {
        self.primary.flush()?;
        self.mirror("flush", |b| b.flush());
        Ok(())
    }

    fn clear_all(&self) -> Result<(), SmstError> {
        self.primary.clear_all()?;
        self.mirror("clear_all", |b| b.clear_all());
        Ok(())
    }
}
