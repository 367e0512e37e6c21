//! Backup Manager - writes, prunes and loads session snapshots.

use super::snapshot::{SessionSnapshot, session_backup_dir, snapshot_file_name};
use super::{BackupConfig, BackupError, BackupEvent};
use crate::session_tree::BackupSource;
use async_trait::async_trait;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Supplies the live sessions to back up on each periodic tick, paired with
/// their service's compute units per relay.
#[async_trait]
pub trait BackupTargets: Send + Sync {
    async fn backup_targets(&self) -> Vec<(Arc<dyn BackupSource>, u64)>;
}

pub struct BackupManager {
    config: BackupConfig,
    backup_dir: PathBuf,
}

impl BackupManager {
    pub fn new(config: BackupConfig) -> Result<Self, BackupError> {
        config.validate()?;
        let backup_dir = PathBuf::from(&config.backup_dir);
        if config.enabled {
            fs::create_dir_all(&backup_dir).map_err(|e| {
                BackupError::InvalidDirectory(format!("{}: {}", backup_dir.display(), e))
            })?;
        }
        Ok(Self { config, backup_dir })
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    // --------------------------------------------------------
    // Write
    // --------------------------------------------------------

    /// Write one snapshot of `source` and prune its directory.
    pub fn backup_session(
        &self,
        source: &dyn BackupSource,
        compute_units_per_relay: u64,
    ) -> Result<PathBuf, BackupError> {
        let snapshot = SessionSnapshot::capture(source, compute_units_per_relay)?;
        let dir = session_backup_dir(
            &self.backup_dir,
            &snapshot.supplier_operator_address,
            snapshot.session_id(),
        );
        fs::create_dir_all(&dir)?;

        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(snapshot.backup_timestamp * 1_000_000_000);
        let file_name =
            snapshot_file_name(&snapshot.supplier_operator_address, snapshot.session_id(), nanos);
        let final_path = dir.join(&file_name);
        let tmp_path = dir.join(format!(".{}.tmp", file_name));

        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &snapshot)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;

        let pruned = self.apply_retention(&dir)?;

        info!(
            session_id = %snapshot.session_id(),
            supplier = %snapshot.supplier_operator_address,
            entries = snapshot.smt_entries.len(),
            pruned,
            path = %final_path.display(),
            "Session tree backup written"
        );
        Ok(final_path)
    }

    /// Back up on `event` if that trigger is enabled.
    pub fn backup_on_event(
        &self,
        source: &dyn BackupSource,
        event: BackupEvent,
        compute_units_per_relay: u64,
    ) -> Result<Option<PathBuf>, BackupError> {
        if !self.config.event_enabled(event) {
            return Ok(None);
        }
        debug!(event = %event, "Backup triggered");
        self.backup_session(source, compute_units_per_relay).map(Some)
    }

    /// Back up every source; failures are logged and skipped.
    pub fn backup_all(&self, sources: &[(Arc<dyn BackupSource>, u64)], event: BackupEvent) -> usize {
        let mut written = 0;
        for (source, cu) in sources {
            match self.backup_on_event(source.as_ref(), event, *cu) {
                Ok(Some(_)) => written += 1,
                Ok(None) => {}
                Err(e) => {
                    let meta = source.snapshot_meta();
                    error!(
                        session_id = %meta.session_header.session_id,
                        supplier = %meta.supplier_operator_address,
                        event = %event,
                        error = %e,
                        "Session tree backup failed"
                    );
                }
            }
        }
        written
    }

    /// Start the periodic backup loop, if an interval is configured.
    pub fn spawn_periodic(
        self: &Arc<Self>,
        targets: Arc<dyn BackupTargets>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !self.config.event_enabled(BackupEvent::Periodic) {
            info!("Periodic backup disabled");
            return None;
        }
        let manager = Arc::clone(self);
        let period = Duration::from_secs(self.config.interval_seconds);
        info!(
            interval_secs = self.config.interval_seconds,
            backup_dir = %self.backup_dir.display(),
            "Starting periodic backup"
        );

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let sources = targets.backup_targets().await;
                        let written = manager.backup_all(&sources, BackupEvent::Periodic);
                        debug!(written, total = sources.len(), "Periodic backup pass complete");
                    }
                }
            }
            info!("Periodic backup stopped");
        }))
    }

    // --------------------------------------------------------
    // Retention
    // --------------------------------------------------------

    /// Keep the newest `retain_backup_count` snapshots in `dir`; returns how many were removed.
    pub fn apply_retention(&self, dir: &Path) -> Result<usize, BackupError> {
        if self.config.retain_backup_count <= 0 {
            return Ok(0);
        }
        let keep = self.config.retain_backup_count as usize;
        let files = snapshot_files_newest_first(dir)?;

        let mut removed = 0;
        for path in files.into_iter().skip(keep) {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to prune backup"),
            }
        }
        Ok(removed)
    }

    // --------------------------------------------------------
    // Restore
    // --------------------------------------------------------

    pub fn load_snapshot(path: &Path) -> Result<SessionSnapshot, BackupError> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Newest readable snapshot of every backed-up session.
    ///
    /// Unreadable files are skipped with a warning and the next newest file
    /// for that session is tried.
    pub fn restore_all(&self) -> Result<Vec<SessionSnapshot>, BackupError> {
        if !self.config.enabled {
            info!("Backups disabled, skipping restore");
            return Ok(Vec::new());
        }
        if !self.backup_dir.exists() {
            info!(backup_dir = %self.backup_dir.display(), "Backup directory missing, nothing to restore");
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::new();
        for supplier_dir in sub_dirs(&self.backup_dir)? {
            for session_dir in sub_dirs(&supplier_dir)? {
                let files = match snapshot_files_newest_first(&session_dir) {
                    Ok(files) => files,
                    Err(e) => {
                        warn!(path = %session_dir.display(), error = %e, "Skipping unreadable backup dir");
                        continue;
                    }
                };
                for path in files {
                    match Self::load_snapshot(&path) {
                        Ok(snapshot) => {
                            snapshots.push(snapshot);
                            break;
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Skipping invalid backup file");
                        }
                    }
                }
            }
        }

        info!(count = snapshots.len(), "Loaded session backups");
        Ok(snapshots)
    }
}

fn sub_dirs(dir: &Path) -> Result<Vec<PathBuf>, BackupError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

/// `.json` snapshot files in `dir`, newest modification time first.
fn snapshot_files_newest_first(dir: &Path) -> Result<Vec<PathBuf>, BackupError> {
    let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_snapshot = path.extension().is_some_and(|ext| ext == "json")
            && !entry.file_name().to_string_lossy().starts_with('.');
        if !is_snapshot || !entry.file_type()?.is_file() {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        files.push((modified, path));
    }
    // Newest first; file names carry a nanosecond timestamp and break ties
    files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    Ok(files.into_iter().map(|(_, p)| p).collect())
}
