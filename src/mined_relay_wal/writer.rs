//! Buffered WAL writer with size- and timer-triggered flushes.

use super::reader::WalReader;
use super::{MAX_PAYLOAD_SIZE, WAL_VERSION, WalConfig, WalEntry, WalError};
use futures::FutureExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct WalState {
    file: Option<File>,
    buffer: Vec<u8>,
    buffered_entries: usize,
    /// Bytes known to be on disk (header included).
    durable_len: u64,
    /// Set when the file could not be rolled back to `durable_len`
    failed: bool,
}

/// Append-only mined-relay log for one session.
///
/// # Usage
///
/// ```rust,ignore
/// let wal = Arc::new(MinedRelayWal::open(&path, WalConfig::default())?);
/// wal.start_flush_timer();
///
/// wal.append(&relay_hash, &relay_bytes, compute_units)?;
/// // ... on settlement
/// wal.close_and_remove()?;
/// ```
///
/// Entries still in the buffer when the process dies are lost; durability
/// follows the flush policy, not individual appends.
pub struct MinedRelayWal {
    path: PathBuf,
    config: WalConfig,
    state: Mutex<WalState>,
    closed: AtomicBool,
    timer_cancel: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl MinedRelayWal {
    /// Open or create the WAL at `path`.
    ///
    /// A new file gets the version byte immediately; an existing one must
    /// carry [`WAL_VERSION`]. A partial frame left at the end of an existing
    /// file by a crash is cut off so new frames start on a boundary.
    pub fn open(path: impl AsRef<Path>, config: WalConfig) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        let durable_len = if len == 0 {
            file.write_all(&[WAL_VERSION])?;
            file.sync_all()?;
            1
        } else {
            let mut version = [0u8; 1];
            file.read_exact(&mut version)?;
            if version[0] != WAL_VERSION {
                return Err(WalError::UnsupportedVersion {
                    found: version[0],
                    expected: WAL_VERSION,
                });
            }
            let whole = whole_frames_len(&path)?;
            if whole < len {
                warn!(
                    path = %path.display(),
                    file_len = len,
                    kept = whole,
                    "Truncating torn frame at end of WAL"
                );
                file.set_len(whole)?;
                file.sync_all()?;
            }
            whole
        };
        file.seek(SeekFrom::Start(durable_len))?;

        debug!(path = %path.display(), durable_len, "Mined relay WAL opened");

        Ok(Self {
            path,
            config,
            state: Mutex::new(WalState {
                file: Some(file),
                buffer: Vec::new(),
                buffered_entries: 0,
                durable_len,
                failed: false,
            }),
            closed: AtomicBool::new(false),
            timer_cancel: CancellationToken::new(),
            timer: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of bytes waiting for the next flush.
    pub fn buffered_bytes(&self) -> usize {
        self.lock().buffer.len()
    }

    /// Buffer one frame; flushes when the buffer crosses the size threshold.
    ///
    /// A failed threshold flush is logged and the frames stay buffered for
    /// the next flush attempt.
    pub fn append(&self, relay_hash: &[u8; 32], payload: &[u8], weight: u64) -> Result<(), WalError> {
        if self.is_closed() {
            return Err(WalError::Closed);
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WalError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut state = self.lock();
        if state.failed {
            return Err(WalError::Failed);
        }
        WalEntry::encode_into(relay_hash, payload, weight, &mut state.buffer);
        state.buffered_entries += 1;

        if state.buffer.len() >= self.config.flush_threshold_bytes {
            if let Err(e) = self.flush_locked(&mut state) {
                warn!(
                    path = %self.path.display(),
                    buffered = state.buffer.len(),
                    error = %e,
                    "Threshold WAL flush failed, will retry"
                );
            }
        }
        Ok(())
    }

    /// Write buffered frames and fsync.
    pub fn flush(&self) -> Result<(), WalError> {
        let mut state = self.lock();
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut WalState) -> Result<(), WalError> {
        if state.failed {
            return Err(WalError::Failed);
        }
        if state.buffer.is_empty() {
            return Ok(());
        }
        let durable_len = state.durable_len;
        let file = state.file.as_mut().ok_or(WalError::Closed)?;

        let result = file
            .write_all(&state.buffer)
            .and_then(|_| file.sync_data());

        if let Err(e) = result {
            // Drop any partial frame so the next attempt starts on a boundary
            let rollback = file
                .set_len(durable_len)
                .and_then(|_| file.seek(SeekFrom::Start(durable_len)));
            if let Err(rollback_err) = rollback {
                error!(
                    path = %self.path.display(),
                    durable_len,
                    error = %rollback_err,
                    "WAL rollback after failed write failed, refusing further writes"
                );
                state.failed = true;
            }
            return Err(e.into());
        }

        state.durable_len += state.buffer.len() as u64;
        state.buffer.clear();
        state.buffered_entries = 0;
        Ok(())
    }

    /// Start the periodic flush task; the WAL owns it until close.
    ///
    /// A no-op on a closed WAL or when a timer is already running.
    pub fn start_flush_timer(self: &Arc<Self>) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.is_some() || self.is_closed() {
            return;
        }
        let wal = Arc::clone(self);
        let cancel = self.timer_cancel.clone();
        let period = Duration::from_secs(self.config.flush_interval_secs.max(1));

        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = wal.flush() {
                            warn!(path = %wal.path.display(), error = %e, "Periodic WAL flush failed");
                        }
                    }
                }
            }
        }));
    }

    pub fn has_flush_timer(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Cancel the flush timer and report it if it died.
    ///
    /// A timer still winding down after the cancel exits on its own.
    fn stop_flush_timer(&self) {
        self.timer_cancel.cancel();
        let handle = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Some(Err(e)) = handle.now_or_never()
        {
            error!(path = %self.path.display(), error = %e, "WAL flush timer ended abnormally");
        }
    }

    /// Flush and release the file; the log stays on disk for replay.
    pub fn close(&self) -> Result<(), WalError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_flush_timer();

        let mut state = self.lock();
        let entries = state.buffered_entries;
        let result = self.flush_locked(&mut state);
        state.file = None;
        result?;

        debug!(path = %self.path.display(), flushed_entries = entries, "Mined relay WAL closed");
        Ok(())
    }

    /// Close and delete the log once settlement makes it redundant.
    pub fn close_and_remove(&self) -> Result<(), WalError> {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "WAL flush before removal failed");
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(path = %self.path.display(), "Mined relay WAL removed");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Length of the prefix of `path` made of the version byte and whole frames.
///
/// A truncated last frame is excluded; any other corruption is an error.
fn whole_frames_len(path: &Path) -> Result<u64, WalError> {
    let mut reader = WalReader::open(path)?;
    loop {
        match reader.read_entry() {
            Ok(Some(_)) => continue,
            Ok(None) | Err(WalError::Truncated { .. }) => return Ok(reader.offset()),
            Err(e) => return Err(e),
        }
    }
}
