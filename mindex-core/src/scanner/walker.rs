use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

use crossbeam_channel::{Receiver, Sender};
use jwalk::WalkDir;

use super::progress::{ScanMessage, ScanProgress};
use crate::index::{Entry, Index};
#[cfg(not(unix))]
use crate::index::{MODE_DIR, MODE_FILE, MODE_SYMLINK};
use crate::{IndexError, Result};

/// Scanner configuration.
///
/// Hidden files are always indexed. The same configuration must be used for
/// every scan of a root so that successive indexes stay comparable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Follow symbolic links
    pub follow_symlinks: bool,
    /// Deepest entry depth to record (None = unlimited)
    pub max_depth: Option<usize>,
    /// Stay on same filesystem (don't cross mount points)
    pub same_filesystem: bool,
    /// Number of parallel threads (0 = auto)
    pub num_threads: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            follow_symlinks: false,
            max_depth: None,
            same_filesystem: true,
            num_threads: 0, // auto
        }
    }
}

/// Cancellation token for stopping scans
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared progress state for heartbeat updates
struct SharedProgress {
    files_scanned: AtomicU64,
    dirs_scanned: AtomicU64,
    bytes_scanned: AtomicU64,
    errors: AtomicU64,
    current_path: Mutex<Option<PathBuf>>,
    done: AtomicBool,
}

impl SharedProgress {
    fn new() -> Self {
        Self {
            files_scanned: AtomicU64::new(0),
            dirs_scanned: AtomicU64::new(0),
            bytes_scanned: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            current_path: Mutex::new(None),
            done: AtomicBool::new(false),
        }
    }

    fn to_scan_progress(&self) -> ScanProgress {
        ScanProgress {
            files_scanned: self.files_scanned.load(Ordering::Relaxed),
            dirs_scanned: self.dirs_scanned.load(Ordering::Relaxed),
            bytes_scanned: self.bytes_scanned.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            current_path: self.current_path.lock().ok().and_then(|g| g.clone()),
        }
    }

    fn skip(&self, path: &Path, reason: impl ToString) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let err = IndexError::EntryUnreadable {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        log::warn!("skipping: {err}");
    }
}

/// Filesystem scanner producing [`Index`] snapshots
#[derive(Debug, Clone)]
pub struct Scanner {
    config: ScanConfig,
    cancel_token: CancellationToken,
}

impl Scanner {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Walk `root` and build an index of everything below it.
    ///
    /// Unreadable entries are logged and skipped. Failing to open `root`
    /// itself is an error and produces no index.
    pub fn walk(&self, root: &Path) -> Result<Index> {
        self.walk_with(root, &SharedProgress::new())
    }

    /// Scan in a background thread.
    /// Returns a receiver for progress updates and the handle yielding the index.
    pub fn scan(self, root: PathBuf) -> (Receiver<ScanMessage>, JoinHandle<Result<Index>>) {
        let (tx, rx) = crossbeam_channel::unbounded();

        let handle = std::thread::spawn(move || self.scan_sync(root, tx));

        (rx, handle)
    }

    fn scan_sync(self, root: PathBuf, tx: Sender<ScanMessage>) -> Result<Index> {
        let shared_progress = Arc::new(SharedProgress::new());
        let progress_for_heartbeat = Arc::clone(&shared_progress);
        let tx_for_heartbeat = tx.clone();
        let cancel_for_heartbeat = self.cancel_token.clone();

        // Heartbeat thread sends progress every 100ms
        let heartbeat_handle = std::thread::spawn(move || {
            while !progress_for_heartbeat.done.load(Ordering::Relaxed)
                && !cancel_for_heartbeat.is_cancelled()
            {
                std::thread::sleep(Duration::from_millis(100));
                let progress = progress_for_heartbeat.to_scan_progress();
                let _ = tx_for_heartbeat.send(ScanMessage::Progress(progress));
            }
        });

        let _ = tx.send(ScanMessage::Started(root.clone()));

        let result = self.walk_with(&root, &shared_progress);

        shared_progress.done.store(true, Ordering::Relaxed);
        let _ = heartbeat_handle.join();

        match &result {
            Ok(_) => {
                let _ = tx.send(ScanMessage::Progress(shared_progress.to_scan_progress()));
                let _ = tx.send(ScanMessage::Completed);
            }
            Err(IndexError::Cancelled) => {
                let _ = tx.send(ScanMessage::Cancelled);
            }
            Err(err) => {
                let _ = tx.send(ScanMessage::Error(err.to_string()));
            }
        }

        result
    }

    fn walk_with(&self, root: &Path, progress: &SharedProgress) -> Result<Index> {
        let started = Instant::now();
        let root_path = open_root(root)?;

        let root_dev = fs::metadata(&root_path)
            .map(|m| get_device_id(&m))
            .map_err(|e| IndexError::root_unavailable(&root_path, e))?;

        // Configure walker with process_read_dir to stay on one filesystem
        let same_fs = self.config.same_filesystem;
        let cancel_for_filter = self.cancel_token.clone();
        let walker = WalkDir::new(&root_path)
            .skip_hidden(false)
            .follow_links(self.config.follow_symlinks)
            .sort(true) // Stable order between scans
            .process_read_dir(move |_depth, _path, _read_dir_state, children| {
                if cancel_for_filter.is_cancelled() {
                    children.clear();
                    return;
                }

                if same_fs {
                    children.retain(|entry| match entry {
                        Ok(e) => match e.metadata() {
                            Ok(meta) => get_device_id(&meta) == root_dev,
                            Err(_) => true,
                        },
                        Err(_) => true,
                    });
                }
            });

        // jwalk counts the root as depth 0, entries start at 1
        let walker = if let Some(depth) = self.config.max_depth {
            walker.max_depth(depth.saturating_add(1))
        } else {
            walker
        };

        let walker = if self.config.num_threads > 0 {
            walker.parallelism(jwalk::Parallelism::RayonNewPool(self.config.num_threads))
        } else {
            walker
        };

        let mut entries = Vec::new();

        for entry_result in walker {
            if self.cancel_token.is_cancelled() {
                return Err(IndexError::Cancelled);
            }

            let entry = match entry_result {
                Ok(e) => e,
                Err(e) => {
                    let path = e.path().unwrap_or(root_path.as_path()).to_path_buf();
                    progress.skip(&path, e);
                    continue;
                }
            };

            let path = entry.path();

            if let Some(err) = &entry.read_children_error {
                progress.skip(&path, err);
            }

            // Skip root
            if entry.depth == 0 {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    progress.skip(&path, e);
                    continue;
                }
            };

            let Some(relative) = relative_path(&path, &root_path) else {
                continue;
            };

            let is_dir = metadata.is_dir();
            let size = if is_dir { 0 } else { metadata.len() };
            let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

            entries.push(Entry::new(relative, size, get_mode(&metadata), mtime));

            if is_dir {
                progress.dirs_scanned.fetch_add(1, Ordering::Relaxed);
            } else {
                progress.files_scanned.fetch_add(1, Ordering::Relaxed);
            }
            progress.bytes_scanned.fetch_add(size, Ordering::Relaxed);

            if let Ok(mut guard) = progress.current_path.lock() {
                *guard = Some(path);
            }
        }

        // A cancellation after the last entry still discards the walk
        if self.cancel_token.is_cancelled() {
            return Err(IndexError::Cancelled);
        }

        let skipped = progress.errors.load(Ordering::Relaxed);
        let index = Index::from_entries(root_path, SystemTime::now(), entries, skipped);

        log::debug!(
            "walked {} in {:?}: {} entries, {} bytes, {} skipped",
            index.root().display(),
            started.elapsed(),
            index.count(None),
            index.disk_size(None),
            skipped
        );

        Ok(index)
    }
}

/// Resolve `root` and make sure it is a readable directory
fn open_root(root: &Path) -> Result<PathBuf> {
    let root_path = root
        .canonicalize()
        .map_err(|e| IndexError::root_unavailable(root, e))?;

    let metadata =
        fs::metadata(&root_path).map_err(|e| IndexError::root_unavailable(&root_path, e))?;
    if !metadata.is_dir() {
        return Err(IndexError::NotADirectory(root_path));
    }

    fs::read_dir(&root_path).map_err(|e| IndexError::root_unavailable(&root_path, e))?;

    Ok(root_path)
}

/// `/`-separated path of `path` relative to `root`, None for the root itself
fn relative_path(path: &Path, root: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// File type and permission bits
#[cfg(unix)]
fn get_mode(metadata: &Metadata) -> u32 {
    metadata.mode()
}

/// File type and permission bits (non-unix - synthesized from file type and readonly flag)
#[cfg(not(unix))]
fn get_mode(metadata: &Metadata) -> u32 {
    let file_type = metadata.file_type();
    let kind = if file_type.is_dir() {
        MODE_DIR
    } else if file_type.is_symlink() {
        MODE_SYMLINK
    } else {
        MODE_FILE
    };
    let perm = if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    };
    kind | perm
}

/// Get device ID for same-filesystem checks
#[cfg(unix)]
fn get_device_id(metadata: &Metadata) -> u64 {
    metadata.dev()
}

/// Get device ID (non-unix - not supported, return 0)
#[cfg(not(unix))]
fn get_device_id(_metadata: &Metadata) -> u64 {
    0
}
