//! Per-root index cache.
//!
//! [`Cached`] keeps the latest [`Index`] of every root it was asked about,
//! persists it through a [`TempStore`] and rescans a root only once its
//! index is older than the rescan interval. Rescans are single-flight: while
//! one caller walks a root, other callers for that root wait for its result.
//!
//! Snapshots persisted by an earlier process are adopted on the first
//! request for a root if they validate and are still fresh (see
//! [`CacheConfig::reuse_persisted`]). [`Cached::head_cached_index`] never
//! reads the disk, so it only knows roots requested through this instance.

mod flight;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use self::flight::Flight;
use crate::index::Index;
use crate::scanner::{CancellationToken, ScanConfig, Scanner};
use crate::store::{SnapshotScanConfig, TempStore};
use crate::{IndexError, Result};

/// Provides the base directory under which per-root index directories live
pub type TempDirProvider = Arc<dyn Fn() -> PathBuf + Send + Sync>;

/// Cache configuration
#[derive(Clone)]
pub struct CacheConfig {
    /// Maximum age of a cached index before it is rebuilt (zero = always rebuild)
    pub rescan: Duration,
    /// Base directory for persisted indexes
    pub temp_dir: TempDirProvider,
    /// Scanner configuration used for every root
    pub scan: ScanConfig,
    /// Adopt a valid persisted snapshot on the first request for a root
    pub reuse_persisted: bool,
    /// Cancels running and future scans
    pub cancel: CancellationToken,
}

impl CacheConfig {
    pub fn with_rescan(mut self, rescan: Duration) -> Self {
        self.rescan = rescan;
        self
    }

    /// Use a fixed base directory
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.temp_dir = Arc::new(move || dir.clone());
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            rescan: Duration::ZERO,
            temp_dir: Arc::new(std::env::temp_dir),
            scan: ScanConfig::default(),
            reuse_persisted: true,
            cancel: CancellationToken::new(),
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("rescan", &self.rescan)
            .field("temp_dir", &(self.temp_dir)())
            .field("scan", &self.scan)
            .field("reuse_persisted", &self.reuse_persisted)
            .finish()
    }
}

/// Counters of work done by a cache instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Filesystem walks performed
    pub scans: u64,
    /// Snapshots written to the temp store
    pub writes: u64,
    /// Persisted snapshots adopted instead of scanning
    pub adopted: u64,
    /// Roots with an index in memory
    pub roots: usize,
}

/// Cache entry of one root. Slots are never removed from the registry, so
/// every request for a root shares the same flight.
struct RootSlot {
    root: PathBuf,
    store: TempStore,
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    /// Latest successfully built index; its scan time is the last scan time
    ready: Option<Arc<Index>>,
    /// Where `ready` is persisted
    location: Option<PathBuf>,
    /// Rebuild in progress
    flight: Option<Arc<Flight>>,
    /// Whether the persisted snapshot has been considered already
    probed: bool,
}

/// Directory index cache keyed by root path
pub struct Cached {
    config: CacheConfig,
    rescan: RwLock<Duration>,
    scanner: Scanner,
    roots: Mutex<HashMap<PathBuf, Arc<RootSlot>>>,
    scans: AtomicU64,
    writes: AtomicU64,
    adopted: AtomicU64,
}

impl Cached {
    pub fn new(config: CacheConfig) -> Self {
        let scanner = Scanner::new(config.scan.clone()).with_cancellation(config.cancel.clone());
        Self {
            rescan: RwLock::new(config.rescan),
            config,
            scanner,
            roots: Mutex::new(HashMap::new()),
            scans: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            adopted: AtomicU64::new(0),
        }
    }

    pub fn rescan_interval(&self) -> Duration {
        *self.rescan.read()
    }

    /// Change the rescan interval; applies from the next request on
    pub fn set_rescan(&self, rescan: Duration) {
        *self.rescan.write() = rescan;
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the index of `root`, rebuilding it first if it is missing or stale.
    ///
    /// A fresh index is returned without touching the filesystem. If another
    /// caller is already rebuilding `root`, this waits for and returns that
    /// rebuild's outcome. A failed rebuild leaves the previous index in place.
    pub fn get_cached_index(&self, root: impl AsRef<Path>) -> Result<Arc<Index>> {
        let root = root.as_ref();
        let key = std::path::absolute(root).map_err(|e| IndexError::root_unavailable(root, e))?;
        let slot = self.slot(&key);
        let rescan = self.rescan_interval();

        let (flight, probe) = {
            let mut state = slot.state.lock();

            if let Some(index) = &state.ready
                && !is_stale(index, rescan)
            {
                log::trace!("cache hit for {}", key.display());
                return Ok(Arc::clone(index));
            }

            if let Some(flight) = &state.flight {
                let flight = Arc::clone(flight);
                drop(state);
                log::debug!("waiting for in-flight rebuild of {}", key.display());
                return flight.wait();
            }

            let flight = Flight::new();
            state.flight = Some(Arc::clone(&flight));
            let probe = self.config.reuse_persisted && !std::mem::replace(&mut state.probed, true);
            (flight, probe)
        };

        let leader = Leader {
            slot: &slot,
            flight,
            finished: false,
        };
        let outcome = self.rebuild(&slot, rescan, probe);
        leader.finish(outcome)
    }

    /// Entry count and total size of the latest index of `root`.
    ///
    /// Never rescans, even if the index is stale. Fails with
    /// [`IndexError::NoCachedIndex`] if `root` has not been indexed yet.
    pub fn head_cached_index(&self, root: impl AsRef<Path>) -> Result<(usize, u64)> {
        let root = root.as_ref();
        let Ok(key) = std::path::absolute(root) else {
            return Err(IndexError::NoCachedIndex(root.to_path_buf()));
        };

        let slot = self.roots.lock().get(&key).cloned();
        slot.and_then(|slot| {
            slot.state
                .lock()
                .ready
                .as_ref()
                .map(|index| (index.count(None), index.disk_size(None)))
        })
        .ok_or(IndexError::NoCachedIndex(key))
    }

    /// Location of the persisted index of `root`, if it has one
    pub fn index_location(&self, root: impl AsRef<Path>) -> Option<PathBuf> {
        let key = std::path::absolute(root.as_ref()).ok()?;
        let slot = self.roots.lock().get(&key).cloned()?;
        let location = slot.state.lock().location.clone();
        location
    }

    /// Forget the index of `root` and remove its temp directory.
    ///
    /// Waits for a rebuild of `root` that is already running, so that it
    /// cannot persist into the directory after it was removed.
    pub fn clean(&self, root: impl AsRef<Path>) -> Result<bool> {
        let key = std::path::absolute(root.as_ref())?;
        let slot = self.roots.lock().get(&key).cloned();
        match slot {
            Some(slot) => clean_slot(&slot),
            None => Ok(false),
        }
    }

    /// Forget every index and remove the temp directories.
    /// Returns how many directories were removed.
    pub fn clean_all(&self) -> Result<usize> {
        let slots: Vec<_> = self.roots.lock().values().cloned().collect();
        let mut removed = 0;
        for slot in slots {
            if clean_slot(&slot)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            scans: self.scans.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            adopted: self.adopted.load(Ordering::Relaxed),
            roots: self
                .roots
                .lock()
                .values()
                .filter(|slot| slot.state.lock().ready.is_some())
                .count(),
        }
    }

    fn slot(&self, key: &Path) -> Arc<RootSlot> {
        let mut roots = self.roots.lock();
        let slot = roots.entry(key.to_path_buf()).or_insert_with(|| {
            Arc::new(RootSlot {
                root: key.to_path_buf(),
                store: TempStore::new((self.config.temp_dir)()),
                state: Mutex::new(SlotState::default()),
            })
        });
        Arc::clone(slot)
    }

    fn snapshot_config(&self) -> SnapshotScanConfig {
        SnapshotScanConfig::from(self.scanner.config())
    }

    /// Produce a new index for the slot's root. Runs without the slot lock held.
    fn rebuild(&self, slot: &RootSlot, rescan: Duration, probe: bool) -> Result<Built> {
        if probe && let Some(built) = self.adopt_persisted(slot, rescan) {
            return Ok(built);
        }

        self.scans.fetch_add(1, Ordering::Relaxed);
        let index = self.scanner.walk(&slot.root)?;

        let location = slot
            .store
            .persist(&slot.root, &index, self.snapshot_config())?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        log::info!(
            "indexed {}: {} entries, {} bytes",
            slot.root.display(),
            index.count(None),
            index.disk_size(None)
        );

        Ok(Built {
            index: Arc::new(index),
            location,
        })
    }

    /// Load a snapshot left behind by an earlier cache, if it is valid and fresh
    fn adopt_persisted(&self, slot: &RootSlot, rescan: Duration) -> Option<Built> {
        let (header, index) = match slot.store.load(&slot.root) {
            Ok(Some(loaded)) => loaded,
            Ok(None) => return None,
            Err(e) => {
                log::warn!(
                    "ignoring persisted index of {}: {}",
                    slot.root.display(),
                    e
                );
                return None;
            }
        };

        if header.config != self.snapshot_config() {
            log::debug!(
                "persisted index of {} was built with a different scan configuration",
                slot.root.display()
            );
            return None;
        }

        if is_stale(&index, rescan) {
            log::debug!("persisted index of {} is stale", slot.root.display());
            return None;
        }

        self.adopted.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "reusing persisted index of {}: {} entries",
            slot.root.display(),
            header.entry_count
        );

        Some(Built {
            index: Arc::new(index),
            location: slot.store.index_path(&slot.root),
        })
    }
}

impl Default for Cached {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl fmt::Debug for Cached {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cached")
            .field("config", &self.config)
            .field("rescan", &self.rescan_interval())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Outcome of a successful rebuild
struct Built {
    index: Arc<Index>,
    location: PathBuf,
}

/// The caller running a rebuild. Publishes the outcome to the slot and to
/// waiting callers; if dropped unfinished (the rebuild panicked), waiters
/// are released with an error.
struct Leader<'a> {
    slot: &'a RootSlot,
    flight: Arc<Flight>,
    finished: bool,
}

impl Leader<'_> {
    fn finish(mut self, outcome: Result<Built>) -> Result<Arc<Index>> {
        let outcome = {
            let mut state = self.slot.state.lock();
            state.flight = None;
            match outcome {
                Ok(built) => {
                    state.ready = Some(Arc::clone(&built.index));
                    state.location = Some(built.location);
                    Ok(built.index)
                }
                Err(e) => {
                    log::warn!("rebuild of {} failed: {}", self.slot.root.display(), e);
                    Err(e)
                }
            }
        };

        self.flight.complete(outcome.clone());
        self.finished = true;
        outcome
    }
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.slot.state.lock().flight = None;
            self.flight.complete(Err(IndexError::Aborted(self.slot.root.clone())));
        }
    }
}

/// Drop the slot's index and remove its directory once no rebuild is running.
/// The slot lock is held while removing, so no new rebuild can start meanwhile.
fn clean_slot(slot: &RootSlot) -> Result<bool> {
    loop {
        let mut state = slot.state.lock();
        if let Some(flight) = state.flight.clone() {
            drop(state);
            log::debug!("waiting for rebuild of {} before cleaning", slot.root.display());
            // Its outcome is discarded either way
            let _ = flight.wait();
            continue;
        }

        state.ready = None;
        state.location = None;
        state.probed = true;
        return slot.store.remove(&slot.root);
    }
}

/// Whether `index` is at least `rescan` old. An index from the future
/// (clock moved backwards) counts as stale.
fn is_stale(index: &Index, rescan: Duration) -> bool {
    index
        .scanned_at()
        .elapsed()
        .map_or(true, |age| age >= rescan)
}
