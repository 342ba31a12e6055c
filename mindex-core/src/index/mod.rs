mod entry;

pub use entry::{Entry, MODE_DIR, MODE_FILE, MODE_SYMLINK, MODE_TYPE_MASK};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Per-depth totals, derived from the entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Level {
    count: usize,
    size: u64,
}

/// Immutable snapshot of a directory tree.
///
/// Entries keep the order the scanner produced them in and are unique by
/// path. The root itself is not an entry. There is no public way to modify
/// an index; a rescan yields a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    root: PathBuf,
    scanned_at: SystemTime,
    entries: Vec<Entry>,
    /// Nodes that could not be read during the scan and were left out
    skipped: u64,
    #[serde(skip)]
    lookup: HashMap<String, usize>,
    #[serde(skip)]
    levels: Vec<Level>,
}

impl Index {
    /// Build an index from scanned entries. Later duplicates of a path are dropped.
    pub(crate) fn from_entries(
        root: PathBuf,
        scanned_at: SystemTime,
        entries: Vec<Entry>,
        skipped: u64,
    ) -> Self {
        let mut index = Self {
            root,
            scanned_at,
            entries,
            skipped,
            lookup: HashMap::new(),
            levels: Vec::new(),
        };

        let before = index.entries.len();
        let mut seen = std::collections::HashSet::with_capacity(before);
        index.entries.retain(|e| seen.insert(e.path.clone()));
        if index.entries.len() != before {
            log::debug!(
                "dropped {} duplicate entries under {}",
                before - index.entries.len(),
                index.root.display()
            );
        }

        index.rebuild_derived();
        index
    }

    /// Recompute the path lookup and per-depth totals (not serialized)
    pub(crate) fn rebuild_derived(&mut self) {
        self.lookup = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.path.clone(), i))
            .collect();

        let mut levels: Vec<Level> = Vec::new();
        for entry in &self.entries {
            let depth = entry.depth as usize;
            if levels.len() <= depth {
                levels.resize(depth + 1, Level::default());
            }
            levels[depth].count += 1;
            levels[depth].size = levels[depth].size.saturating_add(entry.size);
        }
        self.levels = levels;
    }

    /// Number of entries at `depth` or shallower; `None` counts every entry.
    pub fn count(&self, max_depth: Option<usize>) -> usize {
        match max_depth {
            None => self.entries.len(),
            Some(depth) => self
                .levels
                .iter()
                .take(depth.saturating_add(1))
                .fold(0usize, |acc, l| acc.saturating_add(l.count)),
        }
    }

    /// Total size in bytes of entries at `depth` or shallower; `None` sums every entry.
    pub fn disk_size(&self, max_depth: Option<usize>) -> u64 {
        self.levels
            .iter()
            .take(max_depth.map_or(usize::MAX, |d| d.saturating_add(1)))
            .fold(0u64, |acc, l| acc.saturating_add(l.size))
    }

    /// Deepest entry depth, `None` for an empty index
    pub fn max_depth(&self) -> Option<usize> {
        self.levels.len().checked_sub(1)
    }

    /// Look up an entry by its root-relative path
    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.lookup.get(path).map(|&i| &self.entries[i])
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// When the scan that produced this index completed
    pub fn scanned_at(&self) -> SystemTime {
        self.scanned_at
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in scan order
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }
}
