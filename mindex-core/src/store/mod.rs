//! On-disk home of persisted indexes.
//!
//! Every root gets its own directory under the base temp directory, named
//! `<TEMP_INDEX_DIR_PREFIX><hash of root>`, holding a single
//! [`INDEX_FILE_NAME`]. The name only depends on the root path, so repeated
//! requests for a root reuse the same directory and file.

mod snapshot;

pub use snapshot::{
    SNAPSHOT_MAGIC, SNAPSHOT_VERSION, SnapshotHeader, SnapshotScanConfig, decode_header,
    decode_snapshot, encode_snapshot,
};

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::index::Index;
use crate::{IndexError, Result};

/// Name prefix shared by every per-root index directory
pub const TEMP_INDEX_DIR_PREFIX: &str = "mindex-index.";

/// Name of the index file inside a per-root directory
pub const INDEX_FILE_NAME: &str = "index.midx";

/// Per-root index directories under one base directory
#[derive(Debug, Clone)]
pub struct TempStore {
    base: PathBuf,
}

impl TempStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory holding the index of `root`
    pub fn dir_for(&self, root: &Path) -> PathBuf {
        self.base
            .join(format!("{}{:016x}", TEMP_INDEX_DIR_PREFIX, hash_path(root)))
    }

    /// Path of the persisted index of `root`
    pub fn index_path(&self, root: &Path) -> PathBuf {
        self.dir_for(root).join(INDEX_FILE_NAME)
    }

    /// Write `index` to the directory of `root`, replacing any previous snapshot.
    ///
    /// The snapshot is written to a temporary file next to the target and
    /// renamed over it, so readers see either the old or the new file.
    pub fn persist(
        &self,
        root: &Path,
        index: &Index,
        config: SnapshotScanConfig,
    ) -> Result<PathBuf> {
        let dir = self.dir_for(root);
        let path = dir.join(INDEX_FILE_NAME);

        let header = SnapshotHeader::new(root, index, config);
        let data = encode_snapshot(&header, index)
            .map_err(|e| IndexError::persistence(&path, e))?;

        fs::create_dir_all(&dir).map_err(|e| IndexError::persistence(&dir, e))?;

        let mut file = NamedTempFile::new_in(&dir).map_err(|e| IndexError::persistence(&dir, e))?;
        file.write_all(&data)
            .and_then(|()| file.as_file().sync_all())
            .map_err(|e| IndexError::persistence(file.path(), e))?;

        file.persist(&path)
            .map_err(|e| IndexError::persistence(&path, e.error))?;

        log::debug!(
            "persisted index of {} to {} ({} entries, {} bytes)",
            root.display(),
            path.display(),
            header.entry_count,
            data.len()
        );

        Ok(path)
    }

    /// Load the persisted index of `root`, None if nothing was persisted yet
    pub fn load(&self, root: &Path) -> Result<Option<(SnapshotHeader, Index)>> {
        let path = self.index_path(root);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (header, index) = decode_snapshot(&data)?;
        if header.root != root {
            return Err(IndexError::CorruptSnapshot(format!(
                "Snapshot at {} belongs to {}",
                path.display(),
                header.root.display()
            )));
        }

        Ok(Some((header, index)))
    }

    /// Read the header of the index file in a per-root directory
    pub fn read_header(dir: &Path) -> Result<SnapshotHeader> {
        let data = fs::read(dir.join(INDEX_FILE_NAME))?;
        decode_header(&data)
    }

    /// Remove the directory of `root`. Returns false if there was none.
    pub fn remove(&self, root: &Path) -> Result<bool> {
        remove_dir(&self.dir_for(root))
    }

    /// Remove every per-root directory under the base. Returns how many were removed.
    pub fn remove_all(&self) -> Result<usize> {
        let mut removed = 0;
        for dir in self.discover()? {
            if remove_dir(&dir)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// All per-root directories under the base, sorted by name
    pub fn discover(&self) -> Result<Vec<PathBuf>> {
        let read_dir = match fs::read_dir(&self.base) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut dirs = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let is_index_dir = entry.file_type()?.is_dir()
                && entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(TEMP_INDEX_DIR_PREFIX);
            if is_index_dir {
                dirs.push(entry.path());
            }
        }

        dirs.sort();
        Ok(dirs)
    }
}

fn remove_dir(dir: &Path) -> Result<bool> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {
            log::debug!("removed index directory {}", dir.display());
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Hash a path to a u64 for the directory name
fn hash_path(path: &Path) -> u64 {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}
