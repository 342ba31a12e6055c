use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// File type mask of a unix mode.
pub const MODE_TYPE_MASK: u32 = 0o170000;
/// Directory file type bits.
pub const MODE_DIR: u32 = 0o040000;
/// Regular file type bits.
pub const MODE_FILE: u32 = 0o100000;
/// Symbolic link file type bits.
pub const MODE_SYMLINK: u32 = 0o120000;

/// Metadata of one filesystem node, relative to the root it was scanned from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Path relative to the root, `/`-separated
    pub path: String,
    /// Size in bytes (zero for directories)
    pub size: u64,
    /// File type and permission bits, unix layout
    pub mode: u32,
    /// Last modification time
    pub mtime: SystemTime,
    /// Number of path separators in `path` (0 for direct children of the root),
    /// capped at `u16::MAX`
    pub depth: u16,
}

impl Entry {
    pub fn new(path: String, size: u64, mode: u32, mtime: SystemTime) -> Self {
        let depth = u16::try_from(path.matches('/').count()).unwrap_or(u16::MAX);
        Self {
            path,
            size,
            mode,
            mtime,
            depth,
        }
    }

    /// Final path component
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & MODE_TYPE_MASK == MODE_DIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & MODE_TYPE_MASK == MODE_SYMLINK
    }

    pub fn is_file(&self) -> bool {
        self.mode & MODE_TYPE_MASK == MODE_FILE
    }

    /// Permission bits without the file type
    pub fn permissions(&self) -> u32 {
        self.mode & !MODE_TYPE_MASK
    }
}
