use std::path::PathBuf;

/// Message emitted by a background scan
#[derive(Debug, Clone)]
pub enum ScanMessage {
    /// Started walking the root
    Started(PathBuf),
    /// Periodic progress update
    Progress(ScanProgress),
    /// Scan completed, the join handle holds the index
    Completed,
    /// Scan was cancelled
    Cancelled,
    /// Scan failed, the join handle holds the error
    Error(String),
}

/// Scanning progress statistics
#[derive(Debug, Clone, Default)]
pub struct ScanProgress {
    /// Number of non-directory entries recorded
    pub files_scanned: u64,
    /// Number of directories recorded
    pub dirs_scanned: u64,
    /// Total bytes recorded so far
    pub bytes_scanned: u64,
    /// Number of unreadable entries skipped
    pub errors: u64,
    /// Most recently recorded path
    pub current_path: Option<PathBuf>,
}

impl ScanProgress {
    pub fn total_entries(&self) -> u64 {
        self.files_scanned + self.dirs_scanned
    }
}
