use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Errors produced while scanning, persisting or serving directory indexes.
///
/// Cloneable so that every caller waiting on a shared rescan receives the
/// same failure as the caller that performed it.
#[derive(Error, Debug, Clone)]
pub enum IndexError {
    #[error("Root is unavailable: {path}: {source}")]
    RootUnavailable {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Root is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Entry is unreadable: {path}: {reason}")]
    EntryUnreadable { path: PathBuf, reason: String },

    #[error("Failed to persist index to {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },

    #[error("Corrupt index snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("No cached index for {0}")]
    NoCachedIndex(PathBuf),

    #[error("Index rebuild of {0} was aborted")]
    Aborted(PathBuf),

    #[error("Scan was cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl IndexError {
    pub(crate) fn root_unavailable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IndexError::RootUnavailable {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        IndexError::Persistence {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<std::io::Error> for IndexError {
    fn from(err: std::io::Error) -> Self {
        IndexError::Io(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
