pub mod cached;
pub mod error;
pub mod index;
pub mod scanner;
pub mod size;
pub mod store;

pub use cached::{CacheConfig, CacheStats, Cached, TempDirProvider};
pub use error::{IndexError, Result};
pub use index::{Entry, Index};
pub use scanner::{CancellationToken, ScanConfig, ScanMessage, ScanProgress, Scanner};
pub use size::{HumanBytes, format_count};
pub use store::{INDEX_FILE_NAME, SnapshotHeader, TEMP_INDEX_DIR_PREFIX, TempStore};
