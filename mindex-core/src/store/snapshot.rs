use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::index::Index;
use crate::scanner::ScanConfig;
use crate::{IndexError, Result};

/// Current snapshot format version - increment when format changes
pub const SNAPSHOT_VERSION: u32 = 1;

/// Magic bytes identifying a persisted index
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"MIDX";

// magic(4) + version(4) + header_len(4) + index_len(4) + checksum(4)
const MIN_SNAPSHOT_LEN: usize = 20;

/// Header stored in front of a persisted index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Snapshot format version
    pub version: u32,
    /// Root path the index was requested for
    pub root: PathBuf,
    /// When the scan completed
    pub scan_time: SystemTime,
    /// Number of entries in the index
    pub entry_count: usize,
    /// Total size of the indexed entries
    pub disk_size: u64,
    /// Scan configuration used
    pub config: SnapshotScanConfig,
}

impl SnapshotHeader {
    pub fn new(root: &Path, index: &Index, config: SnapshotScanConfig) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            root: root.to_path_buf(),
            scan_time: index.scanned_at(),
            entry_count: index.count(None),
            disk_size: index.disk_size(None),
            config,
        }
    }
}

/// Scan configuration that affects whether a snapshot can be reused
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotScanConfig {
    /// Whether symlinks were followed during scan
    pub follow_symlinks: bool,
    /// Whether scan stayed on same filesystem
    pub same_filesystem: bool,
    /// Maximum depth that was scanned
    pub max_depth: Option<usize>,
}

impl From<&ScanConfig> for SnapshotScanConfig {
    fn from(config: &ScanConfig) -> Self {
        Self {
            follow_symlinks: config.follow_symlinks,
            same_filesystem: config.same_filesystem,
            max_depth: config.max_depth,
        }
    }
}

/// Encode an index with its header.
///
/// Layout:
/// [4B] Magic "MIDX"
/// [4B] Version (u32 LE)
/// [4B] Header length (u32 LE)
/// [NB] Header (postcard)
/// [4B] Index length (u32 LE)
/// [MB] Index (postcard)
/// [4B] CRC32 checksum of all preceding bytes
pub fn encode_snapshot(header: &SnapshotHeader, index: &Index) -> Result<Vec<u8>> {
    let mut data = Vec::new();

    data.extend_from_slice(&SNAPSHOT_MAGIC);
    data.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());

    let header_bytes = postcard::to_allocvec(header).map_err(|e| {
        IndexError::CorruptSnapshot(format!("Failed to serialize header: {}", e))
    })?;
    data.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    data.extend_from_slice(&header_bytes);

    let index_bytes = postcard::to_allocvec(index)
        .map_err(|e| IndexError::CorruptSnapshot(format!("Failed to serialize index: {}", e)))?;
    data.extend_from_slice(&(index_bytes.len() as u32).to_le_bytes());
    data.extend_from_slice(&index_bytes);

    let checksum = crc32fast::hash(&data);
    data.extend_from_slice(&checksum.to_le_bytes());

    Ok(data)
}

/// Decode only the header of a snapshot (checksum is still verified)
pub fn decode_header(data: &[u8]) -> Result<SnapshotHeader> {
    let mut reader = SnapshotReader::new(data)?;
    reader.header()
}

/// Decode a snapshot into its header and index
pub fn decode_snapshot(data: &[u8]) -> Result<(SnapshotHeader, Index)> {
    let mut reader = SnapshotReader::new(data)?;
    let header = reader.header()?;

    let index_bytes = reader.section("index")?;
    let mut index: Index = postcard::from_bytes(index_bytes).map_err(|e| {
        IndexError::CorruptSnapshot(format!("Failed to deserialize index: {}", e))
    })?;

    // Lookup table and depth totals are not serialized
    index.rebuild_derived();

    if index.count(None) != header.entry_count || index.disk_size(None) != header.disk_size {
        return Err(IndexError::CorruptSnapshot(
            "Header does not match index".to_string(),
        ));
    }

    Ok((header, index))
}

/// Cursor over a checksum-verified snapshot body
struct SnapshotReader<'a> {
    body: &'a [u8],
    offset: usize,
}

impl<'a> SnapshotReader<'a> {
    fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < MIN_SNAPSHOT_LEN {
            return Err(IndexError::CorruptSnapshot(
                "Snapshot file too small".to_string(),
            ));
        }

        let checksum_offset = data.len() - 4;
        let (body, stored) = data.split_at(checksum_offset);
        if read_u32(stored, 0)? != crc32fast::hash(body) {
            return Err(IndexError::CorruptSnapshot(
                "Snapshot checksum mismatch".to_string(),
            ));
        }

        if body[..4] != SNAPSHOT_MAGIC {
            return Err(IndexError::CorruptSnapshot(
                "Invalid snapshot magic".to_string(),
            ));
        }

        let version = read_u32(body, 4)?;
        if version != SNAPSHOT_VERSION {
            return Err(IndexError::CorruptSnapshot(format!(
                "Snapshot version mismatch: expected {}, got {}",
                SNAPSHOT_VERSION, version
            )));
        }

        Ok(Self { body, offset: 8 })
    }

    fn header(&mut self) -> Result<SnapshotHeader> {
        let bytes = self.section("header")?;
        postcard::from_bytes(bytes).map_err(|e| {
            IndexError::CorruptSnapshot(format!("Failed to deserialize header: {}", e))
        })
    }

    /// Next length-prefixed section
    fn section(&mut self, what: &str) -> Result<&'a [u8]> {
        let len = read_u32(self.body, self.offset)? as usize;
        self.offset += 4;

        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.body.len())
            .ok_or_else(|| IndexError::CorruptSnapshot(format!("Invalid {} length", what)))?;

        let bytes = &self.body[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| IndexError::CorruptSnapshot("Truncated snapshot".to_string()))
}
