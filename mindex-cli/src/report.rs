use std::path::Path;
use std::time::Duration;

use mindex_core::{HumanBytes, Index, ScanProgress, SnapshotHeader, format_count};

pub fn print_summary(index: &Index, count: usize, disk_size: u64, location: Option<&Path>) {
    println!("{}", index.root().display());
    println!(
        "  {} entries, {}",
        format_count(count as u64),
        HumanBytes(disk_size)
    );
    if index.skipped() > 0 {
        println!("  {} unreadable entries skipped", format_count(index.skipped()));
    }
    if let Some(location) = location {
        println!("  persisted at {}", location.display());
    }
}

/// Cumulative totals per depth level
pub fn print_levels(index: &Index, limit: Option<usize>) {
    let Some(max) = index.max_depth() else {
        return;
    };
    let max = limit.map_or(max, |limit| limit.min(max));

    println!("  {:>5}  {:>12}  {:>10}", "depth", "entries", "size");
    for depth in 0..=max {
        println!(
            "  {:>5}  {:>12}  {:>10}",
            depth,
            format_count(index.count(Some(depth)) as u64),
            HumanBytes(index.disk_size(Some(depth))).to_string()
        );
    }
}

pub fn print_change(elapsed: Duration, previous: Option<(usize, u64)>, current: (usize, u64)) {
    let (count, disk_size) = current;
    match previous {
        None => println!(
            "[{:>8.1}s] {} entries, {}",
            elapsed.as_secs_f64(),
            format_count(count as u64),
            HumanBytes(disk_size)
        ),
        Some((prev_count, prev_size)) => println!(
            "[{:>8.1}s] {} entries ({:+}), {} ({:+} B)",
            elapsed.as_secs_f64(),
            format_count(count as u64),
            count as i64 - prev_count as i64,
            HumanBytes(disk_size),
            disk_size as i128 - prev_size as i128
        ),
    }
}

pub fn print_progress(elapsed: Duration, progress: &ScanProgress) {
    eprintln!(
        "[{:>8.1}s] entries={:<10} files={:<10} dirs={:<8} bytes={:<12} errors={}",
        elapsed.as_secs_f64(),
        format_count(progress.total_entries()),
        format_count(progress.files_scanned),
        format_count(progress.dirs_scanned),
        HumanBytes(progress.bytes_scanned).to_string(),
        progress.errors
    );
}

pub fn print_header(header: &SnapshotHeader) {
    let age = header
        .scan_time
        .elapsed()
        .map(|age| format!("{}s ago", age.as_secs()))
        .unwrap_or_else(|_| "in the future".to_string());

    println!(
        "{}  {} entries, {}, scanned {}",
        header.root.display(),
        format_count(header.entry_count as u64),
        HumanBytes(header.disk_size),
        age
    );
}
