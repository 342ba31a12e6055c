use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use super::*;
use crate::store::{INDEX_FILE_NAME, TEMP_INDEX_DIR_PREFIX};

fn write_file(root: &Path, rel: &str, len: usize) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, vec![b'a'; len]).unwrap();
}

/// A small tree with a few levels of nesting
fn generate_tree() -> TempDir {
    let root = TempDir::new().unwrap();
    write_file(root.path(), "a.txt", 128);
    write_file(root.path(), "b.bin", 4096);
    write_file(root.path(), ".hidden", 3);
    write_file(root.path(), "d/c.txt", 256);
    write_file(root.path(), "d/e/f.txt", 512);
    write_file(root.path(), "d/e/g/h.txt", 1);
    fs::create_dir_all(root.path().join("empty/dir")).unwrap();
    root
}

fn cache_in(temp: &TempDir, rescan: Duration) -> Cached {
    Cached::new(
        CacheConfig::default()
            .with_rescan(rescan)
            .with_temp_dir(temp.path()),
    )
}

/// Per-root directories under `base` and the files directly inside them
fn temp_dir_info(base: &Path) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut dirnames = Vec::new();
    let mut idxs = Vec::new();

    for entry in fs::read_dir(base).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy().to_string();
        if !entry.file_type().unwrap().is_dir() || !name.starts_with(TEMP_INDEX_DIR_PREFIX) {
            continue;
        }
        for file in fs::read_dir(entry.path()).unwrap() {
            idxs.push(file.unwrap().path());
        }
        dirnames.push(entry.path());
    }

    (dirnames, idxs)
}

/// Mark a rebuild of the slot's root as running without walking yet
fn begin_rebuild(slot: &RootSlot) -> Leader<'_> {
    let flight = Flight::new();
    slot.state.lock().flight = Some(Arc::clone(&flight));
    Leader {
        slot,
        flight,
        finished: false,
    }
}

#[test]
fn test_cached_index_create() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();
    let cache = cache_in(&temp, Duration::ZERO);

    let index = cache.get_cached_index(root.path()).unwrap();

    let (count, disk_size) = cache.head_cached_index(root.path()).unwrap();
    assert_eq!(count, index.count(None));
    assert_eq!(disk_size, index.disk_size(None));
    assert_eq!(disk_size, 128 + 4096 + 3 + 256 + 512 + 1);

    let (dirnames, idxs) = temp_dir_info(temp.path());
    assert_eq!(dirnames.len(), 1);
    assert_eq!(idxs.len(), 1);
    assert!(idxs[0].ends_with(INDEX_FILE_NAME));
    assert_eq!(cache.index_location(root.path()), Some(idxs[0].clone()));
}

#[test]
fn test_cached_index_updated() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();
    let cache = cache_in(&temp, Duration::from_secs(30));

    let index = cache.get_cached_index(root.path()).unwrap();

    write_file(root.path(), "new_file.txt", 1024);

    // Not rescanned while the index is younger than the interval
    let index2 = cache.get_cached_index(root.path()).unwrap();
    assert_eq!(index.count(None), index2.count(None));
    assert_eq!(index.disk_size(None), index2.disk_size(None));
    assert_eq!(cache.stats().scans, 1);

    cache.set_rescan(Duration::ZERO);

    let index2 = cache.get_cached_index(root.path()).unwrap();
    assert_eq!(index.count(None) + 1, index2.count(None));
    assert_eq!(index.disk_size(None) + 1024, index2.disk_size(None));
    assert_eq!(index2.get("new_file.txt").unwrap().size, 1024);
    assert_eq!(cache.stats().scans, 2);

    // The previous snapshot is untouched
    assert!(index.get("new_file.txt").is_none());

    let (dirnames, idxs) = temp_dir_info(temp.path());
    assert_eq!(dirnames.len(), 1);
    assert_eq!(idxs.len(), 1);
}

#[test]
fn test_many_calls_single_artifact() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();
    let cache = cache_in(&temp, Duration::ZERO);

    for i in 0..5 {
        write_file(root.path(), &format!("extra/{i}.txt"), i);
        cache.get_cached_index(root.path()).unwrap();
    }

    let (dirnames, idxs) = temp_dir_info(temp.path());
    assert_eq!(dirnames.len(), 1);
    assert_eq!(idxs.len(), 1);
    assert_eq!(cache.stats().writes, 5);
}

#[test]
fn test_head_matches_latest_get() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();
    let cache = cache_in(&temp, Duration::ZERO);

    for len in [10, 20, 30] {
        write_file(root.path(), &format!("grow/{len}"), len);
        let index = cache.get_cached_index(root.path()).unwrap();
        assert_eq!(
            cache.head_cached_index(root.path()).unwrap(),
            (index.count(None), index.disk_size(None))
        );
    }
}

#[test]
fn test_head_never_rescans() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();
    let cache = cache_in(&temp, Duration::ZERO);

    let index = cache.get_cached_index(root.path()).unwrap();
    write_file(root.path(), "late.txt", 1024);

    let (count, disk_size) = cache.head_cached_index(root.path()).unwrap();
    assert_eq!(count, index.count(None));
    assert_eq!(disk_size, index.disk_size(None));
    assert_eq!(cache.stats().scans, 1);
}

#[test]
fn test_head_unknown_root() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();
    let cache = cache_in(&temp, Duration::ZERO);

    assert!(matches!(
        cache.head_cached_index(root.path()),
        Err(IndexError::NoCachedIndex(_))
    ));
    assert_eq!(cache.stats().scans, 0);
}

#[test]
fn test_depth_monotonic() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();
    let cache = cache_in(&temp, Duration::ZERO);

    let index = cache.get_cached_index(root.path()).unwrap();
    let max = index.max_depth().unwrap();
    assert_eq!(max, 3); // d/e/g/h.txt

    for d in 0..max {
        assert!(index.count(Some(d)) <= index.count(Some(d + 1)));
        assert!(index.disk_size(Some(d)) <= index.disk_size(Some(d + 1)));
    }
    assert_eq!(index.count(None), index.count(Some(max)));
    assert_eq!(index.disk_size(None), index.disk_size(Some(max)));
}

#[test]
fn test_missing_root() {
    let temp = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let missing = root.path().join("gone");
    let cache = cache_in(&temp, Duration::ZERO);

    assert!(matches!(
        cache.get_cached_index(&missing),
        Err(IndexError::RootUnavailable { .. })
    ));
    assert!(matches!(
        cache.head_cached_index(&missing),
        Err(IndexError::NoCachedIndex(_))
    ));

    let (dirnames, _) = temp_dir_info(temp.path());
    assert!(dirnames.is_empty());
}

#[test]
fn test_failed_rescan_keeps_previous() {
    let temp = TempDir::new().unwrap();
    let parent = TempDir::new().unwrap();
    let root = parent.path().join("tree");
    write_file(&root, "one.txt", 100);
    write_file(&root, "sub/two.txt", 200);

    let cache = cache_in(&temp, Duration::ZERO);
    let index = cache.get_cached_index(&root).unwrap();

    fs::rename(&root, parent.path().join("moved")).unwrap();

    assert!(matches!(
        cache.get_cached_index(&root),
        Err(IndexError::RootUnavailable { .. })
    ));
    assert_eq!(
        cache.head_cached_index(&root).unwrap(),
        (index.count(None), index.disk_size(None))
    );

    // The persisted snapshot is still the old one
    let store = TempStore::new(temp.path());
    let (header, _) = store.load(&root).unwrap().unwrap();
    assert_eq!(header.entry_count, index.count(None));

    // The next call tries again
    fs::rename(parent.path().join("moved"), &root).unwrap();
    write_file(&root, "three.txt", 300);
    let index = cache.get_cached_index(&root).unwrap();
    assert_eq!(index.disk_size(None), 600);
}

#[test]
fn test_persistence_failure() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();

    // A regular file where the base directory should be
    let blocker = temp.path().join("blocker");
    fs::write(&blocker, b"").unwrap();
    let cache = Cached::new(CacheConfig::default().with_temp_dir(&blocker));

    assert!(matches!(
        cache.get_cached_index(root.path()),
        Err(IndexError::Persistence { .. })
    ));
    assert!(matches!(
        cache.head_cached_index(root.path()),
        Err(IndexError::NoCachedIndex(_))
    ));
    assert_eq!(cache.stats().writes, 0);
}

#[test]
fn test_concurrent_first_request_single_flight() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();
    let cache = Arc::new(cache_in(&temp, Duration::from_secs(30)));
    let barrier = Arc::new(Barrier::new(16));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            let root = root.path().to_path_buf();
            thread::spawn(move || {
                barrier.wait();
                let index = cache.get_cached_index(&root).unwrap();
                (index.count(None), index.disk_size(None))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(results.windows(2).all(|w| w[0] == w[1]));
    let stats = cache.stats();
    assert_eq!(stats.scans, 1);
    assert_eq!(stats.writes, 1);
}

#[test]
fn test_concurrent_stale_request_single_flight() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();
    let cache = Arc::new(cache_in(&temp, Duration::from_secs(1)));

    let first = cache.get_cached_index(root.path()).unwrap();
    thread::sleep(Duration::from_millis(1100));
    write_file(root.path(), "new_file.txt", 1024);

    let barrier = Arc::new(Barrier::new(16));
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            let root = root.path().to_path_buf();
            thread::spawn(move || {
                barrier.wait();
                let index = cache.get_cached_index(&root).unwrap();
                (index.count(None), index.disk_size(None))
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(
            handle.join().unwrap(),
            (first.count(None) + 1, first.disk_size(None) + 1024)
        );
    }
    let stats = cache.stats();
    assert_eq!(stats.scans, 2);
    assert_eq!(stats.writes, 2);
}

#[test]
fn test_unrelated_roots() {
    let temp = TempDir::new().unwrap();
    let root1 = generate_tree();
    let root2 = generate_tree();
    write_file(root2.path(), "only-here.txt", 10);
    let cache = Arc::new(cache_in(&temp, Duration::from_secs(30)));

    let handles: Vec<_> = [root1.path().to_path_buf(), root2.path().to_path_buf()]
        .into_iter()
        .map(|root| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get_cached_index(&root).unwrap().count(None))
        })
        .collect();
    let counts: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(counts[0] + 1, counts[1]);
    assert_eq!(cache.stats().scans, 2);
    assert_eq!(cache.stats().roots, 2);

    let (dirnames, idxs) = temp_dir_info(temp.path());
    assert_eq!(dirnames.len(), 2);
    assert_eq!(idxs.len(), 2);
}

#[test]
fn test_reuses_persisted_snapshot() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();

    let first = cache_in(&temp, Duration::from_secs(30));
    let index = first.get_cached_index(root.path()).unwrap();
    drop(first);

    let second = cache_in(&temp, Duration::from_secs(30));
    assert!(second.head_cached_index(root.path()).is_err());

    let reused = second.get_cached_index(root.path()).unwrap();
    assert_eq!(reused.count(None), index.count(None));
    assert_eq!(reused.disk_size(None), index.disk_size(None));
    assert_eq!(reused.scanned_at(), index.scanned_at());

    let stats = second.stats();
    assert_eq!(stats.scans, 0);
    assert_eq!(stats.adopted, 1);
    assert_eq!(
        second.head_cached_index(root.path()).unwrap(),
        (index.count(None), index.disk_size(None))
    );
}

#[test]
fn test_persisted_snapshot_reuse_disabled() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();

    cache_in(&temp, Duration::from_secs(30))
        .get_cached_index(root.path())
        .unwrap();

    let config = CacheConfig {
        reuse_persisted: false,
        ..CacheConfig::default()
            .with_rescan(Duration::from_secs(30))
            .with_temp_dir(temp.path())
    };
    let cache = Cached::new(config);
    cache.get_cached_index(root.path()).unwrap();

    assert_eq!(cache.stats().scans, 1);
    assert_eq!(cache.stats().adopted, 0);
}

#[test]
fn test_stale_persisted_snapshot_rescanned() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();

    cache_in(&temp, Duration::ZERO)
        .get_cached_index(root.path())
        .unwrap();
    write_file(root.path(), "after.txt", 7);

    let cache = cache_in(&temp, Duration::ZERO);
    let index = cache.get_cached_index(root.path()).unwrap();

    assert!(index.get("after.txt").is_some());
    assert_eq!(cache.stats().scans, 1);
}

#[test]
fn test_persisted_snapshot_with_other_config_rescanned() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();

    cache_in(&temp, Duration::from_secs(30))
        .get_cached_index(root.path())
        .unwrap();

    let mut config = CacheConfig::default()
        .with_rescan(Duration::from_secs(30))
        .with_temp_dir(temp.path());
    config.scan.max_depth = Some(0);
    let cache = Cached::new(config);
    let index = cache.get_cached_index(root.path()).unwrap();

    assert_eq!(index.max_depth(), Some(0));
    assert_eq!(cache.stats().scans, 1);
}

#[test]
fn test_corrupt_persisted_snapshot_replaced() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();
    let store = TempStore::new(temp.path());

    fs::create_dir_all(store.dir_for(root.path())).unwrap();
    fs::write(store.index_path(root.path()), b"garbage").unwrap();

    let cache = cache_in(&temp, Duration::from_secs(30));
    let index = cache.get_cached_index(root.path()).unwrap();

    assert_eq!(cache.stats().scans, 1);
    let (header, _) = store.load(root.path()).unwrap().unwrap();
    assert_eq!(header.entry_count, index.count(None));
}

#[test]
fn test_clean() {
    let temp = TempDir::new().unwrap();
    let root1 = generate_tree();
    let root2 = generate_tree();
    let cache = cache_in(&temp, Duration::ZERO);

    cache.get_cached_index(root1.path()).unwrap();
    cache.get_cached_index(root2.path()).unwrap();
    assert_eq!(temp_dir_info(temp.path()).0.len(), 2);

    assert!(cache.clean(root1.path()).unwrap());
    assert!(!cache.clean(root1.path()).unwrap());
    assert!(cache.head_cached_index(root1.path()).is_err());
    assert_eq!(temp_dir_info(temp.path()).0.len(), 1);

    assert_eq!(cache.clean_all().unwrap(), 1);
    assert!(temp_dir_info(temp.path()).0.is_empty());
    assert_eq!(cache.stats().roots, 0);
}

#[test]
fn test_cancelled_cache_keeps_previous() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();
    let cache = cache_in(&temp, Duration::ZERO);

    let index = cache.get_cached_index(root.path()).unwrap();
    cache.config().cancel.cancel();

    assert!(matches!(
        cache.get_cached_index(root.path()),
        Err(IndexError::Cancelled)
    ));
    assert_eq!(
        cache.head_cached_index(root.path()).unwrap(),
        (index.count(None), index.disk_size(None))
    );
}

#[test]
fn test_clean_waits_for_running_rebuild() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();
    let cache = cache_in(&temp, Duration::ZERO);
    let slot = cache.slot(&std::path::absolute(root.path()).unwrap());
    let leader = begin_rebuild(&slot);

    thread::scope(|s| {
        let cleaner = s.spawn(|| cache.clean(root.path()));
        let waiter = s.spawn(|| cache.get_cached_index(root.path()));
        thread::sleep(Duration::from_millis(100));
        assert!(!cleaner.is_finished());
        assert!(!waiter.is_finished());

        let outcome = cache.rebuild(&slot, Duration::ZERO, false);
        let index = leader.finish(outcome).unwrap();

        // The rebuild persisted before the clean removed its directory
        assert!(cleaner.join().unwrap().unwrap());
        let waited = waiter.join().unwrap().unwrap();
        assert_eq!(waited.count(None), index.count(None));
    });

    // Only the one rebuild walked the root
    assert_eq!(cache.stats().scans, 1);
    assert!(temp_dir_info(temp.path()).0.is_empty());
    assert!(matches!(
        cache.head_cached_index(root.path()),
        Err(IndexError::NoCachedIndex(_))
    ));

    cache.get_cached_index(root.path()).unwrap();
    assert_eq!(cache.stats().scans, 2);
    assert_eq!(temp_dir_info(temp.path()).0.len(), 1);

    assert_eq!(cache.clean_all().unwrap(), 1);
    assert!(temp_dir_info(temp.path()).0.is_empty());
}

#[test]
fn test_waiters_share_failed_rebuild() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();
    let cache = cache_in(&temp, Duration::ZERO);

    let previous = cache.get_cached_index(root.path()).unwrap();
    let slot = cache.slot(&std::path::absolute(root.path()).unwrap());
    let leader = begin_rebuild(&slot);
    let barrier = Barrier::new(9);

    thread::scope(|s| {
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    cache.get_cached_index(root.path())
                })
            })
            .collect();
        barrier.wait();
        thread::sleep(Duration::from_millis(100));

        cache.config().cancel.cancel();
        let outcome = cache.rebuild(&slot, Duration::ZERO, false);
        assert!(matches!(leader.finish(outcome), Err(IndexError::Cancelled)));

        for waiter in waiters {
            assert!(matches!(waiter.join().unwrap(), Err(IndexError::Cancelled)));
        }
    });

    assert_eq!(
        cache.head_cached_index(root.path()).unwrap(),
        (previous.count(None), previous.disk_size(None))
    );
    let (header, _) = TempStore::new(temp.path()).load(root.path()).unwrap().unwrap();
    assert_eq!(header.entry_count, previous.count(None));
}

#[test]
fn test_waiters_released_when_rebuild_aborts() {
    let temp = TempDir::new().unwrap();
    let root = generate_tree();
    let cache = cache_in(&temp, Duration::ZERO);

    let previous = cache.get_cached_index(root.path()).unwrap();
    let slot = cache.slot(&std::path::absolute(root.path()).unwrap());
    let leader = begin_rebuild(&slot);

    thread::scope(|s| {
        let waiter = s.spawn(|| cache.get_cached_index(root.path()));
        thread::sleep(Duration::from_millis(100));

        drop(leader);
        assert!(matches!(waiter.join().unwrap(), Err(IndexError::Aborted(_))));
    });

    assert!(slot.state.lock().flight.is_none());
    assert_eq!(
        cache.head_cached_index(root.path()).unwrap(),
        (previous.count(None), previous.disk_size(None))
    );

    // The next request rebuilds normally
    cache.get_cached_index(root.path()).unwrap();
    assert_eq!(cache.stats().scans, 2);
}
