//! Cache write-back: amalgamation, marker handling, failure suppression.

use std::sync::Arc;
use std::time::Duration;

use readpath::{PAGE_SIZE, Page, ReadError, readahead};
use test_support::{
    InMemoryMapping, PrepareAction, RactlSim, SERVER_FILL, ScriptedCache, ScriptedNetfs,
    ServerAction, wait_until,
};

fn cached_setup(file_size: u64) -> (Arc<InMemoryMapping>, Arc<ScriptedNetfs>, Arc<ScriptedCache>) {
    let mem = InMemoryMapping::new(file_size);
    let netfs = ScriptedNetfs::new();
    let cache = ScriptedCache::new();
    netfs.attach_cache(&cache);
    (mem, netfs, cache)
}

#[test]
fn downloaded_data_is_written_back_once() {
    let (mem, netfs, cache) = cached_setup(16384);
    cache.push_prepare(PrepareAction::server_cached_limited(8192));
    cache.push_prepare(PrepareAction::server_cached_limited(8192));

    let mut ractl = RactlSim::new(&mem, 0, 16384);
    readahead(&mut ractl, netfs.clone(), None);

    // Adjacent slices were amalgamated into one aligned write.
    let writes = cache.write_log();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].pos, 0);
    assert_eq!(writes[0].len, 16384);
    assert_eq!(writes[0].data, vec![SERVER_FILL; 16384]);

    for index in 0..4 {
        let page = mem.page(index).expect("staged page");
        assert!(page.is_uptodate());
        assert!(!page.locked());
        assert!(!page.is_fscache(), "page {index} marker cleared");
    }
}

#[test]
fn cache_sourced_slices_are_not_written_back() {
    let (mem, netfs, cache) = cached_setup(16384);
    cache.push_prepare(PrepareAction::cache_limited(8192));
    cache.push_prepare(PrepareAction::server_cached_limited(8192));

    let mut ractl = RactlSim::new(&mem, 0, 16384);
    readahead(&mut ractl, netfs.clone(), None);

    // Only the downloaded half reaches the cache, page-aligned.
    let writes = cache.write_log();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].pos, 8192);
    assert_eq!(writes[0].len, 8192);

    // Pages of the cache-sourced half never carried the marker.
    assert!(!mem.page(0).expect("cache half").is_fscache());
    assert!(!mem.page(2).expect("server half").is_fscache());
}

#[test]
fn unaligned_slices_are_widened_to_page_boundaries() {
    // A 10000-byte file: the EOF-clamped download covers [8192, 10000)
    // and must be written back as a whole page.
    let (mem, netfs, cache) = cached_setup(10000);
    cache.push_prepare(PrepareAction::server_cached_limited(8192));
    cache.push_prepare(PrepareAction::server_cached());

    let mut ractl = RactlSim::new(&mem, 0, 16384);
    readahead(&mut ractl, netfs.clone(), None);

    let writes = cache.write_log();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].pos, 0);
    assert_eq!(writes[0].len % PAGE_SIZE, 0, "write length page-aligned");
    assert_eq!(writes[0].pos % PAGE_SIZE, 0, "write position page-aligned");
}

#[test]
fn failed_request_suppresses_write_back() {
    let (mem, netfs, cache) = cached_setup(16384);
    cache.push_prepare(PrepareAction::server_cached_limited(8192));
    cache.push_prepare(PrepareAction::server_cached_limited(8192));
    netfs.push_action(ServerAction::CompleteAll);
    netfs.push_action(ServerAction::Fail(ReadError::Io));

    let mut ractl = RactlSim::new(&mem, 0, 16384);
    readahead(&mut ractl, netfs.clone(), None);

    assert!(cache.write_log().is_empty(), "no write-back after failure");
    for index in 0..4 {
        assert!(!mem.page(index).expect("page").is_fscache());
    }
    // The successful half still finalized normally.
    assert!(mem.page(0).expect("first half").is_uptodate());
    assert!(!mem.page(2).expect("failed half").is_uptodate());
}

#[test]
fn write_failure_still_clears_the_markers() {
    let (mem, netfs, cache) = cached_setup(16384);
    cache.push_prepare(PrepareAction::server_cached_limited(8192));
    cache.push_prepare(PrepareAction::server_cached_limited(8192));
    cache.push_write(Err(ReadError::Io));

    let mut ractl = RactlSim::new(&mem, 0, 16384);
    readahead(&mut ractl, netfs.clone(), None);

    assert!(wait_until(Duration::from_secs(5), || {
        (0..4).all(|index| mem.page(index).is_some_and(|page| !page.is_fscache()))
    }));
}

#[test]
fn gapped_writes_stay_separate_and_ordered() {
    let (mem, netfs, cache) = cached_setup(16384);
    cache.push_prepare(PrepareAction::server_cached_limited(4096));
    cache.push_prepare(PrepareAction::cache_limited(4096));
    cache.push_prepare(PrepareAction::server_cached_limited(4096));
    cache.push_prepare(PrepareAction::cache_limited(4096));

    let mut ractl = RactlSim::new(&mem, 0, 16384);
    readahead(&mut ractl, netfs.clone(), None);

    let writes = cache.write_log();
    assert_eq!(writes.len(), 2);
    assert_eq!((writes[0].pos, writes[0].len), (0, 4096));
    assert_eq!((writes[1].pos, writes[1].len), (8192, 4096));
}

#[test]
fn huge_page_is_unmarked_exactly_once() {
    let (mem, netfs, cache) = cached_setup(16384);
    mem.stage_huge_page(0, 4);
    cache.push_prepare(PrepareAction::server_cached_limited(4096));
    cache.push_prepare(PrepareAction::cache_limited(4096));
    cache.push_prepare(PrepareAction::server_cached_limited(4096));
    cache.push_prepare(PrepareAction::cache_limited(4096));

    let mut ractl = RactlSim::new(&mem, 0, 16384);
    readahead(&mut ractl, netfs.clone(), None);

    let page = mem.page(0).expect("huge page");
    assert_eq!(page.len(), 16384);
    assert!(page.is_uptodate());
    assert!(!page.locked());
    assert!(!page.is_fscache());
    assert_eq!(page.fscache_end_calls(), 1, "huge page unmarked once");
    assert_eq!(page.unlock_calls(), 1, "huge page unlocked once");

    // Two gapped writes still arrived for the one logical page.
    assert_eq!(cache.write_log().len(), 2);
}
