//! Readahead entry-point behaviour: expansion, bail-outs, and policies.

use std::time::Duration;

use readpath::{
    PAGE_SIZE, Page, ReadError, ReadaheadControl, ShortSubmissionPolicy, readahead,
};
use test_support::{
    CACHE_FILL, InMemoryMapping, PrepareAction, RactlSim, SERVER_FILL, ScriptedCache,
    ScriptedNetfs, ServerAction, wait_until,
};

#[test]
fn zero_length_window_only_cleans_up() {
    let mem = InMemoryMapping::new(4096);
    let netfs = ScriptedNetfs::new();
    let mut ractl = RactlSim::new(&mem, 0, 0);

    readahead(&mut ractl, netfs.clone(), Some(Box::new("token")));

    assert_eq!(netfs.init_calls(), 0);
    assert_eq!(netfs.cleanup_calls(), 1);
    assert!(!ractl.released());
}

#[test]
fn window_is_read_and_unlocked() {
    let mem = InMemoryMapping::new(16384);
    let netfs = ScriptedNetfs::new();
    let mut ractl = RactlSim::new(&mem, 0, 16384);

    readahead(&mut ractl, netfs.clone(), None);

    assert!(ractl.released());
    for index in 0..4 {
        let page = mem.page(index).expect("staged page");
        assert!(page.is_uptodate(), "page {index} uptodate");
        assert!(!page.locked(), "page {index} unlocked");
    }
    assert_eq!(netfs.done_calls(), 1);
}

#[test]
fn beyond_eof_pages_are_zero_filled() {
    let mem = InMemoryMapping::new(4096);
    let netfs = ScriptedNetfs::new();
    let mut ractl = RactlSim::new(&mem, 0, 16384);

    readahead(&mut ractl, netfs.clone(), None);

    // One clamped server read, then a single zero-fill slice.
    assert_eq!(netfs.issued(), vec![(0, 4096)]);
    for index in 0..4 {
        let page = mem.page(index).expect("staged page");
        assert!(page.is_uptodate(), "page {index} uptodate");
        assert!(!page.locked(), "page {index} unlocked");
    }
    assert_eq!(
        mem.page(0).expect("first page").contents(),
        vec![SERVER_FILL; PAGE_SIZE as usize]
    );
    assert_eq!(
        mem.page(1).expect("second page").contents(),
        vec![0; PAGE_SIZE as usize]
    );
}

#[test]
fn cache_failure_falls_back_to_the_server() {
    let mem = InMemoryMapping::new(16384);
    let netfs = ScriptedNetfs::new();
    let cache = ScriptedCache::new();
    netfs.attach_cache(&cache);
    cache.push_prepare(PrepareAction::cache_limited(8192));
    cache.push_prepare(PrepareAction::cache_limited(8192));
    cache.push_read(test_support::CacheReadAction::CompleteAll);
    cache.push_read(test_support::CacheReadAction::Fail(ReadError::Io));

    let mut ractl = RactlSim::new(&mem, 0, 16384);
    readahead(&mut ractl, netfs.clone(), None);

    for index in 0..4 {
        let page = mem.page(index).expect("staged page");
        assert!(page.is_uptodate(), "page {index} uptodate");
        assert!(!page.locked(), "page {index} unlocked");
    }
    // The failed cache slice was re-routed to the server in place.
    assert_eq!(netfs.issued(), vec![(8192, 8192)]);
    assert_eq!(
        mem.page(0).expect("cache half").contents(),
        vec![CACHE_FILL; PAGE_SIZE as usize]
    );
    assert_eq!(
        mem.page(2).expect("server half").contents(),
        vec![SERVER_FILL; PAGE_SIZE as usize]
    );
}

#[test]
fn cache_granule_expansion_widens_the_window() {
    let mem = InMemoryMapping::new(32768);
    let netfs = ScriptedNetfs::new();
    let cache = ScriptedCache::new();
    netfs.attach_cache(&cache);
    cache.set_granule(8192);
    cache.push_prepare(PrepareAction::cache());

    let mut ractl = RactlSim::new(&mem, 4096, 4096);
    readahead(&mut ractl, netfs.clone(), None);

    // [4096, 8192) was rounded out to the enclosing granule.
    assert_eq!(ractl.pos(), 0);
    assert_eq!(ractl.len(), 8192);
    assert_eq!(cache.read_log(), vec![(0, 8192, false)]);
    for index in 0..2 {
        let page = mem.page(index).expect("granule page");
        assert!(page.is_uptodate(), "page {index} uptodate");
        assert!(!page.locked(), "page {index} unlocked");
    }
}

#[test]
fn driver_expansion_widens_the_window() {
    let mem = InMemoryMapping::new(32768);
    let netfs = ScriptedNetfs::new();
    netfs.expand_to(0, 16384);

    let mut ractl = RactlSim::new(&mem, 0, 8192);
    readahead(&mut ractl, netfs.clone(), None);

    assert_eq!(ractl.len(), 16384);
    for index in 0..4 {
        let page = mem.page(index).expect("expanded page");
        assert!(page.is_uptodate(), "page {index} uptodate");
    }
}

#[test]
fn nothing_submitted_leaves_window_untouched() {
    let mem = InMemoryMapping::new(16384);
    let netfs = ScriptedNetfs::new();
    netfs.fail_clamp();

    let mut ractl = RactlSim::new(&mem, 0, 16384);
    readahead(&mut ractl, netfs.clone(), Some(Box::new("token")));

    // No pages released, nothing read, the token cleaned up.
    assert!(!ractl.released());
    assert!(netfs.issued().is_empty());
    let page = mem.page(0).expect("staged page");
    assert!(page.locked());
    assert!(!page.is_uptodate());
    assert_eq!(netfs.cleanup_calls(), 1);
}

#[test]
fn readahead_never_reports_failures() {
    let mem = InMemoryMapping::new(16384);
    let netfs = ScriptedNetfs::new();
    netfs.push_action(ServerAction::Fail(ReadError::Io));

    let mut ractl = RactlSim::new(&mem, 0, 16384);
    readahead(&mut ractl, netfs.clone(), None);

    // Failed pages simply do not become uptodate, but they are unlocked.
    for index in 0..4 {
        let page = mem.page(index).expect("staged page");
        assert!(!page.is_uptodate(), "page {index} not uptodate");
        assert!(!page.locked(), "page {index} unlocked");
    }
}

#[test]
fn short_submission_punts_to_worker_when_configured() {
    let mem = InMemoryMapping::new(32768);
    let netfs = ScriptedNetfs::new();
    netfs.set_short_submission_policy(ShortSubmissionPolicy::PuntToWorker);
    netfs.clamp_max(8192);
    // A transient classification failure stalls the loop mid-window.
    netfs.fail_clamp_on(2);

    let mut ractl = RactlSim::new(&mem, 0, 32768);
    readahead(&mut ractl, netfs.clone(), None);

    assert!(ractl.released());

    // The worker resumes the submission loop and covers the rest.
    assert!(wait_until(Duration::from_secs(5), || {
        (0..8).all(|index| {
            mem.page(index)
                .is_some_and(|page| page.is_uptodate() && !page.locked())
        })
    }));
    assert_eq!(netfs.issued().len(), 4);
}

#[test]
fn short_submission_is_left_alone_by_default() {
    let mem = InMemoryMapping::new(32768);
    let netfs = ScriptedNetfs::new();
    netfs.clamp_max(8192);
    netfs.fail_clamp_on(2);

    let mut ractl = RactlSim::new(&mem, 0, 32768);
    readahead(&mut ractl, netfs.clone(), None);

    assert!(ractl.released());
    // Only the first slice was read; the rest of the window is left for
    // a later read to pick up.
    assert_eq!(netfs.issued(), vec![(0, 8192)]);
    for index in 0..2 {
        let page = mem.page(index).expect("submitted page");
        assert!(page.is_uptodate(), "page {index} uptodate");
        assert!(!page.locked(), "page {index} unlocked");
    }
    for index in 2..8 {
        let page = mem.page(index).expect("unsubmitted page");
        assert!(!page.is_uptodate(), "page {index} untouched");
        assert!(!page.locked(), "page {index} unlocked");
    }
}
