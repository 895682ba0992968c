//! Cross-thread completion: parked entry points, restricted contexts,
//! interrupts, and stale-object invalidation.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use readpath::{Mapping, PAGE_SIZE, Page, ReadError, readahead, readpage, subreq_terminated};
use test_support::{
    CacheReadAction, InMemoryMapping, PrepareAction, RactlSim, SERVER_FILL, ScriptedCache,
    ScriptedNetfs, ServerAction, wait_until,
};

fn staged_page(mem: &Arc<InMemoryMapping>, index: u64) -> Arc<dyn Page> {
    mem.stage_pages(index, 1);
    mem.page(index).expect("page staged")
}

#[test]
fn readpage_parks_until_async_completion() {
    let mem = InMemoryMapping::new(4096);
    let mapping: Arc<dyn Mapping> = mem.clone();
    let page = staged_page(&mem, 0);

    let netfs = ScriptedNetfs::new();
    netfs.push_action(ServerAction::Hold);

    let completer = {
        let netfs = Arc::clone(&netfs);
        thread::spawn(move || {
            assert!(wait_until(Duration::from_secs(5), || netfs.held_count() == 1));
            thread::sleep(Duration::from_millis(20));
            for held in netfs.take_held() {
                let buffer = held.unread_buffer();
                let n = buffer.len();
                buffer.write(0, &vec![SERVER_FILL; n as usize]);
                subreq_terminated(held, Ok(n));
            }
        })
    };

    let result = readpage(&mapping, &page, netfs.clone(), None, None);
    completer.join().expect("completer thread");

    assert_eq!(result, Ok(()));
    assert!(page.is_uptodate());
    assert!(!mem.page(0).expect("page kept").locked());
}

#[test]
fn restricted_completion_defers_heavy_work_to_workers() {
    let mem = InMemoryMapping::new(16384);
    let netfs = ScriptedNetfs::new();
    // A short read terminated from a restricted context: the retry work
    // must happen on a worker, not on the completing thread.
    netfs.push_action(ServerAction::Threaded {
        action: Box::new(ServerAction::Complete(2048)),
        restricted: true,
    });

    let mut ractl = RactlSim::new(&mem, 0, 16384);
    readahead(&mut ractl, netfs.clone(), None);

    assert!(wait_until(Duration::from_secs(5), || {
        (0..4).all(|index| {
            mem.page(index)
                .is_some_and(|page| page.is_uptodate() && !page.locked())
        })
    }));
    // The initial dispatch plus the short-read redispatch.
    assert_eq!(netfs.issued(), vec![(0, 16384), (2048, 16384 - 2048)]);
}

#[test]
fn restricted_failure_completion_finalizes_via_worker() {
    let mem = InMemoryMapping::new(16384);
    let netfs = ScriptedNetfs::new();
    netfs.push_action(ServerAction::Threaded {
        action: Box::new(ServerAction::Fail(ReadError::Io)),
        restricted: true,
    });

    let mut ractl = RactlSim::new(&mem, 0, 16384);
    readahead(&mut ractl, netfs.clone(), None);

    assert!(wait_until(Duration::from_secs(5), || {
        (0..4).all(|index| mem.page(index).is_some_and(|page| !page.locked()))
    }));
    assert!(!mem.page(0).expect("page").is_uptodate());
}

#[test]
fn writeback_from_restricted_context_is_punted() {
    let mem = InMemoryMapping::new(8192);
    let netfs = ScriptedNetfs::new();
    let cache = ScriptedCache::new();
    netfs.attach_cache(&cache);
    cache.push_prepare(PrepareAction::server_cached());
    netfs.push_action(ServerAction::Threaded {
        action: Box::new(ServerAction::CompleteAll),
        restricted: true,
    });

    let mut ractl = RactlSim::new(&mem, 0, 8192);
    readahead(&mut ractl, netfs.clone(), None);

    assert!(wait_until(Duration::from_secs(5), || {
        cache.write_log().len() == 1
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        (0..2).all(|index| {
            mem.page(index)
                .is_some_and(|page| page.is_uptodate() && !page.is_fscache())
        })
    }));
}

#[test]
fn interrupt_abandons_the_wait_but_not_the_io() {
    let mem = InMemoryMapping::new(4096);
    let mapping: Arc<dyn Mapping> = mem.clone();
    let page = staged_page(&mem, 0);

    let netfs = ScriptedNetfs::new();
    netfs.push_action(ServerAction::Hold);
    netfs.arm_interrupt(ReadError::Interrupted);

    let result = readpage(&mapping, &page, netfs.clone(), None, None);
    assert_eq!(result, Err(ReadError::Interrupted));

    // The page is still locked: the read has not completed yet.
    assert!(mem.page(0).expect("page kept").locked());

    // When the straggler finally terminates, finalization happens on the
    // completing context.
    for held in netfs.take_held() {
        let buffer = held.unread_buffer();
        let n = buffer.len();
        buffer.write(0, &vec![SERVER_FILL; n as usize]);
        subreq_terminated(held, Ok(n));
    }
    assert!(wait_until(Duration::from_secs(5), || {
        mem.page(0)
            .is_some_and(|page| page.is_uptodate() && !page.locked())
    }));
}

#[test]
fn stale_cache_data_is_rerouted_to_the_server() {
    let mem = InMemoryMapping::new(4096);
    let mapping: Arc<dyn Mapping> = mem.clone();
    let page = staged_page(&mem, 0);

    let netfs = ScriptedNetfs::new();
    let cache = ScriptedCache::new();
    netfs.attach_cache(&cache);
    cache.push_prepare(PrepareAction::cache());
    cache.push_read(CacheReadAction::CompleteAll);
    netfs.invalidate();

    let before = readpath::stats::snapshot();
    let result = readpage(&mapping, &page, netfs.clone(), None, None);
    let after = readpath::stats::snapshot();

    assert_eq!(result, Ok(()));
    assert!(page.is_uptodate());
    assert!(after.download_instead > before.download_instead);
    // The invalidated slice went back out to the server.
    assert_eq!(netfs.issued().len(), 1);
}

#[test]
fn many_parallel_readpages_stay_independent() {
    let mem = InMemoryMapping::new(PAGE_SIZE * 16);
    let mapping: Arc<dyn Mapping> = mem.clone();

    let handles: Vec<_> = (0..16)
        .map(|index| {
            let mapping = Arc::clone(&mapping);
            let mem = Arc::clone(&mem);
            thread::spawn(move || {
                let netfs = ScriptedNetfs::new();
                netfs.push_action(ServerAction::Threaded {
                    action: Box::new(ServerAction::CompleteAll),
                    restricted: false,
                });
                mem.stage_pages(index, 1);
                let page: Arc<dyn Page> = mem.page(index).expect("staged");
                readpage(&mapping, &page, netfs, None, None)
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().expect("readpage thread"), Ok(()));
    }
    for index in 0..16 {
        let page = mem.page(index).expect("page");
        assert!(page.is_uptodate(), "page {index} uptodate");
        assert!(!page.locked(), "page {index} unlocked");
    }
}
