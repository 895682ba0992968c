//! The statistics surface moves at every labelled site.
//!
//! Counters are process-global and other tests run in parallel, so every
//! assertion is a monotone delta, never an exact value.

use std::sync::Arc;

use readpath::{Mapping, Page, readahead, readpage, stats, write_begin};
use test_support::{
    CacheReadAction, InMemoryMapping, PrepareAction, RactlSim, ScriptedCache, ScriptedNetfs,
};

#[test]
fn readpage_counts_downloads() {
    let mem = InMemoryMapping::new(4096);
    let mapping: Arc<dyn Mapping> = mem.clone();
    mem.stage_pages(0, 1);
    let page: Arc<dyn Page> = mem.page(0).expect("staged");
    let netfs = ScriptedNetfs::new();

    let before = stats::snapshot();
    readpage(&mapping, &page, netfs, None, None).expect("readpage");
    let after = stats::snapshot();

    assert!(after.readpage > before.readpage);
    assert!(after.download > before.download);
    assert!(after.download_done > before.download_done);
    assert!(after.bytes_accounted >= before.bytes_accounted + 4096);
}

#[test]
fn readahead_beyond_eof_counts_zero_fill() {
    let mem = InMemoryMapping::new(4096);
    let netfs = ScriptedNetfs::new();
    let mut ractl = RactlSim::new(&mem, 0, 16384);

    let before = stats::snapshot();
    readahead(&mut ractl, netfs, None);
    let after = stats::snapshot();

    assert!(after.readahead > before.readahead);
    assert!(after.zero > before.zero);
}

#[test]
fn cache_write_back_counts_writes() {
    let mem = InMemoryMapping::new(8192);
    let netfs = ScriptedNetfs::new();
    let cache = ScriptedCache::new();
    netfs.attach_cache(&cache);
    cache.push_prepare(PrepareAction::server_cached());
    let mut ractl = RactlSim::new(&mem, 0, 8192);

    let before = stats::snapshot();
    readahead(&mut ractl, netfs, None);
    let after = stats::snapshot();

    assert!(after.write > before.write);
    assert!(after.write_done > before.write_done);
}

#[test]
fn cache_hits_and_shorts_are_counted() {
    let mem = InMemoryMapping::new(4096);
    let mapping: Arc<dyn Mapping> = mem.clone();
    mem.stage_pages(0, 1);
    let page: Arc<dyn Page> = mem.page(0).expect("staged");

    let netfs = ScriptedNetfs::new();
    let cache = ScriptedCache::new();
    netfs.attach_cache(&cache);
    cache.push_prepare(PrepareAction::cache());
    cache.push_read(CacheReadAction::Complete(1024));
    cache.push_read(CacheReadAction::CompleteAll);

    let before = stats::snapshot();
    readpage(&mapping, &page, netfs, None, None).expect("readpage");
    let after = stats::snapshot();

    assert!(after.read_done >= before.read_done + 2);
    assert!(after.short_read > before.short_read);
}

#[test]
fn write_begin_zero_skip_is_counted() {
    let mem = InMemoryMapping::new(4096);
    let mapping: Arc<dyn Mapping> = mem.clone();
    let netfs = ScriptedNetfs::new();
    let mut fsdata = None;

    let before = stats::snapshot();
    write_begin(&mapping, 8192, 64, netfs, None, None, &mut fsdata).expect("write_begin");
    let after = stats::snapshot();

    assert!(after.write_zskip > before.write_zskip);
}
