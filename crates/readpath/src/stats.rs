//! crates/readpath/src/stats.rs
//!
//! Relaxed event counters covering every labelled site on the read path.

use std::sync::atomic::{AtomicU64, Ordering};

/// One relaxed event counter.
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub(crate) fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// The process-wide counter set.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub(crate) readahead: Counter,
    pub(crate) readpage: Counter,
    pub(crate) write_begin: Counter,
    pub(crate) rreq: Counter,
    pub(crate) sreq: Counter,
    pub(crate) download: Counter,
    pub(crate) download_done: Counter,
    pub(crate) download_failed: Counter,
    pub(crate) download_instead: Counter,
    pub(crate) read_done: Counter,
    pub(crate) read_failed: Counter,
    pub(crate) short_read: Counter,
    pub(crate) write: Counter,
    pub(crate) write_done: Counter,
    pub(crate) write_failed: Counter,
    pub(crate) write_zskip: Counter,
    pub(crate) zero: Counter,
    pub(crate) bytes_accounted: Counter,
}

static STATS: Stats = Stats {
    readahead: Counter(AtomicU64::new(0)),
    readpage: Counter(AtomicU64::new(0)),
    write_begin: Counter(AtomicU64::new(0)),
    rreq: Counter(AtomicU64::new(0)),
    sreq: Counter(AtomicU64::new(0)),
    download: Counter(AtomicU64::new(0)),
    download_done: Counter(AtomicU64::new(0)),
    download_failed: Counter(AtomicU64::new(0)),
    download_instead: Counter(AtomicU64::new(0)),
    read_done: Counter(AtomicU64::new(0)),
    read_failed: Counter(AtomicU64::new(0)),
    short_read: Counter(AtomicU64::new(0)),
    write: Counter(AtomicU64::new(0)),
    write_done: Counter(AtomicU64::new(0)),
    write_failed: Counter(AtomicU64::new(0)),
    write_zskip: Counter(AtomicU64::new(0)),
    zero: Counter(AtomicU64::new(0)),
    bytes_accounted: Counter(AtomicU64::new(0)),
};

pub(crate) fn stats() -> &'static Stats {
    &STATS
}

/// A point-in-time copy of the helper's counters.
///
/// Entry points, dispatch sites, and completion sites each increment one
/// counter; `rreq` and `sreq` are live-object gauges rather than running
/// totals. Snapshots are cheap and monotone between reads, which lets
/// tests assert on deltas without pausing I/O.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StatsSnapshot {
    pub readahead: u64,
    pub readpage: u64,
    pub write_begin: u64,
    pub rreq: u64,
    pub sreq: u64,
    pub download: u64,
    pub download_done: u64,
    pub download_failed: u64,
    pub download_instead: u64,
    pub read_done: u64,
    pub read_failed: u64,
    pub short_read: u64,
    pub write: u64,
    pub write_done: u64,
    pub write_failed: u64,
    pub write_zskip: u64,
    pub zero: u64,
    pub bytes_accounted: u64,
}

/// Returns a copy of the current counter values.
#[must_use]
pub fn snapshot() -> StatsSnapshot {
    StatsSnapshot {
        readahead: STATS.readahead.get(),
        readpage: STATS.readpage.get(),
        write_begin: STATS.write_begin.get(),
        rreq: STATS.rreq.get(),
        sreq: STATS.sreq.get(),
        download: STATS.download.get(),
        download_done: STATS.download_done.get(),
        download_failed: STATS.download_failed.get(),
        download_instead: STATS.download_instead.get(),
        read_done: STATS.read_done.get(),
        read_failed: STATS.read_failed.get(),
        short_read: STATS.short_read.get(),
        write: STATS.write.get(),
        write_done: STATS.write_done.get(),
        write_failed: STATS.write_failed.get(),
        write_zskip: STATS.write_zskip.get(),
        zero: STATS.zero.get(),
        bytes_accounted: STATS.bytes_accounted.get(),
    }
}
