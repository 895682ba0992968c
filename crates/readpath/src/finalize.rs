//! crates/readpath/src/finalize.rs
//!
//! Walking the page collection against the subrequest list once all read
//! I/O has quiesced: marking pages uptodate, tagging cache write-back,
//! and unlocking.

use std::sync::Arc;

use crate::flags::{RequestFlag, SubrequestFlag};
use crate::mapping::PAGE_SIZE;
use crate::request::ReadRequest;
use crate::stats::stats;

/// Unlocks the pages of a completed read.
///
/// Pages and subrequests are walked simultaneously: a page spanning
/// several slices fails if any of them did, and a huge page is handled as
/// one logical unit. Pages due for cache write-back get their fscache
/// marker before they are unlocked so that a racing writer can see the
/// wait condition.
pub(crate) fn unlock_pages(rreq: &Arc<ReadRequest>) {
    let (start, len) = (rreq.start(), rreq.len());
    if len == 0 {
        rreq.ops().done(rreq);
        return;
    }
    let start_page = start / PAGE_SIZE;
    let last_page = (start + len) / PAGE_SIZE - 1;

    // A failed request writes nothing back.
    if rreq.flags.test(RequestFlag::Failed) {
        rreq.flags.clear(RequestFlag::WriteToCache);
        for subreq in rreq.subrequests() {
            subreq.flags.clear(SubrequestFlag::WriteToCache);
        }
    }

    tracing::trace!(rreq = rreq.debug_id(), "rreq unlock");

    let subrequests = rreq.subrequests();
    let mut iter = subrequests.iter();
    let mut current = iter.next();
    let mut current_failed = current.is_some_and(|s| s.error().is_some());
    let mut iopos: u64 = 0;
    let mut account: u64 = 0;

    let dont_unlock = rreq.flags.test(RequestFlag::DontUnlockPages);
    let preserve = rreq
        .flags
        .test(RequestFlag::NoUnlockPage)
        .then(|| rreq.no_unlock_page());

    for page in rreq.mapping().pages(start_page, last_page) {
        let pgpos = (page.index() - start_page) * PAGE_SIZE;
        let pgend = pgpos + page.len();
        let mut pg_failed = false;

        loop {
            let Some(subreq) = current else {
                pg_failed = true;
                break;
            };
            if subreq.flags.test(SubrequestFlag::WriteToCache) {
                page.set_fscache();
            }
            pg_failed |= current_failed;
            if pgend < iopos + subreq.len() {
                break;
            }

            account += subreq.transferred();
            iopos += subreq.len();
            current = iter.next();
            current_failed = current.is_some_and(|s| s.error().is_some());
            if pgend == iopos {
                break;
            }
        }

        if !pg_failed {
            page.mark_uptodate();
        }

        if !dont_unlock {
            if preserve == Some(page.index()) {
                tracing::trace!(rreq = rreq.debug_id(), index = page.index(), "no unlock");
            } else {
                page.unlock();
            }
        }
    }

    stats().bytes_accounted.add(account);
    rreq.ops().done(rreq);
}
