//! crates/readpath/src/writeback.rs
//!
//! Copying freshly downloaded data into the local cache after the pages
//! have been unlocked.
//!
//! Only subrequests tagged for write-back survive the first pass; the
//! rest are dropped from the list. Survivors are widened to page
//! boundaries and greedily amalgamated with any follower whose start
//! falls inside the widened extent, so the cache sees few, aligned,
//! non-overlapping writes in ascending offset order. The write in-flight
//! counter carries the same anchor discipline as the read side: whoever
//! observes the drop to zero unmarks the pages and releases the request.

use std::sync::Arc;

use crate::completion;
use crate::error::ReadError;
use crate::flags::SubrequestFlag;
use crate::mapping::{PAGE_SIZE, PageBuffer};
use crate::ops::Terminator;
use crate::request::ReadRequest;
use crate::stats::stats;
use crate::subrequest::ReadSubrequest;
use crate::workqueue;

fn round_down(value: u64, to: u64) -> u64 {
    value / to * to
}

fn round_up(value: u64, to: u64) -> u64 {
    value.div_ceil(to) * to
}

/// Clears the fscache marker on every page the write-back touched,
/// exactly once per page, then releases the request.
fn unmark_after_write(rreq: Arc<ReadRequest>) {
    let mut unmarked: Option<u64> = None;

    for subreq in rreq.subrequests() {
        if subreq.is_empty() {
            continue;
        }
        let first = subreq.start() / PAGE_SIZE;
        let last = (subreq.start() + subreq.len() - 1) / PAGE_SIZE;
        for page in rreq.mapping().pages(first, last) {
            // Several writes may come from the same huge page; it must
            // only be unmarked once.
            if unmarked.is_some_and(|done| page.index() <= done) {
                continue;
            }
            unmarked = Some(page.index());
            page.end_fscache();
        }
    }

    completion::completed(rreq);
}

fn copy_terminated(subreq: Arc<ReadSubrequest>, outcome: Result<u64, ReadError>) {
    let rreq = Arc::clone(subreq.request());

    match outcome {
        Err(err) => {
            subreq.set_error(err);
            stats().write_failed.inc();
        }
        Ok(_) => {
            subreq.clear_error();
            stats().write_done.inc();
        }
    }
    tracing::trace!(
        rreq = rreq.debug_id(),
        subreq = subreq.debug_index(),
        outcome = ?outcome,
        "sreq write term"
    );

    if rreq.dec_wr_ops() == 0 {
        unmark_after_write(rreq);
    }
}

/// Performs the outstanding writes to the cache. Owns the handle it is
/// given.
fn do_write_to_cache(rreq: Arc<ReadRequest>) {
    tracing::trace!(rreq = rreq.debug_id(), "rreq write");

    // Hold an anchor so terminating writes cannot observe zero while the
    // list is still being walked.
    rreq.inc_wr_ops();

    let batch = rreq.with_subrequests_mut(|list| {
        list.retain(|subreq| subreq.flags.test(SubrequestFlag::WriteToCache));

        let mut index = 0;
        while index < list.len() {
            let subreq = Arc::clone(&list[index]);

            // Widen to page boundaries, then absorb any follower whose
            // start lies within the widened extent.
            let aligned = round_down(subreq.start(), PAGE_SIZE);
            if aligned != subreq.start() {
                subreq.set_len(subreq.len() + (subreq.start() - aligned));
                subreq.set_start(aligned);
            }
            subreq.set_len(round_up(subreq.len(), PAGE_SIZE));

            while index + 1 < list.len() {
                let next = Arc::clone(&list[index + 1]);
                if next.start() > subreq.start() + subreq.len() {
                    break;
                }
                subreq.set_len(round_up(subreq.len() + next.len(), PAGE_SIZE));
                list.remove(index + 1);
            }
            index += 1;
        }
        list.clone()
    });

    if let Some(cache) = rreq.cache().cloned() {
        for subreq in batch {
            rreq.inc_wr_ops();
            stats().write.inc();
            tracing::trace!(
                rreq = rreq.debug_id(),
                subreq = subreq.debug_index(),
                start = subreq.start(),
                len = subreq.len(),
                "sreq write"
            );
            let buffer = PageBuffer::new(rreq.mapping_arc(), subreq.start(), subreq.len());
            let pos = subreq.start();
            let terminator: Terminator =
                Box::new(move |outcome| copy_terminated(subreq, outcome));
            cache.write(pos, buffer, terminator);
        }
    }

    if rreq.dec_wr_ops() == 0 {
        unmark_after_write(rreq);
    }
}

/// Schedules the cache write-back, punting to a worker from restricted
/// contexts. Owns the handle it is given.
pub(crate) fn write_to_cache(rreq: Arc<ReadRequest>) {
    if workqueue::in_restricted_context() {
        workqueue::spawn(move || do_write_to_cache(rreq));
    } else {
        do_write_to_cache(rreq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_helpers() {
        assert_eq!(round_down(0, PAGE_SIZE), 0);
        assert_eq!(round_down(4095, PAGE_SIZE), 0);
        assert_eq!(round_down(4096, PAGE_SIZE), 4096);
        assert_eq!(round_down(8191, PAGE_SIZE), 4096);

        assert_eq!(round_up(0, PAGE_SIZE), 0);
        assert_eq!(round_up(1, PAGE_SIZE), 4096);
        assert_eq!(round_up(4096, PAGE_SIZE), 4096);
        assert_eq!(round_up(4097, PAGE_SIZE), 8192);
    }
}
