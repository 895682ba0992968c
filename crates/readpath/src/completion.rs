//! crates/readpath/src/completion.rs
//!
//! Integrating subrequest outcomes and deciding what happens next.
//!
//! Aggregation is serialised by the read in-flight counter: exactly one
//! termination observes the drop to zero and with it inherits the right
//! to assess the request. Assessment may run on the caller's thread, a
//! worker, or the terminating context itself; anything that needs to
//! re-dispatch I/O from a restricted context is punted to the workers
//! first.

use std::sync::Arc;

use crate::error::ReadError;
use crate::finalize;
use crate::flags::{RequestFlag, SubrequestFlag};
use crate::ops::{OverrunPolicy, ReadSource};
use crate::request::ReadRequest;
use crate::stats::stats;
use crate::submit;
use crate::subrequest::ReadSubrequest;
use crate::workqueue;
use crate::writeback;

enum Disposition {
    Complete,
    Short,
    Failed,
}

fn integrate(
    rreq: &ReadRequest,
    subreq: &ReadSubrequest,
    outcome: Result<u64, ReadError>,
) -> Disposition {
    let reported = match outcome {
        Err(err) => {
            subreq.set_error(err);
            return Disposition::Failed;
        }
        Ok(n) => n,
    };

    let remaining = subreq.len() - subreq.transferred();
    let transferred = if reported > remaining {
        match rreq.ops().overrun_policy() {
            OverrunPolicy::ClampAndWarn => {
                tracing::warn!(
                    rreq = rreq.debug_id(),
                    subreq = subreq.debug_index(),
                    reported,
                    remaining,
                    "source over-reported its transfer, clamping"
                );
                remaining
            }
            OverrunPolicy::FailRequest => {
                subreq.set_error(ReadError::Io);
                return Disposition::Failed;
            }
        }
    } else {
        reported
    };

    subreq.clear_error();
    subreq.add_transferred(transferred);
    if subreq.transferred() >= subreq.len() {
        return Disposition::Complete;
    }

    if subreq.flags.test(SubrequestFlag::ClearTail) {
        subreq.clear_unread();
        subreq.set_transferred(subreq.len());
        return Disposition::Complete;
    }

    if transferred == 0 {
        // A second consecutive zero-byte termination means the source is
        // stuck; give up on the slice.
        if subreq.flags.test_and_set(SubrequestFlag::NoProgress) {
            subreq.set_error(ReadError::NoData);
            return Disposition::Failed;
        }
    } else {
        subreq.flags.clear(SubrequestFlag::NoProgress);
    }

    subreq.flags.set(SubrequestFlag::ShortRead);
    rreq.flags.set(RequestFlag::IncompleteIo);
    Disposition::Short
}

/// Notes the termination of a subrequest's I/O operation.
///
/// The source driver calls this exactly once per dispatch, moving its
/// subrequest handle back in. `outcome` carries the bytes transferred by
/// this operation (zero meaning "no progress, retry me") or the failure.
/// The helper looks after reissuing I/O, falling back from the cache to
/// the server, zero-filling cleared tails, and finalizing the pages once
/// everything has quiesced.
///
/// May be called from a restricted completion context (see
/// [`crate::restricted`]); destructive follow-up work is deferred to the
/// shared workers in that case.
pub fn subreq_terminated(subreq: Arc<ReadSubrequest>, outcome: Result<u64, ReadError>) {
    let rreq = Arc::clone(subreq.request());
    tracing::trace!(
        rreq = rreq.debug_id(),
        subreq = subreq.debug_index(),
        start = subreq.start(),
        transferred = subreq.transferred(),
        outcome = ?outcome,
        "subreq terminated"
    );

    match subreq.source() {
        ReadSource::ReadFromCache => stats().read_done.inc(),
        ReadSource::DownloadFromServer => stats().download_done.inc(),
        _ => {}
    }

    match integrate(&rreq, &subreq, outcome) {
        Disposition::Complete => {
            subreq.flags.clear(SubrequestFlag::NoProgress);
            if subreq.flags.test(SubrequestFlag::WriteToCache) {
                rreq.flags.set(RequestFlag::WriteToCache);
            }
        }
        Disposition::Short => {}
        Disposition::Failed => {
            if subreq.source() == ReadSource::ReadFromCache {
                // Retriable: the assessment pass reroutes the slice to
                // the server.
                stats().read_failed.inc();
                rreq.flags.set(RequestFlag::IncompleteIo);
            } else {
                stats().download_failed.inc();
                rreq.flags.set(RequestFlag::Failed);
                if let Some(err) = subreq.error() {
                    rreq.set_error_if_unset(err);
                }
            }
        }
    }

    let in_flight = rreq.dec_rd_ops();
    if in_flight == 0 {
        rreq_terminated(rreq);
    } else if in_flight == 1 {
        rreq.wake_ops_waiters();
    }
}

/// Handles the completion of all outstanding I/O on a request. Owns the
/// handle it is given.
fn rreq_terminated(rreq: Arc<ReadRequest>) {
    if rreq.flags.test(RequestFlag::IncompleteIo) && workqueue::in_restricted_context() {
        workqueue::spawn(move || assess(rreq));
    } else {
        assess(rreq);
    }
}

/// Marks cache-sourced slices stale when the driver says the object
/// changed under us.
fn check_validity(rreq: &Arc<ReadRequest>) {
    if rreq.ops().is_still_valid(rreq) {
        return;
    }
    for subreq in rreq.subrequests() {
        if subreq.source() == ReadSource::ReadFromCache {
            subreq.set_error(ReadError::Stale);
            rreq.flags.set(RequestFlag::IncompleteIo);
        }
    }
}

fn short_read(rreq: &Arc<ReadRequest>, subreq: &Arc<ReadSubrequest>) {
    subreq.flags.clear(SubrequestFlag::ShortRead);
    subreq.flags.set(SubrequestFlag::SeekDataRead);

    stats().short_read.inc();
    tracing::trace!(
        rreq = rreq.debug_id(),
        subreq = subreq.debug_index(),
        transferred = subreq.transferred(),
        "sreq resubmit short"
    );

    rreq.inc_rd_ops();
    if subreq.source() == ReadSource::ReadFromCache {
        submit::read_from_cache(Arc::clone(subreq), true);
    } else {
        submit::read_from_server(Arc::clone(subreq));
    }
}

/// Resubmits short or failed slices. Returns `true` if the anchor fell to
/// zero and the caller therefore still owns the completion action.
fn perform_resubmissions(rreq: &Arc<ReadRequest>) -> bool {
    tracing::trace!(rreq = rreq.debug_id(), "rreq resubmit");

    // Hold an anchor so terminating resubmissions cannot observe zero
    // while the list walk is still going.
    rreq.inc_rd_ops();

    rreq.flags.clear(RequestFlag::IncompleteIo);
    for subreq in rreq.subrequests() {
        if subreq.error().is_some() {
            if subreq.source() != ReadSource::ReadFromCache {
                break;
            }
            subreq.set_source(ReadSource::DownloadFromServer);
            subreq.clear_error();
            stats().download_instead.inc();
            tracing::trace!(
                rreq = rreq.debug_id(),
                subreq = subreq.debug_index(),
                "sreq download instead"
            );
            rreq.inc_rd_ops();
            submit::read_from_server(Arc::clone(&subreq));
        } else if subreq.flags.test(SubrequestFlag::ShortRead) {
            short_read(rreq, &subreq);
        }
    }

    if rreq.dec_rd_ops() == 0 {
        return true;
    }
    rreq.wake_ops_waiters();
    false
}

/// Assesses the state of a read request and decides what to do next.
///
/// May run on an ordinary thread, a worker, or a completion context; owns
/// the handle it is given.
pub(crate) fn assess(rreq: Arc<ReadRequest>) {
    tracing::trace!(rreq = rreq.debug_id(), "rreq assess");

    loop {
        check_validity(&rreq);

        if !rreq.flags.test(RequestFlag::Failed) && rreq.flags.test(RequestFlag::IncompleteIo) {
            if perform_resubmissions(&rreq) {
                continue;
            }
            // In-flight resubmissions own the completion action now.
            return;
        }
        break;
    }

    finalize::unlock_pages(&rreq);

    rreq.flags.clear(RequestFlag::InProgress);
    rreq.wake_ops_waiters();

    if rreq.flags.test(RequestFlag::WriteToCache) {
        writeback::write_to_cache(rreq);
        return;
    }

    completed(rreq);
}

/// Final release: breaks the list cycle and drops the inherited handle.
pub(crate) fn completed(rreq: Arc<ReadRequest>) {
    tracing::trace!(rreq = rreq.debug_id(), "rreq done");
    rreq.clear_subrequests();
    drop(rreq);
}
