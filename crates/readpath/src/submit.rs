//! crates/readpath/src/submit.rs
//!
//! Slicing a request window into subrequests and dispatching them.
//!
//! Classification is cache-first: an attached cache gets the first say on
//! where the next slice comes from and may shorten it to a granule
//! boundary. Without a cache, anything at or beyond the end-of-file
//! snapshot is zero-filled and the rest goes to the server, clamped first
//! to the file size and then by the driver's own I/O limits.

use std::sync::Arc;

use crate::completion;
use crate::error::ReadError;
use crate::ops::{ReadSource, Terminator};
use crate::request::ReadRequest;
use crate::stats::stats;
use crate::subrequest::ReadSubrequest;

fn cache_prepare_read(rreq: &ReadRequest, subreq: &ReadSubrequest) -> ReadSource {
    if let Some(cache) = rreq.cache() {
        return cache.prepare_read(subreq, rreq.i_size());
    }
    if subreq.start() >= rreq.i_size() {
        return ReadSource::FillWithZeroes;
    }
    ReadSource::DownloadFromServer
}

/// Works out what sort of subrequest the next one will be.
fn prepare_read(rreq: &ReadRequest, subreq: &ReadSubrequest) -> ReadSource {
    let mut source = cache_prepare_read(rreq, subreq);

    if source == ReadSource::DownloadFromServer {
        // Clamp to the file, then let the driver shrink the slice to its
        // own I/O sizes and boundaries. If it shrinks it here it will be
        // called again for the remainder; if it wants serial calls it can
        // report a short read instead.
        let remaining = rreq.i_size().saturating_sub(subreq.start());
        if subreq.len() > remaining {
            subreq.set_len(remaining);
        }
        if !rreq.ops().clamp_length(subreq) {
            source = ReadSource::Invalid;
        }
    }

    if source != ReadSource::Invalid && subreq.is_empty() {
        tracing::warn!(
            rreq = rreq.debug_id(),
            subreq = subreq.debug_index(),
            "slice prepared to zero length"
        );
        source = ReadSource::Invalid;
    }

    subreq.set_source(source);
    tracing::trace!(
        rreq = rreq.debug_id(),
        subreq = subreq.debug_index(),
        start = subreq.start(),
        len = subreq.len(),
        source = ?source,
        "sreq prepare"
    );
    source
}

/// Issues a read against the cache. Eats the caller's subrequest handle.
pub(crate) fn read_from_cache(subreq: Arc<ReadSubrequest>, seek_data: bool) {
    let rreq = Arc::clone(subreq.request());
    let Some(cache) = rreq.cache().cloned() else {
        completion::subreq_terminated(subreq, Err(ReadError::Io));
        return;
    };
    let pos = subreq.start();
    let buffer = subreq.unread_buffer();
    let terminator: Terminator =
        Box::new(move |outcome| completion::subreq_terminated(subreq, outcome));
    cache.read(pos, buffer, seek_data, terminator);
}

/// Asks the driver to read from the server. Eats the caller's handle.
pub(crate) fn read_from_server(subreq: Arc<ReadSubrequest>) {
    stats().download.inc();
    let ops = Arc::clone(subreq.request().ops());
    ops.issue_op(subreq);
}

/// Completes a beyond-EOF slice synchronously with a cleared tail.
fn fill_with_zeroes(subreq: Arc<ReadSubrequest>) {
    stats().zero.inc();
    subreq.set_clear_tail();
    completion::subreq_terminated(subreq, Ok(0));
}

/// Slices off the next piece of the request and submits an I/O for it.
///
/// Returns `false` when the slice could not be classified; the caller
/// stops submitting and the window beyond `submitted` stays uncovered.
pub(crate) fn submit_slice(rreq: &Arc<ReadRequest>) -> bool {
    let start = rreq.start() + rreq.submitted();
    let len = rreq.len() - rreq.submitted();
    let subreq = ReadSubrequest::new(Arc::clone(rreq), start, len);
    rreq.push_subrequest(Arc::clone(&subreq));

    let source = prepare_read(rreq, &subreq);
    if source == ReadSource::Invalid {
        if let Some(err) = subreq.error() {
            rreq.set_error_if_unset(err);
        }
        // The slice contributed nothing; take it back off the list so
        // the list keeps tiling exactly the submitted range.
        rreq.with_subrequests_mut(|list| {
            list.pop();
        });
        return false;
    }

    rreq.inc_rd_ops();
    rreq.advance_submitted(subreq.len());

    tracing::trace!(
        rreq = rreq.debug_id(),
        subreq = subreq.debug_index(),
        start = subreq.start(),
        len = subreq.len(),
        source = ?source,
        "sreq submit"
    );
    match source {
        ReadSource::FillWithZeroes => fill_with_zeroes(subreq),
        ReadSource::DownloadFromServer => read_from_server(subreq),
        ReadSource::ReadFromCache => read_from_cache(subreq, false),
        ReadSource::Invalid => unreachable!("invalid slices are rejected above"),
    }
    true
}

/// Runs the submission loop until the window is covered or a slice fails.
pub(crate) fn submit_slices(rreq: &Arc<ReadRequest>) {
    while rreq.submitted() < rreq.len() {
        if !submit_slice(rreq) {
            break;
        }
    }
}

/// Gives the cache, then the driver, then the page-cache readahead
/// machinery a chance to resize the window. Each stage may only enlarge
/// it; the original region always stays covered.
pub(crate) fn expand_request(rreq: &Arc<ReadRequest>, ractl: &mut dyn crate::entry::ReadaheadControl) {
    let (mut start, mut len) = rreq.window();
    if let Some(cache) = rreq.cache() {
        cache.expand_readahead(&mut start, &mut len, rreq.i_size());
    }
    rreq.expand_window(start, len);

    rreq.ops().expand_readahead(rreq);

    let (start, len) = rreq.window();
    if start != ractl.pos() || len != ractl.len() {
        ractl.expand(start, len);
        rreq.set_window(ractl.pos(), ractl.len());
        tracing::trace!(
            rreq = rreq.debug_id(),
            start = ractl.pos(),
            len = ractl.len(),
            "read expanded"
        );
    }
}
