//! crates/readpath/src/entry.rs
//!
//! The three entry points: readahead, readpage, and write-begin.
//!
//! Each constructs a read request over a page-aligned window, lets the
//! cache and the driver widen it, then drives the submission loop with an
//! anchor held on the read in-flight counter so no completion can observe
//! zero before submission finishes. Readahead hands the rest of the work
//! to whichever completion context finishes last; readpage and
//! write-begin park on the counter and assess from the caller's thread.

use std::sync::Arc;

use crate::completion;
use crate::error::{ReadError, ReadResult};
use crate::mapping::{FileToken, Mapping, PAGE_SIZE, Page};
use crate::ops::{FsData, NetfsOps, NetfsPriv, ShortSubmissionPolicy};
use crate::request::ReadRequest;
use crate::stats::stats;
use crate::submit;
use crate::workqueue;

/// The page cache's readahead window, as negotiated with the caller.
///
/// The helper may ask for the window to be widened (cache granule
/// alignment, transport preferences); the implementation materialises
/// pages for whatever window it grants and reports the granted bounds
/// back through [`pos`](Self::pos) and [`len`](Self::len).
pub trait ReadaheadControl {
    /// The mapping the window belongs to.
    fn mapping(&self) -> Arc<dyn Mapping>;

    /// The open-file handle behind the readahead, if any.
    fn file(&self) -> Option<&FileToken>;

    /// Byte position of the window start.
    fn pos(&self) -> u64;

    /// Window length in bytes.
    fn len(&self) -> u64;

    /// Requests a wider window. The granted window must cover the request
    /// and is visible through `pos`/`len` afterwards.
    fn expand(&mut self, start: u64, len: u64);

    /// Releases the window's own page references once submission pinned
    /// the pages through the page cache.
    fn release_pages(&mut self);
}

/// Internal window used by write-begin: the target page, nothing held.
struct PinnedWindow {
    mapping: Arc<dyn Mapping>,
    start: u64,
    len: u64,
}

impl ReadaheadControl for PinnedWindow {
    fn mapping(&self) -> Arc<dyn Mapping> {
        Arc::clone(&self.mapping)
    }

    fn file(&self) -> Option<&FileToken> {
        None
    }

    fn pos(&self) -> u64 {
        self.start
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn expand(&mut self, start: u64, len: u64) {
        let (granted_start, granted_len) = self.mapping.expand_readahead(start, len);
        self.start = granted_start;
        self.len = granted_len;
    }

    fn release_pages(&mut self) {}
}

/// Fulfils a readahead request by drawing from the cache or the server,
/// zero-filling beyond the EOF.
///
/// The window may be expanded in either direction to a more convenient
/// alignment for transport efficiency or cache storage. Never returns an
/// error: pages whose I/O failed simply do not become uptodate.
pub fn readahead(
    ractl: &mut dyn ReadaheadControl,
    ops: Arc<dyn NetfsOps>,
    netfs_priv: Option<NetfsPriv>,
) {
    tracing::trace!(pos = ractl.pos(), len = ractl.len(), "readahead");

    if ractl.len() == 0 {
        if let Some(token) = netfs_priv {
            ops.cleanup(&ractl.mapping(), token);
        }
        return;
    }

    let rreq = ReadRequest::new(Arc::clone(&ops), ractl.mapping(), netfs_priv, ractl.file());
    rreq.set_window(ractl.pos(), ractl.len());

    stats().readahead.inc();
    tracing::trace!(
        rreq = rreq.debug_id(),
        start = rreq.start(),
        len = rreq.len(),
        "read readahead"
    );

    if let Err(err) = ops.begin_cache_operation(&rreq) {
        if err.is_fatal_setup() {
            return;
        }
    }
    submit::expand_request(&rreq, ractl);

    rreq.begin_read_phase();
    submit::submit_slices(&rreq);

    if rreq.submitted() == 0 {
        rreq.clear_subrequests();
        return;
    }

    // The pages are pinned through the page cache now; the window's own
    // references can go.
    ractl.release_pages();

    if rreq.submitted() < rreq.len()
        && ops.short_submission_policy() == ShortSubmissionPolicy::PuntToWorker
    {
        workqueue::spawn(move || {
            submit::submit_slices(&rreq);
            if rreq.dec_rd_ops() == 0 {
                completion::assess(rreq);
            }
        });
        return;
    }

    if rreq.dec_rd_ops() == 0 {
        completion::assess(rreq);
    }
}

/// Parks on the read counter and assesses from the caller's thread until
/// finalization completes, honouring the driver's interrupt hook.
fn drive_to_completion(rreq: &Arc<ReadRequest>) -> ReadResult<()> {
    loop {
        if let Err(err) = rreq.wait_until_anchored() {
            // Abandon the wait but not the I/O: drop the anchor so the
            // last completion finalizes the pages.
            if rreq.dec_rd_ops() == 0 {
                completion::assess(Arc::clone(rreq));
            }
            return Err(err);
        }
        completion::assess(Arc::clone(rreq));
        if !rreq.in_progress() {
            return Ok(());
        }
    }
}

fn collect_result(rreq: &ReadRequest) -> ReadResult<()> {
    match rreq.error() {
        Some(err) => Err(err),
        None if rreq.submitted() < rreq.len() => Err(ReadError::Io),
        None => Ok(()),
    }
}

/// Fulfils a readpage request for a locked page, drawing from the cache
/// or the server and zero-filling beyond the EOF.
///
/// Blocks until the page has been finalized and returns the first error
/// any non-cache source reported, or `Io` if the window was silently left
/// uncovered.
pub fn readpage(
    mapping: &Arc<dyn Mapping>,
    page: &Arc<dyn Page>,
    ops: Arc<dyn NetfsOps>,
    netfs_priv: Option<NetfsPriv>,
    file: Option<&FileToken>,
) -> ReadResult<()> {
    tracing::trace!(index = page.index(), "readpage");

    let rreq = ReadRequest::new(Arc::clone(&ops), Arc::clone(mapping), netfs_priv, file);
    rreq.set_window(page.index() * PAGE_SIZE, page.len());

    stats().readpage.inc();
    tracing::trace!(
        rreq = rreq.debug_id(),
        start = rreq.start(),
        len = rreq.len(),
        "read readpage"
    );

    if let Err(err) = ops.begin_cache_operation(&rreq) {
        if err.is_fatal_setup() {
            page.unlock();
            return Err(err);
        }
    }

    rreq.begin_read_phase();
    submit::submit_slices(&rreq);

    drive_to_completion(&rreq)?;
    collect_result(&rreq)
}

/// Pre-reads the data a partial page write will overlay.
///
/// Grabs and locks the target page, lets the driver flush conflicting
/// writes ([`NetfsOps::check_write_begin`] may demand re-acquisition with
/// [`ReadError::Again`]), and short-circuits with a zero-filled page when
/// the write covers the whole page or lands beyond the EOF with caching
/// disabled. Otherwise the page is populated like a readpage, except
/// that it stays locked throughout. On success the locked, uptodate page
/// is returned once any cache write-back of it has finished.
pub fn write_begin(
    mapping: &Arc<dyn Mapping>,
    pos: u64,
    len: u64,
    ops: Arc<dyn NetfsOps>,
    mut netfs_priv: Option<NetfsPriv>,
    file: Option<&FileToken>,
    fsdata: &mut Option<FsData>,
) -> ReadResult<Arc<dyn Page>> {
    let index = pos / PAGE_SIZE;
    tracing::trace!(pos, len, index, "write_begin");

    loop {
        let page = match mapping.grab_page(index) {
            Ok(page) => page,
            Err(err) => {
                if let Some(token) = netfs_priv {
                    ops.cleanup(mapping, token);
                }
                return Err(err);
            }
        };

        // Let the driver flush conflicts while it holds the page lock.
        match ops.check_write_begin(file, pos, len, &page, fsdata) {
            Ok(()) => {}
            Err(ReadError::Again) => continue,
            Err(err) => {
                page.unlock();
                if let Some(token) = netfs_priv {
                    ops.cleanup(mapping, token);
                }
                return Err(err);
            }
        }

        if page.is_uptodate() {
            page.wait_for_fscache();
            if let Some(token) = netfs_priv {
                ops.cleanup(mapping, token);
            }
            return Ok(page);
        }

        // A page that is fully overwritten, or lies beyond the EOF, wants
        // clearing rather than preloading - unless the cache granule
        // containing the EOF still has to be populated.
        let size = mapping.file_size();
        let page_start = page.index() * PAGE_SIZE;
        let page_len = page.len();
        let pos_in_page = pos - page_start;
        if !ops.is_cache_enabled(&**mapping)
            && ((pos_in_page == 0 && len == page_len)
                || pos >= size
                || (pos_in_page == 0 && pos + len >= size))
        {
            mapping.zero(page_start, page_len);
            page.mark_uptodate();
            stats().write_zskip.inc();
            if let Some(token) = netfs_priv {
                ops.cleanup(mapping, token);
            }
            return Ok(page);
        }

        let rreq = ReadRequest::new(
            Arc::clone(&ops),
            Arc::clone(mapping),
            netfs_priv.take(),
            file,
        );
        rreq.set_window(page_start, page_len);
        rreq.set_no_unlock_page(page.index());

        stats().write_begin.inc();
        tracing::trace!(rreq = rreq.debug_id(), pos, len, "read write_begin");

        if let Err(err) = ops.begin_cache_operation(&rreq) {
            if err.is_fatal_setup() {
                page.unlock();
                return Err(err);
            }
        }

        // Expand to meet caching requirements and download preferences.
        let mut window = PinnedWindow {
            mapping: Arc::clone(mapping),
            start: page_start,
            len: page_len,
        };
        submit::expand_request(&rreq, &mut window);

        rreq.begin_read_phase();
        submit::submit_slices(&rreq);

        let driven = drive_to_completion(&rreq).and_then(|()| collect_result(&rreq));
        drop(rreq);
        if let Err(err) = driven {
            page.unlock();
            return Err(err);
        }

        page.wait_for_fscache();
        return Ok(page);
    }
}
