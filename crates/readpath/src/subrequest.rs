//! crates/readpath/src/subrequest.rs
//!
//! One slice of a read request, targeted at exactly one source.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::ReadError;
use crate::flags::{Flags, SubrequestFlag};
use crate::lock;
use crate::mapping::PageBuffer;
use crate::ops::ReadSource;
use crate::request::ReadRequest;
use crate::stats::stats;

/// One slice of a read request.
///
/// Subrequests are created by the slicer at two references' worth of
/// ownership: one `Arc` parked in the parent's subrequest list for the
/// aggregator to walk, and one moved into the dispatch path. The dispatch
/// path *eats* its handle: on success it travels into the completion
/// callback and is consumed by [`crate::subreq_terminated`]; on immediate
/// failure it is simply dropped. The subrequest in turn keeps its parent
/// alive through the back-reference.
pub struct ReadSubrequest {
    rreq: Arc<ReadRequest>,
    start: AtomicU64,
    len: AtomicU64,
    transferred: AtomicU64,
    source: AtomicU32,
    error: Mutex<Option<ReadError>>,
    pub(crate) flags: Flags<SubrequestFlag>,
    debug_index: u32,
}

impl ReadSubrequest {
    pub(crate) fn new(rreq: Arc<ReadRequest>, start: u64, len: u64) -> Arc<Self> {
        let debug_index = rreq.next_subreq_index();
        stats().sreq.inc();
        Arc::new(Self {
            rreq,
            start: AtomicU64::new(start),
            len: AtomicU64::new(len),
            transferred: AtomicU64::new(0),
            source: AtomicU32::new(ReadSource::Invalid.encode()),
            error: Mutex::new(None),
            flags: Flags::new(),
            debug_index,
        })
    }

    /// The owning read request.
    #[must_use]
    pub fn request(&self) -> &Arc<ReadRequest> {
        &self.rreq
    }

    /// Absolute file position of the slice.
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start.load(Ordering::Acquire)
    }

    /// Slice length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Whether the slice is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes transferred into the slice so far.
    #[must_use]
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    /// The source this slice is routed to.
    #[must_use]
    pub fn source(&self) -> ReadSource {
        ReadSource::decode(self.source.load(Ordering::Acquire))
    }

    /// The last recorded outcome, if it was a failure.
    #[must_use]
    pub fn error(&self) -> Option<ReadError> {
        *lock(&self.error)
    }

    /// Position of this slice in its request's submission order.
    #[must_use]
    pub fn debug_index(&self) -> u32 {
        self.debug_index
    }

    /// Shrinks the slice; used by `prepare_read` and `clamp_length` while
    /// the slice is being classified.
    pub fn set_len(&self, len: u64) {
        self.len.store(len, Ordering::Release);
    }

    /// Tags the slice so data downloaded for it is written to the cache.
    pub fn set_write_to_cache(&self) {
        self.flags.set(SubrequestFlag::WriteToCache);
    }

    /// Requests that any unread tail be cleared instead of re-read.
    ///
    /// A server driver sets this before terminating a short read when it
    /// knows no further data will arrive for the slice.
    pub fn set_clear_tail(&self) {
        self.flags.set(SubrequestFlag::ClearTail);
    }

    /// A window over the not-yet-transferred part of the slice, for the
    /// source driver to fill.
    #[must_use]
    pub fn unread_buffer(&self) -> PageBuffer {
        let transferred = self.transferred();
        PageBuffer::new(
            self.rreq.mapping_arc(),
            self.start() + transferred,
            self.len() - transferred,
        )
    }

    pub(crate) fn set_start(&self, start: u64) {
        self.start.store(start, Ordering::Release);
    }

    pub(crate) fn set_source(&self, source: ReadSource) {
        self.source.store(source.encode(), Ordering::Release);
    }

    pub(crate) fn set_error(&self, err: ReadError) {
        *lock(&self.error) = Some(err);
    }

    pub(crate) fn clear_error(&self) {
        *lock(&self.error) = None;
    }

    pub(crate) fn add_transferred(&self, n: u64) {
        self.transferred.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn set_transferred(&self, n: u64) {
        self.transferred.store(n, Ordering::Release);
    }

    /// Zeroes the unread part of the slice's page range.
    pub(crate) fn clear_unread(&self) {
        self.unread_buffer().zero_all();
    }
}

impl Drop for ReadSubrequest {
    fn drop(&mut self) {
        tracing::trace!(
            rreq = self.rreq.debug_id(),
            subreq = self.debug_index,
            "sreq free"
        );
        stats().sreq.dec();
    }
}

impl std::fmt::Debug for ReadSubrequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadSubrequest")
            .field("rreq", &self.rreq.debug_id())
            .field("debug_index", &self.debug_index)
            .field("start", &self.start())
            .field("len", &self.len())
            .field("transferred", &self.transferred())
            .field("source", &self.source())
            .field("error", &self.error())
            .field("flags", &format_args!("{:#x}", self.flags.raw()))
            .finish()
    }
}
