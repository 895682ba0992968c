//! crates/readpath/src/ops.rs
//!
//! Capability sets supplied by the network filesystem and the local cache.
//!
//! Optional operations are provided trait methods whose defaults behave
//! exactly like an absent callback in a C operations table: validity
//! checks pass, clamping keeps the proposed length, expansion leaves the
//! window alone, and teardown hooks do nothing.

use std::any::Any;
use std::sync::Arc;

use crate::error::{ReadError, ReadResult};
use crate::mapping::{FileToken, Mapping, Page, PageBuffer};
use crate::request::ReadRequest;
use crate::subrequest::ReadSubrequest;

/// Where one subrequest's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// The slice could not be classified; abandon submission.
    Invalid,
    /// Satisfy the slice from the local disk cache.
    ReadFromCache,
    /// Download the slice from the network server.
    DownloadFromServer,
    /// The slice lies beyond the end of file; fill it with zeroes.
    FillWithZeroes,
}

impl ReadSource {
    pub(crate) fn encode(self) -> u32 {
        match self {
            Self::Invalid => 0,
            Self::ReadFromCache => 1,
            Self::DownloadFromServer => 2,
            Self::FillWithZeroes => 3,
        }
    }

    pub(crate) fn decode(raw: u32) -> Self {
        match raw {
            1 => Self::ReadFromCache,
            2 => Self::DownloadFromServer,
            3 => Self::FillWithZeroes,
            _ => Self::Invalid,
        }
    }
}

/// What to do when a source reports more bytes than the slice had left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverrunPolicy {
    /// Clamp to the remaining length and log a warning.
    #[default]
    ClampAndWarn,
    /// Treat the overrun as a fatal source failure.
    FailRequest,
}

/// What to do when readahead submission stops before covering the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShortSubmissionPolicy {
    /// Return, leaving unsubmitted pages for a later read to pick up.
    #[default]
    Leave,
    /// Continue the submission loop on the worker queue.
    PuntToWorker,
}

/// Driver-private token retained in the request and handed to `cleanup`.
pub type NetfsPriv = Box<dyn Any + Send>;

/// Cookie slot a driver may fill during `check_write_begin`.
pub type FsData = Box<dyn Any + Send>;

/// Completion callback for a cache read or write dispatch.
///
/// Invoked exactly once with the byte count transferred or the failure.
pub type Terminator = Box<dyn FnOnce(Result<u64, ReadError>) + Send>;

/// Operations the network filesystem driver supplies to the helper.
pub trait NetfsOps: Send + Sync + 'static {
    /// Populates driver-private request state at construction time.
    fn init_request(&self, rreq: &ReadRequest, file: Option<&FileToken>);

    /// Whether local caching is switched on for this file.
    fn is_cache_enabled(&self, mapping: &dyn Mapping) -> bool;

    /// Issues a server read for the slice.
    ///
    /// The driver reads into [`ReadSubrequest::unread_buffer`] and must
    /// eventually call [`crate::subreq_terminated`] with the moved
    /// subrequest handle exactly once. It may not backtrack and write
    /// before the transferred point, as that could clobber data already
    /// obtained from the cache.
    fn issue_op(&self, subreq: Arc<ReadSubrequest>);

    /// Opens a cache operation for the request, attaching cache resources
    /// via [`ReadRequest::attach_cache`] on success.
    ///
    /// Only [fatal setup errors](ReadError::is_fatal_setup) abort the
    /// entry point; any other failure means the read proceeds uncached.
    fn begin_cache_operation(&self, rreq: &Arc<ReadRequest>) -> ReadResult<()> {
        let _ = rreq;
        Ok(())
    }

    /// Lets the driver enlarge the request window for transport efficiency
    /// via [`ReadRequest::expand_window`].
    fn expand_readahead(&self, rreq: &ReadRequest) {
        let _ = rreq;
    }

    /// Lets the driver shrink a slice to its own I/O size and boundaries.
    ///
    /// Returning `false` abandons the slice.
    fn clamp_length(&self, subreq: &ReadSubrequest) -> bool {
        let _ = subreq;
        true
    }

    /// Whether data read from the cache is still usable.
    fn is_still_valid(&self, rreq: &ReadRequest) -> bool {
        let _ = rreq;
        true
    }

    /// Checks for conflicting writes once the target page is locked.
    ///
    /// Returning [`ReadError::Again`] after unlocking the page causes the
    /// page to be re-acquired.
    fn check_write_begin(
        &self,
        file: Option<&FileToken>,
        pos: u64,
        len: u64,
        page: &Arc<dyn Page>,
        fsdata: &mut Option<FsData>,
    ) -> ReadResult<()> {
        let _ = (file, pos, len, page, fsdata);
        Ok(())
    }

    /// Invoked at the end of page finalization.
    fn done(&self, rreq: &ReadRequest) {
        let _ = rreq;
    }

    /// Releases the driver-private token.
    fn cleanup(&self, mapping: &Arc<dyn Mapping>, token: NetfsPriv) {
        let _ = (mapping, token);
    }

    /// Polled while an entry point is parked; returning an error abandons
    /// the wait without aborting in-flight I/O.
    fn pending_interrupt(&self) -> Option<ReadError> {
        None
    }

    /// Policy for over-reporting terminations.
    fn overrun_policy(&self) -> OverrunPolicy {
        OverrunPolicy::default()
    }

    /// Policy for readahead windows that could not be fully submitted.
    fn short_submission_policy(&self) -> ShortSubmissionPolicy {
        ShortSubmissionPolicy::default()
    }
}

/// Operations the local cache supplies once a cache operation is open.
pub trait CacheOps: Send + Sync + 'static {
    /// Classifies the next slice and may shorten it to a granule boundary.
    ///
    /// May tag the slice for write-back via
    /// [`ReadSubrequest::set_write_to_cache`] when the cache wants a copy
    /// of data the server is about to supply.
    fn prepare_read(&self, subreq: &ReadSubrequest, i_size: u64) -> ReadSource;

    /// Lets the cache widen the window to storage-friendly boundaries.
    fn expand_readahead(&self, start: &mut u64, len: &mut u64, i_size: u64) {
        let _ = (start, len, i_size);
    }

    /// Reads cached data at `pos` into `buffer`.
    ///
    /// With `seek_data` set the read starts at the next data extent. The
    /// terminator must be invoked exactly once.
    fn read(&self, pos: u64, buffer: PageBuffer, seek_data: bool, terminator: Terminator);

    /// Writes `buffer` to the cache at `pos`, invoking the terminator
    /// exactly once.
    fn write(&self, pos: u64, buffer: PageBuffer, terminator: Terminator);

    /// Closes the cache operation; called once when the request is freed.
    fn end_operation(&self) {}
}
