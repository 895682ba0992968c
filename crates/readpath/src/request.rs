//! crates/readpath/src/request.rs
//!
//! The read-request object: one per entry-point invocation.
//!
//! A request is shared between the entry thread, the worker pool, and
//! completion handlers, so all mutable state is atomic or guarded. The
//! subrequest list is only edited in single-owner phases: during the
//! submission loop (while the entry point still holds its anchor) and by
//! whichever context won the final zero transition of an in-flight
//! counter.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use crate::error::{ReadError, ReadResult};
use crate::flags::{Flags, RequestFlag};
use crate::lock;
use crate::mapping::{FileToken, Mapping};
use crate::ops::{CacheOps, NetfsOps, NetfsPriv};
use crate::stats::stats;
use crate::subrequest::ReadSubrequest;
use crate::workqueue;

/// Interval at which a parked entry point re-checks for interruption.
const PARK_POLL: Duration = Duration::from_millis(10);

fn next_debug_id() -> u64 {
    static DEBUG_IDS: AtomicU64 = AtomicU64::new(0);
    DEBUG_IDS.fetch_add(1, Ordering::Relaxed) + 1
}

/// A single logical read covering a contiguous, page-aligned byte range.
///
/// The request owns the byte window, the ordered subrequest list, the two
/// in-flight counters, the driver callback table, and the cache handle.
/// Lifetime is `Arc`-managed: the subrequest list holds one handle per
/// live subrequest and each subrequest holds one back on the request; the
/// cycle is broken by [`clear_subrequests`](Self::clear_subrequests) on
/// every terminal path. Teardown hands the driver token to `cleanup` and
/// closes the cache operation, deferring to a worker when the final
/// handle drops in a restricted completion context.
pub struct ReadRequest {
    mapping: Arc<dyn Mapping>,
    i_size: u64,
    start: AtomicU64,
    len: AtomicU64,
    submitted: AtomicU64,
    error: Mutex<Option<ReadError>>,
    subrequests: Mutex<Vec<Arc<ReadSubrequest>>>,
    pub(crate) flags: Flags<RequestFlag>,
    no_unlock_page: AtomicU64,
    nr_rd_ops: AtomicUsize,
    nr_wr_ops: AtomicUsize,
    park: Mutex<()>,
    parker: Condvar,
    cache: OnceLock<Arc<dyn CacheOps>>,
    ops: Arc<dyn NetfsOps>,
    netfs_priv: Mutex<Option<NetfsPriv>>,
    subreq_counter: AtomicU32,
    debug_id: u64,
}

impl ReadRequest {
    pub(crate) fn new(
        ops: Arc<dyn NetfsOps>,
        mapping: Arc<dyn Mapping>,
        netfs_priv: Option<NetfsPriv>,
        file: Option<&FileToken>,
    ) -> Arc<Self> {
        let i_size = mapping.file_size();
        let rreq = Arc::new(Self {
            mapping,
            i_size,
            start: AtomicU64::new(0),
            len: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            error: Mutex::new(None),
            subrequests: Mutex::new(Vec::new()),
            flags: Flags::new(),
            no_unlock_page: AtomicU64::new(0),
            nr_rd_ops: AtomicUsize::new(0),
            nr_wr_ops: AtomicUsize::new(0),
            park: Mutex::new(()),
            parker: Condvar::new(),
            cache: OnceLock::new(),
            ops,
            netfs_priv: Mutex::new(netfs_priv),
            subreq_counter: AtomicU32::new(0),
            debug_id: next_debug_id(),
        });
        rreq.flags.set(RequestFlag::InProgress);
        stats().rreq.inc();
        rreq.ops.init_request(&rreq, file);
        rreq
    }

    /// The page collection this request reads into.
    #[must_use]
    pub fn mapping(&self) -> &Arc<dyn Mapping> {
        &self.mapping
    }

    pub(crate) fn mapping_arc(&self) -> Arc<dyn Mapping> {
        Arc::clone(&self.mapping)
    }

    /// File size snapshot taken when the request was created.
    #[must_use]
    pub fn i_size(&self) -> u64 {
        self.i_size
    }

    /// Absolute byte position of the window start.
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start.load(Ordering::Acquire)
    }

    /// Window length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Bytes of the window already assigned to subrequests.
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    /// First fatal error surfaced from a non-cache source, if any.
    #[must_use]
    pub fn error(&self) -> Option<ReadError> {
        *lock(&self.error)
    }

    /// Identifier for correlating trace output.
    #[must_use]
    pub fn debug_id(&self) -> u64 {
        self.debug_id
    }

    /// The driver operations table.
    #[must_use]
    pub fn ops(&self) -> &Arc<dyn NetfsOps> {
        &self.ops
    }

    /// Whether finalization has not yet completed.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.flags.test(RequestFlag::InProgress)
    }

    /// Whether a non-retriable failure was recorded.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.flags.test(RequestFlag::Failed)
    }

    /// Whether downloaded data is due to be written to the cache.
    #[must_use]
    pub fn writes_to_cache(&self) -> bool {
        self.flags.test(RequestFlag::WriteToCache)
    }

    /// Attaches cache resources; called by the driver from
    /// `begin_cache_operation`. Only the first attachment takes effect.
    pub fn attach_cache(&self, cache: Arc<dyn CacheOps>) {
        let _ = self.cache.set(cache);
    }

    /// The attached cache resources, if any.
    #[must_use]
    pub fn cache(&self) -> Option<&Arc<dyn CacheOps>> {
        self.cache.get()
    }

    /// Enlarges the window. The proposal must cover the current window;
    /// one that does not is ignored with a warning.
    pub fn expand_window(&self, start: u64, len: u64) {
        let (cur_start, cur_len) = self.window();
        if start > cur_start || start + len < cur_start + cur_len {
            tracing::warn!(
                rreq = self.debug_id,
                start,
                len,
                cur_start,
                cur_len,
                "window proposal does not cover the request, ignored"
            );
            return;
        }
        self.set_window(start, len);
    }

    /// Page index that must stay locked when `NoUnlockPage` is set.
    #[must_use]
    pub fn no_unlock_page(&self) -> u64 {
        self.no_unlock_page.load(Ordering::Acquire)
    }

    pub(crate) fn window(&self) -> (u64, u64) {
        (self.start(), self.len())
    }

    pub(crate) fn set_window(&self, start: u64, len: u64) {
        self.start.store(start, Ordering::Release);
        self.len.store(len, Ordering::Release);
    }

    pub(crate) fn set_no_unlock_page(&self, index: u64) {
        self.no_unlock_page.store(index, Ordering::Release);
        self.flags.set(RequestFlag::NoUnlockPage);
    }

    pub(crate) fn advance_submitted(&self, n: u64) {
        self.submitted.fetch_add(n, Ordering::AcqRel);
    }

    /// Records `err` unless an earlier fatal error already stuck.
    pub(crate) fn set_error_if_unset(&self, err: ReadError) {
        let mut slot = lock(&self.error);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn next_subreq_index(&self) -> u32 {
        self.subreq_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn push_subrequest(&self, subreq: Arc<ReadSubrequest>) {
        lock(&self.subrequests).push(subreq);
    }

    /// Snapshot of the subrequest list in submission order.
    pub(crate) fn subrequests(&self) -> Vec<Arc<ReadSubrequest>> {
        lock(&self.subrequests).clone()
    }

    /// Runs `f` with exclusive access to the subrequest list. Callers must
    /// be the sole owner of the current phase (anchor holder or winner of
    /// the final zero transition).
    pub(crate) fn with_subrequests_mut<R>(&self, f: impl FnOnce(&mut Vec<Arc<ReadSubrequest>>) -> R) -> R {
        f(&mut lock(&self.subrequests))
    }

    /// Empties the subrequest list, dropping the list's handles and with
    /// them the subrequests' back-references to this request.
    pub(crate) fn clear_subrequests(&self) {
        lock(&self.subrequests).clear();
    }

    /// Begins a read phase with the coordinator's anchor in place.
    pub(crate) fn begin_read_phase(&self) {
        self.nr_rd_ops.store(1, Ordering::Release);
    }

    pub(crate) fn inc_rd_ops(&self) {
        self.nr_rd_ops.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the read in-flight count, returning the new value. The
    /// context that observes zero owns the completion action.
    pub(crate) fn dec_rd_ops(&self) -> usize {
        self.nr_rd_ops.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn inc_wr_ops(&self) {
        self.nr_wr_ops.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_wr_ops(&self) -> usize {
        self.nr_wr_ops.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Wakes an entry point parked on the read in-flight count.
    pub(crate) fn wake_ops_waiters(&self) {
        let _guard = lock(&self.park);
        self.parker.notify_all();
    }

    /// Parks until only the caller's anchor remains in flight, polling the
    /// driver's interrupt hook.
    pub(crate) fn wait_until_anchored(&self) -> ReadResult<()> {
        let mut guard = lock(&self.park);
        loop {
            if self.nr_rd_ops.load(Ordering::Acquire) == 1 {
                return Ok(());
            }
            if let Some(err) = self.ops.pending_interrupt() {
                return Err(err);
            }
            let (next, _timeout) = self
                .parker
                .wait_timeout(guard, PARK_POLL)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard = next;
        }
    }
}

impl Drop for ReadRequest {
    fn drop(&mut self) {
        tracing::trace!(rreq = self.debug_id, "rreq free");
        let token = lock(&self.netfs_priv).take();
        let cache = self.cache.take();
        if token.is_some() || cache.is_some() {
            let ops = Arc::clone(&self.ops);
            let mapping = Arc::clone(&self.mapping);
            let teardown = move || {
                if let Some(token) = token {
                    ops.cleanup(&mapping, token);
                }
                if let Some(cache) = cache {
                    cache.end_operation();
                }
            };
            if workqueue::in_restricted_context() {
                workqueue::spawn(teardown);
            } else {
                teardown();
            }
        }
        stats().rreq.dec();
    }
}

impl std::fmt::Debug for ReadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadRequest")
            .field("debug_id", &self.debug_id)
            .field("start", &self.start())
            .field("len", &self.len())
            .field("submitted", &self.submitted())
            .field("i_size", &self.i_size)
            .field("error", &self.error())
            .field("flags", &format_args!("{:#x}", self.flags.raw()))
            .finish_non_exhaustive()
    }
}
