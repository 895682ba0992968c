//! crates/test-support/src/netfs.rs
//!
//! A network-filesystem driver whose behaviour is scripted per dispatch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use readpath::{
    FileToken, FsData, Mapping, NetfsOps, NetfsPriv, OverrunPolicy, Page, ReadError, ReadRequest,
    ReadResult, ReadSubrequest, ShortSubmissionPolicy, restricted, subreq_terminated,
};

use crate::cache::ScriptedCache;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pattern byte the scripted server writes into the pages.
pub const SERVER_FILL: u8 = b'S';

/// What the scripted server does with one issued subrequest.
#[derive(Debug)]
pub enum ServerAction {
    /// Fill the remaining window and report it all transferred.
    CompleteAll,
    /// Fill and report `n` bytes.
    Complete(u64),
    /// Mark the slice clear-tail, then fill and report `n` bytes.
    ClearTailAfter(u64),
    /// Report `n` bytes without writing more than the window holds.
    OverReport(u64),
    /// Report a failure.
    Fail(ReadError),
    /// Park the subrequest for the test to terminate by hand.
    Hold,
    /// Run the inner action on a spawned thread, optionally marked as a
    /// restricted completion context.
    Threaded {
        /// The action to run on the thread.
        action: Box<ServerAction>,
        /// Whether the thread enters a restricted context first.
        restricted: bool,
    },
}

/// A [`NetfsOps`] implementation driven by a queue of [`ServerAction`]s.
///
/// With an empty queue every dispatch completes in full, inline. Each
/// call site the helper may invoke is observable through a counter or a
/// log.
pub struct ScriptedNetfs {
    actions: Mutex<VecDeque<ServerAction>>,
    issued: Mutex<Vec<(u64, u64)>>,
    held: Arc<Mutex<Vec<Arc<ReadSubrequest>>>>,
    cache: Mutex<Option<Arc<ScriptedCache>>>,
    cache_enabled: AtomicBool,
    begin_cache_error: Mutex<Option<ReadError>>,
    expand_to: Mutex<Option<(u64, u64)>>,
    clamp_max: Mutex<Option<u64>>,
    clamp_calls: AtomicUsize,
    clamp_fail_on: Mutex<Option<usize>>,
    valid: AtomicBool,
    interrupt: Mutex<Option<ReadError>>,
    check_write_begin: Mutex<VecDeque<ReadResult<()>>>,
    overrun_policy: Mutex<OverrunPolicy>,
    short_submission: Mutex<ShortSubmissionPolicy>,
    init_calls: AtomicUsize,
    cleanup_calls: AtomicUsize,
    done_calls: AtomicUsize,
}

impl ScriptedNetfs {
    /// A driver with an empty script: every read completes in full.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            actions: Mutex::new(VecDeque::new()),
            issued: Mutex::new(Vec::new()),
            held: Arc::new(Mutex::new(Vec::new())),
            cache: Mutex::new(None),
            cache_enabled: AtomicBool::new(false),
            begin_cache_error: Mutex::new(None),
            expand_to: Mutex::new(None),
            clamp_max: Mutex::new(None),
            clamp_calls: AtomicUsize::new(0),
            clamp_fail_on: Mutex::new(None),
            valid: AtomicBool::new(true),
            interrupt: Mutex::new(None),
            check_write_begin: Mutex::new(VecDeque::new()),
            overrun_policy: Mutex::new(OverrunPolicy::default()),
            short_submission: Mutex::new(ShortSubmissionPolicy::default()),
            init_calls: AtomicUsize::new(0),
            cleanup_calls: AtomicUsize::new(0),
            done_calls: AtomicUsize::new(0),
        })
    }

    /// Queues the next server action.
    pub fn push_action(&self, action: ServerAction) {
        lock(&self.actions).push_back(action);
    }

    /// Makes `begin_cache_operation` attach this cache.
    pub fn attach_cache(&self, cache: &Arc<ScriptedCache>) {
        *lock(&self.cache) = Some(Arc::clone(cache));
        self.cache_enabled.store(true, Ordering::SeqCst);
    }

    /// Makes `begin_cache_operation` fail with `err`.
    pub fn fail_begin_cache(&self, err: ReadError) {
        *lock(&self.begin_cache_error) = Some(err);
    }

    /// Switches `is_cache_enabled` without attaching cache resources.
    pub fn set_cache_enabled(&self, enabled: bool) {
        self.cache_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Makes `expand_readahead` propose the given window.
    pub fn expand_to(&self, start: u64, len: u64) {
        *lock(&self.expand_to) = Some((start, len));
    }

    /// Caps every slice at `max` bytes via `clamp_length`.
    pub fn clamp_max(&self, max: u64) {
        *lock(&self.clamp_max) = Some(max);
    }

    /// Makes the first `clamp_length` call reject its slice.
    pub fn fail_clamp(&self) {
        self.fail_clamp_on(1);
    }

    /// Makes the `nth` `clamp_length` call (1-based) reject its slice.
    pub fn fail_clamp_on(&self, nth: usize) {
        *lock(&self.clamp_fail_on) = Some(nth);
    }

    /// Makes the next `is_still_valid` check report the object as changed.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    /// Arms the park-point interrupt hook with `err` (one shot).
    pub fn arm_interrupt(&self, err: ReadError) {
        *lock(&self.interrupt) = Some(err);
    }

    /// Queues a result for the next `check_write_begin` call.
    pub fn push_check_write_begin(&self, result: ReadResult<()>) {
        lock(&self.check_write_begin).push_back(result);
    }

    /// Selects the overrun policy the driver reports.
    pub fn set_overrun_policy(&self, policy: OverrunPolicy) {
        *lock(&self.overrun_policy) = policy;
    }

    /// Selects the short-submission policy the driver reports.
    pub fn set_short_submission_policy(&self, policy: ShortSubmissionPolicy) {
        *lock(&self.short_submission) = policy;
    }

    /// The `(position, remaining)` of every issued server read, in order.
    pub fn issued(&self) -> Vec<(u64, u64)> {
        lock(&self.issued).clone()
    }

    /// Takes the subrequests parked by [`ServerAction::Hold`].
    pub fn take_held(&self) -> Vec<Arc<ReadSubrequest>> {
        std::mem::take(&mut *lock(&self.held))
    }

    /// Number of parked subrequests.
    pub fn held_count(&self) -> usize {
        lock(&self.held).len()
    }

    /// How often `init_request` ran.
    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    /// How often `cleanup` ran.
    pub fn cleanup_calls(&self) -> usize {
        self.cleanup_calls.load(Ordering::SeqCst)
    }

    /// How often `done` ran.
    pub fn done_calls(&self) -> usize {
        self.done_calls.load(Ordering::SeqCst)
    }
}

fn run_action(
    held: &Arc<Mutex<Vec<Arc<ReadSubrequest>>>>,
    subreq: Arc<ReadSubrequest>,
    action: ServerAction,
) {
    match action {
        ServerAction::CompleteAll => {
            let buffer = subreq.unread_buffer();
            let n = buffer.len();
            buffer.write(0, &vec![SERVER_FILL; n as usize]);
            subreq_terminated(subreq, Ok(n));
        }
        ServerAction::Complete(n) => {
            let buffer = subreq.unread_buffer();
            let n = n.min(buffer.len());
            buffer.write(0, &vec![SERVER_FILL; n as usize]);
            subreq_terminated(subreq, Ok(n));
        }
        ServerAction::ClearTailAfter(n) => {
            subreq.set_clear_tail();
            let buffer = subreq.unread_buffer();
            let n = n.min(buffer.len());
            buffer.write(0, &vec![SERVER_FILL; n as usize]);
            subreq_terminated(subreq, Ok(n));
        }
        ServerAction::OverReport(n) => {
            let buffer = subreq.unread_buffer();
            let fill = n.min(buffer.len());
            buffer.write(0, &vec![SERVER_FILL; fill as usize]);
            subreq_terminated(subreq, Ok(n));
        }
        ServerAction::Fail(err) => {
            subreq_terminated(subreq, Err(err));
        }
        ServerAction::Hold => {
            lock(held).push(subreq);
        }
        ServerAction::Threaded {
            action,
            restricted: restrict,
        } => {
            let held = Arc::clone(held);
            thread::spawn(move || {
                let _guard = restrict.then(restricted::enter);
                run_action(&held, subreq, *action);
            });
        }
    }
}

impl NetfsOps for ScriptedNetfs {
    fn init_request(&self, _rreq: &ReadRequest, _file: Option<&FileToken>) {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn is_cache_enabled(&self, _mapping: &dyn Mapping) -> bool {
        self.cache_enabled.load(Ordering::SeqCst)
    }

    fn issue_op(&self, subreq: Arc<ReadSubrequest>) {
        lock(&self.issued).push((
            subreq.start() + subreq.transferred(),
            subreq.len() - subreq.transferred(),
        ));
        let action = lock(&self.actions)
            .pop_front()
            .unwrap_or(ServerAction::CompleteAll);
        run_action(&self.held, subreq, action);
    }

    fn begin_cache_operation(&self, rreq: &Arc<ReadRequest>) -> ReadResult<()> {
        if let Some(err) = lock(&self.begin_cache_error).take() {
            return Err(err);
        }
        if let Some(cache) = lock(&self.cache).as_ref() {
            rreq.attach_cache(Arc::clone(cache) as Arc<dyn readpath::CacheOps>);
        }
        Ok(())
    }

    fn expand_readahead(&self, rreq: &ReadRequest) {
        if let Some((start, len)) = *lock(&self.expand_to) {
            rreq.expand_window(start, len);
        }
    }

    fn clamp_length(&self, subreq: &ReadSubrequest) -> bool {
        let call = self.clamp_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if *lock(&self.clamp_fail_on) == Some(call) {
            return false;
        }
        if let Some(max) = *lock(&self.clamp_max) {
            if subreq.len() > max {
                subreq.set_len(max);
            }
        }
        true
    }

    fn is_still_valid(&self, _rreq: &ReadRequest) -> bool {
        self.valid.swap(true, Ordering::SeqCst)
    }

    fn check_write_begin(
        &self,
        _file: Option<&FileToken>,
        _pos: u64,
        _len: u64,
        page: &Arc<dyn Page>,
        _fsdata: &mut Option<FsData>,
    ) -> ReadResult<()> {
        match lock(&self.check_write_begin).pop_front() {
            Some(Err(ReadError::Again)) => {
                page.unlock();
                Err(ReadError::Again)
            }
            Some(result) => result,
            None => Ok(()),
        }
    }

    fn done(&self, _rreq: &ReadRequest) {
        self.done_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn cleanup(&self, _mapping: &Arc<dyn Mapping>, token: NetfsPriv) {
        drop(token);
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn pending_interrupt(&self) -> Option<ReadError> {
        lock(&self.interrupt).take()
    }

    fn overrun_policy(&self) -> OverrunPolicy {
        *lock(&self.overrun_policy)
    }

    fn short_submission_policy(&self) -> ShortSubmissionPolicy {
        *lock(&self.short_submission)
    }
}
