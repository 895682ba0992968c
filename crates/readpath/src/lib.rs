#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `readpath` is the read side of a network filesystem: a helper that
//! sits between a page cache and a filesystem driver, optionally
//! interposing a local disk cache. A request for a page-aligned byte
//! range is sliced into subrequests, each routed to whichever source can
//! supply it (the local cache, the network server, or implicit zero-fill
//! beyond the end of file), and the results are reassembled into the
//! requesting pages. Data downloaded from the server is opportunistically
//! written back to the local cache afterwards.
//!
//! Three entry points funnel into one construct: [`readahead`] for
//! speculative windows, [`readpage`] for a single demand fault, and
//! [`write_begin`] to preload the bytes a partial page write will
//! overlay. The driver supplies a [`NetfsOps`] table; an attached cache
//! supplies [`CacheOps`].
//!
//! # Design
//!
//! - Completion is edge-triggered and counter-serialised: each dispatch
//!   bumps an in-flight counter, each termination drops it, and exactly
//!   one context observes the fall to zero and with it inherits the right
//!   to assess the request. Coordinators hold an extra *anchor* reference
//!   on the counter so no completion can observe zero prematurely.
//! - Sources complete through [`subreq_terminated`], possibly from a
//!   restricted context (an I/O reactor or similar). Drivers mark such
//!   threads with [`restricted::enter`]; destructive follow-up work is
//!   then deferred to a pair of shared worker threads.
//! - Failed cache reads are retried against the server; short reads are
//!   re-driven against the same source; a source that twice transfers
//!   nothing fails the slice with [`ReadError::NoData`].
//!
//! # Invariants
//!
//! - Request windows are page-aligned and subrequests tile
//!   `[start, start + submitted)` contiguously in submission order.
//! - `transferred` never exceeds `len` on any slice, and equals it at
//!   successful completion (possibly via tail clearing).
//! - The page finalizer runs exactly once per request, after all read
//!   I/O has quiesced and before the in-progress flag clears.
//! - Cache write-back issues only page-aligned, non-overlapping writes
//!   at monotonically increasing offsets.

mod completion;
mod entry;
mod error;
mod finalize;
mod flags;
mod mapping;
mod ops;
mod request;
pub mod stats;
mod submit;
mod subrequest;
mod workqueue;
mod writeback;

pub use completion::subreq_terminated;
pub use entry::{ReadaheadControl, readahead, readpage, write_begin};
pub use error::{ReadError, ReadResult};
pub use mapping::{FileToken, Mapping, PAGE_SIZE, Page, PageBuffer};
pub use ops::{
    CacheOps, FsData, NetfsOps, NetfsPriv, OverrunPolicy, ReadSource, ShortSubmissionPolicy,
    Terminator,
};
pub use request::ReadRequest;
pub use subrequest::ReadSubrequest;
pub use workqueue::restricted;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the guard if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
