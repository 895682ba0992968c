//! crates/readpath/src/error.rs
//!
//! Error types for the read-path helper.

use std::io;

use thiserror::Error;

/// Result type for read-path operations.
pub type ReadResult<T> = Result<T, ReadError>;

/// Errors surfaced by the read-path helper and its collaborating drivers.
///
/// The set mirrors the error vocabulary of the read path: setup failures,
/// park-point cancellation, data-source failures, and the stale-object and
/// no-progress conditions the aggregator raises itself. Driver failures
/// that do not fit a named condition travel as [`ReadError::Driver`] so the
/// stored value stays cheap to copy between completion contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadError {
    /// A required allocation or reservation could not be satisfied.
    #[error("out of memory")]
    OutOfMemory,
    /// The caller was interrupted while parked at an entry point.
    #[error("interrupted")]
    Interrupted,
    /// The caller was interrupted and the call should be restarted.
    #[error("interrupted, restart the call")]
    Restart,
    /// The operation should be retried from scratch (page re-acquisition).
    #[error("retry the operation")]
    Again,
    /// A source made no progress twice in a row.
    #[error("no data could be transferred")]
    NoData,
    /// Cached data no longer matches the server's view of the object.
    #[error("cached data is stale")]
    Stale,
    /// Generic I/O failure with no more specific cause.
    #[error("I/O error")]
    Io,
    /// A failure reported by a source driver.
    #[error("driver error: {0:?}")]
    Driver(io::ErrorKind),
}

impl ReadError {
    /// Whether a setup-phase failure must abort the entry point.
    ///
    /// Only memory pressure and caller interruption are fatal when
    /// beginning a cache operation; anything else means "carry on without
    /// the cache".
    #[must_use]
    pub const fn is_fatal_setup(self) -> bool {
        matches!(self, Self::OutOfMemory | Self::Interrupted | Self::Restart)
    }
}

impl From<io::Error> for ReadError {
    fn from(err: io::Error) -> Self {
        Self::Driver(err.kind())
    }
}
