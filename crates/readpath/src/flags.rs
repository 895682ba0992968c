//! crates/readpath/src/flags.rs
//!
//! Typed atomic flag sets for requests and subrequests.
//!
//! The request and subrequest state words are read and written from the
//! caller's thread, the worker pool, and completion contexts, so every
//! operation goes through one atomic word. Call sites name flags through
//! the typed enums below rather than manipulating bits directly.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

/// A flag that can be stored in a [`Flags`] word.
pub(crate) trait FlagBit: Copy {
    /// The single-bit mask for this flag.
    fn bit(self) -> u32;
}

/// Per-request state flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestFlag {
    /// Finalization has not yet completed.
    InProgress,
    /// Some I/O terminated short or failed retriably and needs another pass.
    IncompleteIo,
    /// A non-retriable source failure was recorded.
    Failed,
    /// At least one subrequest carries fresh data the cache wants.
    WriteToCache,
    /// `no_unlock_page` names a page that must stay locked.
    NoUnlockPage,
    /// The finalizer must leave every page locked.
    DontUnlockPages,
}

impl FlagBit for RequestFlag {
    fn bit(self) -> u32 {
        match self {
            Self::InProgress => 1 << 0,
            Self::IncompleteIo => 1 << 1,
            Self::Failed => 1 << 2,
            Self::WriteToCache => 1 << 3,
            Self::NoUnlockPage => 1 << 4,
            Self::DontUnlockPages => 1 << 5,
        }
    }
}

/// Per-subrequest state flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubrequestFlag {
    /// Data read for this slice should be written back to the cache.
    WriteToCache,
    /// The source returned fewer bytes than asked and should be re-driven.
    ShortRead,
    /// The unread tail is to be cleared instead of re-read.
    ClearTail,
    /// A retried cache read should seek to the next data extent.
    SeekDataRead,
    /// The previous termination transferred nothing.
    NoProgress,
}

impl FlagBit for SubrequestFlag {
    fn bit(self) -> u32 {
        match self {
            Self::WriteToCache => 1 << 0,
            Self::ShortRead => 1 << 1,
            Self::ClearTail => 1 << 2,
            Self::SeekDataRead => 1 << 3,
            Self::NoProgress => 1 << 4,
        }
    }
}

/// An atomic word of typed flags.
#[derive(Debug, Default)]
pub(crate) struct Flags<F> {
    bits: AtomicU32,
    _marker: PhantomData<F>,
}

impl<F: FlagBit> Flags<F> {
    pub(crate) fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
            _marker: PhantomData,
        }
    }

    pub(crate) fn set(&self, flag: F) {
        self.bits.fetch_or(flag.bit(), Ordering::AcqRel);
    }

    pub(crate) fn clear(&self, flag: F) {
        self.bits.fetch_and(!flag.bit(), Ordering::AcqRel);
    }

    pub(crate) fn test(&self, flag: F) -> bool {
        self.bits.load(Ordering::Acquire) & flag.bit() != 0
    }

    /// Sets the flag and reports whether it was already set.
    pub(crate) fn test_and_set(&self, flag: F) -> bool {
        self.bits.fetch_or(flag.bit(), Ordering::AcqRel) & flag.bit() != 0
    }

    /// Raw word for trace output.
    pub(crate) fn raw(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_flag_bits_are_distinct() {
        let all = [
            RequestFlag::InProgress,
            RequestFlag::IncompleteIo,
            RequestFlag::Failed,
            RequestFlag::WriteToCache,
            RequestFlag::NoUnlockPage,
            RequestFlag::DontUnlockPages,
        ];
        let mut seen = 0u32;
        for flag in all {
            assert_eq!(seen & flag.bit(), 0, "overlapping bit for {flag:?}");
            seen |= flag.bit();
        }
    }

    #[test]
    fn subrequest_flag_bits_are_distinct() {
        let all = [
            SubrequestFlag::WriteToCache,
            SubrequestFlag::ShortRead,
            SubrequestFlag::ClearTail,
            SubrequestFlag::SeekDataRead,
            SubrequestFlag::NoProgress,
        ];
        let mut seen = 0u32;
        for flag in all {
            assert_eq!(seen & flag.bit(), 0, "overlapping bit for {flag:?}");
            seen |= flag.bit();
        }
    }

    #[test]
    fn set_test_clear_cycle() {
        let flags: Flags<RequestFlag> = Flags::new();
        assert!(!flags.test(RequestFlag::Failed));

        flags.set(RequestFlag::Failed);
        assert!(flags.test(RequestFlag::Failed));
        assert!(!flags.test(RequestFlag::InProgress));

        flags.clear(RequestFlag::Failed);
        assert!(!flags.test(RequestFlag::Failed));
    }

    #[test]
    fn test_and_set_reports_previous_state() {
        let flags: Flags<SubrequestFlag> = Flags::new();
        assert!(!flags.test_and_set(SubrequestFlag::NoProgress));
        assert!(flags.test_and_set(SubrequestFlag::NoProgress));
    }

    #[test]
    fn clear_leaves_other_flags_alone() {
        let flags: Flags<RequestFlag> = Flags::new();
        flags.set(RequestFlag::IncompleteIo);
        flags.set(RequestFlag::WriteToCache);

        flags.clear(RequestFlag::IncompleteIo);

        assert!(!flags.test(RequestFlag::IncompleteIo));
        assert!(flags.test(RequestFlag::WriteToCache));
    }
}
