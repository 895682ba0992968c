//! crates/test-support/src/cache.rs
//!
//! A local cache whose classifications and outcomes are scripted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use readpath::{CacheOps, PageBuffer, ReadError, ReadSource, ReadSubrequest, Terminator};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pattern byte the scripted cache serves on reads.
pub const CACHE_FILL: u8 = b'C';

/// One scripted answer to `prepare_read`.
#[derive(Debug, Clone, Copy)]
pub struct PrepareAction {
    /// The source to classify the slice as.
    pub source: ReadSource,
    /// Shortens the slice to at most this many bytes.
    pub limit: Option<u64>,
    /// Tags the slice so downloaded data is written back to the cache.
    pub write_to_cache: bool,
}

impl PrepareAction {
    /// Serve the slice from the cache.
    pub const fn cache() -> Self {
        Self {
            source: ReadSource::ReadFromCache,
            limit: None,
            write_to_cache: false,
        }
    }

    /// Serve at most `limit` bytes from the cache.
    pub const fn cache_limited(limit: u64) -> Self {
        Self {
            source: ReadSource::ReadFromCache,
            limit: Some(limit),
            write_to_cache: false,
        }
    }

    /// Send the slice to the server, without keeping a copy.
    pub const fn server() -> Self {
        Self {
            source: ReadSource::DownloadFromServer,
            limit: None,
            write_to_cache: false,
        }
    }

    /// Send the slice to the server and write the result back.
    pub const fn server_cached() -> Self {
        Self {
            source: ReadSource::DownloadFromServer,
            limit: None,
            write_to_cache: true,
        }
    }

    /// Send at most `limit` bytes to the server and write the result back.
    pub const fn server_cached_limited(limit: u64) -> Self {
        Self {
            source: ReadSource::DownloadFromServer,
            limit: Some(limit),
            write_to_cache: true,
        }
    }

    /// Classify the slice as beyond-EOF zero fill.
    pub const fn zeroes() -> Self {
        Self {
            source: ReadSource::FillWithZeroes,
            limit: None,
            write_to_cache: false,
        }
    }

    /// Refuse to classify the slice.
    pub const fn invalid() -> Self {
        Self {
            source: ReadSource::Invalid,
            limit: None,
            write_to_cache: false,
        }
    }
}

/// What the scripted cache does with one read dispatch.
#[derive(Debug, Clone, Copy)]
pub enum CacheReadAction {
    /// Fill the whole window and report it transferred.
    CompleteAll,
    /// Fill and report `n` bytes.
    Complete(u64),
    /// Report a failure.
    Fail(ReadError),
}

/// One write the cache received, with the data as it stood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// Absolute byte position of the write.
    pub pos: u64,
    /// Write length in bytes.
    pub len: u64,
    /// The bytes handed over.
    pub data: Vec<u8>,
}

/// A [`CacheOps`] implementation driven by scripted answers.
///
/// Unscripted `prepare_read` calls fall back to the helper's cacheless
/// classification (zero fill beyond the EOF, server otherwise);
/// unscripted reads and writes succeed in full.
pub struct ScriptedCache {
    prepare: Mutex<VecDeque<PrepareAction>>,
    reads: Mutex<VecDeque<CacheReadAction>>,
    writes: Mutex<VecDeque<Result<(), ReadError>>>,
    read_log: Mutex<Vec<(u64, u64, bool)>>,
    write_log: Mutex<Vec<WriteRecord>>,
    granule: Mutex<Option<u64>>,
    end_calls: AtomicUsize,
}

impl ScriptedCache {
    /// A cache with an empty script.
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            prepare: Mutex::new(VecDeque::new()),
            reads: Mutex::new(VecDeque::new()),
            writes: Mutex::new(VecDeque::new()),
            read_log: Mutex::new(Vec::new()),
            write_log: Mutex::new(Vec::new()),
            granule: Mutex::new(None),
            end_calls: AtomicUsize::new(0),
        })
    }

    /// Queues the next `prepare_read` answer.
    pub fn push_prepare(&self, action: PrepareAction) {
        lock(&self.prepare).push_back(action);
    }

    /// Queues the next read outcome.
    pub fn push_read(&self, action: CacheReadAction) {
        lock(&self.reads).push_back(action);
    }

    /// Queues the next write outcome.
    pub fn push_write(&self, outcome: Result<(), ReadError>) {
        lock(&self.writes).push_back(outcome);
    }

    /// Rounds readahead windows to multiples of `granule` bytes.
    pub fn set_granule(&self, granule: u64) {
        *lock(&self.granule) = Some(granule);
    }

    /// The `(position, length, seek_data)` of every read, in order.
    pub fn read_log(&self) -> Vec<(u64, u64, bool)> {
        lock(&self.read_log).clone()
    }

    /// Every write received, in order.
    pub fn write_log(&self) -> Vec<WriteRecord> {
        lock(&self.write_log).clone()
    }

    /// How often `end_operation` ran.
    pub fn end_calls(&self) -> usize {
        self.end_calls.load(Ordering::SeqCst)
    }
}

impl CacheOps for ScriptedCache {
    fn prepare_read(&self, subreq: &ReadSubrequest, i_size: u64) -> ReadSource {
        let action = lock(&self.prepare).pop_front().unwrap_or_else(|| {
            if subreq.start() >= i_size {
                PrepareAction::zeroes()
            } else {
                PrepareAction::server()
            }
        });
        if let Some(limit) = action.limit {
            if subreq.len() > limit {
                subreq.set_len(limit);
            }
        }
        if action.write_to_cache {
            subreq.set_write_to_cache();
        }
        action.source
    }

    fn expand_readahead(&self, start: &mut u64, len: &mut u64, _i_size: u64) {
        if let Some(granule) = *lock(&self.granule) {
            let end = (*start + *len).div_ceil(granule) * granule;
            *start = *start / granule * granule;
            *len = end - *start;
        }
    }

    fn read(&self, pos: u64, buffer: PageBuffer, seek_data: bool, terminator: Terminator) {
        lock(&self.read_log).push((pos, buffer.len(), seek_data));
        let action = lock(&self.reads)
            .pop_front()
            .unwrap_or(CacheReadAction::CompleteAll);
        match action {
            CacheReadAction::CompleteAll => {
                let n = buffer.len();
                buffer.write(0, &vec![CACHE_FILL; n as usize]);
                terminator(Ok(n));
            }
            CacheReadAction::Complete(n) => {
                let n = n.min(buffer.len());
                buffer.write(0, &vec![CACHE_FILL; n as usize]);
                terminator(Ok(n));
            }
            CacheReadAction::Fail(err) => terminator(Err(err)),
        }
    }

    fn write(&self, pos: u64, buffer: PageBuffer, terminator: Terminator) {
        let len = buffer.len();
        let mut data = vec![0; len as usize];
        buffer.read(0, &mut data);
        lock(&self.write_log).push(WriteRecord { pos, len, data });
        match lock(&self.writes).pop_front().unwrap_or(Ok(())) {
            Ok(()) => terminator(Ok(len)),
            Err(err) => terminator(Err(err)),
        }
    }

    fn end_operation(&self) {
        self.end_calls.fetch_add(1, Ordering::SeqCst);
    }
}
