//! crates/test-support/src/pagecache.rs
//!
//! An in-memory page collection with observable page state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use readpath::{FileToken, Mapping, PAGE_SIZE, Page, ReadError, ReadResult, ReadaheadControl};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One page-cache entry; covers several base pages when created huge.
pub struct TestPage {
    index: u64,
    nr_pages: u64,
    data: Mutex<Vec<u8>>,
    locked: AtomicBool,
    uptodate: AtomicBool,
    fscache: Mutex<bool>,
    fscache_waiters: Condvar,
    unlock_calls: AtomicUsize,
    fscache_end_calls: AtomicUsize,
}

impl TestPage {
    fn new(index: u64, nr_pages: u64, locked: bool) -> Arc<Self> {
        Arc::new(Self {
            index,
            nr_pages,
            data: Mutex::new(vec![0; (nr_pages * PAGE_SIZE) as usize]),
            locked: AtomicBool::new(locked),
            uptodate: AtomicBool::new(false),
            fscache: Mutex::new(false),
            fscache_waiters: Condvar::new(),
            unlock_calls: AtomicUsize::new(0),
            fscache_end_calls: AtomicUsize::new(0),
        })
    }

    /// Whether the page is currently locked.
    pub fn locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    fn lock_page(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    /// Bytes currently stored in the page.
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.data).clone()
    }

    /// How often the page was unlocked.
    pub fn unlock_calls(&self) -> usize {
        self.unlock_calls.load(Ordering::SeqCst)
    }

    /// How often the write-back marker was cleared.
    pub fn fscache_end_calls(&self) -> usize {
        self.fscache_end_calls.load(Ordering::SeqCst)
    }

    fn byte_range(&self) -> (u64, u64) {
        let start = self.index * PAGE_SIZE;
        (start, start + self.nr_pages * PAGE_SIZE)
    }

    fn covers(&self, index: u64) -> bool {
        index >= self.index && index < self.index + self.nr_pages
    }
}

impl Page for TestPage {
    fn index(&self) -> u64 {
        self.index
    }

    fn len(&self) -> u64 {
        self.nr_pages * PAGE_SIZE
    }

    fn is_uptodate(&self) -> bool {
        self.uptodate.load(Ordering::SeqCst)
    }

    fn mark_uptodate(&self) {
        self.uptodate.store(true, Ordering::SeqCst);
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
        self.unlock_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn set_fscache(&self) {
        *lock(&self.fscache) = true;
    }

    fn end_fscache(&self) {
        *lock(&self.fscache) = false;
        self.fscache_end_calls.fetch_add(1, Ordering::SeqCst);
        self.fscache_waiters.notify_all();
    }

    fn is_fscache(&self) -> bool {
        *lock(&self.fscache)
    }

    fn wait_for_fscache(&self) {
        let mut marked = lock(&self.fscache);
        while *marked {
            marked = self
                .fscache_waiters
                .wait(marked)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl std::fmt::Debug for TestPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestPage")
            .field("index", &self.index)
            .field("nr_pages", &self.nr_pages)
            .field("locked", &self.locked())
            .field("uptodate", &self.is_uptodate())
            .field("fscache", &self.is_fscache())
            .finish()
    }
}

/// A file's page collection held entirely in memory.
pub struct InMemoryMapping {
    file_size: AtomicU64,
    pages: Mutex<BTreeMap<u64, Arc<TestPage>>>,
    fail_next_grab: AtomicBool,
}

impl InMemoryMapping {
    /// Creates an empty mapping for a file of `file_size` bytes.
    pub fn new(file_size: u64) -> Arc<Self> {
        Arc::new(Self {
            file_size: AtomicU64::new(file_size),
            pages: Mutex::new(BTreeMap::new()),
            fail_next_grab: AtomicBool::new(false),
        })
    }

    /// Creates `count` locked single pages starting at `first_index`,
    /// as the readahead machinery would before calling the helper.
    /// Indices already covered by a page (huge or not) are left alone.
    pub fn stage_pages(&self, first_index: u64, count: u64) {
        let mut pages = lock(&self.pages);
        for index in first_index..first_index + count {
            if pages.values().any(|page| page.covers(index)) {
                continue;
            }
            pages.insert(index, TestPage::new(index, 1, true));
        }
    }

    /// Creates one locked huge page of `nr_pages` base pages.
    pub fn stage_huge_page(&self, first_index: u64, nr_pages: u64) {
        lock(&self.pages)
            .entry(first_index)
            .or_insert_with(|| TestPage::new(first_index, nr_pages, true));
    }

    /// Looks up the page covering `index`.
    pub fn page(&self, index: u64) -> Option<Arc<TestPage>> {
        lock(&self.pages)
            .values()
            .find(|page| page.covers(index))
            .cloned()
    }

    /// Makes the next `grab_page` fail with `OutOfMemory`.
    pub fn fail_next_grab(&self) {
        self.fail_next_grab.store(true, Ordering::SeqCst);
    }

    /// Reads `len` bytes at `pos`, zero-filling holes.
    pub fn slice(&self, pos: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.copy_out(pos, &mut buf);
        buf
    }

    fn overlapping(&self, start: u64, end: u64) -> Vec<Arc<TestPage>> {
        lock(&self.pages)
            .values()
            .filter(|page| {
                let (pg_start, pg_end) = page.byte_range();
                pg_start < end && pg_end > start
            })
            .cloned()
            .collect()
    }
}

impl Mapping for InMemoryMapping {
    fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::SeqCst)
    }

    fn pages(&self, first_index: u64, last_index: u64) -> Vec<Arc<dyn Page>> {
        lock(&self.pages)
            .values()
            .filter(|page| page.index <= last_index && page.index + page.nr_pages > first_index)
            .map(|page| Arc::clone(page) as Arc<dyn Page>)
            .collect()
    }

    fn grab_page(&self, index: u64) -> ReadResult<Arc<dyn Page>> {
        if self.fail_next_grab.swap(false, Ordering::SeqCst) {
            return Err(ReadError::OutOfMemory);
        }
        if let Some(page) = self.page(index) {
            page.lock_page();
            return Ok(page);
        }
        let page = TestPage::new(index, 1, true);
        lock(&self.pages).insert(index, Arc::clone(&page));
        Ok(page)
    }

    fn expand_readahead(&self, start: u64, len: u64) -> (u64, u64) {
        if len > 0 {
            let first = start / PAGE_SIZE;
            let last = (start + len - 1) / PAGE_SIZE;
            self.stage_pages(first, last - first + 1);
        }
        (start, len)
    }

    fn copy_in(&self, pos: u64, data: &[u8]) -> u64 {
        let end = pos + data.len() as u64;
        let mut copied = 0;
        for page in self.overlapping(pos, end) {
            let (pg_start, pg_end) = page.byte_range();
            let from = pos.max(pg_start);
            let to = end.min(pg_end);
            let mut stored = lock(&page.data);
            stored[(from - pg_start) as usize..(to - pg_start) as usize]
                .copy_from_slice(&data[(from - pos) as usize..(to - pos) as usize]);
            copied += to - from;
        }
        copied
    }

    fn copy_out(&self, pos: u64, buf: &mut [u8]) -> u64 {
        let end = pos + buf.len() as u64;
        let mut copied = 0;
        for page in self.overlapping(pos, end) {
            let (pg_start, pg_end) = page.byte_range();
            let from = pos.max(pg_start);
            let to = end.min(pg_end);
            let stored = lock(&page.data);
            buf[(from - pos) as usize..(to - pos) as usize]
                .copy_from_slice(&stored[(from - pg_start) as usize..(to - pg_start) as usize]);
            copied += to - from;
        }
        copied
    }

    fn zero(&self, pos: u64, len: u64) {
        let end = pos + len;
        for page in self.overlapping(pos, end) {
            let (pg_start, pg_end) = page.byte_range();
            let from = pos.max(pg_start);
            let to = end.min(pg_end);
            let mut stored = lock(&page.data);
            stored[(from - pg_start) as usize..(to - pg_start) as usize].fill(0);
        }
    }
}

impl std::fmt::Debug for InMemoryMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryMapping")
            .field("file_size", &self.file_size())
            .field("pages", &lock(&self.pages).len())
            .finish()
    }
}

/// A readahead window over an [`InMemoryMapping`].
pub struct RactlSim {
    mapping: Arc<InMemoryMapping>,
    pos: u64,
    len: u64,
    released: bool,
    file: Option<Arc<FileToken>>,
}

impl RactlSim {
    /// Creates a window of `len` bytes at `pos`, staging locked pages.
    pub fn new(mapping: &Arc<InMemoryMapping>, pos: u64, len: u64) -> Self {
        if len > 0 {
            let first = pos / PAGE_SIZE;
            let last = (pos + len - 1) / PAGE_SIZE;
            mapping.stage_pages(first, last - first + 1);
        }
        Self {
            mapping: Arc::clone(mapping),
            pos,
            len,
            released: false,
            file: None,
        }
    }

    /// Attaches an open-file token handed through to the driver.
    pub fn with_file(mut self, file: Arc<FileToken>) -> Self {
        self.file = Some(file);
        self
    }

    /// Whether the helper released the window's page references.
    pub fn released(&self) -> bool {
        self.released
    }
}

impl ReadaheadControl for RactlSim {
    fn mapping(&self) -> Arc<dyn Mapping> {
        Arc::clone(&self.mapping) as Arc<dyn Mapping>
    }

    fn file(&self) -> Option<&FileToken> {
        self.file.as_deref()
    }

    fn pos(&self) -> u64 {
        self.pos
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn expand(&mut self, start: u64, len: u64) {
        let (granted_start, granted_len) = self.mapping.expand_readahead(start, len);
        self.pos = granted_start;
        self.len = granted_len;
    }

    fn release_pages(&mut self) {
        self.released = true;
    }
}
