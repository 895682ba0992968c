#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Scripted fixtures for exercising the read-path helper.
//!
//! The fixtures mirror the helper's three collaborators: an in-memory
//! page collection ([`InMemoryMapping`] / [`TestPage`]), a scripted
//! network filesystem driver ([`ScriptedNetfs`]) whose per-dispatch
//! behaviour is queued up front, and a scripted local cache
//! ([`ScriptedCache`]). A [`RactlSim`] stands in for the page cache's
//! readahead window.

mod cache;
mod netfs;
mod pagecache;

pub use cache::{CACHE_FILL, CacheReadAction, PrepareAction, ScriptedCache, WriteRecord};
pub use netfs::{SERVER_FILL, ScriptedNetfs, ServerAction};
pub use pagecache::{InMemoryMapping, RactlSim, TestPage};

use std::time::{Duration, Instant};

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
