//! crates/readpath/src/workqueue.rs
//!
//! Shared worker threads and the restricted-context marker.
//!
//! Completion callbacks may arrive on threads that must not block or run
//! destructive work: an I/O reactor, a timer wheel, anything resembling
//! soft-interrupt context. Drivers mark such threads with
//! [`restricted::enter`]; the helper's run-or-defer sites consult the
//! marker and punt work here instead of running it inline. The queue is
//! the analogue of an unbound system work queue: lazily started, shared by
//! every request in the process, serviced by a pair of named threads.

use std::cell::Cell;
use std::sync::OnceLock;
use std::thread;

use crossbeam_channel::{Sender, unbounded};

type Job = Box<dyn FnOnce() + Send + 'static>;

const WORKERS: usize = 2;

fn queue() -> &'static Sender<Job> {
    static QUEUE: OnceLock<Sender<Job>> = OnceLock::new();
    QUEUE.get_or_init(|| {
        let (tx, rx) = unbounded::<Job>();
        for id in 0..WORKERS {
            let rx = rx.clone();
            let builder = thread::Builder::new().name(format!("readpath-wq-{id}"));
            builder
                .spawn(move || {
                    for job in rx {
                        job();
                    }
                })
                .unwrap_or_else(|err| panic!("failed to start worker thread: {err}"));
        }
        tx
    })
}

/// Queues `job` on the shared workers.
pub(crate) fn spawn<F>(job: F)
where
    F: FnOnce() + Send + 'static,
{
    // The receiver lives for the process; send only fails if every worker
    // died, which a panic in a job cannot cause (jobs run before the loop
    // polls again and panics unwind the thread, not the channel).
    queue()
        .send(Box::new(job))
        .unwrap_or_else(|_| panic!("read-path worker queue disconnected"));
}

thread_local! {
    static RESTRICTED: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn in_restricted_context() -> bool {
    RESTRICTED.with(Cell::get)
}

/// Marking of restricted completion contexts.
pub mod restricted {
    use super::RESTRICTED;

    /// RAII marker for a restricted completion context.
    ///
    /// While a guard is live on a thread, the helper defers finalization,
    /// re-dispatch, cache write-back, and teardown callbacks triggered
    /// from that thread to the shared workers. Guards nest.
    #[derive(Debug)]
    pub struct Guard {
        previous: bool,
    }

    /// Marks the current thread as a restricted completion context.
    #[must_use]
    pub fn enter() -> Guard {
        let previous = RESTRICTED.with(|cell| cell.replace(true));
        Guard { previous }
    }

    impl Drop for Guard {
        fn drop(&mut self) {
            let previous = self.previous;
            RESTRICTED.with(|cell| cell.set(previous));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn spawned_jobs_run() {
        let (tx, rx) = mpsc::channel();
        spawn(move || {
            tx.send(42).expect("receiver alive");
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(42));
    }

    #[test]
    fn jobs_run_outside_restricted_context() {
        let (tx, rx) = mpsc::channel();
        let _guard = restricted::enter();
        spawn(move || {
            tx.send(in_restricted_context()).expect("receiver alive");
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(false));
    }

    #[test]
    fn restricted_marker_is_scoped() {
        assert!(!in_restricted_context());
        {
            let _guard = restricted::enter();
            assert!(in_restricted_context());
            {
                let _inner = restricted::enter();
                assert!(in_restricted_context());
            }
            assert!(in_restricted_context());
        }
        assert!(!in_restricted_context());
    }

    #[test]
    fn many_jobs_all_complete() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(()).expect("receiver alive");
            });
        }
        for _ in 0..64 {
            rx.recv_timeout(Duration::from_secs(5)).expect("job ran");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }
}
