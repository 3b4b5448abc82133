//! Fixed set of pollers, one wait thread each, picked round-robin.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use tracing::warn;

use crate::poll::Poller;
use crate::sys;

static GLOBAL: OnceLock<PollManager> = OnceLock::new();
static GLOBAL_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Size the shared manager before first use. 0 keeps the default (number
/// of CPUs). Has no effect once the manager exists.
pub fn setup(pollers: usize) {
    GLOBAL_SIZE.store(pollers, Ordering::Relaxed);
}

/// The process-wide poll manager, created on first use.
///
/// Poller creation failure at startup is not recoverable by callers, so it
/// panics rather than threading an error through every registration site.
pub fn global() -> &'static PollManager {
    GLOBAL.get_or_init(|| {
        let size = GLOBAL_SIZE.load(Ordering::Relaxed);
        PollManager::new(size).expect("failed to create pollers")
    })
}

/// Owns `n` pollers and their dedicated wait threads.
pub struct PollManager {
    polls: Vec<Arc<Poller>>,
    next: AtomicUsize,
}

impl PollManager {
    /// Create `n` pollers (0 = number of CPUs, minimum 1), each with its
    /// own named wait thread.
    pub fn new(n: usize) -> io::Result<PollManager> {
        let n = if n == 0 { sys::num_cpus() } else { n };
        let mut polls = Vec::with_capacity(n);
        for i in 0..n {
            let poller = Poller::open()?;
            let runner = poller.clone();
            thread::Builder::new()
                .name(format!("nexio-poll-{i}"))
                .spawn(move || {
                    if let Err(e) = runner.wait() {
                        warn!(error = %e, "poller wait loop exited with error");
                    }
                })?;
            polls.push(poller);
        }
        Ok(PollManager { polls, next: AtomicUsize::new(0) })
    }

    /// Round-robin pick of a poller for a new fd.
    pub fn pick(&self) -> &Arc<Poller> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.polls.len();
        &self.polls[idx]
    }

    /// Number of pollers.
    pub fn len(&self) -> usize {
        self.polls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polls.is_empty()
    }

    /// Signal every poller to exit its wait loop. Used by tests; the
    /// shared manager normally lives for the process lifetime.
    pub fn close(&self) {
        for poll in &self.polls {
            let _ = poll.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_round_robins() {
        let mgr = PollManager::new(3).unwrap();
        let a = Arc::as_ptr(mgr.pick());
        let b = Arc::as_ptr(mgr.pick());
        let c = Arc::as_ptr(mgr.pick());
        let a2 = Arc::as_ptr(mgr.pick());
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a, a2);
        mgr.close();
    }

    #[test]
    fn zero_means_at_least_one() {
        let mgr = PollManager::new(0).unwrap();
        assert!(mgr.len() >= 1);
        mgr.close();
    }
}
