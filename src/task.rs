//! Shared background task pool.
//!
//! Hangup callbacks and request pumps run here instead of on the poller
//! threads. Workers are spawned on demand up to a cap and retire after
//! sitting idle, so a burst of slow handlers grows the pool and a quiet
//! process keeps no threads alive.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

const DEFAULT_MAX_THREADS: usize = 256;
const IDLE_RETIRE: Duration = Duration::from_secs(30);

static POOL: OnceLock<TaskPool> = OnceLock::new();
static MAX_THREADS: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_THREADS);

/// Raise or lower the worker-thread cap. Takes effect for workers spawned
/// after the call.
pub(crate) fn set_max_threads(max: usize) {
    MAX_THREADS.store(max.max(1), Ordering::Relaxed);
}

/// Run `job` on a background worker.
pub(crate) fn spawn<F: FnOnce() + Send + 'static>(job: F) {
    POOL.get_or_init(TaskPool::new).submit(Box::new(job));
}

struct TaskPool {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    idle: AtomicUsize,
    workers: AtomicUsize,
    seq: AtomicUsize,
}

impl TaskPool {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        TaskPool {
            tx,
            rx,
            idle: AtomicUsize::new(0),
            workers: AtomicUsize::new(0),
            seq: AtomicUsize::new(0),
        }
    }

    fn submit(&'static self, job: Job) {
        // The queue is unbounded; send only fails if the pool is gone,
        // which cannot happen for a process-lifetime static.
        let _ = self.tx.send(job);
        if self.idle.load(Ordering::Acquire) == 0 {
            self.spawn_worker();
        }
    }

    fn spawn_worker(&'static self) {
        let max = MAX_THREADS.load(Ordering::Relaxed);
        let mut count = self.workers.load(Ordering::Acquire);
        loop {
            if count >= max {
                return;
            }
            match self.workers.compare_exchange(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => count = observed,
            }
        }

        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let spawned = thread::Builder::new()
            .name(format!("nexio-task-{id}"))
            .spawn(move || self.run_worker());
        if let Err(e) = spawned {
            self.workers.fetch_sub(1, Ordering::AcqRel);
            warn!(error = %e, "failed to spawn task worker");
        }
    }

    fn run_worker(&'static self) {
        loop {
            self.idle.fetch_add(1, Ordering::AcqRel);
            let job = self.rx.recv_timeout(IDLE_RETIRE);
            self.idle.fetch_sub(1, Ordering::AcqRel);
            match job {
                Ok(job) => {
                    // Keep the queue live before this job possibly blocks:
                    // if work is already waiting and nobody is idle, add a
                    // worker now.
                    if !self.rx.is_empty() && self.idle.load(Ordering::Acquire) == 0 {
                        self.spawn_worker();
                    }
                    job();
                }
                // Idle long enough: retire this worker.
                Err(_) => break,
            }
        }
        self.workers.fetch_sub(1, Ordering::AcqRel);
    }
}
