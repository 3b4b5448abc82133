//! Per-fd operator records: the unit of kernel registration.
//!
//! An `FdOperator` carries the callbacks and buffer providers for one file
//! descriptor. Its raw address is stored in the kernel event payload at
//! registration time, so operators live in the stable-address pool
//! (`crate::pool`) and are never moved while registered.

use std::io;
use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

use crate::poll::{PollEvent, Poller};

/// Not registered with any poller; eligible for the free list.
const STATE_UNUSED: i32 = 0;
/// Registered with a poller, no callback currently running.
const STATE_REGISTERED: i32 = 1;
/// A dispatch for this operator is executing on the poller thread.
const STATE_DISPATCHING: i32 = 2;

/// Callback invoked by the poller for readable/writable/hangup events on
/// operators that handle events themselves (e.g. a listener's accept).
pub type Callback = Arc<dyn Fn(&Arc<Poller>) -> io::Result<()> + Send + Sync>;

/// Buffer provider for connection operators.
///
/// The reactor does not own application buffers: it asks the provider for
/// vectored regions, performs one `readv`/`sendmsg`, and reports the byte
/// count back. Regions placed into `iovs` must stay valid and untouched by
/// the provider until the matching ack call.
pub trait IoProvider: Send + Sync {
    /// Fill `iovs` with writable spare regions for a vectored read.
    fn inputs(&self, iovs: &mut Vec<libc::iovec>);
    /// `n` bytes were read into the regions from the last `inputs` call.
    fn input_ack(&self, n: usize) -> io::Result<()>;
    /// Fill `iovs` with pending output regions for a vectored write.
    /// Returns whether the provider's memory supports zero-copy send.
    fn outputs(&self, iovs: &mut Vec<libc::iovec>) -> bool;
    /// `n` bytes from the last `outputs` regions were written.
    fn output_ack(&self, n: usize) -> io::Result<()>;
}

/// Per-fd state registered with a poller.
///
/// Field mutation is only legal while the operator is unregistered and
/// singly owned (between `pool::alloc` and the first `control` call, or
/// after detach completes); the poller threads otherwise only read fields
/// and touch the atomic `state`.
pub struct FdOperator {
    pub(crate) fd: RawFd,
    pub(crate) on_read: Option<Callback>,
    pub(crate) on_write: Option<Callback>,
    pub(crate) on_hup: Option<Callback>,
    pub(crate) io: Option<Arc<dyn IoProvider>>,
    pub(crate) poll: Option<Arc<Poller>>,
    state: AtomicI32,
    /// Free-list link, owned by the pool.
    pub(crate) next: *mut FdOperator,
}

// The raw `next` pointer is only touched under the pool lock, and the
// remaining non-atomic fields follow the single-owner-while-unregistered
// contract above.
unsafe impl Send for FdOperator {}
unsafe impl Sync for FdOperator {}

impl FdOperator {
    pub(crate) fn new() -> Self {
        FdOperator {
            fd: -1,
            on_read: None,
            on_write: None,
            on_hup: None,
            io: None,
            poll: None,
            state: AtomicI32::new(STATE_UNUSED),
            next: std::ptr::null_mut(),
        }
    }

    /// The file descriptor this operator represents.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Register/modify/remove this operator on its owning poller.
    pub fn control(&self, event: PollEvent) -> io::Result<()> {
        match &self.poll {
            Some(poll) => poll.control(OpHandle(NonNull::from(self)), event),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "operator is not bound to a poller",
            )),
        }
    }

    /// Mark the operator as registered with the kernel. Spins past an
    /// in-progress `unused` and is a no-op if already registered.
    pub(crate) fn inuse(&self) {
        loop {
            if self
                .state
                .compare_exchange(STATE_UNUSED, STATE_REGISTERED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
                || self.state.load(Ordering::Acquire) == STATE_REGISTERED
            {
                return;
            }
            thread::yield_now();
        }
    }

    /// Mark the operator as removed from the kernel. Waits for any
    /// in-flight dispatch to `leave` before completing, so memory
    /// reclamation ordered after this call is safe.
    pub(crate) fn unused(&self) {
        loop {
            if self
                .state
                .compare_exchange(STATE_REGISTERED, STATE_UNUSED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
                || self.state.load(Ordering::Acquire) == STATE_UNUSED
            {
                return;
            }
            thread::yield_now();
        }
    }

    /// Enter a dispatch. Returns `false` when the operator is being (or has
    /// been) detached, in which case the event must be skipped and `leave`
    /// must not be called.
    pub(crate) fn enter(&self) -> bool {
        self.state
            .compare_exchange(STATE_REGISTERED, STATE_DISPATCHING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Leave a dispatch entered via `enter`.
    pub(crate) fn leave(&self) {
        self.state.store(STATE_REGISTERED, Ordering::Release);
    }

    /// Whether the operator is free to be reclaimed.
    pub fn is_unused(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_UNUSED
    }

    /// Clear every mutable field. Called by the pool before an operator
    /// goes back on the free list.
    pub(crate) fn reset(&mut self) {
        self.fd = -1;
        self.on_read = None;
        self.on_write = None;
        self.on_hup = None;
        self.io = None;
        self.poll = None;
        self.state.store(STATE_UNUSED, Ordering::Release);
    }
}

/// Stable pointer to a pooled operator.
///
/// The pool owns the memory; the kernel and poller threads hold this
/// borrow between registration and the detach-then-free handshake.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OpHandle(NonNull<FdOperator>);

unsafe impl Send for OpHandle {}
unsafe impl Sync for OpHandle {}

impl OpHandle {
    pub(crate) fn from_ptr(ptr: *mut FdOperator) -> OpHandle {
        debug_assert!(!ptr.is_null());
        OpHandle(unsafe { NonNull::new_unchecked(ptr) })
    }

    pub(crate) fn raw(&self) -> *mut FdOperator {
        self.0.as_ptr()
    }

    /// Shared view of the operator.
    pub fn as_ref(&self) -> &FdOperator {
        unsafe { self.0.as_ref() }
    }

    /// Exclusive view of the operator.
    ///
    /// # Safety
    /// Caller must hold the single-owner-while-unregistered condition: the
    /// operator is not registered with any poller and no other thread is
    /// accessing it.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn as_mut(&self) -> &mut FdOperator {
        &mut *self.0.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_requires_registration() {
        let op = FdOperator::new();
        assert!(!op.enter());
        op.inuse();
        assert!(op.enter());
        // Serialized: a second enter fails until leave.
        assert!(!op.enter());
        op.leave();
        assert!(op.enter());
        op.leave();
    }

    #[test]
    fn unused_waits_for_leave() {
        use std::sync::atomic::AtomicBool;

        let op = Arc::new(FdOperator::new());
        op.inuse();
        assert!(op.enter());

        let done = Arc::new(AtomicBool::new(false));
        let handle = {
            let op = op.clone();
            let done = done.clone();
            thread::spawn(move || {
                op.unused();
                done.store(true, Ordering::SeqCst);
            })
        };

        // The detach side must not complete while the dispatch is entered.
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        op.leave();
        handle.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert!(op.is_unused());
    }

    #[test]
    fn inuse_is_idempotent() {
        let op = FdOperator::new();
        op.inuse();
        op.inuse();
        assert!(!op.is_unused());
        op.unused();
        op.unused();
        assert!(op.is_unused());
    }
}
