//! Linux reactor: epoll multiplexing with an eventfd wake channel.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use crate::operator::{Callback, FdOperator, OpHandle};
use crate::poll::{PollEvent, MAX_IOVECS};
use crate::{pool, sys, task};

/// Initial size of the event array.
const INITIAL_EVENTS: usize = 128;
/// Hard cap for the event array growth heuristic.
const MAX_EVENTS: usize = 128 * 1024;

/// Wake payload: written by `trigger`, byte 0 stays zero.
const WAKE_PAYLOAD: [u8; 8] = [0, 0, 0, 0, 0, 0, 0, 1];
/// Close payload: byte 0 is nonzero, which tells the wait loop to exit.
const CLOSE_PAYLOAD: [u8; 8] = [1, 0, 0, 0, 0, 0, 0, 0];

const EV_READ: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLERR) as u32;
const EV_WRITE_ET: u32 =
    libc::EPOLLET as u32 | (libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLERR) as u32;
const EV_READ_WRITE: u32 =
    (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLERR) as u32;
const EV_HUP: u32 = (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;

/// One kernel multiplexor plus its wake channel.
///
/// `wait` is meant to run on a dedicated thread; every other operation is
/// safe to call from any thread.
pub struct Poller {
    epfd: RawFd,
    wake_fd: RawFd,
    /// Operator registered for the eventfd; identified by pointer equality
    /// during dispatch, never entered.
    wake: OpHandle,
    /// Debounces wake writes: only the 0 -> 1 transition hits the kernel.
    trigger: AtomicU32,
}

impl Poller {
    /// Create the epoll instance, the eventfd, and register the wake
    /// operator.
    pub fn open() -> io::Result<Arc<Poller>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            sys::close(epfd);
            return Err(err);
        }

        let wake = pool::alloc();
        unsafe {
            wake.as_mut().fd = wake_fd;
        }

        let poller = Arc::new(Poller {
            epfd,
            wake_fd,
            wake,
            trigger: AtomicU32::new(0),
        });

        if let Err(err) = poller.control(wake, PollEvent::Readable) {
            wake.as_ref().unused();
            pool::free(wake);
            sys::close(wake_fd);
            sys::close(epfd);
            return Err(err);
        }

        debug!(epfd, wake_fd, "poller opened");
        Ok(poller)
    }

    /// Register, modify, or remove an operator.
    ///
    /// Registration variants take the in-use refcount before the syscall;
    /// `Detach` drops it after the syscall returns, regardless of outcome,
    /// and waits out any dispatch that is currently entered.
    pub fn control(&self, op: OpHandle, event: PollEvent) -> io::Result<()> {
        let opr = op.as_ref();
        let mut evt = libc::epoll_event {
            events: 0,
            u64: op.raw() as u64,
        };
        let (ctl, mask) = match event {
            PollEvent::Readable => {
                opr.inuse();
                (libc::EPOLL_CTL_ADD, EV_READ)
            }
            PollEvent::ModReadable => {
                opr.inuse();
                (libc::EPOLL_CTL_MOD, EV_READ)
            }
            PollEvent::Writable => {
                opr.inuse();
                (libc::EPOLL_CTL_ADD, EV_WRITE_ET)
            }
            PollEvent::ReadWritable => (libc::EPOLL_CTL_MOD, EV_READ_WRITE),
            PollEvent::ReadOnly => (libc::EPOLL_CTL_MOD, EV_READ),
            PollEvent::Detach => (libc::EPOLL_CTL_DEL, 0),
        };
        evt.events = mask;

        let rc = unsafe { libc::epoll_ctl(self.epfd, ctl, opr.fd, &mut evt) };
        let res = if rc != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        };
        if event == PollEvent::Detach {
            opr.unused();
        }
        res
    }

    /// Run the wait loop until `close` is observed. Blocks the calling
    /// thread.
    pub fn wait(self: &Arc<Self>) -> io::Result<()> {
        let mut size = INITIAL_EVENTS;
        let mut events = alloc_events(size);
        let mut barriers = alloc_barriers(size);
        let mut msec: libc::c_int = -1;
        let mut n = 0usize;
        loop {
            let grown = grown_size(n, size);
            if grown != size {
                size = grown;
                events = alloc_events(size);
                barriers = alloc_barriers(size);
            }

            n = match self.epoll_wait(&mut events, msec) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(e) => return Err(e),
            };
            if n == 0 {
                // Idle: block on the next wait and give up the core once.
                msec = -1;
                thread::yield_now();
                continue;
            }
            // Productive pass: poll again without blocking to coalesce
            // events that became ready during dispatch.
            msec = 0;
            if self.dispatch(&events[..n], &mut barriers) {
                debug!(epfd = self.epfd, "poller closed");
                return Ok(());
            }
        }
    }

    /// Wake a blocked `wait` without any fd becoming ready. Concurrent
    /// calls within one wake window collapse into a single kernel write.
    pub fn trigger(&self) -> io::Result<()> {
        if self.trigger.fetch_add(1, Ordering::AcqRel) > 0 {
            return Ok(());
        }
        self.write_wake(&WAKE_PAYLOAD)
    }

    /// Ask the wait loop to exit. Asynchronous; `wait` returns after it
    /// consumes the close payload and releases its kernel fds.
    pub fn close(&self) -> io::Result<()> {
        self.write_wake(&CLOSE_PAYLOAD)
    }

    fn write_wake(&self, payload: &[u8; 8]) -> io::Result<()> {
        let rc = unsafe {
            libc::write(
                self.wake_fd,
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn epoll_wait(&self, events: &mut [libc::epoll_event], msec: libc::c_int) -> io::Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                msec,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Dispatch one batch of readiness events. Returns `true` when the
    /// close payload was consumed and the poller has released its fds.
    fn dispatch(
        self: &Arc<Self>,
        events: &[libc::epoll_event],
        barriers: &mut [Vec<libc::iovec>],
    ) -> bool {
        let mut hups: Vec<OpHandle> = Vec::new();
        for (i, ev) in events.iter().enumerate() {
            let op = OpHandle::from_ptr(ev.u64 as *mut FdOperator);

            // Wake channel: consume the payload, reset the debounce flag,
            // and exit if the payload asks for it.
            if op.raw() == self.wake.raw() {
                let mut buf = [0u8; 8];
                unsafe {
                    libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
                }
                self.trigger.store(0, Ordering::Release);
                if buf[0] != 0 {
                    sys::close(self.wake_fd);
                    sys::close(self.epfd);
                    self.wake.as_ref().unused();
                    pool::free(self.wake);
                    return true;
                }
                continue;
            }

            let opr = op.as_ref();
            if !opr.enter() {
                // Concurrently detached; the detach path reclaims it.
                continue;
            }

            if ev.events & EV_HUP != 0 {
                hups.push(op);
            } else if ev.events & libc::EPOLLERR as u32 != 0 {
                // A zero-copy completion arrives as EPOLLERR with nothing
                // real on the error queue; only a genuine error hangs up.
                if sys::pending_socket_error(opr.fd) {
                    hups.push(op);
                }
            } else if ev.events & libc::EPOLLIN as u32 != 0 {
                if let Some(on_read) = &opr.on_read {
                    let _ = on_read(self);
                } else if let Some(io_src) = &opr.io {
                    let iovs = &mut barriers[i];
                    iovs.clear();
                    io_src.inputs(iovs);
                    if !iovs.is_empty() {
                        match sys::readv(opr.fd, iovs) {
                            Ok(read) => {
                                let _ = io_src.input_ack(read);
                            }
                            Err(e) if sys::is_would_block(&e) => {
                                let _ = io_src.input_ack(0);
                            }
                            Err(e) => {
                                warn!(fd = opr.fd, error = %e, "readv failed");
                                let _ = io_src.input_ack(0);
                                hups.push(op);
                            }
                        }
                    }
                }
            } else if ev.events & libc::EPOLLOUT as u32 != 0 {
                if let Some(on_write) = &opr.on_write {
                    let _ = on_write(self);
                } else if let Some(io_src) = &opr.io {
                    let iovs = &mut barriers[i];
                    iovs.clear();
                    let zerocopy = io_src.outputs(iovs);
                    if !iovs.is_empty() {
                        match sys::sendmsg(opr.fd, iovs, zerocopy) {
                            Ok(sent) => {
                                let _ = io_src.output_ack(sent);
                            }
                            Err(e) if sys::is_would_block(&e) => {
                                let _ = io_src.output_ack(0);
                            }
                            Err(e) => {
                                warn!(fd = opr.fd, error = %e, "sendmsg failed");
                                let _ = io_src.output_ack(0);
                                hups.push(op);
                            }
                        }
                    }
                }
            }

            opr.leave();
        }

        // Detach hung-up fds together and run their callbacks off-thread so
        // a slow callback cannot stall the wait loop.
        if !hups.is_empty() {
            self.detach_batch(hups);
        }
        false
    }

    fn detach_batch(self: &Arc<Self>, hups: Vec<OpHandle>) {
        let mut callbacks: Vec<Callback> = Vec::with_capacity(hups.len());
        for op in &hups {
            let opr = op.as_ref();
            // Re-enter while cloning the callback: a concurrent user-side
            // detach cannot complete (and recycle the record) until we leave.
            if !opr.enter() {
                continue;
            }
            if let Some(cb) = &opr.on_hup {
                callbacks.push(cb.clone());
            }
            opr.leave();
            if let Err(e) = self.control(*op, PollEvent::Detach) {
                debug!(fd = opr.fd(), error = %e, "detach after hangup failed");
            }
        }
        let poller = self.clone();
        task::spawn(move || {
            for cb in callbacks {
                let _ = cb(&poller);
            }
        });
    }
}

fn alloc_events(size: usize) -> Vec<libc::epoll_event> {
    vec![libc::epoll_event { events: 0, u64: 0 }; size]
}

fn alloc_barriers(size: usize) -> Vec<Vec<libc::iovec>> {
    (0..size).map(|_| Vec::with_capacity(MAX_IOVECS)).collect()
}

/// Saturation heuristic: when a wait fills the whole event array, double it
/// for the next round, up to the cap.
fn grown_size(n: usize, size: usize) -> usize {
    if n == size && size < MAX_EVENTS {
        size << 1
    } else {
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn spawn_wait(poller: &Arc<Poller>) -> thread::JoinHandle<io::Result<()>> {
        let p = poller.clone();
        thread::spawn(move || p.wait())
    }

    #[test]
    fn event_array_doubles_and_caps() {
        assert_eq!(grown_size(128, 128), 256);
        assert_eq!(grown_size(100, 128), 128);
        let mut size = INITIAL_EVENTS;
        loop {
            let next = grown_size(size, size);
            if next == size {
                break;
            }
            size = next;
        }
        assert_eq!(size, MAX_EVENTS);
        assert_eq!(grown_size(MAX_EVENTS, MAX_EVENTS), MAX_EVENTS);
    }

    #[test]
    fn close_payload_terminates_wait() {
        let poller = Poller::open().unwrap();
        let handle = spawn_wait(&poller);
        thread::sleep(Duration::from_millis(20));
        poller.close().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn trigger_burst_coalesces_and_resets() {
        let poller = Poller::open().unwrap();
        let handle = spawn_wait(&poller);
        thread::sleep(Duration::from_millis(20));

        let mut senders = Vec::new();
        for _ in 0..8 {
            let p = poller.clone();
            senders.push(thread::spawn(move || {
                for _ in 0..125 {
                    p.trigger().unwrap();
                }
            }));
        }
        for s in senders {
            s.join().unwrap();
        }

        // The wait loop consumes the single coalesced wake and clears the
        // debounce flag.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while poller.trigger.load(Ordering::Acquire) != 0 {
            assert!(std::time::Instant::now() < deadline, "trigger flag never reset");
            thread::sleep(Duration::from_millis(5));
        }

        poller.close().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn detached_operator_gets_no_callbacks() {
        let poller = Poller::open().unwrap();
        let handle = spawn_wait(&poller);

        let (a, b) = socketpair();
        let hits = Arc::new(AtomicUsize::new(0));

        let op = pool::alloc();
        unsafe {
            let o = op.as_mut();
            o.fd = a;
            o.poll = Some(poller.clone());
            let hits = hits.clone();
            o.on_read = Some(Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        poller.control(op, PollEvent::Readable).unwrap();

        unsafe {
            libc::write(b, b"x".as_ptr() as *const libc::c_void, 1);
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "on_read never fired");
            thread::sleep(Duration::from_millis(5));
        }

        poller.control(op, PollEvent::Detach).unwrap();
        let seen = hits.load(Ordering::SeqCst);
        unsafe {
            libc::write(b, b"y".as_ptr() as *const libc::c_void, 1);
        }
        thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), seen);

        // Round-trip: the operator is reclaimable and comes back reset.
        assert!(op.as_ref().is_unused());
        pool::free(op);
        let again = pool::alloc();
        assert!(again.as_ref().on_read.is_none());
        pool::free(again);

        sys::close(a);
        sys::close(b);
        poller.close().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn hangup_runs_on_hup_off_thread() {
        let poller = Poller::open().unwrap();
        let handle = spawn_wait(&poller);

        let (a, b) = socketpair();
        let hups = Arc::new(AtomicUsize::new(0));

        let op = pool::alloc();
        unsafe {
            let o = op.as_mut();
            o.fd = a;
            o.poll = Some(poller.clone());
            let hups = hups.clone();
            o.on_hup = Some(Arc::new(move |_| {
                hups.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        poller.control(op, PollEvent::Readable).unwrap();

        // Closing the peer raises a hangup event.
        sys::close(b);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while hups.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "on_hup never fired");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hups.load(Ordering::SeqCst), 1);

        // The batch detach already dropped the registration.
        assert!(op.as_ref().is_unused());
        pool::free(op);

        sys::close(a);
        poller.close().unwrap();
        handle.join().unwrap().unwrap();
    }
}
