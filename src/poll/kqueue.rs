//! BSD-family reactor: kqueue multiplexing with an EVFILT_USER wake event.

use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use crate::operator::{Callback, FdOperator, OpHandle};
use crate::poll::{PollEvent, MAX_IOVECS};
use crate::{sys, task};

const INITIAL_EVENTS: usize = 128;
const MAX_EVENTS: usize = 128 * 1024;

/// Ident of the user-event used to wake the wait loop. No fd ever has
/// ident 0 registered here because stdin is never handed to a poller.
const WAKE_IDENT: libc::uintptr_t = 0;

/// One kernel multiplexor plus its wake channel.
pub struct Poller {
    kqfd: RawFd,
    /// Debounces wake posts: only the 0 -> 1 transition hits the kernel.
    trigger: AtomicU32,
    /// Set by `close`; observed by the wait loop on its next wake.
    closed: AtomicBool,
}

impl Poller {
    /// Create the kqueue instance and register the wake user-event.
    pub fn open() -> io::Result<Arc<Poller>> {
        let kqfd = unsafe { libc::kqueue() };
        if kqfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let change = kev(
            WAKE_IDENT,
            libc::EVFILT_USER as i32,
            (libc::EV_ADD | libc::EV_CLEAR) as u32,
            0,
            ptr::null_mut(),
        );
        let rc = unsafe { libc::kevent(kqfd, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            sys::close(kqfd);
            return Err(err);
        }
        debug!(kqfd, "poller opened");
        Ok(Arc::new(Poller {
            kqfd,
            trigger: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }))
    }

    /// Register, modify, or remove an operator. Mirrors the epoll mapping:
    /// read interest is level-triggered, write interest uses EV_CLEAR.
    pub fn control(&self, op: OpHandle, event: PollEvent) -> io::Result<()> {
        let opr = op.as_ref();
        let fd = opr.fd as libc::uintptr_t;
        let udata = op.raw() as *mut libc::c_void;
        let mut changes: [libc::kevent; 2] = [kev(0, 0, 0, 0, ptr::null_mut()); 2];
        let nchanges: usize;
        match event {
            PollEvent::Readable | PollEvent::ModReadable => {
                opr.inuse();
                changes[0] = kev(fd, libc::EVFILT_READ as i32, libc::EV_ADD as u32, 0, udata);
                nchanges = 1;
            }
            PollEvent::Writable => {
                opr.inuse();
                changes[0] = kev(
                    fd,
                    libc::EVFILT_WRITE as i32,
                    (libc::EV_ADD | libc::EV_CLEAR) as u32,
                    0,
                    udata,
                );
                nchanges = 1;
            }
            PollEvent::ReadWritable => {
                changes[0] = kev(fd, libc::EVFILT_WRITE as i32, libc::EV_ADD as u32, 0, udata);
                nchanges = 1;
            }
            PollEvent::ReadOnly => {
                changes[0] = kev(fd, libc::EVFILT_WRITE as i32, libc::EV_DELETE as u32, 0, udata);
                nchanges = 1;
            }
            PollEvent::Detach => {
                changes[0] = kev(fd, libc::EVFILT_READ as i32, libc::EV_DELETE as u32, 0, udata);
                changes[1] = kev(fd, libc::EVFILT_WRITE as i32, libc::EV_DELETE as u32, 0, udata);
                nchanges = 2;
            }
        }

        let rc = unsafe {
            libc::kevent(
                self.kqfd,
                changes.as_ptr(),
                nchanges as libc::c_int,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        let res = if rc < 0 {
            let err = io::Error::last_os_error();
            // Removing a filter that was never armed is expected during
            // detach; everything else is reported.
            if event == PollEvent::Detach && err.raw_os_error() == Some(libc::ENOENT) {
                Ok(())
            } else {
                Err(err)
            }
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
        let mut block = true;
        let mut n = 0usize;
        loop {
            let grown = grown_size(n, size);
            if grown != size {
                size = grown;
                events = alloc_events(size);
                barriers = alloc_barriers(size);
            }

            n = match self.kevent_wait(&mut events, block) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(e) => return Err(e),
            };
            if n == 0 {
                block = true;
                thread::yield_now();
                continue;
            }
            block = false;
            if self.dispatch(&events[..n], &mut barriers) {
                debug!(kqfd = self.kqfd, "poller closed");
                return Ok(());
            }
        }
    }

    /// Wake a blocked `wait`. Concurrent calls within one wake window
    /// collapse into a single kernel post.
    pub fn trigger(&self) -> io::Result<()> {
        if self.trigger.fetch_add(1, Ordering::AcqRel) > 0 {
            return Ok(());
        }
        self.post_wake()
    }

    /// Ask the wait loop to exit.
    pub fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        self.post_wake()
    }

    fn post_wake(&self) -> io::Result<()> {
        let change = kev(
            WAKE_IDENT,
            libc::EVFILT_USER as i32,
            0,
            libc::NOTE_TRIGGER,
            ptr::null_mut(),
        );
        let rc = unsafe { libc::kevent(self.kqfd, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn kevent_wait(&self, events: &mut [libc::kevent], block: bool) -> io::Result<usize> {
        let zero = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let timeout = if block { ptr::null() } else { &zero as *const _ };
        let n = unsafe {
            libc::kevent(
                self.kqfd,
                ptr::null(),
                0,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn dispatch(self: &Arc<Self>, events: &[libc::kevent], barriers: &mut [Vec<libc::iovec>]) -> bool {
        let mut hups: Vec<OpHandle> = Vec::new();
        for (i, ev) in events.iter().enumerate() {
            if ev.ident == WAKE_IDENT && ev.filter == libc::EVFILT_USER as _ {
                self.trigger.store(0, Ordering::Release);
                if self.closed.load(Ordering::Acquire) {
                    sys::close(self.kqfd);
                    return true;
                }
                continue;
            }

            let op = OpHandle::from_ptr(ev.udata as *mut FdOperator);
            let opr = op.as_ref();
            if !opr.enter() {
                continue;
            }

            if ev.flags & (libc::EV_EOF | libc::EV_ERROR) as _ != 0 {
                hups.push(op);
            } else if ev.filter == libc::EVFILT_READ as _ {
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
            } else if ev.filter == libc::EVFILT_WRITE as _ {
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

        if !hups.is_empty() {
            self.detach_batch(hups);
        }
        false
    }

    fn detach_batch(self: &Arc<Self>, hups: Vec<OpHandle>) {
        let mut callbacks: Vec<Callback> = Vec::with_capacity(hups.len());
        for op in &hups {
            let opr = op.as_ref();
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

fn kev(
    ident: libc::uintptr_t,
    filter: i32,
    flags: u32,
    fflags: u32,
    udata: *mut libc::c_void,
) -> libc::kevent {
    let mut ev: libc::kevent = unsafe { mem::zeroed() };
    ev.ident = ident;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.fflags = fflags as _;
    ev.udata = udata as _;
    ev
}

fn alloc_events(size: usize) -> Vec<libc::kevent> {
    (0..size)
        .map(|_| unsafe { mem::zeroed::<libc::kevent>() })
        .collect()
}

fn alloc_barriers(size: usize) -> Vec<Vec<libc::iovec>> {
    (0..size).map(|_| Vec::with_capacity(MAX_IOVECS)).collect()
}

fn grown_size(n: usize, size: usize) -> usize {
    if n == size && size < MAX_EVENTS {
        size << 1
    } else {
        size
    }
}
