//! Stream connection: buffers, request pump, and close arbitration.
//!
//! The poller fills the input buffer through the operator's I/O provider
//! and drains the output buffer when write interest is armed. User code
//! reads committed input and writes/flushes output from its own threads;
//! `on_request` runs on the shared task pool, one pump per connection.

use std::any::Any;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::buffer::LinkedBuffer;
use crate::error::Error;
use crate::event_loop::{OnPrepare, OnRequest};
use crate::operator::{IoProvider, OpHandle};
use crate::poll::{PollEvent, Poller, MAX_IOVECS};
use crate::{pool, sys, task};

const OPEN: u8 = 0;
const CLOSED_BY_USER: u8 = 1;
const CLOSED_BY_POLLER: u8 = 2;

/// Callback run when the connection closes, before its fd is released.
pub type CloseCallback = Box<dyn Fn(&Connection) + Send + Sync>;

pub struct Connection {
    fd: RawFd,
    peer: Option<SocketAddr>,
    op: OpHandle,
    input: LinkedBuffer,
    output: LinkedBuffer,
    on_request: OnRequest,
    /// Value returned by `on_prepare`, queryable from `on_request`.
    context: OnceLock<Box<dyn Any + Send + Sync>>,
    /// Single-pump guard: set while an `on_request` loop is scheduled.
    pumping: AtomicBool,
    /// Who closed the connection first; all teardown goes through one CAS.
    closing: AtomicU8,
    active: AtomicBool,
    /// Whether the operator is registered with a poller (teardown owner).
    registered: AtomicBool,
    /// Whether write interest is armed (output drains on the poller).
    write_armed: AtomicBool,
    /// Serializes user-side flush attempts.
    flush_lock: Mutex<()>,
    close_callbacks: Mutex<Vec<CloseCallback>>,
}

impl Connection {
    /// Take ownership of `fd`, bind it to `poll`, and register for
    /// readable events. The returned connection may already be inactive if
    /// `on_prepare` closed it.
    pub(crate) fn register(
        fd: RawFd,
        peer: Option<SocketAddr>,
        poll: Arc<Poller>,
        on_request: OnRequest,
        on_prepare: Option<&OnPrepare>,
        seg_size: usize,
    ) -> Result<Arc<Connection>, Error> {
        let _ = sys::set_tcp_nodelay(fd);
        #[cfg(not(target_os = "linux"))]
        let _ = sys::set_nosigpipe(fd);

        let op = pool::alloc();
        let conn = Arc::new(Connection {
            fd,
            peer,
            op,
            input: LinkedBuffer::new(seg_size),
            output: LinkedBuffer::new(seg_size),
            on_request,
            context: OnceLock::new(),
            pumping: AtomicBool::new(false),
            closing: AtomicU8::new(OPEN),
            active: AtomicBool::new(true),
            registered: AtomicBool::new(false),
            write_armed: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
            close_callbacks: Mutex::new(Vec::new()),
        });

        unsafe {
            let o = op.as_mut();
            o.fd = fd;
            o.poll = Some(poll.clone());
            o.io = Some(Arc::new(ConnIo { conn: conn.clone() }));
            let hup = conn.clone();
            o.on_hup = Some(Arc::new(move |_| {
                hup.close_by(CLOSED_BY_POLLER);
                Ok(())
            }));
        }

        if let Some(prepare) = on_prepare {
            if let Some(ctx) = prepare(&conn) {
                let _ = conn.context.set(ctx);
            }
        }
        if conn.closing.load(Ordering::Acquire) != OPEN {
            // Closed during prepare, before the kernel ever saw the fd.
            pool::free(op);
            sys::close(fd);
            return Ok(conn);
        }

        if let Err(e) = poll.control(op, PollEvent::Readable) {
            pool::free(op);
            sys::close(fd);
            return Err(Error::Io(e));
        }
        conn.registered.store(true, Ordering::Release);

        // A close that raced the registration marks `closing` but skips
        // teardown because `registered` was still false; finish it here.
        if conn.closing.load(Ordering::Acquire) != OPEN
            && conn.registered.swap(false, Ordering::AcqRel)
        {
            let _ = op.as_ref().control(PollEvent::Detach);
            sys::close(fd);
            pool::free(op);
        }
        Ok(conn)
    }

    /// Address of the peer, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether the connection is open for I/O.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// No buffered bytes in either direction and no handler in flight.
    pub fn is_idle(&self) -> bool {
        self.input.is_empty() && self.output.is_empty() && !self.pumping.load(Ordering::Acquire)
    }

    /// The value `on_prepare` returned for this connection, if any.
    pub fn context<T: 'static>(&self) -> Option<&T> {
        self.context.get()?.downcast_ref()
    }

    /// Bytes currently readable.
    pub fn input_len(&self) -> usize {
        self.input.len()
    }

    /// Take exactly `n` input bytes.
    pub fn next(&self, n: usize) -> Result<Bytes, Error> {
        self.input.next(n).ok_or(Error::InsufficientData {
            requested: n,
            available: self.input.len(),
        })
    }

    /// Copy out the first `n` input bytes without consuming them.
    pub fn peek(&self, n: usize) -> Result<Bytes, Error> {
        self.input.peek(n).ok_or(Error::InsufficientData {
            requested: n,
            available: self.input.len(),
        })
    }

    /// Discard `n` input bytes.
    pub fn skip(&self, n: usize) -> Result<(), Error> {
        let available = self.input.len();
        if available < n {
            return Err(Error::InsufficientData { requested: n, available });
        }
        self.input.consume(n);
        Ok(())
    }

    /// Queue `data` for sending. Bytes move on the next `flush`.
    pub fn write(&self, data: &[u8]) -> Result<usize, Error> {
        if !self.is_active() {
            return Err(Error::ConnectionClosed);
        }
        self.output.append(data);
        Ok(data.len())
    }

    /// Push queued output to the socket. Sends inline until the socket
    /// would block, then arms write interest so the poller finishes the
    /// job; write interest is dropped again once the buffer drains.
    pub fn flush(&self) -> Result<(), Error> {
        if !self.is_active() {
            return Err(Error::ConnectionClosed);
        }
        if self.output.is_empty() {
            return Ok(());
        }
        let _guard = self.flush_lock.lock();
        if self.write_armed.load(Ordering::Acquire) {
            // The poller owns draining until the buffer empties.
            return Ok(());
        }
        let mut iovs = Vec::with_capacity(MAX_IOVECS);
        loop {
            iovs.clear();
            self.output.readable_iovs(&mut iovs);
            if iovs.is_empty() {
                return Ok(());
            }
            match sys::sendmsg(self.fd, &iovs, false) {
                Ok(n) => {
                    self.output.consume(n);
                }
                Err(e) if sys::is_would_block(&e) => {
                    self.write_armed.store(true, Ordering::Release);
                    self.op
                        .as_ref()
                        .control(PollEvent::ReadWritable)
                        .map_err(Error::Io)?;
                    return Ok(());
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Register a callback to run when the connection closes. Runs
    /// immediately if it already has.
    pub fn add_close_callback(&self, cb: CloseCallback) {
        {
            let mut callbacks = self.close_callbacks.lock();
            if self.closing.load(Ordering::Acquire) == OPEN {
                callbacks.push(cb);
                return;
            }
        }
        cb(self);
    }

    /// Close the connection. Idempotent; loses to a concurrent
    /// poller-side close.
    pub fn close(&self) {
        self.close_by(CLOSED_BY_USER);
    }

    fn close_by(&self, who: u8) {
        if self
            .closing
            .compare_exchange(OPEN, who, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.active.store(false, Ordering::Release);

        let callbacks = mem::take(&mut *self.close_callbacks.lock());
        for cb in &callbacks {
            cb(self);
        }

        if self.registered.swap(false, Ordering::AcqRel) {
            if who == CLOSED_BY_USER {
                // The poller-side path arrives here via the hangup batch,
                // which has already detached the operator.
                let _ = self.op.as_ref().control(PollEvent::Detach);
            }
            sys::close(self.fd);
            pool::free(self.op);
        }
    }

    fn schedule_pump(self: &Arc<Self>) {
        if !self.is_active() || self.input.is_empty() {
            return;
        }
        if self.pumping.swap(true, Ordering::AcqRel) {
            return;
        }
        let conn = self.clone();
        task::spawn(move || conn.pump());
    }

    /// Run `on_request` until the input drains, then release the pump
    /// flag. The post-release recheck closes the window where input
    /// arrived after the drain check but before the release.
    fn pump(self: Arc<Self>) {
        loop {
            while self.is_active() && !self.input.is_empty() {
                let _ = (self.on_request)(&self);
            }
            self.pumping.store(false, Ordering::Release);
            if !self.is_active() || self.input.is_empty() {
                return;
            }
            if self.pumping.swap(true, Ordering::AcqRel) {
                return;
            }
        }
    }
}

/// Adapter handing the connection's buffers to the reactor.
struct ConnIo {
    conn: Arc<Connection>,
}

impl IoProvider for ConnIo {
    fn inputs(&self, iovs: &mut Vec<libc::iovec>) {
        self.conn.input.writable_iovs(iovs);
    }

    fn input_ack(&self, n: usize) -> io::Result<()> {
        if n > 0 {
            self.conn.input.ack_written(n);
            self.conn.schedule_pump();
        }
        Ok(())
    }

    fn outputs(&self, iovs: &mut Vec<libc::iovec>) -> bool {
        self.conn.output.readable_iovs(iovs);
        false
    }

    fn output_ack(&self, n: usize) -> io::Result<()> {
        if n > 0 {
            self.conn.output.consume(n);
        }
        if self.conn.output.is_empty() && self.conn.write_armed.swap(false, Ordering::AcqRel) {
            self.conn.op.as_ref().control(PollEvent::ReadOnly)?;
        }
        Ok(())
    }
}
