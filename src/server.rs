//! Server adaptor: a listening fd wrapped as an fd operator.
//!
//! The listener's operator accepts on readable events and registers each
//! new connection with a poller picked round-robin. Live connections are
//! tracked in a map keyed by fd so graceful shutdown can drain them.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ahash::RandomState;
use parking_lot::RwLock;
use tracing::warn;

use crate::connection::Connection;
use crate::error::Error;
use crate::event_loop::{OnPrepare, OnRequest, QuitFn};
use crate::listener::Listener;
use crate::operator::OpHandle;
use crate::poll::PollEvent;
use crate::{manager, pool};

const DRAIN_RESCAN: Duration = Duration::from_secs(1);

pub(crate) struct Server {
    op: OpHandle,
    listener: Arc<dyn Listener>,
    on_request: OnRequest,
    on_prepare: Option<OnPrepare>,
    segment_size: usize,
    quit: QuitFn,
    connections: RwLock<HashMap<RawFd, Arc<Connection>, RandomState>>,
    listener_detached: AtomicBool,
}

impl Server {
    pub(crate) fn new(
        listener: Arc<dyn Listener>,
        on_request: OnRequest,
        on_prepare: Option<OnPrepare>,
        segment_size: usize,
        quit: QuitFn,
    ) -> Arc<Server> {
        Arc::new(Server {
            op: pool::alloc(),
            listener,
            on_request,
            on_prepare,
            segment_size,
            quit,
            connections: RwLock::new(HashMap::with_hasher(RandomState::new())),
            listener_detached: AtomicBool::new(false),
        })
    }

    /// Bind the listener operator to a poller and arm it for accepts.
    pub(crate) fn run(self: &Arc<Self>) -> Result<(), Error> {
        let poll = manager::global().pick().clone();
        unsafe {
            let o = self.op.as_mut();
            o.fd = self.listener.fd();
            o.poll = Some(poll.clone());
            let srv = self.clone();
            o.on_read = Some(Arc::new(move |_| srv.handle_accept()));
            let quit = self.quit.clone();
            o.on_hup = Some(Arc::new(move |_| {
                quit(Some(Error::ListenerClosed));
                Ok(())
            }));
        }
        if let Err(e) = poll.control(self.op, PollEvent::Readable) {
            // The registration never took; reclaim the operator here and
            // keep the later teardown path from touching it again.
            self.listener_detached.store(true, Ordering::Release);
            self.op.as_ref().unused();
            pool::free(self.op);
            (self.quit)(Some(Error::Io(io::Error::new(e.kind(), e.to_string()))));
            return Err(Error::Io(e));
        }
        Ok(())
    }

    fn handle_accept(self: &Arc<Self>) -> io::Result<()> {
        match self.listener.accept() {
            Ok(None) => Ok(()),
            Ok(Some(accepted)) => {
                let poll = manager::global().pick().clone();
                let conn = Connection::register(
                    accepted.fd,
                    accepted.peer,
                    poll,
                    self.on_request.clone(),
                    self.on_prepare.as_ref(),
                    self.segment_size,
                );
                match conn {
                    Ok(conn) => {
                        if !conn.is_active() {
                            // Rejected during prepare; already released.
                            return Ok(());
                        }
                        let fd = accepted.fd;
                        let srv = Arc::downgrade(self);
                        conn.add_close_callback(Box::new(move |_| {
                            if let Some(srv) = srv.upgrade() {
                                srv.connections.write().remove(&fd);
                            }
                        }));
                        self.connections.write().insert(fd, conn);
                        Ok(())
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to register accepted connection");
                        Ok(())
                    }
                }
            }
            Err(Error::ListenerClosed) => {
                // The listening fd is gone, so the kernel already dropped
                // its registration; quit the loop and let the teardown
                // path reclaim the operator.
                (self.quit)(Some(Error::ListenerClosed));
                Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed"))
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                Ok(())
            }
        }
    }

    /// Stop accepting: detach the listener operator, close the listener,
    /// and reclaim the operator. Idempotent.
    pub(crate) fn detach_listener(&self) {
        if self.listener_detached.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.op.as_ref().control(PollEvent::Detach);
        let _ = self.listener.close();
        pool::free(self.op);
    }

    /// Graceful close: stop accepting, then close idle connections,
    /// re-scanning every second until all are gone or the deadline fires.
    /// Connections still busy at the deadline are left open.
    pub(crate) fn shutdown(&self, deadline: Option<Instant>) -> Result<(), Error> {
        self.detach_listener();
        loop {
            let conns: Vec<Arc<Connection>> =
                self.connections.read().values().cloned().collect();
            if conns.is_empty() {
                return Ok(());
            }
            for conn in &conns {
                if conn.is_idle() {
                    conn.close();
                }
            }
            if self.connections.read().is_empty() {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::ShutdownTimeout);
                    }
                    thread::sleep(DRAIN_RESCAN.min(deadline - now));
                }
                None => thread::sleep(DRAIN_RESCAN),
            }
        }
    }
}
