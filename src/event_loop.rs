//! Event loop front: lifecycle glue between a listener and the reactor.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::config::Config;
use crate::connection::Connection;
use crate::error::Error;
use crate::listener::Listener;
use crate::server::Server;
use crate::{manager, task};

/// Handler invoked repeatedly while a connection's input buffer is
/// non-empty. Runs on the task pool, one invocation at a time per
/// connection; its error return is ignored. It must eventually consume all
/// input or close the connection, otherwise it will be invoked in a tight
/// loop.
pub type OnRequest = Arc<dyn Fn(&Arc<Connection>) -> Result<(), Error> + Send + Sync>;

/// Optional per-connection setup, run once before any data arrives. The
/// returned value is stored on the connection and queryable via
/// `Connection::context`. Must not perform I/O.
pub type OnPrepare =
    Arc<dyn Fn(&Arc<Connection>) -> Option<Box<dyn Any + Send + Sync>> + Send + Sync>;

/// First-wins quit signal shared with the server adaptor.
pub(crate) type QuitFn = Arc<dyn Fn(Option<Error>) + Send + Sync>;

/// A network server: serves one listener, handling connections through the
/// shared pollers.
pub struct EventLoop {
    on_request: OnRequest,
    config: Config,
    server: Mutex<Option<Arc<Server>>>,
    stop_tx: Sender<Option<Error>>,
    stop_rx: Receiver<Option<Error>>,
    serving: AtomicBool,
}

impl EventLoop {
    /// Create an event loop with the default configuration.
    pub fn new<F>(on_request: F) -> EventLoop
    where
        F: Fn(&Arc<Connection>) -> Result<(), Error> + Send + Sync + 'static,
    {
        Self::with_config(on_request, Config::default())
    }

    pub fn with_config<F>(on_request: F, config: Config) -> EventLoop
    where
        F: Fn(&Arc<Connection>) -> Result<(), Error> + Send + Sync + 'static,
    {
        let (stop_tx, stop_rx) = bounded(1);
        EventLoop {
            on_request: Arc::new(on_request),
            config,
            server: Mutex::new(None),
            stop_tx,
            stop_rx,
            serving: AtomicBool::new(false),
        }
    }

    /// Register `listener` and serve it, blocking until the listener dies
    /// or `shutdown` is invoked. Returns the reason for quitting, `Ok` for
    /// a clean shutdown.
    pub fn serve(&self, listener: Arc<dyn Listener>) -> Result<(), Error> {
        if self.serving.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyServing);
        }
        if self.config.pollers > 0 {
            manager::setup(self.config.pollers);
        }
        task::set_max_threads(self.config.max_task_threads);

        let quit: QuitFn = {
            let tx = self.stop_tx.clone();
            Arc::new(move |err| {
                let _ = tx.try_send(err);
            })
        };
        let server = Server::new(
            listener,
            self.on_request.clone(),
            self.config.on_prepare.clone(),
            self.config.segment_size,
            quit,
        );
        server.run()?;
        *self.server.lock() = Some(server.clone());

        let result = match self.stop_rx.recv() {
            Ok(Some(err)) => Err(err),
            _ => Ok(()),
        };
        server.detach_listener();
        result
    }

    /// Graceful exit: quit `serve`, stop accepting, and close idle
    /// connections until all are gone or `timeout` elapses. On timeout the
    /// deadline error is returned and busy connections stay open. The
    /// underlying pollers are left running.
    pub fn shutdown(&self, timeout: Duration) -> Result<(), Error> {
        let server = self.server.lock().take();
        let Some(server) = server else {
            return Ok(());
        };
        let _ = self.stop_tx.try_send(None);
        server.shutdown(Some(Instant::now() + timeout))
    }
}
