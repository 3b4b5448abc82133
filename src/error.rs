use std::io;

use thiserror::Error;

/// Errors surfaced by the runtime.
///
/// Transient kernel conditions (`EINTR`, `EAGAIN`) are absorbed internally
/// and never appear here; per-fd I/O failures are logged and handled by
/// detaching the fd, not by tearing down the poller.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying syscall failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The listener was closed, either explicitly or by the peer of
    /// `accept`. Replaces error-message sniffing with a typed sentinel.
    #[error("listener closed")]
    ListenerClosed,

    /// Graceful shutdown did not drain all connections before the deadline.
    /// In-flight connections are left open.
    #[error("shutdown deadline exceeded")]
    ShutdownTimeout,

    /// Operation on a connection that is already closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// `serve` was called on an event loop that is already serving.
    #[error("event loop already serving")]
    AlreadyServing,

    /// A read asked for more bytes than the input buffer currently holds.
    #[error("insufficient buffered data: requested {requested}, available {available}")]
    InsufficientData { requested: usize, available: usize },
}

impl Error {
    /// Whether this error means the listener is gone and the event loop
    /// should quit.
    pub fn is_listener_closed(&self) -> bool {
        matches!(self, Error::ListenerClosed)
    }
}
