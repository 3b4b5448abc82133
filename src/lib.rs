//! nexio: an event-driven network I/O runtime for stream servers.
//!
//! A small reactor built directly on kernel readiness notification (epoll
//! on Linux, kqueue on BSD-family systems). A fixed set of poller threads
//! multiplexes fds through pooled per-fd operators whose addresses ride in
//! the kernel event payload; connection reads and writes are vectored
//! straight into buffers owned by the connection, and request handling runs
//! on a shared task pool.
//!
//! ```no_run
//! use std::sync::Arc;
//! use nexio::{EventLoop, TcpListener};
//!
//! let listener = Arc::new(TcpListener::bind("127.0.0.1:8080").unwrap());
//! let event_loop = EventLoop::new(|conn| {
//!     let data = conn.next(conn.input_len())?;
//!     conn.write(&data)?;
//!     conn.flush()?;
//!     Ok(())
//! });
//! event_loop.serve(listener).unwrap();
//! ```

mod buffer;
mod config;
mod connection;
mod error;
mod event_loop;
mod listener;
pub mod manager;
mod operator;
pub mod pool;
mod poll;
mod server;
mod sys;
mod task;

pub use config::Config;
pub use connection::{CloseCallback, Connection};
pub use error::Error;
pub use event_loop::{EventLoop, OnPrepare, OnRequest};
pub use listener::{Accepted, Listener, TcpListener};
pub use operator::{Callback, FdOperator, IoProvider, OpHandle};
pub use poll::{PollEvent, Poller, MAX_IOVECS};
