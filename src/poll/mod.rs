//! Kernel readiness multiplexing: epoll on Linux, kqueue on BSD-family
//! systems. The `Poller` surface is identical on both.

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub use epoll::Poller;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub use kqueue::Poller;

/// Maximum number of regions per vectored syscall; the per-slot barrier
/// scratch is sized to this.
pub const MAX_IOVECS: usize = 32;

/// Operations accepted by `Poller::control`.
///
/// Read interest is level-triggered: a partially drained input buffer must
/// re-fire so the request pump sees the residue. Write interest is
/// edge-triggered: the caller only needs the single writable edge and then
/// manages its own buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    /// Register level-triggered read interest (new fd).
    Readable,
    /// Re-register read interest for an fd the kernel already knows.
    ModReadable,
    /// Register edge-triggered write interest (new fd).
    Writable,
    /// Add write interest to an existing read registration. Used when the
    /// socket send buffer is full and output must drain via readiness.
    ReadWritable,
    /// Drop write interest again, keeping read. Pairs with `ReadWritable`.
    ReadOnly,
    /// Remove the fd from the poller entirely.
    Detach,
}
