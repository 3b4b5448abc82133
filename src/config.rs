use crate::event_loop::OnPrepare;

/// Configuration for an event loop.
#[derive(Clone)]
pub struct Config {
    /// Number of poller threads backing the shared poll manager.
    /// 0 = number of CPUs. Only the first event loop (or an explicit
    /// `manager::setup`) to touch the manager decides the size.
    pub pollers: usize,
    /// Capacity of each buffer segment in bytes. Segments are allocated
    /// once and never reallocated, so regions handed to vectored syscalls
    /// stay at stable addresses.
    pub segment_size: usize,
    /// Upper bound on background task threads (request pumps, hangup
    /// callbacks).
    pub max_task_threads: usize,
    /// Optional hook invoked once per connection before any data arrives.
    /// Its return value is stored on the connection as a type-erased
    /// context. Must not perform I/O.
    pub on_prepare: Option<OnPrepare>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pollers: 0,
            segment_size: 4096,
            max_task_threads: 256,
            on_prepare: None,
        }
    }
}
