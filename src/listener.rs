//! Nonblocking TCP listener built directly on the socket syscalls.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Error;
use crate::sys;

const DEFAULT_BACKLOG: libc::c_int = 1024;

/// A stream listener the event loop can serve.
pub trait Listener: Send + Sync {
    /// The listening fd, registered for readable events.
    fn fd(&self) -> RawFd;
    /// Accept one pending connection. `Ok(None)` when none is ready;
    /// `Err(Error::ListenerClosed)` once the listener is gone.
    fn accept(&self) -> Result<Option<Accepted>, Error>;
    /// Close the listening socket. Idempotent.
    fn close(&self) -> io::Result<()>;
}

/// An accepted stream socket, already nonblocking and close-on-exec.
pub struct Accepted {
    pub fd: RawFd,
    pub peer: Option<SocketAddr>,
}

/// Raw nonblocking TCP listener.
pub struct TcpListener {
    fd: RawFd,
    local: SocketAddr,
    closed: AtomicBool,
}

impl TcpListener {
    /// Bind and listen on `addr` (e.g. `"127.0.0.1:0"` for an ephemeral
    /// port).
    pub fn bind(addr: &str) -> Result<TcpListener, Error> {
        let parsed: SocketAddr = addr
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                Error::Io(io::Error::new(io::ErrorKind::InvalidInput, e))
            })?;

        let domain = if parsed.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };
        let fd = unsafe {
            libc::socket(
                domain,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let optval: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &optval as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let addr_len = sys::encode_sockaddr(&mut storage, &parsed);
        let rc = unsafe {
            libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len)
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            sys::close(fd);
            return Err(Error::Io(err));
        }

        let rc = unsafe { libc::listen(fd, DEFAULT_BACKLOG) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            sys::close(fd);
            return Err(Error::Io(err));
        }

        // Recover the actual address for ephemeral-port binds.
        let mut bound: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut bound_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(fd, &mut bound as *mut _ as *mut libc::sockaddr, &mut bound_len)
        };
        let local = if rc == 0 {
            sys::decode_sockaddr(&bound).unwrap_or(parsed)
        } else {
            parsed
        };

        Ok(TcpListener {
            fd,
            local,
            closed: AtomicBool::new(false),
        })
    }

    /// The bound address, with the kernel-assigned port filled in.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Listener for TcpListener {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn accept(&self) -> Result<Option<Accepted>, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ListenerClosed);
        }

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        #[cfg(target_os = "linux")]
        let fd = unsafe {
            libc::accept4(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        #[cfg(not(target_os = "linux"))]
        let fd = unsafe {
            let fd = libc::accept(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            );
            if fd >= 0 {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
            fd
        };

        if fd < 0 {
            let err = io::Error::last_os_error();
            let errno = err.raw_os_error();
            if errno == Some(libc::EAGAIN)
                || errno == Some(libc::EINTR)
                || errno == Some(libc::ECONNABORTED)
            {
                return Ok(None);
            }
            // The fd went away underneath us: a racing close.
            if errno == Some(libc::EBADF) || errno == Some(libc::EINVAL) {
                return Err(Error::ListenerClosed);
            }
            return Err(Error::Io(err));
        }

        Ok(Some(Accepted {
            fd,
            peer: sys::decode_sockaddr(&storage),
        }))
    }

    fn close(&self) -> io::Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            sys::close(self.fd);
        }
        Ok(())
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let _ = Listener::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[test]
    fn accept_reports_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        assert!(matches!(listener.accept(), Ok(None)));
        Listener::close(&listener).unwrap();
        assert!(matches!(listener.accept(), Err(Error::ListenerClosed)));
    }

    #[test]
    fn accepts_a_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = std::net::TcpStream::connect(listener.local_addr()).unwrap();
        // The handshake completes in the kernel; poll briefly for it.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            match listener.accept().unwrap() {
                Some(accepted) => {
                    assert!(accepted.peer.is_some());
                    sys::close(accepted.fd);
                    break;
                }
                None => {
                    assert!(std::time::Instant::now() < deadline, "accept never succeeded");
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
            }
        }
    }
}
