//! Thin wrappers over the raw syscalls the reactor issues.
//!
//! Everything here reports failures through `io::Error::last_os_error()`;
//! callers decide which errno values are transient.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

/// Vectored read into the regions described by `iovs`.
pub fn readv(fd: RawFd, iovs: &[libc::iovec]) -> io::Result<usize> {
    let n = unsafe { libc::readv(fd, iovs.as_ptr(), iovs.len() as libc::c_int) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Vectored write of the regions described by `iovs`.
///
/// `zerocopy` is accepted for interface symmetry but MSG_ZEROCOPY is never
/// set; the error-queue handling on the read side stays in place either way.
pub fn sendmsg(fd: RawFd, iovs: &[libc::iovec], zerocopy: bool) -> io::Result<usize> {
    let _ = zerocopy;
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iovs.as_ptr() as *mut libc::iovec;
    msg.msg_iovlen = iovs.len() as _;
    let n = unsafe { libc::sendmsg(fd, &msg, SEND_FLAGS) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Probe the socket error queue after EPOLLERR.
///
/// Zero-copy notifications surface as EPOLLERR with an EAGAIN error-queue
/// recv; only a non-EAGAIN result is a real error. Returns `true` when the
/// condition is a genuine failure and the fd should be hung up.
#[cfg(target_os = "linux")]
pub fn pending_socket_error(fd: RawFd) -> bool {
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE) };
    if n >= 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::EAGAIN)
}

/// Close a file descriptor, ignoring the result.
pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Mark a socket as TCP_NODELAY.
pub fn set_tcp_nodelay(fd: RawFd) -> io::Result<()> {
    let optval: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &optval as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Suppress SIGPIPE on send for platforms without MSG_NOSIGNAL.
#[cfg(not(target_os = "linux"))]
pub fn set_nosigpipe(fd: RawFd) -> io::Result<()> {
    let optval: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &optval as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Decode a peer address out of a `sockaddr_storage`.
pub fn decode_sockaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sa.sin_port)))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sa.sin6_port)))
        }
        _ => None,
    }
}

/// Write a `SocketAddr` into a `sockaddr_storage`, returning the length.
pub fn encode_sockaddr(storage: &mut libc::sockaddr_storage, addr: &SocketAddr) -> libc::socklen_t {
    unsafe {
        std::ptr::write_bytes(storage as *mut _ as *mut u8, 0, mem::size_of::<libc::sockaddr_storage>());
    }
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

/// Number of online CPU cores, minimum 1.
pub fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 {
        1
    } else {
        ret as usize
    }
}

/// Whether an `io::Error` is a should-retry-later condition.
pub fn is_would_block(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}
