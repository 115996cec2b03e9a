//! Thin libc glue shared by the poller, acceptor and connection.
//!
//! Every raw syscall in the crate goes through [`syscall!`], which turns
//! the usual `-1`-on-error convention into an `io::Result`.

use std::io;
use std::mem::size_of;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

/// Runs a libc call, converting a `-1` return into `io::Error::last_os_error()`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) use syscall;

/// Sets `O_NONBLOCK` and `FD_CLOEXEC` on an fd that wasn't created with the
/// `SOCK_NONBLOCK | SOCK_CLOEXEC` flags already (e.g. a listener inherited
/// from elsewhere).
pub(crate) fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    let fdflags = syscall!(fcntl(fd, libc::F_GETFD))?;
    syscall!(fcntl(fd, libc::F_SETFD, fdflags | libc::FD_CLOEXEC))?;
    Ok(())
}

/// Enables or disables `SO_REUSEADDR`.
pub(crate) fn set_reuseaddr(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
}

/// Enables `SO_REUSEPORT`. Not exposed by `std`, so this goes straight to
/// `setsockopt`.
pub(crate) fn set_reuseport(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
}

/// Enables or disables `TCP_NODELAY`.
pub(crate) fn set_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt_bool(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
}

fn setsockopt_bool(fd: RawFd, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
    let val: libc::c_int = on as libc::c_int;
    syscall!(setsockopt(
        fd,
        level,
        name,
        &val as *const libc::c_int as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

/// Converts a `std::net::SocketAddr` into the raw pointer/length pair
/// `bind`/`connect`/`accept` want.
pub(crate) fn socket_addr(addr: &SocketAddr) -> (*const libc::sockaddr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(ref a) => (
            a as *const _ as *const libc::sockaddr,
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ),
        SocketAddr::V6(ref a) => (
            a as *const _ as *const libc::sockaddr,
            size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        ),
    }
}

/// Reads the local address of a bound/connected socket via `getsockname`.
pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    sockname(fd, libc::getsockname)
}

/// Reads the peer address of a connected socket via `getpeername`.
pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    sockname(fd, libc::getpeername)
}

fn sockname(
    fd: RawFd,
    f: unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int,
) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let res = unsafe { f(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if res == -1 {
        return Err(io::Error::last_os_error());
    }
    to_socket_addr(&storage)
}

fn to_socket_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: libc::sockaddr_in =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            Ok(SocketAddr::V4(std::net::SocketAddrV4::new(
                std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let addr: libc::sockaddr_in6 =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(std::net::SocketAddrV6::new(
                std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr),
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

/// Creates a non-blocking, close-on-exec `eventfd(2)` counter used as the
/// `EventLoop`'s cross-thread wakeup descriptor.
pub(crate) fn eventfd() -> io::Result<RawFd> {
    syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))
}
