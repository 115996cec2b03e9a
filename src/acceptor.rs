//! The listening socket: binds, listens, and hands freshly accepted
//! connections to a callback supplied by `TcpServer`.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Instant;

use log::{error, warn};

use crate::channel::{Channel, ChannelIndex, Dispatch};
use crate::event_loop::LoopHandle;
use crate::sys::{self, syscall};

/// Invoked once per accepted connection with the new fd and its peer
/// address. The callback owns the fd from this point on.
pub type NewConnectionCallback = Box<dyn FnMut(RawFd, SocketAddr)>;

/// The listening socket for a `TcpServer`.
///
/// `Rc`-owned: an `Acceptor` only ever lives on the main/accept
/// `EventLoop`'s thread, so `RefCell` is enough for its interior state —
/// unlike `TcpConnection`, nothing requires handing this across threads.
pub(crate) struct Acceptor {
    loop_: LoopHandle,
    channel: RefCell<Channel>,
    listen_fd: RawFd,
    listening: std::cell::Cell<bool>,
    idle_fd: std::cell::Cell<RawFd>,
    new_connection_cb: RefCell<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Creates a listening socket bound to `addr`. `SO_REUSEADDR` is always
    /// enabled; `reuse_port` additionally enables `SO_REUSEPORT` so several
    /// processes/threads can share the same listening port.
    pub(crate) fn new(
        loop_: LoopHandle,
        addr: SocketAddr,
        reuse_port: bool,
    ) -> std::io::Result<Rc<Acceptor>> {
        let listen_fd = create_nonblocking_socket(&addr)?;
        sys::set_reuseaddr(listen_fd, true)?;
        if reuse_port {
            sys::set_reuseport(listen_fd, true)?;
        }
        bind(listen_fd, &addr)?;

        let idle_fd = open_dev_null()?;

        let acceptor = Rc::new(Acceptor {
            loop_,
            channel: RefCell::new(Channel::new(listen_fd)),
            listen_fd,
            listening: std::cell::Cell::new(false),
            idle_fd: std::cell::Cell::new(idle_fd),
            new_connection_cb: RefCell::new(None),
        });
        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn local_addr(&self) -> std::io::Result<SocketAddr> {
        sys::local_addr(self.listen_fd)
    }

    /// Starts listening and registers the listening fd for readability.
    /// Must be called on the loop's own thread, via `self_handle` since
    /// registering requires a `Weak<dyn Dispatch>` onto this `Acceptor`.
    pub(crate) fn listen(self: &Rc<Self>) -> std::io::Result<()> {
        self.listening.set(true);
        syscall!(listen(self.listen_fd, libc::SOMAXCONN))?;
        self.channel.borrow_mut().enable_reading();
        let weak: Weak<dyn Dispatch> = Rc::downgrade(self) as Weak<dyn Dispatch>;
        self.loop_.update_channel(weak);
        Ok(())
    }

    /// Accepts at most one connection per fire. The listening socket is
    /// edge-of-level-triggered readiness: if more than one connection is
    /// waiting, epoll will simply report this fd readable again on the next
    /// poll cycle rather than this call draining the whole backlog itself.
    fn handle_read(&self) {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let conn_fd = unsafe {
            libc::accept4(
                self.listen_fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };

        if conn_fd >= 0 {
            match sys::peer_addr(conn_fd) {
                Ok(peer) => {
                    if let Some(cb) = self.new_connection_cb.borrow_mut().as_mut() {
                        cb(conn_fd, peer);
                    } else {
                        unsafe {
                            libc::close(conn_fd);
                        }
                    }
                }
                Err(e) => {
                    warn!("failed to read peer address of accepted fd: {e}");
                    unsafe {
                        libc::close(conn_fd);
                    }
                }
            }
            return;
        }

        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => {}
            Some(libc::EMFILE) | Some(libc::ENFILE) => {
                // Out of fds: free our reserved idle fd, accept (and
                // immediately drop) the pending connection to clear the
                // listen backlog entry, then reclaim the idle fd.
                error!("accept4 ran out of file descriptors: {err}");
                unsafe {
                    libc::close(self.idle_fd.get());
                }
                let stray = unsafe {
                    libc::accept(self.listen_fd, std::ptr::null_mut(), std::ptr::null_mut())
                };
                if stray >= 0 {
                    unsafe {
                        libc::close(stray);
                    }
                }
                if let Ok(fd) = open_dev_null() {
                    self.idle_fd.set(fd);
                }
            }
            _ => {
                error!("accept4 failed: {err}");
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.idle_fd.get());
            libc::close(self.listen_fd);
        }
    }
}

impl Dispatch for Acceptor {
    fn fd(&self) -> RawFd {
        self.channel.borrow().fd()
    }
    fn events(&self) -> i32 {
        self.channel.borrow().events()
    }
    fn revents(&self) -> i32 {
        self.channel.borrow().revents()
    }
    fn set_revents(&self, revents: i32) {
        self.channel.borrow_mut().set_revents(revents);
    }
    fn index(&self) -> ChannelIndex {
        self.channel.borrow().index()
    }
    fn set_index(&self, index: ChannelIndex) {
        self.channel.borrow_mut().set_index(index);
    }
    fn handle_event(&self, _receive_time: Instant) {
        self.handle_read();
    }
}

fn create_nonblocking_socket(addr: &SocketAddr) -> std::io::Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = syscall!(socket(
        domain,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0,
    ))?;
    Ok(fd)
}

fn bind(fd: RawFd, addr: &SocketAddr) -> std::io::Result<()> {
    let (ptr, len) = sys::socket_addr(addr);
    syscall!(bind(fd, ptr, len)).map(|_| ())
}

/// Opens a reserved low-cost fd, closed and reopened around an `EMFILE`/
/// `ENFILE` accept storm so the acceptor always has one spare descriptor
/// to use as an escape valve.
fn open_dev_null() -> std::io::Result<RawFd> {
    let path = b"/dev/null\0";
    syscall!(open(
        path.as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;

    #[test]
    fn listen_on_ephemeral_port_succeeds() {
        let loop_ = EventLoop::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let acceptor = Acceptor::new(loop_, addr, false).unwrap();
        acceptor.listen().unwrap();
        assert!(sys::local_addr(acceptor.listen_fd).unwrap().port() != 0);
    }
}
