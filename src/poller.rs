//! The readiness-multiplexer abstraction and its epoll realization.
//!
//! All three methods of [`Multiplexer`] — and [`Multiplexer::poll`] in
//! particular — must only ever be called from the owning `EventLoop`'s
//! thread; nothing here is `Send`/`Sync` and nothing needs to be.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Weak;
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::channel::{ChannelIndex, Dispatch};
use crate::sys::syscall;

const INIT_EVENT_LIST_SIZE: usize = 16;

/// The capability every readiness backend must provide. One concrete
/// implementation — epoll — ships today; a kqueue or io_uring backend
/// would implement the same trait and preserve the same membership-state
/// rule (all calls happen on the owning loop's thread).
pub(crate) trait Multiplexer {
    /// Waits up to `timeout` for readiness, appending every channel that
    /// became active to `active`. Returns the time the wait returned.
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Weak<dyn Dispatch>>) -> Instant;

    /// Registers a new channel, or updates an already-registered one's
    /// interest mask (including dropping it to `Deleted` if its interest
    /// became empty).
    fn update_channel(&mut self, channel: Weak<dyn Dispatch>);

    /// Removes a channel entirely.
    fn remove_channel(&mut self, fd: RawFd);

    #[cfg(test)]
    fn has_channel(&self, fd: RawFd) -> bool;
}

/// The epoll-backed [`Multiplexer`].
pub(crate) struct EpollMultiplexer {
    epoll_fd: RawFd,
    channels: HashMap<RawFd, Weak<dyn Dispatch>>,
    events: Vec<libc::epoll_event>,
}

impl EpollMultiplexer {
    pub(crate) fn new() -> std::io::Result<EpollMultiplexer> {
        let epoll_fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(EpollMultiplexer {
            epoll_fd,
            channels: HashMap::new(),
            events: vec![unsafe { std::mem::zeroed() }; INIT_EVENT_LIST_SIZE],
        })
    }

    fn update(&self, op: libc::c_int, fd: RawFd, events: i32) -> std::io::Result<()> {
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = events as u32;
        ev.u64 = fd as u64;
        syscall!(epoll_ctl(self.epoll_fd, op, fd, &mut ev)).map(|_| ())
    }

    fn fill_active(&self, n: usize, active: &mut Vec<Weak<dyn Dispatch>>) {
        for ev in &self.events[..n] {
            let fd = ev.u64 as RawFd;
            if let Some(weak) = self.channels.get(&fd) {
                if let Some(strong) = weak.upgrade() {
                    strong.set_revents(ev.events as i32);
                    active.push(weak.clone());
                } else {
                    trace!("epoll: fd {fd} fired after its owner was dropped");
                }
            }
        }
    }
}

impl Drop for EpollMultiplexer {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

impl AsRawFd for EpollMultiplexer {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll_fd
    }
}

impl Multiplexer for EpollMultiplexer {
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Weak<dyn Dispatch>>) -> Instant {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let result = syscall!(epoll_wait(
            self.epoll_fd,
            self.events.as_mut_ptr(),
            self.events.len() as libc::c_int,
            timeout_ms,
        ));
        let now = Instant::now();

        match result {
            Ok(n) => {
                let n = n as usize;
                trace!("{n} events happened");
                self.fill_active(n, active);
                if n == self.events.len() {
                    self.events.resize(n * 2, unsafe { std::mem::zeroed() });
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {
                // EINTR: treat as "nothing happened", the loop will poll again.
            }
            Err(e) => {
                error!("epoll_wait error: {e}");
            }
        }
        now
    }

    fn update_channel(&mut self, channel: Weak<dyn Dispatch>) {
        let Some(ch) = channel.upgrade() else {
            return;
        };
        let fd = ch.fd();
        match ch.index() {
            ChannelIndex::New | ChannelIndex::Deleted => {
                if ch.index() == ChannelIndex::New {
                    debug_assert!(!self.channels.contains_key(&fd));
                } else {
                    debug_assert!(self.channels.contains_key(&fd));
                }
                self.channels.insert(fd, channel.clone());
                ch.set_index(ChannelIndex::Added);
                if let Err(e) = self.update(libc::EPOLL_CTL_ADD, fd, ch.events()) {
                    error!("epoll_ctl add failed for fd {fd}: {e}");
                }
            }
            ChannelIndex::Added => {
                debug_assert!(self.channels.contains_key(&fd));
                if ch.events() == 0 {
                    if let Err(e) = self.update(libc::EPOLL_CTL_DEL, fd, ch.events()) {
                        error!("epoll_ctl del failed for fd {fd}: {e}");
                    }
                    ch.set_index(ChannelIndex::Deleted);
                } else if let Err(e) = self.update(libc::EPOLL_CTL_MOD, fd, ch.events()) {
                    error!("epoll_ctl mod failed for fd {fd}: {e}");
                }
            }
        }
    }

    fn remove_channel(&mut self, fd: RawFd) {
        if let Some(weak) = self.channels.remove(&fd) {
            if let Some(ch) = weak.upgrade() {
                if ch.index() == ChannelIndex::Added {
                    if let Err(e) = self.update(libc::EPOLL_CTL_DEL, fd, 0) {
                        error!("epoll_ctl del failed for fd {fd}: {e}");
                    }
                }
                ch.set_index(ChannelIndex::New);
            }
        }
    }

    #[cfg(test)]
    fn has_channel(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use std::cell::{Cell, RefCell};
    use std::sync::Arc;

    struct TestChannel {
        inner: RefCell<Channel>,
        fired: Cell<bool>,
    }

    impl Dispatch for TestChannel {
        fn fd(&self) -> RawFd {
            self.inner.borrow().fd()
        }
        fn events(&self) -> i32 {
            self.inner.borrow().events()
        }
        fn revents(&self) -> i32 {
            self.inner.borrow().revents()
        }
        fn set_revents(&self, revents: i32) {
            self.inner.borrow_mut().set_revents(revents);
        }
        fn index(&self) -> ChannelIndex {
            self.inner.borrow().index()
        }
        fn set_index(&self, index: ChannelIndex) {
            self.inner.borrow_mut().set_index(index);
        }
        fn handle_event(&self, _receive_time: Instant) {
            self.fired.set(true);
        }
    }

    #[test]
    fn register_then_poll_reports_readable_eventfd() {
        let mut mux = EpollMultiplexer::new().unwrap();
        let fd = crate::sys::eventfd().unwrap();

        let ch = Arc::new(TestChannel {
            inner: RefCell::new(Channel::new(fd)),
            fired: Cell::new(false),
        });
        ch.inner.borrow_mut().enable_reading();
        let weak: Weak<dyn Dispatch> = Arc::downgrade(&ch) as Weak<dyn Dispatch>;
        mux.update_channel(weak.clone());
        assert!(mux.has_channel(fd));

        let buf: [u8; 8] = 1u64.to_ne_bytes();
        unsafe {
            libc::write(fd, buf.as_ptr() as *const libc::c_void, 8);
        }

        let mut active = Vec::new();
        mux.poll(Duration::from_millis(1000), &mut active);
        assert_eq!(active.len(), 1);

        mux.remove_channel(fd);
        assert!(!mux.has_channel(fd));
        unsafe {
            libc::close(fd);
        }
    }
}
