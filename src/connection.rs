//! A single established TCP connection: buffered, non-blocking read/write
//! with backpressure, and the Connecting/Connected/Disconnecting/
//! Disconnected lifecycle.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::{error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::{Channel, ChannelIndex, Dispatch};
use crate::event_loop::LoopHandle;
use crate::sys::{self, syscall};

/// Shared, cloneable handle onto an established connection. `Arc`-backed
/// (not `Rc`) because a handle may legitimately be stashed and used from
/// an arbitrary third thread, not just the io loop that owns its `Channel`.
pub type TcpConnectionPtr = Arc<TcpConnection>;

/// `Arc`-wrapped so `TcpServer` can install the one callback it was given
/// on every connection it accepts, rather than needing a distinct closure
/// per connection.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub(crate) type CloseCallback = Box<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Interior state mutated from the owning io loop's thread under normal
/// operation, but reachable from any thread holding a `TcpConnectionPtr`
/// (e.g. `send`/`shutdown` called off-loop), hence the `Mutex` rather than
/// a `RefCell`.
struct ConnectionState {
    conn_state: ConnState,
    channel: Channel,
    input: Buffer,
    output: Buffer,
    high_water_mark: usize,
}

/// An established connection between this process and a peer.
pub struct TcpConnection {
    name: String,
    loop_: LoopHandle,
    fd: RawFd,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: Mutex<ConnectionState>,

    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,

    self_weak: Weak<TcpConnection>,
}

pub(crate) const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

impl TcpConnection {
    pub(crate) fn new(
        name: String,
        loop_: LoopHandle,
        fd: RawFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        sys::set_nonblocking_cloexec(fd).ok();

        Arc::new_cyclic(|weak: &Weak<TcpConnection>| TcpConnection {
            name,
            loop_,
            fd,
            local_addr,
            peer_addr,
            state: Mutex::new(ConnectionState {
                conn_state: ConnState::Connecting,
                channel: Channel::new(fd),
                input: Buffer::new(),
                output: Buffer::new(),
                high_water_mark: DEFAULT_HIGH_WATER_MARK,
            }),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_mark_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state.lock().unwrap().conn_state == ConnState::Connected
    }

    pub fn loop_handle(&self) -> LoopHandle {
        self.loop_.clone()
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> std::io::Result<()> {
        sys::set_nodelay(self.fd, on)
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, mark: usize, cb: HighWaterMarkCallback) {
        self.state.lock().unwrap().high_water_mark = mark;
        *self.high_water_mark_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    /// Completes the Connecting -> Connected transition and registers this
    /// connection's fd for readability. Called exactly once, on the io
    /// loop's thread, by `TcpServer::new_connection`.
    pub(crate) fn connect_established(self: &TcpConnectionPtr) {
        {
            let mut state = self.state.lock().unwrap();
            debug_assert_eq!(state.conn_state, ConnState::Connecting);
            state.conn_state = ConnState::Connected;
            state.channel.enable_reading();
        }
        let weak: Weak<dyn Dispatch> = self.self_weak.clone();
        self.loop_.update_channel(weak);

        if let Some(cb) = self.connection_cb.lock().unwrap().as_ref() {
            cb(self);
        }
    }

    /// Completes the Disconnecting -> Disconnected transition and
    /// deregisters this connection's fd. Called exactly once, on the io
    /// loop's thread, by `TcpServer::remove_connection_in_loop`.
    pub(crate) fn connect_destroyed(self: &TcpConnectionPtr) {
        {
            let mut state = self.state.lock().unwrap();
            if state.conn_state == ConnState::Connected {
                state.conn_state = ConnState::Disconnected;
                state.channel.disable_all();
                if let Some(cb) = self.connection_cb.lock().unwrap().as_ref() {
                    cb(self);
                }
            }
        }
        self.loop_.remove_channel(self.fd);
    }

    fn handle_read(self: &TcpConnectionPtr, receive_time: Instant) {
        let mut state = self.state.lock().unwrap();
        match state.input.read_fd(self.fd) {
            Ok(0) => {
                drop(state);
                self.handle_close();
            }
            Ok(_n) => {
                drop(state);
                if let Some(cb) = self.message_cb.lock().unwrap().as_ref() {
                    let mut state = self.state.lock().unwrap();
                    cb(self, &mut state.input, receive_time);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                drop(state);
                error!("TcpConnection::handle_read [{}] error: {e}", self.name);
                self.handle_error(&e);
                self.handle_close();
            }
        }
    }

    fn handle_write(self: &TcpConnectionPtr) {
        let mut state = self.state.lock().unwrap();
        if !state.channel.is_writing() {
            return;
        }
        match state.output.write_fd(self.fd) {
            Ok(_) => {
                if state.output.readable_bytes() == 0 {
                    state.channel.disable_writing();
                    let disconnecting = state.conn_state == ConnState::Disconnecting;
                    let weak: Weak<dyn Dispatch> = self.self_weak.clone();
                    drop(state);
                    self.loop_.update_channel(weak);
                    if disconnecting {
                        self.shutdown_in_loop();
                    }
                    if self.write_complete_cb.lock().unwrap().is_some() {
                        let conn = self.self_weak.clone();
                        self.loop_.queue_in_loop(move || {
                            if let Some(conn) = conn.upgrade() {
                                if let Some(cb) = conn.write_complete_cb.lock().unwrap().as_ref() {
                                    cb(&conn);
                                }
                            }
                        });
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                drop(state);
                error!("TcpConnection::handle_write [{}] error: {e}", self.name);
            }
        }
    }

    fn handle_close(self: &TcpConnectionPtr) {
        {
            let mut state = self.state.lock().unwrap();
            debug_assert!(matches!(
                state.conn_state,
                ConnState::Connected | ConnState::Disconnecting
            ));
            state.conn_state = ConnState::Disconnected;
            state.channel.disable_all();
        }
        if let Some(cb) = self.close_cb.lock().unwrap().as_ref() {
            cb(self);
        }
    }

    fn handle_error(&self, err: &std::io::Error) {
        warn!(
            "TcpConnection::handle_error [{}] - SO_ERROR/raw error: {err}",
            self.name
        );
    }

    /// Queues `data` for sending. Safe to call from any thread: on-loop
    /// sends go out immediately where possible, off-loop sends are queued
    /// onto the owning loop.
    pub fn send(self: &TcpConnectionPtr, data: &[u8]) {
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.self_weak.clone();
            let owned = data.to_vec();
            self.loop_.run_in_loop(move || {
                if let Some(conn) = conn.upgrade() {
                    conn.send_in_loop(&owned);
                }
            });
        }
    }

    fn send_in_loop(self: &TcpConnectionPtr, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if state.conn_state == ConnState::Disconnected {
            warn!("TcpConnection::send [{}] - disconnected, give up", self.name);
            return;
        }

        let mut remaining = data.len();
        let mut wrote_directly = 0usize;
        let mut fault_error = false;

        if !state.channel.is_writing() && state.output.readable_bytes() == 0 {
            match syscall!(write(
                self.fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
            )) {
                Ok(n) => {
                    wrote_directly = n as usize;
                    remaining -= wrote_directly;
                    if remaining == 0 && self.write_complete_cb.lock().unwrap().is_some() {
                        let conn = self.self_weak.clone();
                        self.loop_.queue_in_loop(move || {
                            if let Some(conn) = conn.upgrade() {
                                if let Some(cb) = conn.write_complete_cb.lock().unwrap().as_ref() {
                                    cb(&conn);
                                }
                            }
                        });
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => {}
                Err(e) => {
                    // Any hard errno (excluding EINTR/EAGAIN) is a fault:
                    // suppress further sends. EPIPE/ECONNRESET additionally
                    // mean the peer is gone, which is just a more specific
                    // flavor of the same fault for logging purposes.
                    fault_error = true;
                    if matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        warn!(
                            "TcpConnection::send_in_loop [{}] - peer closed: {e}",
                            self.name
                        );
                    } else {
                        error!("TcpConnection::send_in_loop [{}] error: {e}", self.name);
                    }
                }
            }
        }

        if !fault_error && remaining > 0 {
            let old_len = state.output.readable_bytes();
            let high_water_mark = state.high_water_mark;
            state.output.append(&data[wrote_directly..]);
            if old_len + remaining >= high_water_mark && old_len < high_water_mark {
                if let Some(cb) = self.high_water_mark_cb.lock().unwrap().as_ref() {
                    let new_len = old_len + remaining;
                    drop(state);
                    cb(self, new_len);
                    state = self.state.lock().unwrap();
                }
            }
            if !state.channel.is_writing() {
                state.channel.enable_writing();
                let weak: Weak<dyn Dispatch> = self.self_weak.clone();
                drop(state);
                self.loop_.update_channel(weak);
            }
        }
    }

    /// Half-closes the connection once its output buffer has drained.
    /// Safe to call from any thread.
    pub fn shutdown(self: &TcpConnectionPtr) {
        {
            let mut state = self.state.lock().unwrap();
            if state.conn_state != ConnState::Connected {
                return;
            }
            state.conn_state = ConnState::Disconnecting;
        }
        if self.loop_.is_in_loop_thread() {
            self.shutdown_in_loop();
        } else {
            let conn = self.self_weak.clone();
            self.loop_.run_in_loop(move || {
                if let Some(conn) = conn.upgrade() {
                    conn.shutdown_in_loop();
                }
            });
        }
    }

    fn shutdown_in_loop(self: &TcpConnectionPtr) {
        let state = self.state.lock().unwrap();
        if !state.channel.is_writing() {
            drop(state);
            if let Err(e) = syscall!(shutdown(self.fd, libc::SHUT_WR)) {
                warn!("TcpConnection::shutdown_in_loop [{}] error: {e}", self.name);
            }
        }
    }

    fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.state.lock().unwrap().conn_state,
            ConnState::Disconnected
        );
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl Dispatch for TcpConnection {
    fn fd(&self) -> RawFd {
        TcpConnection::fd(self)
    }
    fn events(&self) -> i32 {
        self.state.lock().unwrap().channel.events()
    }
    fn revents(&self) -> i32 {
        self.state.lock().unwrap().channel.revents()
    }
    fn set_revents(&self, revents: i32) {
        self.state.lock().unwrap().channel.set_revents(revents);
    }
    fn index(&self) -> ChannelIndex {
        self.state.lock().unwrap().channel.index()
    }
    fn set_index(&self, index: ChannelIndex) {
        self.state.lock().unwrap().channel.set_index(index);
    }
    fn handle_event(&self, receive_time: Instant) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        let revents = crate::channel::Revents(self.state.lock().unwrap().channel.revents());
        trace!("TcpConnection::handle_event [{}] revents {:#x}", self.name, revents.0);

        if revents.is_close() {
            this.handle_close();
            return;
        }
        if revents.is_error() {
            this.handle_error(&std::io::Error::last_os_error());
        }
        if revents.is_readable() {
            this.handle_read(receive_time);
        }
        if revents.is_writable() {
            this.handle_write();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::net::TcpListener;
    use std::os::unix::io::IntoRawFd;

    fn loopback_pair() -> (RawFd, RawFd, SocketAddr, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        let client_local = client.local_addr().unwrap();
        (client.into_raw_fd(), server.into_raw_fd(), client_local, peer)
    }

    #[test]
    fn new_connection_starts_in_connecting_state() {
        let loop_ = EventLoop::new().unwrap();
        let (_client_fd, server_fd, client_addr, _peer) = loopback_pair();
        let conn = TcpConnection::new(
            "test-conn".to_string(),
            loop_,
            server_fd,
            client_addr,
            client_addr,
        );
        assert!(!conn.connected());
        assert_eq!(conn.name(), "test-conn");
    }

    #[test]
    fn connect_established_flips_to_connected_and_fires_callback() {
        let loop_ = EventLoop::new().unwrap();
        let (_client_fd, server_fd, client_addr, _peer) = loopback_pair();
        let conn = TcpConnection::new(
            "test-conn".to_string(),
            loop_,
            server_fd,
            client_addr,
            client_addr,
        );

        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        conn.set_connection_callback(Arc::new(move |_c| {
            fired2.store(true, std::sync::atomic::Ordering::SeqCst);
        }));

        conn.connect_established();
        assert!(conn.connected());
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));

        // Tear down cleanly so Drop's debug_assert on Disconnected holds.
        conn.connect_destroyed();
    }
}
