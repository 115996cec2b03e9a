//! The composition root: owns the listening `Acceptor`, a `LoopThreadPool`
//! of worker loops, and the registry of currently-open connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::acceptor::Acceptor;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::event_loop::LoopHandle;
use crate::loop_thread::{LoopThreadPool, ThreadInitCallback};

/// Whether the listening socket additionally sets `SO_REUSEPORT`, letting
/// several processes (or several `TcpServer`s in this one) share a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Options {
    NoReusePort,
    ReusePort,
}

/// The `Send + Sync` core of a `TcpServer`: everything a connection's
/// close callback needs to reach, regardless of which thread raised it.
/// Kept separate from the `Rc`-owned `Acceptor`, which only ever runs on
/// the accept loop's own thread and must never be captured by a
/// cross-thread closure.
struct ServerCore {
    loop_: LoopHandle,
    name: String,
    ip_port: SocketAddr,
    thread_pool: Mutex<LoopThreadPool>,

    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,

    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
    next_conn_id: AtomicUsize,
}

impl ServerCore {
    fn new_connection(self: &Arc<Self>, fd: RawFd, peer_addr: SocketAddr) {
        let io_loop = self.thread_pool.lock().unwrap().get_next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);
        let local_addr = crate::sys::local_addr(fd).unwrap_or(self.ip_port);

        info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );

        let conn = TcpConnection::new(conn_name.clone(), io_loop.clone(), fd, local_addr, peer_addr);

        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            conn.set_connection_callback(cb);
        }
        if let Some(cb) = self.message_cb.lock().unwrap().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }

        let this = self.clone();
        conn.set_close_callback(Box::new(move |conn| {
            this.remove_connection(conn);
        }));

        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());

        let established = conn.clone();
        io_loop.run_in_loop(move || {
            established.connect_established();
        });
    }

    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        let this = self.clone();
        let conn = conn.clone();
        self.loop_.run_in_loop(move || {
            this.remove_connection_in_loop(&conn);
        });
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionPtr) {
        info!(
            "TcpServer::remove_connection_in_loop [{}] - connection [{}]",
            self.name,
            conn.name()
        );
        self.connections.lock().unwrap().remove(conn.name());
        let io_loop = conn.loop_handle();
        let conn = conn.clone();
        io_loop.queue_in_loop(move || {
            conn.connect_destroyed();
        });
    }
}

/// A multi-reactor TCP server: one accept loop plus a fixed pool of
/// worker loops that accepted connections are dispatched to round-robin.
pub struct TcpServer {
    core: Arc<ServerCore>,
    acceptor: std::rc::Rc<Acceptor>,
    started: AtomicBool,
}

impl TcpServer {
    /// Creates a server bound to `listen_addr`. Does not start listening —
    /// call [`TcpServer::start`] for that, after wiring up callbacks.
    pub fn new(
        loop_: LoopHandle,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        options: Options,
    ) -> std::io::Result<TcpServer> {
        let name = name.into();
        let reuse_port = options == Options::ReusePort;
        let acceptor = Acceptor::new(loop_.clone(), listen_addr, reuse_port)?;

        let core = Arc::new(ServerCore {
            thread_pool: Mutex::new(LoopThreadPool::new(loop_.clone(), name.clone())),
            loop_,
            ip_port: listen_addr,
            name,
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicUsize::new(1),
        });

        Ok(TcpServer {
            core,
            acceptor,
            started: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn loop_handle(&self) -> LoopHandle {
        self.core.loop_.clone()
    }

    /// The listening socket's actual bound address, useful when
    /// [`TcpServer::new`] was given port `0`.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Sets the worker-pool size. Must be called before [`TcpServer::start`].
    /// `num_threads == 0` keeps every connection on the accept loop.
    pub fn set_thread_num(&self, num_threads: usize, init_cb: Option<ThreadInitCallback>) {
        self.core.thread_pool.lock().unwrap().start(num_threads, init_cb);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.core.connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.core.message_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.core.write_complete_cb.lock().unwrap() = Some(cb);
    }

    /// Starts listening for connections. Idempotent: a second call is a
    /// no-op, matching the original's `CheckLoopNotNull`-guarded `start`.
    ///
    /// Must be called from the accept loop's own thread: the listening
    /// socket's `Acceptor` is `Rc`-owned and never crosses threads.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        assert!(
            self.core.loop_.is_in_loop_thread(),
            "TcpServer::start must be called from its accept loop's own thread"
        );

        info!(
            "TcpServer::start [{}] listening on {}",
            self.core.name, self.core.ip_port
        );

        let core = self.core.clone();
        self.acceptor
            .set_new_connection_callback(Box::new(move |fd, peer_addr| {
                core.new_connection(fd, peer_addr);
            }));

        self.acceptor.listen().expect("failed to start listening");
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let names: Vec<String> = self.core.connections.lock().unwrap().keys().cloned().collect();
        if !names.is_empty() {
            warn!(
                "TcpServer::drop [{}] - {} connection(s) still open at shutdown",
                self.core.name,
                names.len()
            );
        }
        for name in names {
            if let Some(conn) = self.core.connections.lock().unwrap().remove(&name) {
                let io_loop = conn.loop_handle();
                io_loop.run_in_loop(move || {
                    conn.connect_destroyed();
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;

    #[test]
    fn start_is_idempotent() {
        let loop_ = EventLoop::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::new(loop_.clone(), addr, "echo", Options::NoReusePort).unwrap();
        server.set_thread_num(0, None);
        server.start();
        server.start();
        assert!(server.started.load(Ordering::SeqCst));
    }
}
