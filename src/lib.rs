//! A multi-reactor, one-loop-per-thread TCP server library.
//!
//! A [`TcpServer`] owns one accept [`EventLoop`] and, optionally, a fixed
//! pool of worker loops (see [`TcpServer::set_thread_num`]); each accepted
//! connection is handed round-robin to a worker loop and lives out its
//! life as a [`TcpConnection`] on that loop's own thread. `Buffer`,
//! [`EventLoop`]/[`LoopHandle`] and the five callback type aliases are the
//! crate's public surface; everything else (`Channel`, `Dispatch`, the
//! `Multiplexer`, `Acceptor`, `LoopThreadPool`) is internal wiring.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tcp_reactor::{EventLoop, TcpServer, TcpServerOptions};
//!
//! let loop_ = EventLoop::new().expect("failed to create event loop");
//! let server = TcpServer::new(
//!     loop_.clone(),
//!     "127.0.0.1:8000".parse().unwrap(),
//!     "echo",
//!     TcpServerOptions::NoReusePort,
//! )
//! .expect("failed to bind");
//! server.set_message_callback(Arc::new(|conn, buf, _receive_time| {
//!     let data = buf.retrieve_all_bytes();
//!     conn.send(&data);
//! }));
//! server.set_thread_num(0, None);
//! server.start();
//! loop_.run();
//! ```

mod acceptor;
mod buffer;
mod channel;
mod connection;
mod event_loop;
mod loop_thread;
mod poller;
mod server;
mod sys;

pub use buffer::Buffer;
pub use connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback,
};
pub use event_loop::{EventLoop, LoopHandle};
pub use loop_thread::ThreadInitCallback;
pub use server::{Options as TcpServerOptions, TcpServer};
