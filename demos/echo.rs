//! A minimal echo server: logs connect/disconnect, echoes the first
//! message it receives on each connection, then shuts that connection
//! down half-close-style.

use std::sync::Arc;

use log::info;
use tcp_reactor::{EventLoop, TcpServer, TcpServerOptions};

fn main() {
    env_logger::init();

    let loop_ = EventLoop::new().expect("failed to create event loop");
    let addr = "127.0.0.1:8000".parse().unwrap();
    let server = TcpServer::new(loop_.clone(), addr, "echo", TcpServerOptions::NoReusePort)
        .expect("failed to bind 127.0.0.1:8000");

    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            info!("connection up: {}", conn.peer_addr());
        } else {
            info!("connection down: {}", conn.peer_addr());
        }
    }));

    server.set_message_callback(Arc::new(|conn, buf, _receive_time| {
        let msg = buf.retrieve_all_as_string();
        conn.send(msg.as_bytes());
        conn.shutdown();
    }));

    // threads = 0: every connection stays on the accept loop.
    server.set_thread_num(0, None);
    server.start();

    info!("echo server listening on {addr}");
    loop_.run();
}
