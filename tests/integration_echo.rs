//! End-to-end tests driving a real `TcpServer` over the loopback
//! interface with `std::net::TcpStream` clients, the way a live kernel
//! socket test has to be written (no mock transport exists in this crate).

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use tcp_reactor::{EventLoop, TcpServer, TcpServerOptions};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Starts an echo server (threads = 0) on a free loopback port, on its
/// own dedicated thread, and returns that address plus a [`LoopHandle`]
/// the caller can `quit()` when done. The `TcpServer` itself never leaves
/// the thread that created it — only the `Send + Sync` loop handle does.
fn start_echo_server() -> (SocketAddr, Arc<tcp_reactor::EventLoop>) {
    // Grab a free port with a throwaway listener, then hand that exact
    // address to the real server — avoids plumbing the bound port back
    // out of a non-`Send` `TcpServer`.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let (ready_tx, ready_rx) = mpsc::channel::<Arc<EventLoop>>();
    std::thread::spawn(move || {
        let loop_ = EventLoop::new().expect("event loop");
        let server = TcpServer::new(loop_.clone(), addr, "integration-echo", TcpServerOptions::NoReusePort)
            .expect("bind");
        server.set_message_callback(Arc::new(|conn, buf, _receive_time| {
            let data = buf.retrieve_all_bytes();
            conn.send(&data);
        }));
        server.set_thread_num(0, None);
        server.start();

        ready_tx.send(loop_.clone()).expect("test dropped the ready receiver");
        loop_.run();
    });

    let loop_ = ready_rx.recv().expect("server thread failed to start");
    (addr, loop_)
}

#[test]
fn echoes_a_single_message_back() {
    init_logging();
    let (addr, loop_) = start_echo_server();

    let mut client = TcpStream::connect(addr).expect("connect");
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    client.write_all(b"hello reactor").unwrap();

    let mut buf = [0u8; 32];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello reactor");

    loop_.quit();
}

#[test]
fn handles_several_concurrent_clients() {
    init_logging();
    let (addr, loop_) = start_echo_server();
    let connected = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let connected = connected.clone();
            std::thread::spawn(move || {
                let mut client = TcpStream::connect(addr).expect("connect");
                client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                let msg = format!("client-{i}");
                client.write_all(msg.as_bytes()).unwrap();

                let mut buf = [0u8; 32];
                let n = client.read(&mut buf).unwrap();
                assert_eq!(&buf[..n], msg.as_bytes());
                connected.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(connected.load(Ordering::SeqCst), 8);

    loop_.quit();
}

#[test]
fn large_payload_round_trips_through_backpressure_path() {
    init_logging();
    let (addr, loop_) = start_echo_server();

    // Large enough to not fit in one writev/readv pass on most kernels,
    // exercising Buffer's scatter-read growth and TcpConnection's
    // partial-write buffering on the way back.
    let mut seed = 0x2545F4914F6CDD1Du64;
    let mut next_byte = move || {
        // xorshift64*, good enough for a non-cryptographic test fixture.
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        (seed % 256) as u8
    };
    let payload: Vec<u8> = (0..rand::random_range(900_000..1_100_000))
        .map(|_| next_byte())
        .collect();

    let mut client = TcpStream::connect(addr).expect("connect");
    client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    client.write_all(&payload).unwrap();

    let mut received = Vec::with_capacity(payload.len());
    let mut buf = [0u8; 64 * 1024];
    while received.len() < payload.len() {
        let n = client.read(&mut buf).expect("read");
        assert!(n > 0, "peer closed before sending the whole payload back");
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, payload);

    loop_.quit();
}

#[test]
fn high_water_mark_fires_exactly_once_under_backpressure() {
    init_logging();

    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    const HIGH_WATER_MARK: usize = 16 * 1024;
    let hwm_fires = Arc::new(AtomicUsize::new(0));
    let hwm_fires_cb = hwm_fires.clone();

    let (ready_tx, ready_rx) = mpsc::channel::<Arc<EventLoop>>();
    std::thread::spawn(move || {
        let loop_ = EventLoop::new().expect("event loop");
        let server = TcpServer::new(loop_.clone(), addr, "hwm-echo", TcpServerOptions::NoReusePort)
            .expect("bind");

        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                let fires = hwm_fires_cb.clone();
                conn.set_high_water_mark_callback(
                    HIGH_WATER_MARK,
                    Arc::new(move |_conn, _len| {
                        fires.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }
        }));
        server.set_message_callback(Arc::new(|conn, buf, _receive_time| {
            let data = buf.retrieve_all_bytes();
            conn.send(&data);
        }));
        server.set_thread_num(0, None);
        server.start();

        ready_tx.send(loop_.clone()).expect("test dropped the ready receiver");
        loop_.run();
    });

    let loop_ = ready_rx.recv().expect("server thread failed to start");

    // The client writes a payload well above the mark but doesn't read
    // anything back for a while, so the server's echoed bytes pile up in
    // its output buffer past HIGH_WATER_MARK before draining.
    let payload = vec![0x5au8; 4 * 1024 * 1024];
    let mut client = TcpStream::connect(addr).expect("connect");
    client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    let mut write_client = client.try_clone().unwrap();
    let writer = std::thread::spawn(move || {
        write_client.write_all(&payload).unwrap();
    });

    std::thread::sleep(Duration::from_millis(300));

    let mut received = 0usize;
    let mut buf = [0u8; 64 * 1024];
    while received < 4 * 1024 * 1024 {
        let n = client.read(&mut buf).expect("read");
        assert!(n > 0, "peer closed before echoing the whole payload back");
        received += n;
    }
    writer.join().unwrap();

    assert_eq!(hwm_fires.load(Ordering::SeqCst), 1);

    loop_.quit();
}
