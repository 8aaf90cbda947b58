//! End-to-end echo tests against a live server.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use reactor::EventLoopThread;
use server::{ServerOption, TcpConnectionRef, TcpServer};

/// Get an available port for testing.
fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Connect with retries while the server finishes starting up.
fn connect(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return stream,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
            Err(e) => panic!("could not connect to test server: {e}"),
        }
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + timeout;
    while Instant::now() < end {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn echo_round_trip_and_down_notification() {
    let mut base = EventLoopThread::new("echo-base", None);
    let base_handle = base.start_loop();

    let port = get_available_port();
    let server = TcpServer::new(
        base_handle,
        format!("127.0.0.1:{port}").parse().unwrap(),
        "echo",
        ServerOption::Plain,
    )
    .unwrap();
    server.set_thread_num(3);

    let ups = Arc::new(AtomicUsize::new(0));
    let downs = Arc::new(AtomicUsize::new(0));
    {
        let ups = ups.clone();
        let downs = downs.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                ups.fetch_add(1, Ordering::SeqCst);
            } else {
                downs.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    let seen_readable = Arc::new(AtomicUsize::new(0));
    {
        let seen_readable = seen_readable.clone();
        server.set_message_callback(Arc::new(move |conn, buf, _ts| {
            seen_readable.store(buf.readable_bytes(), Ordering::SeqCst);
            conn.send(buf.retrieve_all_as_bytes());
        }));
    }

    server.start();

    let mut client = connect(port);
    client.write_all(b"hello\n").unwrap();

    let mut reply = [0u8; 6];
    client.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello\n");
    assert_eq!(seen_readable.load(Ordering::SeqCst), 6);
    assert_eq!(ups.load(Ordering::SeqCst), 1);

    drop(client);
    assert!(wait_until(Duration::from_secs(3), || {
        downs.load(Ordering::SeqCst) == 1
    }));
}

#[test]
fn sequential_clients_each_get_their_own_echo() {
    let mut base = EventLoopThread::new("multi-base", None);
    let base_handle = base.start_loop();

    let port = get_available_port();
    let server = TcpServer::new(
        base_handle,
        format!("127.0.0.1:{port}").parse().unwrap(),
        "echo",
        ServerOption::Plain,
    )
    .unwrap();
    server.set_thread_num(2);
    server.set_message_callback(Arc::new(|conn, buf, _ts| {
        conn.send(buf.retrieve_all_as_bytes());
    }));
    server.start();

    for i in 0..5u8 {
        let mut client = connect(port);
        client.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let msg = vec![b'a' + i; 64];
        client.write_all(&msg).unwrap();

        let mut reply = vec![0u8; 64];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, msg);
    }
}

#[test]
fn cross_thread_send_delivers_exactly_once() {
    let mut base = EventLoopThread::new("xsend-base", None);
    let base_handle = base.start_loop();

    let port = get_available_port();
    let server = TcpServer::new(
        base_handle,
        format!("127.0.0.1:{port}").parse().unwrap(),
        "xsend",
        ServerOption::Plain,
    )
    .unwrap();
    server.set_thread_num(1);

    let conn_slot: Arc<Mutex<Option<TcpConnectionRef>>> = Arc::new(Mutex::new(None));
    {
        let conn_slot = conn_slot.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                *conn_slot.lock().unwrap() = Some(conn.clone());
            }
        }));
    }
    server.start();

    let mut client = connect(port);
    assert!(wait_until(Duration::from_secs(3), || conn_slot
        .lock()
        .unwrap()
        .is_some()));

    // This test thread is neither the base loop nor the worker loop.
    let conn = conn_slot.lock().unwrap().clone().unwrap();
    assert!(!conn.loop_handle().is_in_loop_thread());
    conn.send(b"x".to_vec());

    let mut byte = [0u8; 1];
    client.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    client.read_exact(&mut byte).unwrap();
    assert_eq!(&byte, b"x");

    // Exactly once: nothing further arrives within the grace window.
    client
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut extra = [0u8; 16];
    match client.read(&mut extra) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected extra {n} bytes"),
        Err(e) => assert!(
            matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            "unexpected read error: {e}"
        ),
    }

    drop(conn);
    *conn_slot.lock().unwrap() = None;
}
