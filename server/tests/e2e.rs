//! End-to-end tests over a real socket.
//!
//! Boots the server on a loopback port, speaks the client protocol with a
//! plain TcpStream, and exercises graceful shutdown.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use server::config::Config;

/// Get an available port for testing.
fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn start_test_server(port: u16) -> (thread::JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    let handle = thread::spawn(move || {
        let text = format!(
            r#"
            [server]
            address = "127.0.0.1:{port}"
            worker_threads = 2
            executor_threads = 2
            drain_timeout_secs = 2

            [client]
            max_pending_ops = 16
            "#
        );
        let config: Config = toml::from_str(&text).unwrap();
        server::run(&config, flag).unwrap();
    });

    (handle, shutdown)
}

fn connect(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => {
                stream.set_nodelay(true).unwrap();
                stream
                    .set_read_timeout(Some(Duration::from_secs(2)))
                    .unwrap();
                return stream;
            }
            Err(_) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => panic!("server did not come up: {e}"),
        }
    }
}

/// Send one request and read back one complete response block.
fn round_trip(stream: &mut TcpStream, request: &str) -> String {
    stream.write_all(request.as_bytes()).unwrap();
    stream.flush().unwrap();

    let mut response = Vec::new();
    let mut byte = [0u8; 256];
    while !response.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert!(n > 0, "connection closed mid-response");
        response.extend_from_slice(&byte[..n]);
    }
    String::from_utf8(response).unwrap()
}

#[test]
fn request_round_trips_and_shutdown_drains() {
    let port = get_available_port();
    let (handle, shutdown) = start_test_server(port);

    let mut conn = connect(port);

    let resp = round_trip(&mut conn, "PING\r\nCseq: 1\r\n\r\n");
    assert!(resp.contains("Cseq: 1\r\n"), "bad response: {resp}");
    assert!(resp.contains("Status: 0\r\n"), "bad response: {resp}");

    let resp = round_trip(&mut conn, "MKDIR\r\nCseq: 2\r\nPathname: /home\r\n\r\n");
    assert!(resp.contains("Status: 0\r\n"), "bad response: {resp}");

    let resp = round_trip(
        &mut conn,
        "CREATE\r\nCseq: 3\r\nPathname: /home/notes.txt\r\n\r\n",
    );
    assert!(resp.contains("Status: 0\r\n"), "bad response: {resp}");

    let resp = round_trip(&mut conn, "READDIR\r\nCseq: 4\r\nPathname: /home\r\n\r\n");
    assert!(resp.contains("Entries: 1\r\n"), "bad response: {resp}");
    assert!(resp.contains("notes.txt\r\n"), "bad response: {resp}");

    // A missing entry comes back as a failure status, not an error frame.
    let resp = round_trip(&mut conn, "STAT\r\nCseq: 5\r\nPathname: /nope\r\n\r\n");
    assert!(resp.contains("Status: -2\r\n"), "bad response: {resp}");

    drop(conn);

    shutdown.store(true, Ordering::SeqCst);
    let start = Instant::now();
    while !handle.is_finished() && start.elapsed() < Duration::from_secs(5) {
        thread::sleep(Duration::from_millis(50));
    }
    assert!(handle.is_finished(), "server did not shut down");
    handle.join().unwrap();
}

#[test]
fn pipelined_requests_answer_in_order() {
    let port = get_available_port();
    let (handle, shutdown) = start_test_server(port);

    let mut conn = connect(port);

    // Three requests in one segment; responses must come back in
    // completion order with matching sequence numbers.
    let mut batch = String::new();
    for seq in 1..=3 {
        batch.push_str(&format!("PING\r\nCseq: {seq}\r\n\r\n"));
    }
    conn.write_all(batch.as_bytes()).unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    let deadline = Instant::now() + Duration::from_secs(3);
    while received.windows(4).filter(|w| *w == b"\r\n\r\n").count() < 3 {
        assert!(Instant::now() < deadline, "timed out waiting for responses");
        if let Ok(n) = conn.read(&mut buf) {
            assert!(n > 0, "connection closed early");
            received.extend_from_slice(&buf[..n]);
        }
    }
    let text = String::from_utf8(received).unwrap();
    let positions: Vec<usize> = (1..=3)
        .map(|seq| {
            text.find(&format!("Cseq: {seq}\r\n"))
                .unwrap_or_else(|| panic!("missing response {seq}: {text}"))
        })
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));

    drop(conn);
    shutdown.store(true, Ordering::SeqCst);
    let _ = handle.join();
}
