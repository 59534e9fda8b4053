#![allow(dead_code)]

use etude_core::status::{CURRENT_CONNECTIONS, FAILED_CONNECTIONS, TOTAL_CONNECTIONS};
use etude_core::{Handlers, Protocol, SharedCounters, StaticSite, Worker, WorkerSettings};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::IntoRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A single worker on a background thread, listening on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub counters: Arc<SharedCounters>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    /// `handlers` runs on the worker thread (handlers are not `Send`).
    pub fn start(protocol: Protocol, root: Option<PathBuf>, handlers: fn() -> Handlers) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let fd = listener.into_raw_fd();

        let counters = Arc::new(SharedCounters::anonymous().unwrap());
        for name in [CURRENT_CONNECTIONS, FAILED_CONNECTIONS, TOTAL_CONNECTIONS, "closed"] {
            counters.set(name, 0i64).unwrap();
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_counters = Arc::clone(&counters);
        let flag = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            let settings = WorkerSettings {
                sweep_interval: Duration::from_millis(20),
                ..WorkerSettings::default()
            };
            let mut worker = Worker::new(0, fd, protocol, worker_counters, handlers(), settings);
            if let Some(root) = root {
                worker = worker.with_site(StaticSite::single_root(root));
            }
            worker.listen_until(flag).unwrap();
        });

        Self {
            addr,
            counters,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    pub fn counter(&self, name: &str) -> i64 {
        self.counters
            .get(name)
            .and_then(|v| v.as_int())
            .unwrap_or(-1)
    }

    /// Poll until `name` equals `expected`.
    pub fn wait_for(&self, name: &str, expected: i64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.counter(name) == expected {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

fn parse_head(head: &[u8]) -> (u16, HashMap<String, String>) {
    let head = String::from_utf8_lossy(head);
    let mut lines = head.split("\r\n");
    let status = lines
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap();
    let headers = lines
        .filter_map(|line| line.split_once(": "))
        .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
        .collect();
    (status, headers)
}

/// Send `request`, read until the server closes the connection.
pub fn exchange(server: &TestServer, request: &[u8]) -> Response {
    let mut stream = server.connect();
    stream.write_all(request).unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has a header block");
    let (status, headers) = parse_head(&raw[..split]);
    Response {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    }
}

/// Read one response framed by Content-Length from a kept-alive stream.
pub fn read_response(stream: &mut TcpStream) -> Response {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert_eq!(n, 1, "connection closed mid-header");
        raw.push(byte[0]);
    }
    let (status, headers) = parse_head(&raw[..raw.len() - 4]);
    let len: usize = headers
        .get("content-length")
        .map(|v| v.parse().unwrap())
        .unwrap_or(0);
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    Response {
        status,
        headers,
        body,
    }
}

/// Send `prefix` followed by more filler than the receive buffer may hold,
/// with no end of header. Returns whatever the server answered before it
/// closed; write and read errors after the close are expected.
pub fn overfill(server: &TestServer, prefix: &[u8]) -> Vec<u8> {
    let mut stream = server.connect();
    let mut request = prefix.to_vec();
    request.resize(prefix.len() + (1 << 20) + 64, b'a');
    let _ = stream.write_all(&request);

    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    while let Ok(n) = stream.read(&mut buf) {
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
    }
    raw
}
