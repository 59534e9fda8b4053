// src/conn.rs
//
// Per-connection state: receive buffer, FIFO send queue (bytes and file
// segments), codec, keep-alive accounting and the handle given to handlers.

use crate::codec::{Codec, CodecState, Payload, Protocol};
use crate::error::{EtudeError, EtudeResult};
use crate::event_loop::{EventLoop, Interest};
use crate::shm::SharedCounters;
use crate::status::CURRENT_CONNECTIONS;
use crate::syscalls;
use crate::worker::Worker;
use libc::c_int;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Files are pulled into the send path this many bytes at a time.
pub const FILE_CHUNK: usize = 8192;

enum Segment {
    Bytes { buf: Vec<u8>, pos: usize },
    File { file: File, remaining: u64 },
}

/// Outbound data in strict FIFO order. A file segment is only read once
/// everything queued before it has been written.
#[derive(Default)]
pub struct SendQueue {
    segments: VecDeque<Segment>,
}

impl SendQueue {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Bytes waiting in memory (file segments not counted).
    pub fn buffered_bytes(&self) -> usize {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Bytes { buf, pos } => buf.len() - pos,
                Segment::File { .. } => 0,
            })
            .sum()
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Some(Segment::Bytes { buf, .. }) = self.segments.back_mut() {
            buf.extend_from_slice(bytes);
            return;
        }
        self.segments.push_back(Segment::Bytes {
            buf: bytes.to_vec(),
            pos: 0,
        });
    }

    /// Queue `len` bytes from the file's current position.
    pub fn push_file(&mut self, file: File, len: u64) {
        if len == 0 {
            return;
        }
        self.segments.push_back(Segment::File {
            file,
            remaining: len,
        });
    }

    /// Drop everything, closing queued files.
    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// Write as much as `fd` accepts. `Ok(true)` once the queue is empty.
    pub fn flush(&mut self, fd: c_int) -> io::Result<bool> {
        loop {
            let chunk = match self.segments.front_mut() {
                None => return Ok(true),
                Some(Segment::Bytes { buf, pos }) => {
                    let rest = &buf[*pos..];
                    let n = accepted(syscalls::write_nonblocking(fd, rest), rest.len())?;
                    if n == 0 {
                        return Ok(false);
                    }
                    *pos += n;
                    if *pos < buf.len() {
                        return Ok(false);
                    }
                    self.segments.pop_front();
                    continue;
                }
                Some(Segment::File { file, remaining }) => {
                    let want = (*remaining).min(FILE_CHUNK as u64) as usize;
                    let mut chunk = vec![0u8; want];
                    let n = file.read(&mut chunk)?;
                    // A short file ends its segment early.
                    if n == 0 {
                        self.segments.pop_front();
                        continue;
                    }
                    *remaining -= n as u64;
                    if *remaining == 0 {
                        self.segments.pop_front();
                    }
                    chunk.truncate(n);
                    chunk
                }
            };
            self.segments.push_front(Segment::Bytes { buf: chunk, pos: 0 });
        }
    }
}

/// Bytes taken by a non-blocking write of `len` bytes. A write that
/// accepts nothing from a non-empty buffer means the peer is gone.
fn accepted(res: io::Result<Option<usize>>, len: usize) -> io::Result<usize> {
    match res? {
        Some(0) if len > 0 => Err(io::ErrorKind::BrokenPipe.into()),
        Some(n) => Ok(n),
        None => Ok(0),
    }
}

pub struct Connection {
    pub(crate) fd: c_int,
    peer: Option<SocketAddr>,
    pub(crate) recv_buf: Vec<u8>,
    pub(crate) send_queue: SendQueue,
    pub(crate) codec: CodecState,

    requests: u64,
    max_requests: u64,
    deadline: Option<Instant>,
    idle_since: Instant,
    idle_timeout: Duration,

    closed: bool,
    broken: bool,
    failure: Option<EtudeError>,
}

impl Connection {
    pub fn new(
        fd: c_int,
        peer: Option<SocketAddr>,
        codec: CodecState,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            fd,
            peer,
            recv_buf: Vec::new(),
            send_queue: SendQueue::default(),
            codec,
            requests: 0,
            max_requests: 0,
            deadline: None,
            idle_since: Instant::now(),
            idle_timeout,
            closed: false,
            broken: false,
            failure: None,
        }
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn protocol(&self) -> Protocol {
        self.codec.protocol()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn send_buffer_empty(&self) -> bool {
        self.send_queue.is_empty()
    }

    pub(crate) fn record_request(&mut self) {
        self.requests += 1;
    }

    /// Restart the idle clock.
    pub(crate) fn touch(&mut self) {
        self.idle_since = Instant::now();
    }

    /// Expire the connection as soon as its send queue drains.
    pub(crate) fn expire_now(&mut self) {
        self.deadline = Some(Instant::now());
    }

    /// Apply `Keep-Alive: timeout=N, max=M`. Values only ever grow.
    pub(crate) fn keep_alive(&mut self, timeout: Option<Duration>, max: Option<u64>) {
        if let Some(timeout) = timeout {
            let candidate = Instant::now() + timeout;
            self.deadline = Some(self.deadline.map_or(candidate, |d| d.max(candidate)));
        }
        if let Some(max) = max {
            self.max_requests = self.max_requests.max(max);
        }
    }

    pub fn timed_out(&self, now: Instant) -> bool {
        let deadline = self
            .deadline
            .unwrap_or(self.idle_since + self.idle_timeout);
        now >= deadline
    }

    pub fn too_many_requests(&self) -> bool {
        self.max_requests > 0 && self.requests >= self.max_requests
    }

    /// Idle or over its request cap, with nothing left to send.
    pub fn expired(&self, now: Instant) -> bool {
        (self.timed_out(now) || self.too_many_requests()) && self.send_buffer_empty()
    }

    /// A write failed; the connection must be closed.
    pub(crate) fn is_broken(&self) -> bool {
        self.broken
    }

    pub(crate) fn take_failure(&mut self) -> Option<EtudeError> {
        self.failure.take()
    }

    /// Record an I/O failure for the worker to report. Peer resets are
    /// ordinary closes and are not recorded.
    pub(crate) fn fail(&mut self, err: io::Error) {
        self.broken = true;
        match err.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                debug!(fd = self.fd, %err, "peer went away");
            }
            _ => {
                if self.failure.is_none() {
                    self.failure = Some(EtudeError::Io(err));
                }
            }
        }
    }

    /// Tear down once. Returns `false` when already closed.
    pub(crate) fn close(&mut self, lp: &mut EventLoop<Worker>, counters: &SharedCounters) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        if let Err(err) = counters.decrement(CURRENT_CONNECTIONS, 1) {
            warn!(%err, "failed to decrement current connections");
        }
        lp.delete(self.fd, Interest::Read);
        lp.delete(self.fd, Interest::Write);
        self.send_queue.clear();
        self.recv_buf = Vec::new();
        syscalls::close_fd(self.fd);
        debug!(fd = self.fd, requests = self.requests, "connection closed");
        true
    }

    fn write_direct(&mut self, bytes: &[u8]) -> usize {
        match accepted(syscalls::write_nonblocking(self.fd, bytes), bytes.len()) {
            Ok(n) => n,
            Err(err) => {
                self.fail(err);
                0
            }
        }
    }

    fn arm_write(&mut self, id: usize, lp: &mut EventLoop<Worker>) -> EtudeResult<()> {
        if lp.is_registered(self.fd, Interest::Write) {
            return Ok(());
        }
        lp.add(self.fd, Interest::Write, move |lp, worker: &mut Worker, _fd| {
            worker.on_writable(lp, id);
        })
    }

    fn encode(&self, payload: Payload) -> Vec<u8> {
        match payload {
            Payload::Raw(bytes) => bytes,
            other => self.codec.encode(other),
        }
    }

    /// Best-effort direct write. Writes nothing while data is queued.
    pub(crate) fn send(&mut self, payload: Payload) -> usize {
        if self.closed || !self.send_queue.is_empty() {
            return 0;
        }
        let bytes = self.encode(payload);
        self.write_direct(&bytes)
    }

    /// Direct write when the queue is empty, the rest is queued behind
    /// whatever is pending. Returns the bytes written directly.
    pub(crate) fn send_string(
        &mut self,
        id: usize,
        lp: &mut EventLoop<Worker>,
        payload: Payload,
    ) -> usize {
        if self.closed {
            return 0;
        }
        let bytes = self.encode(payload);
        let was_empty = self.send_queue.is_empty();
        let written = if was_empty {
            self.write_direct(&bytes)
        } else {
            0
        };
        if self.broken {
            return written;
        }
        if written < bytes.len() {
            self.send_queue.push_bytes(&bytes[written..]);
            if was_empty {
                if let Err(err) = self.arm_write(id, lp) {
                    self.broken = true;
                    self.failure = Some(err);
                }
            }
        }
        written
    }

    pub(crate) fn send_file_range(
        &mut self,
        id: usize,
        lp: &mut EventLoop<Worker>,
        mut file: File,
        offset: u64,
        len: u64,
    ) -> EtudeResult<()> {
        if self.closed {
            return Ok(());
        }
        file.seek(SeekFrom::Start(offset))?;
        let was_empty = self.send_queue.is_empty();
        self.send_queue.push_file(file, len);
        if was_empty && !self.send_queue.is_empty() {
            self.arm_write(id, lp)?;
        }
        Ok(())
    }
}

/// What a handler sees of a connection: the connection itself plus the
/// worker's loop and counters.
pub struct ConnectionHandle<'a> {
    pub(crate) id: usize,
    pub(crate) conn: &'a mut Connection,
    pub(crate) lp: &'a mut EventLoop<Worker>,
    pub(crate) counters: &'a SharedCounters,
}

impl<'a> ConnectionHandle<'a> {
    pub(crate) fn new(
        id: usize,
        conn: &'a mut Connection,
        lp: &'a mut EventLoop<Worker>,
        counters: &'a SharedCounters,
    ) -> Self {
        Self {
            id,
            conn,
            lp,
            counters,
        }
    }

    /// Slab index of the connection within its worker.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.conn.remote_addr()
    }

    pub fn protocol(&self) -> Protocol {
        self.conn.protocol()
    }

    pub fn requests(&self) -> u64 {
        self.conn.requests()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// The worker's shared counter store.
    pub fn counters(&self) -> &SharedCounters {
        self.counters
    }

    /// Best-effort direct write; whatever the socket does not accept is
    /// dropped. Returns the bytes written.
    pub fn send(&mut self, payload: impl Into<Payload>) -> usize {
        let written = self.conn.send(payload.into());
        self.close_on_failure();
        written
    }

    /// Reliable send: queued behind anything pending and flushed on write
    /// readiness. Returns the bytes written immediately.
    pub fn send_string(&mut self, payload: impl Into<Payload>) -> usize {
        let written = self.conn.send_string(self.id, self.lp, payload.into());
        self.close_on_failure();
        written
    }

    pub fn send_file(&mut self, file: File) -> EtudeResult<()> {
        let len = file.metadata()?.len();
        self.send_file_range(file, 0, len)
    }

    /// Queue `len` bytes of `file` starting at `offset`.
    pub fn send_file_range(&mut self, file: File, offset: u64, len: u64) -> EtudeResult<()> {
        self.conn.send_file_range(self.id, self.lp, file, offset, len)
    }

    pub fn close(&mut self) {
        self.conn.close(self.lp, self.counters);
    }

    pub(crate) fn connection(&mut self) -> &mut Connection {
        self.conn
    }

    fn close_on_failure(&mut self) {
        if self.conn.broken {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::os::fd::IntoRawFd;
    use std::os::unix::net::UnixStream;

    fn pair() -> (c_int, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        (a.into_raw_fd(), b)
    }

    fn connection(fd: c_int) -> Connection {
        Connection::new(
            fd,
            None,
            Protocol::Http.codec(1 << 20),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_close_twice_decrements_once() {
        let counters = SharedCounters::anonymous().unwrap();
        counters.set(CURRENT_CONNECTIONS, 1i64).unwrap();
        let mut lp: EventLoop<Worker> = EventLoop::new().unwrap();
        let (fd, _peer) = pair();
        let mut conn = connection(fd);

        assert!(conn.close(&mut lp, &counters));
        assert!(!conn.close(&mut lp, &counters));
        assert!(conn.is_closed());
        assert_eq!(counters.get(CURRENT_CONNECTIONS).unwrap().as_int(), Some(0));
    }

    #[test]
    fn test_send_string_preserves_order_with_files() {
        let counters = SharedCounters::anonymous().unwrap();
        let mut lp: EventLoop<Worker> = EventLoop::new().unwrap();
        let (fd, mut peer) = pair();
        let mut conn = connection(fd);

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();

        conn.send_string(0, &mut lp, Payload::Raw(b"head:".to_vec()));
        conn.send_file_range(0, &mut lp, file, 2, 5).unwrap();
        assert!(lp.is_registered(fd, Interest::Write));
        // Queued behind the file, never written directly.
        assert_eq!(conn.send_string(0, &mut lp, Payload::Raw(b":tail".to_vec())), 0);
        assert_eq!(conn.send(Payload::Raw(b"lost".to_vec())), 0);

        assert!(conn.send_queue.flush(fd).unwrap());
        conn.close(&mut lp, &counters);

        let mut got = Vec::new();
        peer.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"head:23456:tail");
    }

    #[test]
    fn test_flush_stops_when_socket_is_full() {
        let (fd, mut peer) = pair();
        let mut queue = SendQueue::default();
        let big = vec![7u8; 4 << 20];
        queue.push_bytes(&big);

        assert!(!queue.flush(fd).unwrap());
        let pending = queue.buffered_bytes();
        assert!(pending > 0 && pending < big.len());

        let mut sink = vec![0u8; 1 << 16];
        let mut drained = 0;
        while drained < big.len() {
            let _ = queue.flush(fd).unwrap();
            drained += peer.read(&mut sink).unwrap();
        }
        assert!(queue.is_empty());
        syscalls::close_fd(fd);
    }

    #[test]
    fn test_zero_byte_write_is_a_broken_pipe() {
        let err = accepted(Ok(Some(0)), 5).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(accepted(Ok(Some(0)), 0).unwrap(), 0);
        assert_eq!(accepted(Ok(None), 5).unwrap(), 0);
        assert_eq!(accepted(Ok(Some(3)), 5).unwrap(), 3);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_send_to_departed_peer_marks_connection_broken() {
        let (fd, peer) = pair();
        drop(peer);
        let mut conn = connection(fd);

        assert_eq!(conn.send(Payload::Raw(b"hello".to_vec())), 0);
        assert!(conn.is_broken());
        assert!(conn.take_failure().is_none());
        syscalls::close_fd(fd);
    }

    #[test]
    fn test_keep_alive_accounting() {
        let (fd, _peer) = pair();
        let mut conn = connection(fd);
        let now = Instant::now();
        assert!(!conn.timed_out(now));
        assert!(!conn.too_many_requests());

        conn.keep_alive(Some(Duration::from_secs(5)), Some(2));
        conn.keep_alive(Some(Duration::from_secs(1)), Some(1));
        assert!(!conn.timed_out(now + Duration::from_secs(3)));
        assert!(conn.timed_out(now + Duration::from_secs(6)));

        conn.record_request();
        assert!(!conn.too_many_requests());
        conn.record_request();
        assert!(conn.too_many_requests());

        conn.expire_now();
        assert!(conn.expired(Instant::now()));
        syscalls::close_fd(conn.fd());
    }

    #[test]
    fn test_idle_timeout_without_deadline() {
        let (fd, _peer) = pair();
        let conn = Connection::new(fd, None, Protocol::Http.codec(1024), Duration::ZERO);
        assert!(conn.timed_out(Instant::now()));
        syscalls::close_fd(fd);
    }
}
