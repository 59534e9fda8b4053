// src/worker.rs
use crate::codec::websocket::encode_frame;
use crate::codec::{Codec, CodecState, Inbound, Input, Opcode, Payload, Protocol};
use crate::conn::{Connection, ConnectionHandle};
use crate::error::{EtudeError, EtudeResult, ProtocolError};
use crate::event_loop::{EventLoop, Interest, TimerKind};
use crate::responder::{self, Outcome};
use crate::shm::SharedCounters;
use crate::site::StaticSite;
use crate::slab::ConnectionSlab;
use crate::status::{CURRENT_CONNECTIONS, FAILED_CONNECTIONS, TOTAL_CONNECTIONS};
use crate::syscalls;
use libc::c_int;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Connections accepted per listener wake-up, so sibling workers get a share.
const ACCEPT_BATCH: usize = 64;

pub type ConnectionCallback = Box<dyn FnMut(&mut ConnectionHandle<'_>)>;
pub type MessageCallback = Box<dyn FnMut(&mut ConnectionHandle<'_>, Inbound)>;
pub type ErrorCallback = Box<dyn FnMut(Option<&mut ConnectionHandle<'_>>, &EtudeError)>;

/// Application callbacks, injected into every worker.
#[derive(Default)]
pub struct Handlers {
    pub on_connection: Option<ConnectionCallback>,
    pub on_message: Option<MessageCallback>,
    pub on_close: Option<ConnectionCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl Handlers {
    pub fn on_connection(mut self, f: impl FnMut(&mut ConnectionHandle<'_>) + 'static) -> Self {
        self.on_connection = Some(Box::new(f));
        self
    }

    pub fn on_message(
        mut self,
        f: impl FnMut(&mut ConnectionHandle<'_>, Inbound) + 'static,
    ) -> Self {
        self.on_message = Some(Box::new(f));
        self
    }

    pub fn on_close(mut self, f: impl FnMut(&mut ConnectionHandle<'_>) + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }

    pub fn on_error(
        mut self,
        f: impl FnMut(Option<&mut ConnectionHandle<'_>>, &EtudeError) + 'static,
    ) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub read_chunk: usize,
    pub max_recv_buffer: usize,
    pub max_connections: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
            read_chunk: 65536,
            max_recv_buffer: 1 << 20,
            max_connections: 10_000,
        }
    }
}

/// One worker: accepts from the shared listener and drives its connections
/// on a private event loop.
pub struct Worker {
    id: usize,
    listener: c_int,
    protocol: Protocol,
    slab: ConnectionSlab<Connection>,
    counters: Arc<SharedCounters>,
    handlers: Handlers,
    site: Option<StaticSite>,
    settings: WorkerSettings,
    read_buf: Vec<u8>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        id: usize,
        listener: c_int,
        protocol: Protocol,
        counters: Arc<SharedCounters>,
        handlers: Handlers,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id,
            listener,
            protocol,
            slab: ConnectionSlab::new(settings.max_connections),
            counters,
            handlers,
            site: None,
            read_buf: vec![0; settings.read_chunk],
            settings,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Serve static files for GET/HEAD requests.
    pub fn with_site(mut self, site: StaticSite) -> Self {
        self.site = Some(site);
        self
    }

    /// Run until the process dies.
    pub fn listen(self) -> EtudeResult<()> {
        let shutdown = Arc::clone(&self.shutdown);
        self.listen_until(shutdown)
    }

    /// Run until `shutdown` is set; checked on every sweep.
    pub fn listen_until(mut self, shutdown: Arc<AtomicBool>) -> EtudeResult<()> {
        self.shutdown = shutdown;
        syscalls::ignore_signal(libc::SIGPIPE);
        syscalls::set_nonblocking(self.listener)?;

        let mut lp: EventLoop<Worker> = EventLoop::new()?;
        lp.add(self.listener, Interest::Read, |lp, worker: &mut Worker, _fd| {
            worker.on_acceptable(lp);
        })?;
        lp.add_timer(
            self.settings.sweep_interval,
            TimerKind::Repeating,
            |lp, worker: &mut Worker, _id| worker.sweep(lp),
        );

        info!(
            worker = self.id,
            pid = syscalls::getpid(),
            protocol = self.protocol.scheme(),
            "worker entering event loop"
        );
        let result = lp.run(&mut self);

        lp.delete(self.listener, Interest::Read);
        for id in self.slab.ids() {
            self.close(&mut lp, id);
        }
        info!(worker = self.id, "worker exiting");
        result
    }

    fn bump(&self, name: &str) {
        if let Err(err) = self.counters.increment(name, 1) {
            warn!(counter = name, %err, "failed to increment counter");
        }
    }

    fn report(&mut self, lp: &mut EventLoop<Worker>, id: Option<usize>, err: &EtudeError) {
        debug!(worker = self.id, conn = ?id, %err, "connection error");
        let Some(callback) = self.handlers.on_error.as_mut() else {
            return;
        };
        match id.and_then(|id| self.slab.get_mut(id).map(|conn| (id, conn))) {
            Some((id, conn)) => {
                let mut h = ConnectionHandle::new(id, conn, lp, &self.counters);
                callback(Some(&mut h), err);
            }
            None => callback(None, err),
        }
    }

    fn on_acceptable(&mut self, lp: &mut EventLoop<Worker>) {
        for _ in 0..ACCEPT_BATCH {
            match syscalls::accept_connection(self.listener) {
                Ok(Some(fd)) => self.register(lp, fd),
                // Another worker took it.
                Ok(None) => return,
                Err(err) => {
                    warn!(worker = self.id, %err, "accept failed");
                    self.bump(FAILED_CONNECTIONS);
                    self.bump(TOTAL_CONNECTIONS);
                    self.report(lp, None, &EtudeError::Io(err));
                    return;
                }
            }
        }
    }

    fn register(&mut self, lp: &mut EventLoop<Worker>, fd: c_int) {
        let peer = syscalls::peer_addr(fd).ok();
        let conn = Connection::new(
            fd,
            peer,
            self.protocol.codec(self.settings.max_recv_buffer),
            self.settings.idle_timeout,
        );
        let Some(id) = self.slab.allocate(conn) else {
            warn!(worker = self.id, "connection limit reached");
            syscalls::close_fd(fd);
            self.bump(FAILED_CONNECTIONS);
            self.bump(TOTAL_CONNECTIONS);
            self.report(lp, None, &EtudeError::SlabFull);
            return;
        };
        self.bump(CURRENT_CONNECTIONS);
        self.bump(TOTAL_CONNECTIONS);
        trace!(worker = self.id, conn = id, ?peer, "accepted");

        if let Err(err) = lp.add(fd, Interest::Read, move |lp, worker: &mut Worker, _fd| {
            worker.on_readable(lp, id);
        }) {
            self.report(lp, Some(id), &err);
            self.close(lp, id);
            return;
        }

        // WebSocket connections count as established after the handshake.
        if self.protocol == Protocol::Http {
            self.call_on_connection(lp, id);
        }
        self.reap(lp, id);
    }

    fn call_on_connection(&mut self, lp: &mut EventLoop<Worker>, id: usize) {
        let Some(callback) = self.handlers.on_connection.as_mut() else {
            return;
        };
        if let Some(conn) = self.slab.get_mut(id) {
            let mut h = ConnectionHandle::new(id, conn, lp, &self.counters);
            callback(&mut h);
        }
    }

    fn call_on_message(&mut self, lp: &mut EventLoop<Worker>, id: usize, inbound: Inbound) {
        let Some(conn) = self.slab.get_mut(id) else {
            return;
        };
        let mut h = ConnectionHandle::new(id, conn, lp, &self.counters);
        match (self.handlers.on_message.as_mut(), inbound) {
            (Some(callback), inbound) => callback(&mut h, inbound),
            (None, Inbound::Request(req)) => responder::send_error(&mut h, &req, 405),
            (None, _) => {}
        }
    }

    pub(crate) fn on_readable(&mut self, lp: &mut EventLoop<Worker>, id: usize) {
        let Some(conn) = self.slab.get_mut(id) else {
            return;
        };
        if conn.is_closed() {
            return;
        }
        match syscalls::read_nonblocking(conn.fd(), &mut self.read_buf) {
            Ok(None) => return,
            Ok(Some(0)) => {
                trace!(conn = id, "peer closed");
                self.close(lp, id);
                return;
            }
            Ok(Some(n)) => conn.recv_buf.extend_from_slice(&self.read_buf[..n]),
            Err(err) => {
                conn.fail(err);
                self.close(lp, id);
                return;
            }
        }
        self.drain(lp, id);
        self.reap(lp, id);
    }

    /// Frame, decode and dispatch everything complete in the receive buffer.
    fn drain(&mut self, lp: &mut EventLoop<Worker>, id: usize) {
        loop {
            let Some(conn) = self.slab.get_mut(id) else {
                return;
            };
            if conn.is_closed() || conn.is_broken() || conn.recv_buf.is_empty() {
                return;
            }

            let framed = conn.codec.input(&conn.recv_buf);
            match framed {
                Ok(Input::Incomplete) => {
                    let buffered = conn.recv_buf.len();
                    if buffered > self.settings.max_recv_buffer {
                        self.protocol_error(lp, id, ProtocolError::BufferOverflow(buffered));
                    }
                    return;
                }
                Ok(Input::Upgrade { consumed, response }) => {
                    conn.recv_buf.drain(..consumed);
                    conn.touch();
                    conn.send_string(id, lp, Payload::Raw(response));
                    debug!(conn = id, "websocket handshake complete");
                    self.call_on_connection(lp, id);
                }
                Ok(Input::Frame(len)) => {
                    let decoded = conn.codec.decode(&conn.recv_buf[..len]);
                    conn.recv_buf.drain(..len);
                    match decoded {
                        Ok(Some(inbound)) => self.dispatch(lp, id, inbound),
                        Ok(None) => {}
                        Err(err) => {
                            self.protocol_error(lp, id, err);
                            return;
                        }
                    }
                }
                Err(err) => {
                    self.protocol_error(lp, id, err);
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, lp: &mut EventLoop<Worker>, id: usize, inbound: Inbound) {
        match inbound {
            Inbound::Request(req) => {
                let Some(conn) = self.slab.get_mut(id) else {
                    return;
                };
                let mut h = ConnectionHandle::new(id, conn, lp, &self.counters);
                if let Outcome::Delegate(req) = responder::respond(&mut h, self.site.as_ref(), req)
                {
                    self.call_on_message(lp, id, Inbound::Request(req));
                }
                if let Some(conn) = self.slab.get_mut(id) {
                    if conn.expired(Instant::now()) {
                        conn.close(lp, &self.counters);
                    }
                }
            }
            Inbound::Ping(payload) => {
                if let Some(conn) = self.slab.get_mut(id) {
                    conn.touch();
                    let pong = encode_frame(Opcode::Pong, &payload);
                    conn.send_string(id, lp, Payload::Raw(pong));
                }
            }
            Inbound::Pong(_) => {
                if let Some(conn) = self.slab.get_mut(id) {
                    conn.touch();
                }
            }
            Inbound::Close => {
                debug!(conn = id, "close frame received");
                self.close(lp, id);
            }
            message @ Inbound::Message(_) => {
                if let Some(conn) = self.slab.get_mut(id) {
                    conn.touch();
                }
                self.call_on_message(lp, id, message);
            }
        }
    }

    fn protocol_error(&mut self, lp: &mut EventLoop<Worker>, id: usize, err: ProtocolError) {
        let Some(conn) = self.slab.get_mut(id) else {
            return;
        };
        debug!(conn = id, %err, "protocol error");
        let handshake_failed = matches!(&conn.codec, CodecState::WebSocket(ws) if !ws.is_handshaken());

        match conn.protocol() {
            Protocol::WebSocket if handshake_failed => {
                let reply = format!("HTTP/1.1 400 Bad Request\r\n\r\n{err}");
                conn.send(Payload::Raw(reply.into_bytes()));
                self.bump(FAILED_CONNECTIONS);
                self.report(lp, Some(id), &EtudeError::Protocol(err));
                self.close(lp, id);
            }
            Protocol::WebSocket => {
                self.report(lp, Some(id), &EtudeError::Protocol(err));
                self.close(lp, id);
            }
            Protocol::Http => {
                self.report(lp, Some(id), &EtudeError::Protocol(err.clone()));
                if let Some(conn) = self.slab.get_mut(id) {
                    let mut h = ConnectionHandle::new(id, conn, lp, &self.counters);
                    responder::reject(&mut h, &err);
                }
            }
        }
    }

    pub(crate) fn on_writable(&mut self, lp: &mut EventLoop<Worker>, id: usize) {
        let Some(conn) = self.slab.get_mut(id) else {
            return;
        };
        match conn.send_queue.flush(conn.fd()) {
            Ok(true) => {
                lp.delete(conn.fd(), Interest::Write);
                if conn.expired(Instant::now()) {
                    conn.close(lp, &self.counters);
                }
            }
            Ok(false) => {}
            Err(err) => {
                conn.fail(err);
                conn.close(lp, &self.counters);
            }
        }
        self.reap(lp, id);
    }

    /// Close idle or exhausted connections with nothing left to send.
    fn sweep(&mut self, lp: &mut EventLoop<Worker>) {
        if self.shutdown.load(Ordering::Acquire) {
            lp.stop();
            return;
        }
        let now = Instant::now();
        for id in self.slab.ids() {
            if let Some(conn) = self.slab.get_mut(id) {
                if conn.expired(now) {
                    trace!(conn = id, "closing expired connection");
                    conn.close(lp, &self.counters);
                }
            }
            self.reap(lp, id);
        }
    }

    fn close(&mut self, lp: &mut EventLoop<Worker>, id: usize) {
        if let Some(conn) = self.slab.get_mut(id) {
            conn.close(lp, &self.counters);
        }
        self.reap(lp, id);
    }

    /// Release a closed connection: report a recorded failure, run
    /// `on_close` exactly once and free the slot.
    fn reap(&mut self, lp: &mut EventLoop<Worker>, id: usize) {
        let Some(conn) = self.slab.get_mut(id) else {
            return;
        };
        if conn.is_broken() {
            conn.close(lp, &self.counters);
        }
        if !conn.is_closed() {
            return;
        }
        if let Some(err) = conn.take_failure() {
            self.report(lp, Some(id), &err);
        }
        if let (Some(callback), Some(conn)) =
            (self.handlers.on_close.as_mut(), self.slab.get_mut(id))
        {
            let mut h = ConnectionHandle::new(id, conn, lp, &self.counters);
            callback(&mut h);
        }
        self.slab.free(id);
    }
}
