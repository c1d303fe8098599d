use std::{
    io::{self, Read, Write},
    net::SocketAddr,
    sync::{Mutex, MutexGuard},
};

use blackbox_protocol::{
    CodecError, FRAME_PREFIX_SIZE, MAX_PACKET_BUFFER_SIZE, Packet, encode_frame,
};
use blackbox_timing::{Duration, Instant};
use blackbox_utils::{safe_assert, safe_panic};
use mio::{Events, Interest, Poll, Token, net::TcpListener, net::TcpStream};
use tracing::{debug, error, warn};

use crate::sockets::graceful_close;

pub const SEND_BUFFER_SIZE: usize = 8192;
pub const RECV_BUFFER_SIZE: usize = 32768;

const DEFAULT_SEND_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a blocking flush spins on a saturated socket before giving up on
/// the peer. Fixed for wire compatibility.
const FLUSH_DEADLINE: Duration = Duration::from_secs(2);

const STREAM: Token = Token(0);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnState {
    NotConnected,
    Listening,
    Connecting,
    Connected,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

enum Socket {
    None,
    Connecting(TcpStream),
    Connected(TcpStream),
    Listening(TcpListener),
}

struct Inner {
    poll: Poll,
    events: Events,
    socket: Socket,
    state: ConnState,
    role: Role,
    // Readiness is edge-triggered; these latch until an op hits WouldBlock.
    readable: bool,
    writable: bool,
    send_buf: Box<[u8; SEND_BUFFER_SIZE]>,
    recv_buf: Box<[u8; RECV_BUFFER_SIZE]>,
    send_cursor: usize,
    recv_cursor: usize,
    decode_cursor: usize,
    sent_bytes_total: u64,
    received_bytes_total: u64,
    prev_send_time: Instant,
    send_interval: Duration,
    connect_deadline: Instant,
    connect_timeout: Duration,
}

/// One framed TCP connection. Every mutation of buffers, cursors, or state
/// happens under the single internal mutex; cross-thread send ordering is the
/// mutex acquisition order.
pub struct Connection {
    inner: Mutex<Inner>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        let inner = Inner {
            poll: Poll::new().expect("couldn't set up a poll for the connection"),
            events: Events::with_capacity(8),
            socket: Socket::None,
            state: ConnState::NotConnected,
            role: Role::Client,
            readable: false,
            writable: false,
            send_buf: Box::new([0; SEND_BUFFER_SIZE]),
            recv_buf: Box::new([0; RECV_BUFFER_SIZE]),
            send_cursor: 0,
            recv_cursor: 0,
            decode_cursor: 0,
            sent_bytes_total: 0,
            received_bytes_total: 0,
            prev_send_time: Instant::ZERO,
            send_interval: DEFAULT_SEND_INTERVAL,
            connect_deadline: Instant::MAX,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        };
        Self { inner: Mutex::new(inner) }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn set_send_interval(&self, interval: Duration) {
        self.lock().send_interval = interval;
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.lock().connect_timeout = timeout;
    }

    pub fn state(&self) -> ConnState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.lock().state == ConnState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.lock().state == ConnState::Connecting
    }

    pub fn is_listening(&self) -> bool {
        self.lock().state == ConnState::Listening
    }

    pub fn sent_bytes_total(&self) -> u64 {
        self.lock().sent_bytes_total
    }

    pub fn received_bytes_total(&self) -> u64 {
        self.lock().received_bytes_total
    }

    /// Starts a non-blocking connect. A `connect_async` while already
    /// `Connecting` resets the previous attempt first, so at most one connect
    /// is ever in flight and no fd leaks.
    pub fn connect_async(&self, addr: SocketAddr) -> bool {
        let mut inner = self.lock();
        reset_locked(&mut inner);

        debug!(%addr, "trying to connect");
        let mut stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(err) => {
                error!(?err, %addr, "connect failed");
                return false;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(?err, "couldn't set nodelay");
        }
        if let Err(err) =
            inner.poll.registry().register(&mut stream, STREAM, Interest::READABLE | Interest::WRITABLE)
        {
            error!(?err, "couldn't register connecting stream");
            return false;
        }
        inner.socket = Socket::Connecting(stream);
        inner.state = ConnState::Connecting;
        inner.role = Role::Client;
        inner.connect_deadline = Instant::now() + inner.connect_timeout;
        true
    }

    /// Polls a pending connect for up to 1 ms. Returns true once connected.
    pub fn tick_connecting(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != ConnState::Connecting {
            return inner.state == ConnState::Connected;
        }
        poll_ready(&mut inner, Some(std::time::Duration::from_millis(1)));

        let Socket::Connecting(stream) = &mut inner.socket else {
            return false;
        };
        match stream.take_error() {
            Ok(Some(err)) => {
                error!(?err, "async connect failed");
                disconnect_no_flush_locked(&mut inner);
                return false;
            }
            Ok(None) => {}
            Err(err) => {
                error!(?err, "couldn't take error from connecting stream");
                disconnect_no_flush_locked(&mut inner);
                return false;
            }
        }
        if inner.writable {
            // writable + peer_addr succeeding means the handshake finished
            let Socket::Connecting(stream) = &mut inner.socket else { unreachable!() };
            if stream.peer_addr().is_ok() {
                debug!("connected");
                let Socket::Connecting(stream) = std::mem::replace(&mut inner.socket, Socket::None)
                else {
                    unreachable!()
                };
                inner.socket = Socket::Connected(stream);
                inner.state = ConnState::Connected;
                flush_locked(&mut inner, true);
                return true;
            }
        }
        if Instant::now() >= inner.connect_deadline {
            error!("timed out waiting to connect");
            disconnect_no_flush_locked(&mut inner);
        }
        false
    }

    /// Adopts a listener produced by [`bind_ephemeral_listener`] and waits
    /// for the one client the reservation promised.
    pub fn adopt_listener(&self, mut listener: TcpListener) -> bool {
        let mut inner = self.lock();
        reset_locked(&mut inner);
        if let Err(err) = inner.poll.registry().register(&mut listener, STREAM, Interest::READABLE)
        {
            error!(?err, "couldn't register listener");
            return false;
        }
        inner.socket = Socket::Listening(listener);
        inner.state = ConnState::Listening;
        inner.role = Role::Server;
        inner.connect_deadline = Instant::now() + inner.connect_timeout;
        true
    }

    /// Accepts one client, closes the listener, adopts the new socket.
    pub fn tick_listening(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != ConnState::Listening {
            return inner.state == ConnState::Connected;
        }
        poll_ready(&mut inner, Some(std::time::Duration::from_millis(1)));

        let Socket::Listening(listener) = &mut inner.socket else {
            return false;
        };
        match listener.accept() {
            Ok((mut stream, addr)) => {
                debug!(%addr, "client connected");
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(?err, "couldn't set nodelay");
                }
                let Socket::Listening(mut listener) =
                    std::mem::replace(&mut inner.socket, Socket::None)
                else {
                    unreachable!()
                };
                let _ = inner.poll.registry().deregister(&mut listener);
                drop(listener);
                inner.readable = false;
                inner.writable = true;
                if let Err(err) = inner
                    .poll
                    .registry()
                    .register(&mut stream, STREAM, Interest::READABLE | Interest::WRITABLE)
                {
                    error!(?err, "couldn't register accepted stream");
                    disconnect_no_flush_locked(&mut inner);
                    return false;
                }
                inner.socket = Socket::Connected(stream);
                inner.state = ConnState::Connected;
                true
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                inner.readable = false;
                if Instant::now() >= inner.connect_deadline {
                    error!("timed out waiting for client to connect");
                    disconnect_no_flush_locked(&mut inner);
                }
                false
            }
            Err(err) => {
                error!(?err, "accept failed");
                disconnect_no_flush_locked(&mut inner);
                false
            }
        }
    }

    /// Periodic work: opportunistic flush and socket reads.
    pub fn tick(&self) {
        let mut inner = self.lock();
        if !matches!(inner.socket, Socket::Connected(_)) {
            return;
        }
        if Instant::now() >= inner.prev_send_time + inner.send_interval {
            flush_locked(&mut inner, false);
        }
        receive_locked(&mut inner);
    }

    /// Serializes and appends a packet, blocking for up to the flush deadline
    /// when the send buffer is saturated.
    pub fn send(&self, packet: &Packet) {
        let mut buf = [0u8; MAX_PACKET_BUFFER_SIZE];
        let frame_len = match encode_frame(packet, &mut buf) {
            Ok(len) => len,
            Err(err) => {
                error!(?err, "send failed to encode packet");
                return;
            }
        };
        let mut inner = self.lock();
        if !matches!(inner.socket, Socket::None) {
            send_raw_locked(&mut inner, &buf[..frame_len]);
        }
    }

    /// Appends already-framed bytes (spill buffer replay).
    pub fn send_raw(&self, data: &[u8]) {
        let mut inner = self.lock();
        if !matches!(inner.socket, Socket::None) {
            send_raw_locked(&mut inner, data);
        }
    }

    /// Non-blocking send: false when the frame does not fit in the remaining
    /// buffer space. Returns true when not connected so callers drop rather
    /// than retry forever.
    pub fn try_send(&self, packet: &Packet) -> bool {
        let mut buf = [0u8; MAX_PACKET_BUFFER_SIZE];
        let frame_len = match encode_frame(packet, &mut buf) {
            Ok(len) => len,
            Err(err) => {
                error!(?err, "try_send failed to encode packet");
                return true;
            }
        };
        let mut inner = self.lock();
        if matches!(inner.socket, Socket::None) {
            return true;
        }
        if frame_len <= SEND_BUFFER_SIZE - inner.send_cursor {
            let cursor = inner.send_cursor;
            inner.send_buf[cursor..cursor + frame_len].copy_from_slice(&buf[..frame_len]);
            inner.send_cursor += frame_len;
            true
        } else {
            false
        }
    }

    /// Retries sends until the buffer drains, the peer dies, or the deadline
    /// expires.
    pub fn flush(&self) {
        let mut inner = self.lock();
        flush_locked(&mut inner, true);
    }

    /// One non-blocking flush attempt.
    pub fn try_flush(&self) {
        let mut inner = self.lock();
        flush_locked(&mut inner, false);
    }

    /// Decodes the next complete frame out of the receive ring, if any.
    /// A malformed frame is an error; callers tear the connection down since
    /// the length prefix is the only framing signal.
    pub fn decode_packet(&self) -> Result<Option<Packet>, CodecError> {
        let mut inner = self.lock();
        decode_locked(&mut inner, None)
    }

    /// Like [`decode_packet`], additionally appending the frame's exact wire
    /// bytes to `raw`. Recording files store these bytes verbatim.
    ///
    /// [`decode_packet`]: Connection::decode_packet
    pub fn decode_packet_raw(&self, raw: &mut Vec<u8>) -> Result<Option<Packet>, CodecError> {
        let mut inner = self.lock();
        decode_locked(&mut inner, Some(raw))
    }

    /// Flushes what it can, then closes.
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        if inner.state == ConnState::NotConnected {
            return;
        }
        inner.state = ConnState::NotConnected;
        flush_locked(&mut inner, true);
        close_socket_locked(&mut inner);
    }

    pub fn disconnect_no_flush(&self) {
        let mut inner = self.lock();
        disconnect_no_flush_locked(&mut inner);
    }

    /// Disconnects and zeroes buffers, cursors, and totals.
    pub fn reset(&self) {
        let mut inner = self.lock();
        reset_locked(&mut inner);
    }
}

/// Binds a TCP listener on an OS-assigned port, returning it with the port
/// for the reservation response.
pub fn bind_ephemeral_listener(ip: std::net::IpAddr) -> io::Result<(TcpListener, u16)> {
    let listener = TcpListener::bind(SocketAddr::new(ip, 0))?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

fn reset_locked(inner: &mut Inner) {
    if inner.state != ConnState::NotConnected {
        inner.state = ConnState::NotConnected;
        flush_locked(inner, true);
    }
    close_socket_locked(inner);
    inner.send_cursor = 0;
    inner.recv_cursor = 0;
    inner.decode_cursor = 0;
    inner.sent_bytes_total = 0;
    inner.received_bytes_total = 0;
    inner.prev_send_time = Instant::ZERO;
    inner.readable = false;
    inner.writable = false;
}

fn disconnect_no_flush_locked(inner: &mut Inner) {
    if inner.state == ConnState::NotConnected && matches!(inner.socket, Socket::None) {
        return;
    }
    inner.state = ConnState::NotConnected;
    close_socket_locked(inner);
}

fn close_socket_locked(inner: &mut Inner) {
    match std::mem::replace(&mut inner.socket, Socket::None) {
        Socket::None => {}
        Socket::Connecting(mut stream) | Socket::Connected(mut stream) => {
            let _ = inner.poll.registry().deregister(&mut stream);
            graceful_close(stream);
        }
        Socket::Listening(mut listener) => {
            let _ = inner.poll.registry().deregister(&mut listener);
        }
    }
    inner.readable = false;
    inner.writable = false;
    inner.state = ConnState::NotConnected;
}

/// Polls once and latches readiness. Readiness notifications are
/// edge-triggered, so the flags only clear when an op returns WouldBlock.
fn poll_ready(inner: &mut Inner, timeout: Option<std::time::Duration>) {
    if let Err(err) = inner.poll.poll(&mut inner.events, timeout) {
        if err.kind() != io::ErrorKind::Interrupted {
            safe_panic!("got error polling: {err}");
        }
        return;
    }
    let mut readable = false;
    let mut writable = false;
    for ev in inner.events.iter() {
        if ev.token() == STREAM {
            readable |= ev.is_readable() || ev.is_read_closed() || ev.is_error();
            writable |= ev.is_writable();
        }
    }
    inner.readable |= readable;
    inner.writable |= writable;
}

fn receive_locked(inner: &mut Inner) {
    if !inner.readable {
        let timeout = match inner.role {
            Role::Server => std::time::Duration::from_micros(100),
            Role::Client => std::time::Duration::ZERO,
        };
        poll_ready(inner, Some(timeout));
    }
    while inner.readable && inner.recv_cursor < RECV_BUFFER_SIZE {
        let cursor = inner.recv_cursor;
        let Socket::Connected(stream) = &mut inner.socket else { return };
        match stream.read(&mut inner.recv_buf[cursor..]) {
            Ok(0) => {
                debug!("disconnected during recv");
                disconnect_no_flush_locked(inner);
                return;
            }
            Ok(n) => {
                inner.recv_cursor += n;
                inner.received_bytes_total += n as u64;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                inner.readable = false;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                error!(?err, "disconnected during recv");
                disconnect_no_flush_locked(inner);
                return;
            }
        }
    }
}

fn decode_locked(
    inner: &mut Inner,
    mut raw: Option<&mut Vec<u8>>,
) -> Result<Option<Packet>, CodecError> {
    safe_assert!(inner.decode_cursor <= inner.recv_cursor);
    if matches!(inner.socket, Socket::None) && inner.recv_cursor == inner.decode_cursor {
        return Ok(None);
    }
    let decodable = inner.recv_cursor - inner.decode_cursor;
    if decodable < FRAME_PREFIX_SIZE + 1 {
        return Ok(None);
    }
    let at = inner.decode_cursor;
    let frame_len = ((inner.recv_buf[at] as usize) << 8) + inner.recv_buf[at + 1] as usize;
    if frame_len < FRAME_PREFIX_SIZE + 1 || frame_len > MAX_PACKET_BUFFER_SIZE {
        return Err(CodecError::OutOfSpace);
    }
    if decodable < frame_len {
        return Ok(None);
    }

    let frame = &inner.recv_buf[at..at + frame_len];
    if let Some(raw) = raw.as_deref_mut() {
        raw.extend_from_slice(frame);
    }
    let result = Packet::deserialize(&frame[FRAME_PREFIX_SIZE..]);
    inner.decode_cursor += frame_len;

    if inner.decode_cursor >= RECV_BUFFER_SIZE / 2 {
        let remaining = inner.recv_cursor - inner.decode_cursor;
        inner.recv_buf.copy_within(inner.decode_cursor..inner.recv_cursor, 0);
        inner.decode_cursor = 0;
        inner.recv_cursor = remaining;
    }
    result.map(Some)
}

fn send_raw_locked(inner: &mut Inner, data: &[u8]) {
    let mut remaining = data;
    while !remaining.is_empty() && !matches!(inner.socket, Socket::None) {
        let n = (SEND_BUFFER_SIZE - inner.send_cursor).min(remaining.len());
        let cursor = inner.send_cursor;
        inner.send_buf[cursor..cursor + n].copy_from_slice(&remaining[..n]);
        inner.send_cursor += n;
        remaining = &remaining[n..];

        if inner.send_cursor == SEND_BUFFER_SIZE && !remaining.is_empty() {
            flush_locked(inner, true);
        }
    }

    if Instant::now() >= inner.prev_send_time + inner.send_interval {
        flush_locked(inner, false);
    }
}

/// Retries sends until everything queued is on the wire or the peer is gone.
/// Non-retrying flushes attempt a single write.
fn flush_locked(inner: &mut Inner, retry: bool) {
    let start = Instant::now();
    let deadline = start + FLUSH_DEADLINE;
    let mut sent = 0usize;

    while sent < inner.send_cursor {
        if !matches!(inner.socket, Socket::Connected(_)) {
            break;
        }
        if !inner.writable {
            poll_ready(inner, Some(std::time::Duration::from_millis(1)));
            if !inner.writable {
                if Instant::now() >= deadline {
                    // OS buffer has been full for a long time, peer is
                    // probably dead
                    debug!("flush timed out after {}", start.elapsed());
                    disconnect_no_flush_locked(inner);
                    break;
                }
                if !retry {
                    break;
                }
                continue;
            }
        }
        let range = sent..inner.send_cursor;
        let Socket::Connected(stream) = &mut inner.socket else { break };
        match stream.write(&inner.send_buf[range]) {
            Ok(0) => {
                debug!("disconnected during send");
                disconnect_no_flush_locked(inner);
                break;
            }
            Ok(n) => {
                sent += n;
                inner.sent_bytes_total += n as u64;
                if !retry {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                inner.writable = false;
                if !retry {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                debug!(?err, "disconnected during send");
                disconnect_no_flush_locked(inner);
                break;
            }
        }
    }

    if sent < inner.send_cursor {
        if sent > 0 {
            inner.send_buf.copy_within(sent..inner.send_cursor, 0);
            inner.send_cursor -= sent;
        }
    } else {
        inner.send_cursor = 0;
        inner.prev_send_time = Instant::now();
    }

    let took = start.elapsed();
    if took > Duration::from_millis(10) {
        warn!(%took, "flush took a long time");
    }
}
