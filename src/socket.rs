//! Non-blocking, optionally TLS-wrapped byte-stream endpoint.
//!
//! A [`Socket`] owns a mio `TcpStream` plus an overflow send buffer that
//! absorbs writes the OS refuses immediately. It tracks idle time per
//! direction, captures the last I/O error, and counts consecutive faults so
//! the flush loop can back off on a broken peer. All operations are
//! non-blocking and take `&self`; the poll and flush loops of one data
//! thread touch the same socket concurrently.

use crate::error::Error;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;
use tracing::trace;

#[cfg(feature = "tls")]
use rustls::pki_types::ServerName;
#[cfg(feature = "tls")]
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
#[cfg(feature = "tls")]
use std::sync::Arc;

/// Direction selector for idle-timeout checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Time since the last successful read.
    Read,
    /// Time since the last successful write.
    Write,
}

// Mutable socket state shared by both data-thread loops.
#[derive(Debug)]
struct Inner {
    stream: TcpStream,
    /// Overflow buffer for bytes the OS refused to accept immediately.
    send_buf: Vec<u8>,
    #[cfg(feature = "tls")]
    tls: Option<TlsSession>,
}

#[cfg(feature = "tls")]
#[derive(Debug)]
enum TlsSession {
    Client(ClientConnection),
    Server(ServerConnection),
}

#[cfg(feature = "tls")]
impl TlsSession {
    fn read_tls(&mut self, stream: &mut TcpStream) -> std::io::Result<usize> {
        match self {
            TlsSession::Client(conn) => conn.read_tls(stream),
            TlsSession::Server(conn) => conn.read_tls(stream),
        }
    }

    fn write_tls(&mut self, stream: &mut TcpStream) -> std::io::Result<usize> {
        match self {
            TlsSession::Client(conn) => conn.write_tls(stream),
            TlsSession::Server(conn) => conn.write_tls(stream),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsSession::Client(conn) => conn.process_new_packets(),
            TlsSession::Server(conn) => conn.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsSession::Client(conn) => conn.wants_write(),
            TlsSession::Server(conn) => conn.wants_write(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsSession::Client(conn) => conn.reader(),
            TlsSession::Server(conn) => conn.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsSession::Client(conn) => conn.writer(),
            TlsSession::Server(conn) => conn.writer(),
        }
    }
}

/// Non-blocking byte-stream endpoint with overflow write buffering.
#[derive(Debug)]
pub struct Socket {
    inner: Mutex<Inner>,
    peer_addr: SocketAddr,
    // Timestamps are millis since `epoch` so both loops can read them
    // without taking the inner lock.
    epoch: Instant,
    last_send: AtomicU64,
    last_recv: AtomicU64,
    has_error: AtomicBool,
    last_error: Mutex<Option<String>>,
    consecutive_errors: AtomicU32,
    secure: AtomicBool,
}

// ============================================================================
// Constructors
// ============================================================================

impl Socket {
    /// Initiates a non-blocking connection to the specified address.
    ///
    /// The connection is in progress when this returns; the poll loop's
    /// readiness events report completion or failure.
    pub fn connect(addr: SocketAddr) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream, addr))
    }

    /// Wraps an already-accepted mio stream.
    pub fn accepted(stream: TcpStream, peer_addr: SocketAddr) -> Result<Self, Error> {
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream, peer_addr))
    }

    /// Converts a blocking std stream (e.g. from `TcpListener::accept`) into
    /// a non-blocking socket.
    pub fn from_std(stream: std::net::TcpStream) -> Result<Self, Error> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self::from_stream(TcpStream::from_std(stream), peer_addr))
    }

    fn from_stream(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(Inner {
                stream,
                send_buf: Vec::new(),
                #[cfg(feature = "tls")]
                tls: None,
            }),
            peer_addr,
            epoch: now,
            last_send: AtomicU64::new(0),
            last_recv: AtomicU64::new(0),
            has_error: AtomicBool::new(false),
            last_error: Mutex::new(None),
            consecutive_errors: AtomicU32::new(0),
            secure: AtomicBool::new(false),
        }
    }
}

// ============================================================================
// Readiness Registration
// ============================================================================

impl Socket {
    /// Registers the socket with a data thread's poll registry under the
    /// given slot token.
    pub fn register(&self, registry: &Registry, token: Token) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        registry.register(&mut inner.stream, token, Interest::READABLE)?;
        Ok(())
    }

    /// Removes the socket from the poll registry during slot reclamation.
    pub fn deregister(&self, registry: &Registry) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        registry.deregister(&mut inner.stream)?;
        Ok(())
    }
}

// ============================================================================
// Data Operations
// ============================================================================

impl Socket {
    /// Reads available bytes into `buf` without blocking.
    ///
    /// Returns `Ok(0)` both when no data is ready and when the peer has
    /// closed; the poll loop distinguishes the two through readiness flags
    /// and [`available()`](Self::available).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut inner = self.inner.lock();

        #[cfg(feature = "tls")]
        if inner.tls.is_some() {
            return self.read_secure(&mut inner, buf);
        }

        match inner.stream.read(buf) {
            Ok(n) => {
                if n > 0 {
                    trace!(len = n, peer_addr = %self.peer_addr, "Read data from socket");
                    self.mark_transfer(&self.last_recv);
                }
                Ok(n)
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(err) if err.kind() == ErrorKind::Interrupted => Ok(0),
            Err(err) => {
                self.record_error(&err);
                Err(err.into())
            }
        }
    }

    /// Queues `data` for transmission, writing what the OS accepts
    /// immediately and buffering the rest.
    ///
    /// Always accepts the full payload; the configured send-buffer cap is
    /// enforced by the poll loop, which disconnects overflowing peers.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut inner = self.inner.lock();

        #[cfg(feature = "tls")]
        if inner.tls.is_some() {
            // Plaintext goes through the overflow buffer; flush feeds it into
            // the TLS session and drains records opportunistically.
            inner.send_buf.extend_from_slice(data);
            let _ = self.flush_locked(&mut inner);
            return data.len();
        }

        let mut written = 0;
        if inner.send_buf.is_empty() {
            loop {
                match inner.stream.write(&data[written..]) {
                    Ok(0) => break,
                    Ok(n) => {
                        written += n;
                        self.mark_transfer(&self.last_send);
                        if written == data.len() {
                            return written;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        self.record_error(&err);
                        break;
                    }
                }
            }
        }

        inner.send_buf.extend_from_slice(&data[written..]);
        data.len()
    }

    /// Bytes currently queued but unwritten.
    pub fn buffered(&self) -> usize {
        let inner = self.inner.lock();
        let mut queued = inner.send_buf.len();
        #[cfg(feature = "tls")]
        if inner.tls.as_ref().is_some_and(|tls| tls.wants_write()) {
            // At least one pending TLS record; rustls does not expose the
            // exact byte count.
            queued += 1;
        }
        queued
    }

    /// Opportunistically drains the overflow buffer.
    ///
    /// Returns the bytes written this call. A fault bumps the
    /// consecutive-error counter, which the flush loop uses to scale its
    /// backoff.
    pub fn flush(&self) -> Result<usize, Error> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)
    }

    fn flush_locked(&self, inner: &mut Inner) -> Result<usize, Error> {
        #[cfg(feature = "tls")]
        if inner.tls.is_some() {
            return self.flush_secure(inner);
        }

        let mut sent = 0;
        while sent < inner.send_buf.len() {
            let chunk = &inner.send_buf[sent..];
            match inner.stream.write(chunk) {
                Ok(0) => break,
                Ok(n) => {
                    sent += n;
                    self.mark_transfer(&self.last_send);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    inner.send_buf.drain(..sent);
                    self.record_error(&err);
                    return Err(err.into());
                }
            }
        }
        inner.send_buf.drain(..sent);
        if sent > 0 {
            trace!(len = sent, peer_addr = %self.peer_addr, "Flushed buffered data");
            self.consecutive_errors.store(0, Ordering::Relaxed);
        }
        Ok(sent)
    }

    /// Readable byte count without consuming (peek).
    pub fn available(&self) -> usize {
        let inner = self.inner.lock();
        let mut peek_buf = [0u8; 512];
        match inner.stream.peek(&mut peek_buf) {
            Ok(n) => n,
            Err(_) => 0,
        }
    }
}

// ============================================================================
// TLS Operations
// ============================================================================

#[cfg(feature = "tls")]
impl Socket {
    /// Wraps the socket in a client-side TLS session.
    pub fn set_secure_client(
        &self,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<(), Error> {
        let session = ClientConnection::new(config, server_name)
            .map_err(|e| Error::TlsSession(e.to_string()))?;
        let mut inner = self.inner.lock();
        inner.tls = Some(TlsSession::Client(session));
        self.secure.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Wraps the socket in a server-side TLS session.
    pub fn set_secure_server(&self, config: Arc<ServerConfig>) -> Result<(), Error> {
        let session =
            ServerConnection::new(config).map_err(|e| Error::TlsSession(e.to_string()))?;
        let mut inner = self.inner.lock();
        inner.tls = Some(TlsSession::Server(session));
        self.secure.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Drops the TLS session, reverting to plaintext I/O.
    pub fn set_plain(&self) {
        let mut inner = self.inner.lock();
        inner.tls = None;
        self.secure.store(false, Ordering::Relaxed);
    }

    fn read_secure(&self, inner: &mut Inner, buf: &mut [u8]) -> Result<usize, Error> {
        let Inner { stream, tls, .. } = &mut *inner;
        let tls = tls.as_mut().expect("TLS session checked by caller");

        // Pull ciphertext from the wire until it would block.
        loop {
            match tls.read_tls(stream) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.record_error(&err);
                    return Err(err.into());
                }
            }
        }

        if let Err(err) = tls.process_new_packets() {
            let err = std::io::Error::new(ErrorKind::InvalidData, err.to_string());
            self.record_error(&err);
            return Err(err.into());
        }

        match tls.reader().read(buf) {
            Ok(n) => {
                if n > 0 {
                    self.mark_transfer(&self.last_recv);
                }
                Ok(n)
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(err) => {
                self.record_error(&err);
                Err(err.into())
            }
        }
    }

    fn flush_secure(&self, inner: &mut Inner) -> Result<usize, Error> {
        let Inner {
            stream,
            send_buf,
            tls,
        } = &mut *inner;
        let tls = tls.as_mut().expect("TLS session checked by caller");

        // Feed queued plaintext into the session.
        let mut fed = 0;
        while fed < send_buf.len() {
            match tls.writer().write(&send_buf[fed..]) {
                Ok(0) => break,
                Ok(n) => fed += n,
                Err(_) => break,
            }
        }
        send_buf.drain(..fed);

        // Drain pending TLS records onto the wire.
        let mut sent = 0;
        while tls.wants_write() {
            match tls.write_tls(stream) {
                Ok(0) => break,
                Ok(n) => {
                    sent += n;
                    self.mark_transfer(&self.last_send);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.record_error(&err);
                    return Err(err.into());
                }
            }
        }
        if sent > 0 {
            self.consecutive_errors.store(0, Ordering::Relaxed);
        }
        Ok(sent)
    }
}

// ============================================================================
// State Queries
// ============================================================================

impl Socket {
    /// The remote address of this socket.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether `secs` seconds elapsed since the last successful transfer in
    /// the given direction.
    pub fn timeout(&self, secs: u64, side: Side) -> bool {
        let last = match side {
            Side::Read => self.last_recv.load(Ordering::Relaxed),
            Side::Write => self.last_send.load(Ordering::Relaxed),
        };
        self.now_millis().saturating_sub(last) > secs.saturating_mul(1000)
    }

    /// Whether the socket captured an I/O error.
    pub fn errors(&self) -> bool {
        self.has_error.load(Ordering::Relaxed)
    }

    /// Human-readable description of the last captured error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Count of consecutive faults since the last successful flush.
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    /// Whether the socket is TLS-wrapped.
    pub fn is_secure(&self) -> bool {
        self.secure.load(Ordering::Relaxed)
    }

    /// Restarts both idle-timeout clocks. Called on slot assignment.
    pub fn reset_timers(&self) {
        let now = self.now_millis();
        self.last_send.store(now, Ordering::Relaxed);
        self.last_recv.store(now, Ordering::Relaxed);
    }

    fn now_millis(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn mark_transfer(&self, stamp: &AtomicU64) {
        stamp.store(self.now_millis(), Ordering::Relaxed);
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }

    fn record_error(&self, err: &std::io::Error) {
        trace!(peer_addr = %self.peer_addr, ?err, "Socket error");
        *self.last_error.lock() = Some(err.to_string());
        self.has_error.store(true, Ordering::Relaxed);
        self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
    }
}
