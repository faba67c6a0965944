//! Shared test harness: a minimal line-delimited protocol implementing the
//! `Connection` capability set over real loopback sockets, plus fault
//! injection hooks for exercising the core's disconnect paths.

// Not every test target uses every helper.
#![allow(dead_code)]

use peercore::prelude::*;

use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Once;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

/// Opt-in test logging via the TEST_LOG environment variable:
/// 1 = info, 2 = debug, 3+ = trace.
///
/// Example: TEST_LOG=2 cargo test fault_in_one_slot -- --nocapture
pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace",
                };

                let filter = format!("peercore={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

/// A connection speaking newline-delimited frames, recording every event
/// the core dispatches to it.
pub struct TestConnection {
    socket: Socket,
    direction: Direction,
    ddos: Option<DdosFilter>,
    subscriptions: HashSet<u8>,
    read_buf: Mutex<Vec<u8>>,
    pub events: Mutex<Vec<Event>>,
    pub processed: Mutex<Vec<Vec<u8>>>,
    pub notified: AtomicUsize,
    /// When set, `process_packet` rejects and the core must Force-disconnect.
    pub reject: AtomicBool,
    /// When set, `read_packet` fails and the core must disconnect with
    /// `Errors`.
    pub fail_read: AtomicBool,
}

impl TestConnection {
    pub fn new(socket: Socket, direction: Direction) -> Self {
        Self {
            socket,
            direction,
            ddos: None,
            subscriptions: HashSet::new(),
            read_buf: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            processed: Mutex::new(Vec::new()),
            notified: AtomicUsize::new(0),
            reject: AtomicBool::new(false),
            fail_read: AtomicBool::new(false),
        }
    }

    pub fn with_ddos(mut self) -> Self {
        self.ddos = Some(DdosFilter::new());
        self
    }

    pub fn with_subscriptions(mut self, kinds: &[u8]) -> Self {
        self.subscriptions = kinds.iter().copied().collect();
        self
    }

    /// The reason of the most recent disconnect event, if any.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.events.lock().iter().rev().find_map(|e| match e {
            Event::Disconnect(reason) => Some(*reason),
            _ => None,
        })
    }
}

impl Connection for TestConnection {
    type Kind = u8;

    fn socket(&self) -> &Socket {
        &self.socket
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn connected(&self) -> bool {
        true
    }

    fn ddos(&self) -> Option<&DdosFilter> {
        self.ddos.as_ref()
    }

    fn event(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn notify(&self) {
        self.notified.fetch_add(1, Ordering::Relaxed);
    }

    fn read_packet(&self) -> Result<(), Error> {
        if self.fail_read.load(Ordering::Relaxed) {
            return Err(Error::Io(std::io::Error::other("injected read fault")));
        }
        let mut chunk = [0u8; 1024];
        let n = self.socket.read(&mut chunk)?;
        if n > 0 {
            self.read_buf.lock().extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    fn packet_complete(&self) -> bool {
        self.read_buf.lock().contains(&b'\n')
    }

    fn process_packet(&self) -> bool {
        if self.reject.load(Ordering::Relaxed) {
            return false;
        }
        let buf = self.read_buf.lock();
        if let Some(end) = buf.iter().position(|&b| b == b'\n') {
            self.processed.lock().push(buf[..end].to_vec());
        }
        true
    }

    fn reset_packet(&self) {
        let mut buf = self.read_buf.lock();
        if let Some(end) = buf.iter().position(|&b| b == b'\n') {
            buf.drain(..=end);
        }
    }

    fn relay_filter(&self, kind: &u8, payload: &[u8]) -> Option<Vec<u8>> {
        if payload.is_empty() || !self.subscriptions.contains(kind) {
            return None;
        }
        Some(payload.to_vec())
    }

    fn write_packet(&self, _kind: &u8, payload: &[u8]) {
        let mut framed = Vec::with_capacity(payload.len() + 1);
        framed.extend_from_slice(payload);
        framed.push(b'\n');
        self.socket.write(&framed);
    }
}

/// Accepted non-blocking socket plus the peer's blocking end.
pub fn socket_pair() -> (Socket, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
    let addr = listener.local_addr().expect("Failed to get local address");
    let peer = TcpStream::connect(addr).expect("Failed to connect peer");
    let (accepted, _) = listener.accept().expect("Failed to accept");
    let socket = Socket::from_std(accepted).expect("Failed to wrap socket");
    (socket, peer)
}

/// Polls `check` every 10 ms until it passes or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Reads from the peer until at least `min_len` bytes arrived or `window`
/// elapses.
pub fn drain_peer(peer: &mut TcpStream, min_len: usize, window: Duration) -> Vec<u8> {
    peer.set_read_timeout(Some(Duration::from_millis(50)))
        .expect("Failed to set read timeout");
    let mut received = Vec::new();
    let deadline = Instant::now() + window;
    let mut chunk = [0u8; 65536];
    while received.len() < min_len && Instant::now() < deadline {
        match std::io::Read::read(peer, &mut chunk) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&chunk[..n]),
            Err(err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => break,
        }
    }
    received
}
