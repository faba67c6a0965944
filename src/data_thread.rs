//! The per-worker connection engine: a poll/dispatch loop and a relay/flush
//! loop sharing one slot table.
//!
//! Each [`DataThread`] owns a slice of the node's live connections. The poll
//! loop multiplexes their readiness with a single bounded `mio` poll per
//! cycle, applies timeout/backpressure/abuse checks in a fixed precedence,
//! and drives the protocol's read/process cycle. The flush loop fans queued
//! relay entries out to subscribed occupants and drains buffered writes.
//! Both loops retire slots through one shared reclamation procedure, so a
//! fault in one connection never affects its neighbors.

use crate::config::{
    get_namespaced_bool, get_namespaced_u32, get_namespaced_u64, get_namespaced_usize,
};
use crate::connection::{Connection, CountFlags, Direction, DisconnectReason, Event};
use crate::ddos::DEFAULT_BAN;
use crate::error::Error;
use crate::slots::SlotTable;
use crate::socket::Side;

use ::config::Config;
use mio::{Events, Poll, Registry, Token};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

// Fixed write-idle limit: buffered data unwritten this long means the
// remote host stopped reading entirely.
const WRITE_TIMEOUT_SECS: u64 = 15;

// Bounded poll wait so the loop re-evaluates shutdown and fresh slots
// promptly even when no descriptor turns ready.
const POLL_WAIT: Duration = Duration::from_millis(100);

const DEFAULT_SLOT_CAPACITY: usize = 128;
const DEFAULT_POLL_CAPACITY: usize = 256;
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_SEND_BUFFER: usize = 3 * 1024 * 1024;
const DEFAULT_RELAY_QUEUE_LIMIT: usize = 16 * 1024;
const DEFAULT_DDOS_REQUEST_SCORE: u32 = 100;
const DEFAULT_DDOS_CONNECTION_SCORE: u32 = 50;

// Per-thread settings resolved once at construction.
#[derive(Debug, Clone)]
struct Settings {
    timeout_secs: u64,
    max_send_buffer: usize,
    relay_queue_limit: usize,
    poll_capacity: usize,
    sleep_ms: u64,
    ddos_enabled: bool,
    ddos_request_score: u32,
    ddos_connection_score: u32,
    meter_enabled: bool,
}

impl Settings {
    fn from_config(config: &Config, name: &str) -> Self {
        Self {
            timeout_secs: get_namespaced_u64(config, name, "timeout_secs")
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
            max_send_buffer: get_namespaced_usize(config, name, "max_send_buffer")
                .unwrap_or(DEFAULT_MAX_SEND_BUFFER),
            relay_queue_limit: get_namespaced_usize(config, name, "relay_queue_limit")
                .unwrap_or(DEFAULT_RELAY_QUEUE_LIMIT),
            poll_capacity: get_namespaced_usize(config, name, "poll_capacity")
                .unwrap_or(DEFAULT_POLL_CAPACITY),
            sleep_ms: get_namespaced_u64(config, name, "core_sleep_ms").unwrap_or(0),
            ddos_enabled: get_namespaced_bool(config, name, "ddos_enabled").unwrap_or(false),
            ddos_request_score: get_namespaced_u32(config, name, "ddos_request_score")
                .unwrap_or(DEFAULT_DDOS_REQUEST_SCORE),
            ddos_connection_score: get_namespaced_u32(config, name, "ddos_connection_score")
                .unwrap_or(DEFAULT_DDOS_CONNECTION_SCORE),
            meter_enabled: get_namespaced_bool(config, name, "meter_enabled").unwrap_or(false),
        }
    }
}

// Per-cycle readiness mirror for one slot, rebuilt from poll events every
// cycle and never persisted.
#[derive(Debug, Default, Clone, Copy)]
struct Readiness {
    readable: bool,
    error: bool,
    hup: bool,
}

// State shared between the two worker loops and the external API.
struct Shared<C: Connection> {
    id: u32,
    table: SlotTable<C>,
    relay: Mutex<VecDeque<(C::Kind, Vec<u8>)>>,
    work_lock: Mutex<()>,
    work: Condvar,
    flush_lock: Mutex<()>,
    flush: Condvar,
    incoming: AtomicU32,
    outbound: AtomicU32,
    requests: AtomicU64,
    destruct: AtomicBool,
    shutdown: Arc<AtomicBool>,
    registry: Registry,
    settings: Settings,
}

impl<C: Connection> Shared<C> {
    fn stopping(&self) -> bool {
        self.destruct.load(Ordering::Relaxed) || self.shutdown.load(Ordering::Relaxed)
    }

    fn relay_pending(&self) -> bool {
        !self.relay.lock().is_empty()
    }

    // Signals are fired under the paired mutex: the flag/counter stores
    // happen outside any lock, so an unsynchronized notify could land
    // between a waiter's predicate check and its park and be lost.
    fn wake_work(&self) {
        let _guard = self.work_lock.lock();
        self.work.notify_all();
    }

    fn wake_flush(&self) {
        let _guard = self.flush_lock.lock();
        self.flush.notify_all();
    }

    fn any_buffered(&self) -> bool {
        self.table
            .snapshot()
            .into_iter()
            .flatten()
            .any(|conn| conn.socket().buffered() > 0)
    }

    // Fires the disconnect event with the given reason and reclaims the
    // slot. The handle is captured outside the table lock: the event
    // callback may itself reach back into shared structures, and holding
    // the occupancy lock across it risks deadlock.
    fn disconnect_slot(&self, index: usize, reason: DisconnectReason) {
        let Some(conn) = self.table.get(index) else {
            return;
        };
        conn.event(Event::Disconnect(reason));
        self.remove(index);
    }

    // Reclaims a slot: decrement the direction counter, release ownership,
    // and wake the poll loop so its wait predicate re-evaluates emptiness.
    fn remove(&self, index: usize) {
        if let Some(conn) = self.table.free(index) {
            match conn.direction() {
                Direction::Incoming => self.incoming.fetch_sub(1, Ordering::Relaxed),
                Direction::Outbound => self.outbound.fetch_sub(1, Ordering::Relaxed),
            };
            if let Err(err) = conn.socket().deregister(&self.registry) {
                debug!(id = self.id, index, ?err, "Deregister during reclamation failed");
            }
            info!(id = self.id, index, peer_addr = %conn.socket().peer_addr(), "Reclaimed slot");
        }
        self.wake_work();
    }
}

/// One worker owning a slice of connections, a poll loop, and a flush loop.
///
/// Constructed with a fixed ID at node startup; dropping it signals both
/// loops to exit and joins them before the slot table and relay queue are
/// released.
pub struct DataThread<C: Connection> {
    shared: Arc<Shared<C>>,
    poll_thread: Option<JoinHandle<()>>,
    flush_thread: Option<JoinHandle<()>>,
}

// ============================================================================
// Constructors
// ============================================================================

impl<C: Connection> DataThread<C> {
    /// Creates a data thread with the given worker ID and spawns both loops.
    ///
    /// `shutdown` is the process-wide stop flag shared across all workers.
    pub fn new(config: &Config, id: u32, shutdown: Arc<AtomicBool>) -> Result<Self, Error> {
        Self::new_named(config, "", id, shutdown)
    }

    /// Creates a data thread with configuration namespacing.
    ///
    /// Configuration lookup follows `{name}.{key}`, then `{key}`, then a
    /// hard-coded default.
    pub fn new_named(
        config: &Config,
        name: &str,
        id: u32,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        let settings = Settings::from_config(config, name);
        let capacity =
            get_namespaced_usize(config, name, "slot_capacity").unwrap_or(DEFAULT_SLOT_CAPACITY);

        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;

        let shared = Arc::new(Shared {
            id,
            table: SlotTable::new(capacity),
            relay: Mutex::new(VecDeque::new()),
            work_lock: Mutex::new(()),
            work: Condvar::new(),
            flush_lock: Mutex::new(()),
            flush: Condvar::new(),
            incoming: AtomicU32::new(0),
            outbound: AtomicU32::new(0),
            requests: AtomicU64::new(0),
            destruct: AtomicBool::new(false),
            shutdown,
            registry,
            settings,
        });

        let poll_shared = Arc::clone(&shared);
        let poll_thread = thread::Builder::new()
            .name(format!("peercore-poll-{id}"))
            .spawn(move || poll_loop(poll_shared, poll))?;

        let flush_shared = Arc::clone(&shared);
        let flush_thread = thread::Builder::new()
            .name(format!("peercore-flush-{id}"))
            .spawn(move || flush_loop(flush_shared))?;

        Ok(Self {
            shared,
            poll_thread: Some(poll_thread),
            flush_thread: Some(flush_thread),
        })
    }
}

// ============================================================================
// Connection Management
// ============================================================================

impl<C: Connection> DataThread<C> {
    /// Assigns a new connection into the first empty slot and wakes the poll
    /// loop.
    ///
    /// The connection's [`direction()`](Connection::direction) decides which
    /// live counter it occupies. Fails with [`Error::SlotTableFull`] when no
    /// slot is empty; the caller must [`grow()`](Self::grow) or reject.
    pub fn assign(&self, connection: C) -> Result<usize, Error> {
        let conn = Arc::new(connection);
        let index = self.shared.table.assign(Arc::clone(&conn))?;

        conn.socket().reset_timers();
        if let Err(err) = conn.socket().register(&self.shared.registry, Token(index)) {
            self.shared.table.free(index);
            return Err(err);
        }

        match conn.direction() {
            Direction::Incoming => self.shared.incoming.fetch_add(1, Ordering::Relaxed),
            Direction::Outbound => self.shared.outbound.fetch_add(1, Ordering::Relaxed),
        };

        // Connection-rate scoring counts assignments, not packets.
        if self.shared.settings.ddos_enabled {
            if let Some(filter) = conn.ddos() {
                filter.c_score.add(1);
            }
        }

        info!(
            id = self.shared.id,
            index,
            peer_addr = %conn.socket().peer_addr(),
            direction = ?conn.direction(),
            "Assigned connection"
        );
        self.shared.wake_work();
        Ok(index)
    }

    /// Snapshot load of a slot's occupant.
    pub fn connection(&self, index: usize) -> Option<Arc<C>> {
        self.shared.table.get(index)
    }

    /// Disconnects one slot with the given reason.
    pub fn disconnect(&self, index: usize, reason: DisconnectReason) {
        self.shared.disconnect_slot(index, reason);
    }

    /// Disconnects every occupant with [`DisconnectReason::Force`] so
    /// upstream peer management can schedule reconnects. During teardown the
    /// slots are simply reclaimed without the event.
    pub fn disconnect_all(&self) {
        for index in 0..self.shared.table.len() {
            if self.shared.stopping() {
                self.shared.remove(index);
            } else {
                self.shared.disconnect_slot(index, DisconnectReason::Force);
            }
        }
    }

    /// Live connection count for the given direction flags.
    pub fn connection_count(&self, flags: CountFlags) -> u32 {
        let incoming = self.shared.incoming.load(Ordering::Relaxed);
        let outbound = self.shared.outbound.load(Ordering::Relaxed);
        match flags {
            CountFlags::Incoming => incoming,
            CountFlags::Outbound => outbound,
            CountFlags::Either => incoming + outbound,
        }
    }

    /// First empty slot index, or the slot count when full.
    pub fn find_empty_slot(&self) -> usize {
        self.shared.table.find_empty_slot()
    }

    /// Current slot capacity.
    pub fn slot_count(&self) -> usize {
        self.shared.table.len()
    }

    /// Adds empty slots for callers reacting to [`Error::SlotTableFull`].
    pub fn grow(&self, additional: usize) {
        self.shared.table.grow(additional);
    }
}

// ============================================================================
// Relay and Events
// ============================================================================

impl<C: Connection> DataThread<C> {
    /// Queues an outbound relay entry for fan-out to subscribed occupants.
    ///
    /// The queue is bounded by `relay_queue_limit`; producers hitting the
    /// bound get [`Error::RelayQueueFull`] instead of unbounded growth.
    pub fn enqueue_relay(&self, kind: C::Kind, payload: Vec<u8>) -> Result<(), Error> {
        {
            let mut queue = self.shared.relay.lock();
            if queue.len() >= self.shared.settings.relay_queue_limit {
                return Err(Error::RelayQueueFull {
                    limit: self.shared.settings.relay_queue_limit,
                });
            }
            queue.push_back((kind, payload));
        }
        self.shared.wake_flush();
        Ok(())
    }

    /// Pushes an out-of-band generic notification to every occupant.
    pub fn notify_all(&self) {
        for slot in self.shared.table.snapshot().into_iter().flatten() {
            slot.notify();
        }
    }

    /// Wakes the poll loop to re-evaluate its wait predicate.
    pub fn notify_work(&self) {
        self.shared.wake_work();
    }

    /// Wakes the flush loop to re-evaluate its wait predicate.
    pub fn notify_flush(&self) {
        self.shared.wake_flush();
    }

    /// Completed-packet meter, counted when `meter_enabled` is set.
    pub fn request_count(&self) -> u64 {
        self.shared.requests.load(Ordering::Relaxed)
    }

    /// This worker's fixed ID.
    pub fn id(&self) -> u32 {
        self.shared.id
    }
}

impl<C: Connection> Drop for DataThread<C> {
    fn drop(&mut self) {
        self.shared.destruct.store(true, Ordering::Relaxed);
        self.shared.wake_work();
        self.shared.wake_flush();
        if let Some(handle) = self.poll_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.flush_thread.take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Poll/Dispatch Loop
// ============================================================================

fn poll_loop<C: Connection>(shared: Arc<Shared<C>>, mut poll: Poll) {
    let mut events = Events::with_capacity(shared.settings.poll_capacity);
    let mut readiness: Vec<Readiness> = Vec::new();

    while !shared.stopping() {
        // Optional throttle to trade latency for CPU on small deployments.
        if shared.settings.sleep_ms > 0 {
            thread::sleep(Duration::from_millis(shared.settings.sleep_ms));
        }

        // Wait until there is at least one live connection or teardown is
        // requested. The predicate re-check absorbs spurious wakeups.
        {
            let mut guard = shared.work_lock.lock();
            shared.work.wait_while(&mut guard, |_| {
                !(shared.stopping()
                    || shared.incoming.load(Ordering::Relaxed) > 0
                    || shared.outbound.load(Ordering::Relaxed) > 0)
            });
        }
        if shared.stopping() {
            return;
        }

        // Rebuild the readiness snapshot to mirror the current slot count.
        // Slots without a registered occupant simply never produce events.
        let size = shared.table.len();
        readiness.clear();
        readiness.resize(size, Readiness::default());

        if let Err(err) = poll.poll(&mut events, Some(POLL_WAIT)) {
            // Transient multiplex fault: skip the slot pass entirely.
            warn!(id = shared.id, ?err, "Poll failed, retrying cycle");
            thread::sleep(Duration::from_millis(1));
            continue;
        }

        for event in events.iter() {
            let Token(index) = event.token();
            if let Some(slot) = readiness.get_mut(index) {
                slot.readable |= event.is_readable();
                slot.error |= event.is_error();
                slot.hup |= event.is_read_closed();
            }
        }

        for index in 0..size {
            let Some(conn) = shared.table.get(index) else {
                continue;
            };
            if !conn.connected() {
                continue;
            }

            if let Some(reason) = check_slot(&shared, readiness[index], &conn) {
                debug!(
                    id = shared.id,
                    index,
                    %reason,
                    peer_addr = %conn.socket().peer_addr(),
                    "Disconnecting slot"
                );
                shared.disconnect_slot(index, reason);
                continue;
            }

            // A fault in one connection must never abort the cycle for the
            // others.
            if let Err(err) = service_slot(&shared, index, &conn) {
                warn!(id = shared.id, index, ?err, "Slot handling failed");
                shared.disconnect_slot(index, DisconnectReason::Errors);
            }
        }

        // Backlogged writers are the flush loop's responsibility; kick it so
        // buffered responses from this cycle drain promptly.
        if shared.any_buffered() {
            shared.wake_flush();
        }
    }
}

// Disconnect checks in their total precedence order: the first match wins
// and the remaining checks are never consulted for this slot.
fn check_slot<C: Connection>(
    shared: &Shared<C>,
    ready: Readiness,
    conn: &Arc<C>,
) -> Option<DisconnectReason> {
    let settings = &shared.settings;
    let socket = conn.socket();

    if ready.error {
        return Some(DisconnectReason::PollError);
    }
    if ready.hup {
        return Some(DisconnectReason::Peer);
    }
    if socket.errors() {
        return Some(DisconnectReason::Errors);
    }
    if socket.timeout(settings.timeout_secs, Side::Read) {
        return Some(DisconnectReason::Timeout);
    }
    // Readable with nothing to read means the peer closed on platforms that
    // signal readiness for the close; TLS sessions legitimately wake for
    // handshake records.
    if ready.readable && socket.available() == 0 && !socket.is_secure() {
        return Some(DisconnectReason::PollEmpty);
    }
    if socket.buffered() > 0 && socket.timeout(WRITE_TIMEOUT_SECS, Side::Write) {
        return Some(DisconnectReason::TimeoutWrite);
    }
    if socket.buffered() > settings.max_send_buffer {
        return Some(DisconnectReason::Buffer);
    }
    if settings.ddos_enabled {
        if let Some(filter) = conn.ddos() {
            if filter.r_score.score() > settings.ddos_request_score
                || filter.c_score.score() > settings.ddos_connection_score
            {
                filter.ban(DEFAULT_BAN);
            }
            if filter.banned() {
                warn!(id = shared.id, peer_addr = %socket.peer_addr(), "Connection banned");
                return Some(DisconnectReason::Ddos);
            }
        }
    }
    None
}

// The read/process/event cycle for one healthy slot.
fn service_slot<C: Connection>(
    shared: &Shared<C>,
    index: usize,
    conn: &Arc<C>,
) -> Result<(), Error> {
    conn.event(Event::Generic);
    conn.read_packet()?;

    if conn.packet_complete() {
        trace!(id = shared.id, index, "Received complete packet");
        if shared.settings.meter_enabled {
            shared.requests.fetch_add(1, Ordering::Relaxed);
        }
        if shared.settings.ddos_enabled {
            if let Some(filter) = conn.ddos() {
                filter.r_score.add(1);
            }
        }

        if !conn.process_packet() {
            shared.disconnect_slot(index, DisconnectReason::Force);
            return Ok(());
        }

        conn.event(Event::Processed);
        conn.reset_packet();
    }
    Ok(())
}

// ============================================================================
// Relay/Flush Loop
// ============================================================================

fn flush_loop<C: Connection>(shared: Arc<Shared<C>>) {
    while !shared.stopping() {
        {
            let mut guard = shared.flush_lock.lock();
            shared.flush.wait_while(&mut guard, |_| {
                !(shared.stopping() || shared.relay_pending() || shared.any_buffered())
            });
        }
        if shared.stopping() {
            return;
        }

        // At most one relay entry per cycle, FIFO; the placeholder keeps the
        // flush pass running when only buffered backlogs need draining.
        let (kind, payload) = shared
            .relay
            .lock()
            .pop_front()
            .unwrap_or_else(|| (C::Kind::default(), Vec::new()));

        let size = shared.table.len();
        for index in 0..size {
            let Some(conn) = shared.table.get(index) else {
                continue;
            };

            // Fan out to subscribers of this entry's kind; the connection's
            // relay filter decides the real content.
            if let Some(data) = conn.relay_filter(&kind, &payload) {
                if !data.is_empty() {
                    trace!(id = shared.id, index, len = data.len(), "Relaying entry");
                    conn.write_packet(&kind, &data);
                }
            }

            // Flush buffered writes every cycle regardless of the relay
            // outcome so backlogs drain without new traffic.
            if conn.socket().buffered() > 0 {
                match conn.socket().flush() {
                    Ok(0) => {
                        // Still buffered with no progress; yield briefly so a
                        // saturated peer does not spin this loop.
                        thread::sleep(Duration::from_millis(1));
                    }
                    Ok(_) => {}
                    Err(err) => {
                        trace!(id = shared.id, index, ?err, "Flush failed");
                        let backoff =
                            u64::from(conn.socket().consecutive_errors() / 1000).min(5);
                        if backoff > 0 {
                            thread::sleep(Duration::from_millis(backoff));
                        }
                    }
                }
            }
        }
    }
}
