//! The capability interface the core requires from a connection.
//!
//! The engine is generic over the wire protocol: a [`DataThread`](crate::DataThread)
//! only ever talks to its occupants through the [`Connection`] trait, so one
//! engine instance can drive any protocol that exposes readiness state,
//! packet read/process/reset, eventing, relay filtering, and abuse scoring.

use crate::ddos::DdosFilter;
use crate::error::Error;
use crate::socket::Socket;

use std::fmt;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted from a remote dialer.
    Incoming,
    /// Dialed out by this node.
    Outbound,
}

/// Direction selector for [`connection_count`](crate::DataThread::connection_count)
/// queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountFlags {
    Incoming,
    Outbound,
    Either,
}

/// Why a slot was disconnected.
///
/// Passed verbatim to the connection's disconnect event before the slot is
/// reclaimed, so upstream peer management can react (e.g. schedule a
/// reconnect) while the connection is still nominally present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Protocol processing rejected the connection.
    Force,
    /// The readiness poll reported an error condition.
    PollError,
    /// The peer hung up.
    Peer,
    /// The socket accumulated I/O errors.
    Errors,
    /// Read-idle timeout exceeded.
    Timeout,
    /// Read readiness with zero bytes available on a plaintext socket
    /// (peer-close signalling on some platforms).
    PollEmpty,
    /// Buffered data went unwritten past the write-idle limit.
    TimeoutWrite,
    /// The outbound buffer exceeded the configured maximum.
    Buffer,
    /// Banned by abuse-rate protection.
    Ddos,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::Force => "force",
            DisconnectReason::PollError => "poll-error",
            DisconnectReason::Peer => "peer",
            DisconnectReason::Errors => "errors",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::PollEmpty => "poll-empty",
            DisconnectReason::TimeoutWrite => "timeout-write",
            DisconnectReason::Buffer => "buffer",
            DisconnectReason::Ddos => "ddos",
        };
        f.write_str(name)
    }
}

/// Lifecycle events the core dispatches to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Emitted once per poll cycle for every serviced slot.
    Generic,
    /// Emitted after a packet was processed successfully.
    Processed,
    /// Emitted immediately before the slot is reclaimed.
    Disconnect(DisconnectReason),
}

/// Capability set the core requires from a connection.
///
/// The poll loop and the flush loop of one data thread share each occupant
/// through an `Arc`, so every method takes `&self`; implementations carry
/// interior mutability for their packet state (the provided [`Socket`]
/// already does for its buffers).
pub trait Connection: Send + Sync + 'static {
    /// Relay message kind. The default value is the placeholder used when
    /// the flush loop runs a cycle with an empty relay queue.
    type Kind: Clone + Default + Send + 'static;

    /// The transport endpoint this connection owns.
    fn socket(&self) -> &Socket;

    /// Which side opened this connection. Decides which live-connection
    /// counter the slot occupies.
    fn direction(&self) -> Direction;

    /// Whether the connection finished establishing. Slots holding
    /// unconnected occupants are skipped by the poll loop.
    fn connected(&self) -> bool;

    /// Abuse-rate filter, if this connection is scored.
    fn ddos(&self) -> Option<&DdosFilter>;

    /// Delivers a lifecycle event.
    fn event(&self, event: Event);

    /// Out-of-band generic notification, outside the read/process cycle.
    fn notify(&self);

    /// Makes progress on assembling the next inbound packet without
    /// blocking. An error here disconnects the slot with
    /// [`DisconnectReason::Errors`].
    fn read_packet(&self) -> Result<(), Error>;

    /// Whether a complete packet is assembled and ready for processing.
    fn packet_complete(&self) -> bool;

    /// Handles the assembled packet. Returning `false` flags the data
    /// thread to disconnect with [`DisconnectReason::Force`].
    fn process_packet(&self) -> bool;

    /// Clears packet state for the next read cycle.
    fn reset_packet(&self);

    /// Decides whether this connection subscribes to a relay entry.
    ///
    /// Returns the payload to send (possibly transformed for this peer), or
    /// `None`/empty to skip. Called every flush cycle for every occupant.
    fn relay_filter(&self, kind: &Self::Kind, payload: &[u8]) -> Option<Vec<u8>>;

    /// Wraps `payload` in this protocol's outbound packet format and queues
    /// it on the socket.
    fn write_packet(&self, kind: &Self::Kind, payload: &[u8]);
}
