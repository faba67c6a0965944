//! peercore - the connection-handling core of a peer-to-peer network node
//!
//! peercore provides a fixed pool of worker data threads, each independently
//! owning a slice of live socket connections. Every worker multiplexes its
//! connections' readiness with a single bounded poll per cycle, drives the
//! protocol's read/process/write cycle, applies abuse-rate defenses, and
//! relays outbound broadcast entries to subscribed peers. The engine is
//! generic over the wire protocol through the [`Connection`] trait, so
//! several unrelated protocols can run on the same machinery.
//!
//! Out of scope and left to the embedding node: per-protocol message
//! formats, ledger state, peer discovery, and the listener/dialer that
//! feeds new connections into [`Pool::assign`] or [`DataThread::assign`].

// Internal-only modules
pub(crate) mod config;

mod connection;
mod data_thread;
mod ddos;
mod error;
mod pool;
mod slots;
mod socket;
#[cfg(feature = "tls")]
mod tls_config;

// These are the intended public API
pub use connection::{Connection, CountFlags, Direction, DisconnectReason, Event};
pub use data_thread::DataThread;
pub use ddos::{DdosFilter, DdosScore, DEFAULT_BAN};
pub use error::Error;
pub use pool::Pool;
pub use slots::SlotTable;
pub use socket::{Side, Socket};
#[cfg(feature = "tls")]
pub use tls_config::{client_config, server_config, server_name};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::connection::{Connection, CountFlags, Direction, DisconnectReason, Event};
    pub use crate::data_thread::DataThread;
    pub use crate::ddos::DdosFilter;
    pub use crate::error::Error;
    pub use crate::pool::Pool;
    pub use crate::slots::SlotTable;
    pub use crate::socket::{Side, Socket};
}
