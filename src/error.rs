use thiserror::Error;

/// The error type for peercore operations.
///
/// This encompasses all errors that can occur when driving the connection
/// core: slot assignment, relay submission, socket I/O, and TLS setup.
///
/// Per-connection faults (timeouts, peer resets, abuse-limit breaches) are
/// never surfaced through this type - they are resolved internally by
/// disconnecting the affected slot and reported through the connection's
/// disconnect event.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Capacity Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No empty slot was available for a new connection.
    ///
    /// The caller must either grow the table with
    /// [`SlotTable::grow()`](crate::SlotTable::grow) or reject the connection.
    #[error("Slot table full ({capacity} slots occupied)")]
    SlotTableFull {
        /// The current slot table capacity.
        capacity: usize,
    },

    /// The outbound relay queue reached its configured bound.
    ///
    /// Producers must slow down or drop the entry; the queue is never grown
    /// past `relay_queue_limit`.
    #[error("Relay queue full ({limit} entries queued)")]
    RelayQueueFull {
        /// The configured queue bound.
        limit: usize,
    },

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate or key file format is invalid or unsupported.
    #[error("Invalid TLS material: {0}")]
    TlsInvalidMaterial(String),

    /// Server name for TLS SNI is invalid.
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// Failed to create a TLS session for a socket.
    #[error("TLS session setup failed: {0}")]
    TlsSession(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
