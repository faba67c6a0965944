//! A fixed pool of data threads with least-loaded assignment.
//!
//! The pool is the embedding node's handle on the connection core: an
//! external acceptor/dialer pushes new connections in, upstream logic
//! submits relay entries, and monitoring reads aggregate counters. The
//! threads run fully in parallel with no cross-instance coordination
//! beyond the shared shutdown flag.

use crate::connection::{Connection, CountFlags};
use crate::data_thread::DataThread;
use crate::error::Error;

use ::config::Config;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const DEFAULT_DATA_THREADS: u32 = 4;

/// Fixed set of [`DataThread`] workers sharing one shutdown flag.
pub struct Pool<C: Connection> {
    threads: Vec<DataThread<C>>,
    shutdown: Arc<AtomicBool>,
}

impl<C: Connection> Pool<C> {
    /// Builds `data_threads` workers from configuration.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::new_named(config, "")
    }

    /// Builds a pool with configuration namespacing
    /// (`{name}.{key}` falling back to `{key}`).
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        let count = crate::config::get_namespaced_u32(config, name, "data_threads")
            .unwrap_or(DEFAULT_DATA_THREADS)
            .max(1);

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(count as usize);
        for id in 0..count {
            threads.push(DataThread::new_named(
                config,
                name,
                id,
                Arc::clone(&shutdown),
            )?);
        }

        info!(count, "Started connection pool");
        Ok(Self { threads, shutdown })
    }

    /// Assigns a connection to the worker with the fewest live connections.
    ///
    /// Returns `(worker id, slot index)`.
    pub fn assign(&self, connection: C) -> Result<(u32, usize), Error> {
        let thread = self
            .threads
            .iter()
            .min_by_key(|t| t.connection_count(CountFlags::Either))
            .expect("Pool always holds at least one data thread");
        let index = thread.assign(connection)?;
        debug!(id = thread.id(), index, "Pool assigned connection");
        Ok((thread.id(), index))
    }

    /// Submits a relay entry to every worker for fan-out to its occupants.
    ///
    /// Stops at the first worker whose queue is at its bound, surfacing the
    /// backpressure to the producer.
    pub fn broadcast_relay(&self, kind: &C::Kind, payload: &[u8]) -> Result<(), Error> {
        for thread in &self.threads {
            thread.enqueue_relay(kind.clone(), payload.to_vec())?;
        }
        Ok(())
    }

    /// Aggregate live connection count across all workers.
    pub fn connection_count(&self, flags: CountFlags) -> u32 {
        self.threads
            .iter()
            .map(|t| t.connection_count(flags))
            .sum()
    }

    /// Aggregate completed-packet meter across all workers.
    pub fn request_count(&self) -> u64 {
        self.threads.iter().map(DataThread::request_count).sum()
    }

    /// Pushes an out-of-band generic notification to every connection in
    /// the pool.
    pub fn notify_all(&self) {
        for thread in &self.threads {
            thread.notify_all();
        }
    }

    /// Force-disconnects every connection in the pool.
    pub fn disconnect_all(&self) {
        for thread in &self.threads {
            thread.disconnect_all();
        }
    }

    /// The pool's workers, for callers that need to address one directly
    /// (e.g. to relay on a single worker or grow its table).
    pub fn threads(&self) -> &[DataThread<C>] {
        &self.threads
    }

    /// Sets the shared shutdown flag and wakes every loop. Dropping the
    /// pool afterwards joins all workers.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for thread in &self.threads {
            thread.notify_work();
            thread.notify_flush();
        }
    }
}

impl<C: Connection> Drop for Pool<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
