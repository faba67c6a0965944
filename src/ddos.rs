//! Abuse-rate scoring for connections.
//!
//! Each connection may carry a [`DdosFilter`] with two independent decaying
//! counters: a request-rate score bumped once per completed packet, and a
//! connection-rate score bumped once per assignment from the same source.
//! The data thread compares both against configured thresholds each cycle
//! and bans the connection when either is crossed.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Default ban duration applied when a score threshold is crossed.
pub const DEFAULT_BAN: Duration = Duration::from_secs(60);

/// A rate score that decays one point per elapsed second.
///
/// Increments are cheap atomic adds; decay is applied lazily whenever the
/// score is read or bumped.
#[derive(Debug)]
pub struct DdosScore {
    score: AtomicU32,
    last_decay: Mutex<Instant>,
}

impl Default for DdosScore {
    fn default() -> Self {
        Self::new()
    }
}

impl DdosScore {
    pub fn new() -> Self {
        Self {
            score: AtomicU32::new(0),
            last_decay: Mutex::new(Instant::now()),
        }
    }

    /// Current score after applying pending decay.
    pub fn score(&self) -> u32 {
        self.decay();
        self.score.load(Ordering::Relaxed)
    }

    /// Adds `n` points to the score.
    pub fn add(&self, n: u32) {
        self.decay();
        self.score.fetch_add(n, Ordering::Relaxed);
    }

    /// Clears the score and restarts the decay clock.
    pub fn reset(&self) {
        let mut last = self.last_decay.lock();
        *last = Instant::now();
        self.score.store(0, Ordering::Relaxed);
    }

    // Subtracts one point per whole second elapsed since the last decay.
    fn decay(&self) {
        let mut last = self.last_decay.lock();
        let elapsed = last.elapsed().as_secs();
        if elapsed == 0 {
            return;
        }
        *last += Duration::from_secs(elapsed);
        let current = self.score.load(Ordering::Relaxed);
        let drop = current.min(u32::try_from(elapsed).unwrap_or(u32::MAX));
        self.score.store(current - drop, Ordering::Relaxed);
    }
}

/// Per-connection abuse filter: request-rate and connection-rate scores plus
/// a ban flag.
///
/// The data thread only reads the scores and calls [`ban()`](Self::ban);
/// decay and reset policy live here. A ban expires on its own, at which
/// point both scores restart from zero.
#[derive(Debug)]
pub struct DdosFilter {
    /// Request-rate score: one point per completed packet.
    pub r_score: DdosScore,
    /// Connection-rate score: one point per assignment.
    pub c_score: DdosScore,
    banned: AtomicBool,
    ban_until: Mutex<Option<Instant>>,
}

impl Default for DdosFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl DdosFilter {
    pub fn new() -> Self {
        Self {
            r_score: DdosScore::new(),
            c_score: DdosScore::new(),
            banned: AtomicBool::new(false),
            ban_until: Mutex::new(None),
        }
    }

    /// Marks the connection banned for `duration`.
    pub fn ban(&self, duration: Duration) {
        let mut until = self.ban_until.lock();
        *until = Some(Instant::now() + duration);
        self.banned.store(true, Ordering::Relaxed);
    }

    /// Whether a ban is currently in force.
    ///
    /// An expired ban clears the flag and resets both scores so a
    /// well-behaved reconnect starts fresh.
    pub fn banned(&self) -> bool {
        if !self.banned.load(Ordering::Relaxed) {
            return false;
        }
        let mut until = self.ban_until.lock();
        match *until {
            Some(deadline) if Instant::now() < deadline => true,
            _ => {
                *until = None;
                self.banned.store(false, Ordering::Relaxed);
                self.r_score.reset();
                self.c_score.reset();
                false
            }
        }
    }
}
