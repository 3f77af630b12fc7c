// src/quic/clock.rs
//! Monotonic time sources.
//!
//! The reliability core never reads the wall clock; it is handed nanosecond
//! timestamps taken from an injected [`Ticker`] so tests can drive time
//! deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A monotonic clock measured in nanoseconds from an arbitrary origin.
pub trait Ticker: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Production ticker: nanoseconds since the ticker was created.
#[derive(Debug)]
pub struct MonotonicTicker {
    origin: Instant,
}

impl MonotonicTicker {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for MonotonicTicker {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Deterministic ticker for tests and simulations: time only moves when told.
#[derive(Debug, Default)]
pub struct ManualTicker {
    now: AtomicU64,
}

impl ManualTicker {
    pub fn new(start_ns: u64) -> Self {
        Self { now: AtomicU64::new(start_ns) }
    }

    /// Sets the absolute time in nanoseconds.
    pub fn set(&self, now_ns: u64) {
        self.now.store(now_ns, Ordering::SeqCst);
    }

    /// Moves time forward by the given amount.
    pub fn advance(&self, delta_ns: u64) {
        self.now.fetch_add(delta_ns, Ordering::SeqCst);
    }
}

impl Ticker for ManualTicker {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
