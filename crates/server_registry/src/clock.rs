//! Time source and staleness thresholds for the registry.
//!
//! Every liveness decision in the registry is derived from a single number:
//! the time elapsed since an entry's last heartbeat. This module provides the
//! clock that produces "now" and the [`StalenessPolicy`] that turns an elapsed
//! duration into a liveness verdict.
//!
//! Production code uses [`SystemClock`]. Tests use [`ManualClock`] so that
//! soft and hard timeouts can be crossed without waiting on wall-clock time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current time, in milliseconds since the Unix epoch.
pub trait HeartbeatClock: Send + Sync + std::fmt::Debug {
    /// Returns the current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// Wall-clock time source.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl HeartbeatClock for SystemClock {
    fn now_millis(&self) -> u64 {
        // A clock set before the epoch reads as 0, which only makes entries look older.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Manually advanced time source for deterministic tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock frozen at `start_millis`.
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute value.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl HeartbeatClock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Liveness verdict for an entry at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Heartbeat received within the soft timeout.
    Fresh,
    /// Past the soft timeout; hidden from discovery but retained.
    Stale,
    /// Past the hard timeout; eligible for removal.
    Expired,
}

/// Soft and hard staleness thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    pub soft_timeout: Duration,
    pub hard_timeout: Duration,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            soft_timeout: Duration::from_secs(60),
            hard_timeout: Duration::from_secs(300),
        }
    }
}

impl StalenessPolicy {
    pub fn new(soft_timeout: Duration, hard_timeout: Duration) -> Self {
        Self {
            soft_timeout,
            hard_timeout,
        }
    }

    /// Classifies an entry whose last heartbeat was at `last_heartbeat_at`.
    ///
    /// Thresholds are exclusive: an entry exactly `soft_timeout` old is
    /// still fresh. A heartbeat timestamp in the future counts as fresh.
    pub fn classify(&self, last_heartbeat_at: u64, now: u64) -> Freshness {
        let elapsed = now.saturating_sub(last_heartbeat_at);
        if elapsed > self.hard_timeout.as_millis() as u64 {
            Freshness::Expired
        } else if elapsed > self.soft_timeout.as_millis() as u64 {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }
}
