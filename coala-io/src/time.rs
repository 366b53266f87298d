//! Time utilities for Coala
//!
//! Monotonic timestamps plus an injectable [`Clock`], so pool and cache
//! timeouts can be driven by a [`ManualClock`] in tests.

use parking_lot::Mutex;
use std::ops::{Add, Sub};
use std::time::{Duration, Instant};

/// Monotonic timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Instant);

impl Timestamp {
    /// Get the current timestamp
    #[inline]
    pub fn now() -> Self {
        Timestamp(Instant::now())
    }

    /// Create a timestamp from a base instant
    #[inline]
    pub fn from_instant(instant: Instant) -> Self {
        Timestamp(instant)
    }

    /// Get the underlying instant
    #[inline]
    pub fn as_instant(&self) -> Instant {
        self.0
    }

    /// Duration since an earlier timestamp (zero if `earlier` is later)
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }

    /// Calculate elapsed wall time since this timestamp
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, duration: Duration) -> Timestamp {
        Timestamp(self.0 + duration)
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, duration: Duration) -> Timestamp {
        Timestamp(self.0 - duration)
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, other: Timestamp) -> Duration {
        self.duration_since(other)
    }
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Clock backed by [`Instant::now`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, duration: Duration) {
        *self.offset.lock() += duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.base + *self.offset.lock())
    }
}

/// Timer for periodic operations
///
/// Used by the send loop for housekeeping sweeps.
pub struct Timer {
    interval: Duration,
    last_fire: Timestamp,
}

impl Timer {
    /// Create a new timer with the given interval
    pub fn new(interval: Duration) -> Self {
        Timer {
            interval,
            last_fire: Timestamp::now(),
        }
    }

    /// Check if the timer has expired
    pub fn expired(&self) -> bool {
        self.last_fire.elapsed() >= self.interval
    }

    /// Reset the timer
    pub fn reset(&mut self) {
        self.last_fire = Timestamp::now();
    }

    /// Fire the timer if expired, returning true if it fired
    pub fn try_fire(&mut self) -> bool {
        if self.expired() {
            self.reset();
            true
        } else {
            false
        }
    }
}
