//! Time sources.
//!
//! Spans and meters read time through [`Clock`] so tests can drive time by
//! hand with [`ManualClock`].

use crate::span::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Monotonic nanosecond time source.
pub trait Clock: Send + Sync {
    /// Nanoseconds since an arbitrary, fixed origin. Never decreases.
    fn now(&self) -> Timestamp;
}

/// Real monotonic clock anchored at construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        // Saturates after ~584 years of uptime
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Hand-driven clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock reading `start` nanoseconds.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Moves time forward by `by`.
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.now.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Sets the current time. Must not move backwards.
    pub fn set(&self, now: Timestamp) {
        let prev = self.now.swap(now, Ordering::Relaxed);
        debug_assert!(now >= prev, "ManualClock moved backwards: {} -> {}", prev, now);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::Relaxed)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

/// Seconds since the Unix epoch, `0` if the system clock is before it.
pub fn wall_clock_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Maps [`Clock`] readings to wall-clock seconds.
///
/// Captures one `(clock, wall)` pair and offsets from it, so later readings
/// stay consistent with each other even if the system clock is adjusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallAnchor {
    at: Timestamp,
    wall_nanos: u64,
}

impl WallAnchor {
    pub fn new(at: Timestamp, wall_secs: u64) -> Self {
        Self {
            at,
            wall_nanos: wall_secs.saturating_mul(NANOS_PER_SEC),
        }
    }

    /// Anchors `clock` to the system clock right now.
    pub fn capture(clock: &dyn Clock) -> Self {
        Self::new(clock.now(), wall_clock_secs())
    }

    /// Wall-clock seconds at clock reading `ts`, rounded down.
    pub fn secs_at(&self, ts: Timestamp) -> u64 {
        let wall = if ts >= self.at {
            self.wall_nanos.saturating_add(ts - self.at)
        } else {
            self.wall_nanos.saturating_sub(self.at - ts)
        };
        wall / NANOS_PER_SEC
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_never_decreases() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();

        clock.advance(Duration::from_micros(5));
        assert_eq!(other.now(), 6_000);

        other.set(10_000);
        assert_eq!(clock.now(), 10_000);
    }

    #[test]
    fn test_arc_dyn_clock() {
        let manual = ManualClock::new(42);
        let clock: Arc<dyn Clock> = Arc::new(manual.clone());
        manual.advance(Duration::from_nanos(8));
        assert_eq!(clock.now(), 50);
    }

    #[test]
    fn test_wall_clock_is_after_2020() {
        assert!(wall_clock_secs() > 1_577_836_800);
    }

    #[test]
    fn test_wall_anchor_offsets() {
        let anchor = WallAnchor::new(7_500_000_000, 1_700_000_000);

        assert_eq!(anchor.secs_at(7_500_000_000), 1_700_000_000);
        assert_eq!(anchor.secs_at(12_500_000_000), 1_700_000_005);
        // Readings before the anchor round down too
        assert_eq!(anchor.secs_at(5_000_000_000), 1_699_999_997);
        assert_eq!(anchor.secs_at(0), 1_699_999_992);

        let zero = WallAnchor::new(10, 0);
        assert_eq!(zero.secs_at(0), 0);
    }
}
