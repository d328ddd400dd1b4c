//! Exponentially weighted moving average of an event rate.
//!
//! Not thread-safe on its own; [`Meter`](crate::Meter) wraps one behind a
//! mutex and drives `tick` from a clock.

use std::time::Duration;

/// Default tick interval of the preset averages.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// An exponentially weighted moving average over a fixed tick interval.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    interval: Duration,
    /// Events per second as of the last tick
    rate: f64,
    /// Events since the last tick
    uncounted: u64,
    initialized: bool,
}

impl Ewma {
    /// Smoothing factor for an average over `minutes` ticked every `interval`.
    pub fn alpha(minutes: f64, interval: Duration) -> f64 {
        1.0 - (-interval.as_secs_f64() / 60.0 / minutes).exp()
    }

    pub fn new(alpha: f64, interval: Duration) -> Self {
        Self {
            alpha,
            interval,
            rate: 0.0,
            uncounted: 0,
            initialized: false,
        }
    }

    // ========================================================================
    // Presets
    // ========================================================================

    pub fn one_minute() -> Self {
        Self::new(Self::alpha(1.0, TICK_INTERVAL), TICK_INTERVAL)
    }

    pub fn five_minutes() -> Self {
        Self::new(Self::alpha(5.0, TICK_INTERVAL), TICK_INTERVAL)
    }

    pub fn fifteen_minutes() -> Self {
        Self::new(Self::alpha(15.0, TICK_INTERVAL), TICK_INTERVAL)
    }

    /// Records `n` events in the current interval.
    pub fn update(&mut self, n: u64) {
        self.uncounted = self.uncounted.saturating_add(n);
    }

    /// Closes the current interval and folds its rate into the average.
    ///
    /// The first tick adopts the interval's rate outright.
    pub fn tick(&mut self) {
        let instant = self.uncounted as f64 / self.interval.as_secs_f64();
        self.uncounted = 0;

        if self.initialized {
            self.rate += self.alpha * (instant - self.rate);
        } else {
            self.rate = instant;
            self.initialized = true;
        }
    }

    /// Averaged number of events per `window`.
    pub fn rate(&self, window: Duration) -> f64 {
        self.rate * window.as_secs_f64()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn test_one_minute_alpha() {
        let alpha = Ewma::alpha(1.0, TICK_INTERVAL);
        assert!((alpha - 0.0799556).abs() < 1e-6, "alpha = {}", alpha);
    }

    #[test]
    fn test_rate_only_moves_on_tick() {
        let mut ewma = Ewma::one_minute();
        ewma.update(25);
        assert_eq!(ewma.rate(SECOND), 0.0);

        ewma.tick();
        assert!((ewma.rate(SECOND) - 5.0).abs() < 1e-9);
        assert!((ewma.rate(Duration::from_secs(60)) - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_decay_without_events() {
        let mut ewma = Ewma::five_minutes();
        ewma.update(50);
        ewma.tick();
        let before = ewma.rate(SECOND);

        ewma.tick();
        let after = ewma.rate(SECOND);
        let expected = before * (1.0 - Ewma::alpha(5.0, TICK_INTERVAL));
        assert!((after - expected).abs() < 1e-9);
    }

    #[test]
    fn test_longer_windows_decay_slower() {
        let mut fast = Ewma::one_minute();
        let mut slow = Ewma::fifteen_minutes();
        for ewma in [&mut fast, &mut slow] {
            ewma.update(100);
            ewma.tick();
            ewma.tick();
        }
        assert!(slow.rate(SECOND) > fast.rate(SECOND));
    }
}
