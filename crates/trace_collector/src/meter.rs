//! Thread-safe event rate meter.

use crate::clock::Clock;
use crate::ewma::Ewma;
use crate::span::Timestamp;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug)]
struct State {
    ewma: Ewma,
    last_tick: Timestamp,
    count: u64,
}

/// Measures the rate of marked events, ticking its [`Ewma`] on the clock's
/// schedule.
///
/// Ticks are applied lazily: every `mark` and `rate` call first runs the ticks
/// owed since the last one, so an idle meter still decays.
pub struct Meter {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl Meter {
    pub fn new(ewma: Ewma, clock: Arc<dyn Clock>) -> Self {
        let last_tick = clock.now();
        Self {
            state: Mutex::new(State {
                ewma,
                last_tick,
                count: 0,
            }),
            clock,
        }
    }

    /// One-minute moving average.
    pub fn one_minute(clock: Arc<dyn Clock>) -> Self {
        Self::new(Ewma::one_minute(), clock)
    }

    /// Records `n` events.
    pub fn mark(&self, n: u64) {
        let mut state = self.lock();
        self.tick_if_necessary(&mut state);
        state.ewma.update(n);
        state.count = state.count.saturating_add(n);
    }

    /// Averaged events per second.
    pub fn rate(&self) -> f64 {
        let mut state = self.lock();
        self.tick_if_necessary(&mut state);
        state.ewma.rate(Duration::from_secs(1))
    }

    /// Total events marked over the meter's lifetime.
    pub fn count(&self) -> u64 {
        self.lock().count
    }

    fn tick_if_necessary(&self, state: &mut State) {
        let interval = u64::try_from(state.ewma.interval().as_nanos()).unwrap_or(u64::MAX);
        let now = self.clock.now();
        let age = now.saturating_sub(state.last_tick);

        if interval == 0 || age < interval {
            return;
        }

        // Stay aligned to the tick grid
        state.last_tick = now - age % interval;
        for _ in 0..age / interval {
            state.ewma.tick();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Meter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Meter")
            .field("ewma", &state.ewma)
            .field("count", &state.count)
            .finish_non_exhaustive()
    }
}
