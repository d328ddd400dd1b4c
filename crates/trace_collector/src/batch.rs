//! Interval batching.
//!
//! [`BatchProcessor`] accumulates the traces of one flush interval: it counts
//! every trace per endpoint and keeps a bounded uniform sample of them. It
//! is purely sequential and knows nothing about transports.
//!
//! [`IntervalWindow`] pins a processor to a half-open interval `[from, to)`
//! of trace end times. A window is cut once the clock passes
//! `to + flush_delay`, which leaves room for traces that end just before the
//! boundary but reach the collector after it.

use crate::sampler::{Draw, ReservoirSampler};
use crate::span::{Timestamp, Trace};
use rand::rngs::StdRng;
use std::collections::BTreeMap;

/// One interval's worth of sampled traces, ready for encoding.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Wall-clock seconds at the start of the batch's interval
    pub timestamp: u64,
    /// Traces observed per endpoint, sampled or not
    pub counts: BTreeMap<String, u64>,
    /// Sampled traces
    pub traces: Vec<Trace>,
}

impl Batch {
    /// Groups the sampled traces by endpoint.
    ///
    /// Endpoints that were counted but had no trace sampled map to an empty
    /// list, so every counted endpoint gets a segment.
    pub fn by_endpoint(&self) -> BTreeMap<&str, Vec<&Trace>> {
        let mut grouped: BTreeMap<&str, Vec<&Trace>> = self
            .counts
            .keys()
            .map(|endpoint| (endpoint.as_str(), Vec::new()))
            .collect();

        for trace in &self.traces {
            grouped.entry(trace.endpoint.as_str()).or_default().push(trace);
        }
        grouped
    }

    /// Observed count for `endpoint`, never less than the sampled count.
    pub fn observed(&self, endpoint: &str, sampled: usize) -> u64 {
        self.counts
            .get(endpoint)
            .copied()
            .unwrap_or(0)
            .max(sampled as u64)
    }

    /// Earliest span start across all sampled traces.
    pub fn started_at(&self) -> Option<Timestamp> {
        self.traces.iter().filter_map(Trace::started_at).min()
    }

    pub fn span_count(&self) -> usize {
        self.traces.iter().map(Trace::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }
}

/// Batching counters (plain u64, owned by one thread).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchMetrics {
    /// Traces handed to `add`
    pub traces_observed: u64,
    /// Traces that made it into a taken batch
    pub traces_sampled: u64,
    /// Batches returned by `take_batch`
    pub batches_taken: u64,
}

/// Accumulates counts and a reservoir sample for the current interval.
#[derive(Debug)]
pub struct BatchProcessor<R = StdRng> {
    sampler: ReservoirSampler<Trace, R>,
    counts: BTreeMap<String, u64>,
    metrics: BatchMetrics,
}

impl BatchProcessor {
    /// Creates a processor sampling at most `sample_capacity` traces per batch.
    pub fn new(sample_capacity: usize) -> Self {
        Self::with_sampler(ReservoirSampler::new(sample_capacity))
    }
}

impl<R: Draw> BatchProcessor<R> {
    pub fn with_sampler(sampler: ReservoirSampler<Trace, R>) -> Self {
        Self {
            sampler,
            counts: BTreeMap::new(),
            metrics: BatchMetrics::default(),
        }
    }

    /// Counts `trace` against its endpoint and offers it to the sample.
    pub fn add(&mut self, trace: Trace) {
        *self.counts.entry(trace.endpoint.clone()).or_insert(0) += 1;
        self.metrics.traces_observed += 1;
        self.sampler.offer(trace);
    }

    /// Number of traces observed this interval.
    pub fn observed(&self) -> u64 {
        self.sampler.count()
    }

    pub fn is_empty(&self) -> bool {
        self.sampler.is_empty()
    }

    /// Cuts the current interval.
    ///
    /// Returns `None` if nothing was sampled. Counts and sample are reset
    /// either way.
    pub fn take_batch(&mut self, timestamp: u64) -> Option<Batch> {
        let counts = std::mem::take(&mut self.counts);
        if self.sampler.is_empty() {
            return None;
        }

        let traces = self.sampler.drain();
        self.metrics.traces_sampled += traces.len() as u64;
        self.metrics.batches_taken += 1;

        Some(Batch {
            timestamp,
            counts,
            traces,
        })
    }

    /// Discards the current interval.
    pub fn clear(&mut self) {
        self.counts.clear();
        self.sampler.clear();
    }

    pub fn metrics(&self) -> &BatchMetrics {
        &self.metrics
    }
}

// =============================================================================
// INTERVAL WINDOWS
// =============================================================================

/// Shape shared by every window of a collector run. Times in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLayout {
    pub interval: u64,
    /// Grace period after `to` before the window is cut
    pub flush_delay: u64,
    pub sample_capacity: usize,
}

impl WindowLayout {
    pub fn new(interval: u64, flush_delay: u64, sample_capacity: usize) -> Self {
        Self {
            interval: interval.max(1),
            flush_delay,
            sample_capacity,
        }
    }

    /// The window `now` belongs to.
    ///
    /// While `now` is still inside the flush delay of the previous interval,
    /// that interval is returned instead, so traces finishing right before
    /// the boundary are not lost on startup.
    pub fn containing(&self, now: Timestamp) -> IntervalWindow {
        let aligned = now / self.interval * self.interval;
        let from = if now < aligned.saturating_add(self.flush_delay) {
            aligned.saturating_sub(self.interval)
        } else {
            aligned
        };
        self.starting_at(from)
    }

    pub fn starting_at(&self, from: Timestamp) -> IntervalWindow {
        IntervalWindow {
            layout: *self,
            from,
            processor: BatchProcessor::new(self.sample_capacity),
        }
    }
}

/// Traces whose end time falls in `[from, to)`.
#[derive(Debug)]
pub struct IntervalWindow {
    layout: WindowLayout,
    from: Timestamp,
    processor: BatchProcessor,
}

impl IntervalWindow {
    pub fn from(&self) -> Timestamp {
        self.from
    }

    pub fn to(&self) -> Timestamp {
        self.from.saturating_add(self.layout.interval)
    }

    pub fn flush_at(&self) -> Timestamp {
        self.to().saturating_add(self.layout.flush_delay)
    }

    /// Whether `trace` ended inside this window. Traces without a closed
    /// span have no end time and are never wanted.
    pub fn wants(&self, trace: &Trace) -> bool {
        trace
            .ended_at()
            .is_some_and(|end| end >= self.from && end < self.to())
    }

    pub fn should_flush(&self, now: Timestamp) -> bool {
        now >= self.flush_at()
    }

    /// The window directly after this one, empty.
    pub fn following(&self) -> IntervalWindow {
        self.layout.starting_at(self.to())
    }

    pub fn add(&mut self, trace: Trace) {
        self.processor.add(trace);
    }

    pub fn observed(&self) -> u64 {
        self.processor.observed()
    }

    pub fn is_empty(&self) -> bool {
        self.processor.is_empty()
    }

    /// Cuts the window. See [`BatchProcessor::take_batch`].
    pub fn take_batch(&mut self, timestamp: u64) -> Option<Batch> {
        self.processor.take_batch(timestamp)
    }
}
