use crate::clock::Clock;
use crate::ewma::Ewma;
use crate::meter::Meter;
use crate::wire::{BatchEncoder, BatchProtocol, JsonProtocol};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Rejected configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("sample_capacity must be at least 1")]
    ZeroSampleCapacity,
    #[error("queue_capacity must be at least 1")]
    ZeroQueueCapacity,
    #[error("flush_interval must be non-zero")]
    ZeroFlushInterval,
    #[error("flush_delay ({delay:?}) must be shorter than flush_interval ({interval:?})")]
    FlushDelayTooLong { delay: Duration, interval: Duration },
    #[error("send_timeout must be non-zero")]
    ZeroSendTimeout,
}

/// Averaging window of the collector's rate meters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterWindow {
    #[default]
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
}

impl MeterWindow {
    pub fn ewma(self) -> Ewma {
        match self {
            MeterWindow::OneMinute => Ewma::one_minute(),
            MeterWindow::FiveMinutes => Ewma::five_minutes(),
            MeterWindow::FifteenMinutes => Ewma::fifteen_minutes(),
        }
    }

    pub fn meter(self, clock: Arc<dyn Clock>) -> Meter {
        Meter::new(self.ewma(), clock)
    }
}

/// Batch encoding sent to the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// Compact varint format with string tables
    #[default]
    Binary,
    /// Human-readable JSON
    Json,
}

impl ProtocolKind {
    pub fn build(self) -> Box<dyn BatchProtocol> {
        match self {
            ProtocolKind::Binary => Box::new(BatchEncoder::new()),
            ProtocolKind::Json => Box::new(JsonProtocol::new()),
        }
    }
}

/// Configuration for the [`Collector`](crate::Collector).
///
/// Durations deserialize from integer milliseconds (`flush_interval_ms`,
/// `flush_delay_ms`, `shutdown_timeout_ms`, ...); missing fields take their
/// defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Traces kept per flush interval (reservoir size)
    pub sample_capacity: usize,
    /// Traces buffered between producers and the collector thread
    pub queue_capacity: usize,
    /// Length of one batching interval
    #[serde(rename = "flush_interval_ms", with = "millis")]
    pub flush_interval: Duration,
    /// How long an interval stays open after it ends, for traces still in
    /// flight to the collector
    #[serde(rename = "flush_delay_ms", with = "millis")]
    pub flush_delay: Duration,
    /// Upper bound on one delivery, retries included
    #[serde(rename = "send_timeout_ms", with = "millis")]
    pub send_timeout: Duration,
    /// How often the collector logs its received and dropped rates
    #[serde(rename = "report_interval_ms", with = "millis")]
    pub report_interval: Duration,
    /// How long `shutdown` waits for the collector thread
    #[serde(rename = "shutdown_timeout_ms", with = "millis")]
    pub shutdown_timeout: Duration,
    pub meter_window: MeterWindow,
    pub protocol: ProtocolKind,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            sample_capacity: 100,
            queue_capacity: 1000,
            flush_interval: Duration::from_secs(5),
            flush_delay: Duration::from_millis(500),
            send_timeout: Duration::from_secs(5),
            report_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            meter_window: MeterWindow::OneMinute,
            protocol: ProtocolKind::Binary,
        }
    }
}

impl CollectorConfig {
    /// Short intervals and small buffers, for tests and demos.
    pub fn low_latency() -> Self {
        Self {
            sample_capacity: 20,
            queue_capacity: 256,
            flush_interval: Duration::from_millis(200),
            flush_delay: Duration::from_millis(20),
            send_timeout: Duration::from_millis(200),
            report_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Large buffers for bursty producers.
    pub fn high_throughput() -> Self {
        Self {
            sample_capacity: 500,
            queue_capacity: 16_384,
            ..Self::default()
        }
    }

    pub fn with_sample_capacity(mut self, sample_capacity: usize) -> Self {
        self.sample_capacity = sample_capacity;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_flush_delay(mut self, flush_delay: Duration) -> Self {
        self.flush_delay = flush_delay;
        self
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn with_report_interval(mut self, report_interval: Duration) -> Self {
        self.report_interval = report_interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn with_meter_window(mut self, meter_window: MeterWindow) -> Self {
        self.meter_window = meter_window;
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolKind) -> Self {
        self.protocol = protocol;
        self
    }

    /// Queue pop timeout: a twentieth of the flush interval, at least 1 ms.
    pub fn poll_timeout(&self) -> Duration {
        (self.flush_interval / 20).max(Duration::from_millis(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_capacity == 0 {
            return Err(ConfigError::ZeroSampleCapacity);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ZeroFlushInterval);
        }
        if self.flush_delay >= self.flush_interval {
            return Err(ConfigError::FlushDelayTooLong {
                delay: self.flush_delay,
                interval: self.flush_interval,
            });
        }
        if self.send_timeout.is_zero() {
            return Err(ConfigError::ZeroSendTimeout);
        }
        Ok(())
    }
}

/// Serde adapter for `Duration` as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
