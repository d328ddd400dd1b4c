//! Retrying transport decorator.
//!
//! [`RetryingTransport`] wraps any [`Transport`] and re-sends a failed payload
//! with exponential backoff. Retries stop once `max_retries` are used up or
//! the next pause would take the whole sequence past `max_elapsed`; the
//! collector also cuts any delivery short at its `send_timeout`.

use crate::transport::{Payload, Transport, TransportError};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

// =============================================================================
// RETRY CONFIGURATION
// =============================================================================

/// Backoff schedule for [`RetryingTransport`].
///
/// Durations deserialize from integer milliseconds (`initial_delay_ms`,
/// `max_delay_ms`, `max_elapsed_ms`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Re-sends after the first attempt; `0` sends once
    pub max_retries: u32,
    #[serde(rename = "initial_delay_ms", with = "crate::config::millis")]
    pub initial_delay: Duration,
    /// Cap on a single pause
    #[serde(rename = "max_delay_ms", with = "crate::config::millis")]
    pub max_delay: Duration,
    /// Cap on the whole sequence, pauses and attempts together
    #[serde(rename = "max_elapsed_ms", with = "crate::config::millis")]
    pub max_elapsed: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_elapsed: Duration::from_secs(4),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Single attempt.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    /// Pause before retry number `retry` (1-based); `None` once retries are
    /// used up.
    fn backoff(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        let capped = nanos.min(self.max_delay.as_nanos() as f64);
        Some(Duration::from_nanos(capped as u64))
    }
}

// =============================================================================
// RETRYING TRANSPORT
// =============================================================================

/// Re-sends failed payloads on the schedule of a [`RetryConfig`].
pub struct RetryingTransport<T: Transport> {
    inner: T,
    config: RetryConfig,
    /// Re-sends performed
    total_retries: AtomicU64,
    /// Payloads delivered only after a retry
    recovered_sends: AtomicU64,
}

impl<T: Transport> RetryingTransport<T> {
    pub fn new(inner: T, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
            recovered_sends: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: T) -> Self {
        Self::new(inner, RetryConfig::default())
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn recovered_sends(&self) -> u64 {
        self.recovered_sends.load(Ordering::Relaxed)
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl<T: Transport> Transport for RetryingTransport<T> {
    async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let error = match self.inner.send(payload.clone()).await {
                Ok(()) => {
                    if attempts > 1 {
                        self.recovered_sends.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Err(e) => e,
            };

            let pause = self
                .config
                .backoff(attempts)
                .filter(|pause| started.elapsed() + *pause <= self.config.max_elapsed);

            let Some(pause) = pause else {
                warn!(
                    transport = self.inner.name(),
                    attempts,
                    elapsed = ?started.elapsed(),
                    error = %error,
                    "giving up on payload"
                );
                return Err(TransportError::RetriesExhausted { attempts });
            };

            debug!(
                transport = self.inner.name(),
                attempt = attempts,
                retry_in = ?pause,
                error = %error,
                "send failed, retrying"
            );
            self.total_retries.fetch_add(1, Ordering::Relaxed);
            sleep(pause).await;
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
