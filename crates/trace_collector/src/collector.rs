//! Background trace collector.
//!
//! Producers hand finished [`Trace`]s to [`Collector::submit`] (or a cloned
//! [`TraceProducer`]); a dedicated thread drains the bounded queue into two
//! open [`IntervalWindow`]s, the current flush interval and the one after
//! it, routing each trace by its end time. Once the clock passes a window's
//! end plus `flush_delay`, the window is encoded and handed to the
//! transport.
//!
//! ```text
//! producers ──push──► BoundedQueue ──pop(interval/20)──► worker thread
//!                     (drop on full)                      ├─ IntervalWindow x2 (counts + reservoir)
//!                                                         ├─ BatchProtocol     (string tables)
//!                                                         └─ Transport         (block_on, send_timeout)
//! ```
//!
//! Trace timestamps must come from the collector's [`Clock`].
//!
//! Shutdown is cooperative: a sentinel travels through the queue behind any
//! pending traces, the worker flushes both windows and exits. If the queue
//! is full the worker is cancelled instead; it then drains what is queued
//! before its final flush. A worker that does not exit within
//! `shutdown_timeout` is detached.

use crate::batch::{IntervalWindow, WindowLayout};
use crate::clock::{Clock, MonotonicClock, WallAnchor};
use crate::config::{CollectorConfig, ConfigError};
use crate::meter::Meter;
use crate::span::{Timestamp, Trace};
use crate::transport::{Payload, TransportBoxed, TransportError};
use crate::wire::BatchProtocol;
use boundq::BoundedQueue;
use crossbeam_utils::CachePadded;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors raised while creating or starting a collector
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// The worker thread or its runtime could not be created
    #[error("failed to spawn collector worker: {0}")]
    Spawn(#[source] std::io::Error),
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

// =============================================================================
// METRICS
// =============================================================================

/// Collector counters and rate meters.
///
/// Counters are cache-padded atomics updated with `Ordering::Relaxed`: they
/// are statistics and guard no other data.
pub struct CollectorMetrics {
    /// Traces accepted by `submit`
    submitted: CachePadded<AtomicU64>,
    /// Traces rejected because the queue was full
    dropped: CachePadded<AtomicU64>,
    /// Traces taken off the queue by the worker
    received: CachePadded<AtomicU64>,
    /// Received traces that ended outside both open windows
    out_of_window: CachePadded<AtomicU64>,
    batches_sent: CachePadded<AtomicU64>,
    traces_sent: CachePadded<AtomicU64>,
    send_errors: CachePadded<AtomicU64>,
    encode_errors: CachePadded<AtomicU64>,
    /// Worker iterations that panicked
    panics: CachePadded<AtomicU64>,
    received_rate: Meter,
    dropped_rate: Meter,
}

impl CollectorMetrics {
    fn new(config: &CollectorConfig, clock: &Arc<dyn Clock>) -> Self {
        Self {
            submitted: CachePadded::new(AtomicU64::new(0)),
            dropped: CachePadded::new(AtomicU64::new(0)),
            received: CachePadded::new(AtomicU64::new(0)),
            out_of_window: CachePadded::new(AtomicU64::new(0)),
            batches_sent: CachePadded::new(AtomicU64::new(0)),
            traces_sent: CachePadded::new(AtomicU64::new(0)),
            send_errors: CachePadded::new(AtomicU64::new(0)),
            encode_errors: CachePadded::new(AtomicU64::new(0)),
            panics: CachePadded::new(AtomicU64::new(0)),
            received_rate: config.meter_window.meter(Arc::clone(clock)),
            dropped_rate: config.meter_window.meter(Arc::clone(clock)),
        }
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn out_of_window(&self) -> u64 {
        self.out_of_window.load(Ordering::Relaxed)
    }

    pub fn batches_sent(&self) -> u64 {
        self.batches_sent.load(Ordering::Relaxed)
    }

    pub fn traces_sent(&self) -> u64 {
        self.traces_sent.load(Ordering::Relaxed)
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    pub fn encode_errors(&self) -> u64 {
        self.encode_errors.load(Ordering::Relaxed)
    }

    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    /// Traces received per second, moving average.
    pub fn received_rate(&self) -> f64 {
        self.received_rate.rate()
    }

    /// Traces dropped per second, moving average.
    pub fn dropped_rate(&self) -> f64 {
        self.dropped_rate.rate()
    }

    fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.dropped_rate.mark(1);
    }

    fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.received_rate.mark(1);
    }

    fn record_sent(&self, traces: u64) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.traces_sent.fetch_add(traces, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for CollectorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorMetrics")
            .field("submitted", &self.submitted())
            .field("dropped", &self.dropped())
            .field("received", &self.received())
            .field("out_of_window", &self.out_of_window())
            .field("batches_sent", &self.batches_sent())
            .field("send_errors", &self.send_errors())
            .field("encode_errors", &self.encode_errors())
            .field("panics", &self.panics())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

enum Message {
    Trace(Trace),
    Shutdown,
}

/// State shared by the collector, its producers and the worker.
struct Inner {
    queue: BoundedQueue<Message>,
    running: AtomicBool,
    metrics: CollectorMetrics,
}

impl Inner {
    fn submit(&self, trace: Trace) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }

        match self.queue.push(Message::Trace(trace)) {
            Ok(()) => {
                self.metrics.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.metrics.record_dropped();
                false
            }
        }
    }
}

/// Cloneable submission handle for producer threads.
#[derive(Clone)]
pub struct TraceProducer {
    inner: Arc<Inner>,
}

impl TraceProducer {
    /// Queues `trace` for the collector.
    ///
    /// Returns `false` if the collector is not running or the queue is full.
    pub fn submit(&self, trace: Trace) -> bool {
        self.inner.submit(trace)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TraceProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceProducer")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// WORKER
// =============================================================================

/// Signals the collector when the worker thread exits, panic or not.
struct DoneGuard(mpsc::Sender<()>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

enum Step {
    Continue,
    Exit,
}

/// Fires every `interval`, the first time one interval after the first
/// check.
#[derive(Debug)]
struct ReportSchedule {
    interval: u64,
    next: Option<Timestamp>,
}

impl ReportSchedule {
    fn new(interval: Duration) -> Self {
        Self {
            interval: nanos(interval).max(1),
            next: None,
        }
    }

    fn due(&mut self, now: Timestamp) -> bool {
        match self.next {
            Some(next) if now < next => false,
            armed => {
                self.next = Some(now.saturating_add(self.interval));
                armed.is_some()
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

/// Encodes cut windows and delivers them.
struct Shipper {
    inner: Arc<Inner>,
    transport: Arc<dyn TransportBoxed>,
    runtime: tokio::runtime::Runtime,
    protocol: Box<dyn BatchProtocol>,
    anchor: WallAnchor,
    send_timeout: Duration,
}

impl Shipper {
    /// Encodes and sends the window's sample, stamped with the wall-clock
    /// second its interval started. The window is emptied whether or not
    /// delivery succeeds.
    fn ship(&mut self, window: &mut IntervalWindow) {
        let timestamp = self.anchor.secs_at(window.from());
        let Some(batch) = window.take_batch(timestamp) else {
            return;
        };
        let metrics = &self.inner.metrics;

        let encoded = match self.protocol.encode(&batch) {
            Ok(encoded) => encoded,
            Err(e) => {
                metrics.encode_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, traces = batch.traces.len(), "dropping batch that failed to encode");
                return;
            }
        };

        let payload = Payload::new(encoded.bytes, encoded.content_type);
        let bytes = payload.len();
        let timeout = self.send_timeout;
        let send = self.transport.send_boxed(payload);

        let result = self.runtime.block_on(async {
            tokio::time::timeout(timeout, send)
                .await
                .unwrap_or(Err(TransportError::TimedOut(timeout)))
        });

        match result {
            Ok(()) => {
                self.protocol.acknowledge(&encoded.pending);
                metrics.record_sent(batch.traces.len() as u64);
                debug!(
                    traces = batch.traces.len(),
                    endpoints = batch.counts.len(),
                    bytes,
                    timestamp,
                    "batch sent"
                );
            }
            Err(e) => {
                metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                error!(
                    transport = self.transport.name(),
                    error = %e,
                    traces = batch.traces.len(),
                    "batch delivery failed"
                );
            }
        }
    }
}

struct Worker {
    inner: Arc<Inner>,
    cancel: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
    shipper: Shipper,
    layout: WindowLayout,
    /// Oldest open window; always directly followed by `next`
    current: IntervalWindow,
    next: IntervalWindow,
    report: ReportSchedule,
    poll_timeout: Duration,
}

impl Worker {
    fn run(mut self) {
        info!(
            transport = self.shipper.transport.name(),
            content_type = self.shipper.protocol.content_type(),
            window_from = self.current.from(),
            "collector started"
        );

        loop {
            if self.cancel.load(Ordering::Acquire) {
                warn!("collector cancelled");
                self.guarded(Self::drain);
                self.guarded(Self::flush_open);
                break;
            }

            match self.guarded(Self::iteration) {
                Some(Step::Continue) | None => {}
                Some(Step::Exit) => break,
            }
        }

        info!(
            received = self.inner.metrics.received(),
            batches_sent = self.inner.metrics.batches_sent(),
            "collector stopped"
        );
    }

    /// Runs `f`, logging and counting a panic instead of unwinding out of
    /// the worker.
    fn guarded<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> Option<R> {
        match panic::catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(r) => Some(r),
            Err(payload) => {
                self.inner.metrics.panics.fetch_add(1, Ordering::Relaxed);
                error!(panic = panic_message(payload.as_ref()), "collector iteration panicked");
                None
            }
        }
    }

    fn iteration(&mut self) -> Step {
        let msg = self.inner.queue.pop(Some(self.poll_timeout));

        if let Some(Message::Shutdown) = msg {
            self.flush_open();
            return Step::Exit;
        }

        let now = self.clock.now();
        self.roll(now);

        if let Some(Message::Trace(trace)) = msg {
            self.receive(trace);
        }

        if self.report.due(now) {
            self.report_rates();
        }

        Step::Continue
    }

    /// Ships every window whose flush time has passed and opens the ones
    /// that replace it.
    fn roll(&mut self, now: Timestamp) {
        while self.current.should_flush(now) {
            self.shipper.ship(&mut self.current);

            if self.next.is_empty() && self.next.should_flush(now) {
                // Idle for longer than a window: skip the empty ones
                self.current = self.layout.containing(now);
                self.next = self.current.following();
            } else {
                let following = self.next.following();
                self.current = std::mem::replace(&mut self.next, following);
            }
        }
    }

    fn receive(&mut self, trace: Trace) {
        self.inner.metrics.record_received();

        // No end time: kept so the encoder can reject it as a whole batch
        if trace.ended_at().is_none() || self.current.wants(&trace) {
            self.current.add(trace);
        } else if self.next.wants(&trace) {
            self.next.add(trace);
        } else {
            self.inner.metrics.out_of_window.fetch_add(1, Ordering::Relaxed);
            debug!(
                endpoint = %trace.endpoint,
                ended_at = trace.ended_at(),
                window_from = self.current.from(),
                window_to = self.next.to(),
                "dropping trace outside the open windows"
            );
        }
    }

    /// Moves traces still queued into the open windows, up to the shutdown
    /// sentinel if there is one.
    fn drain(&mut self) {
        self.roll(self.clock.now());

        let mut drained = 0u64;
        while let Some(Message::Trace(trace)) = self.inner.queue.try_pop() {
            self.receive(trace);
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "drained queued traces");
        }
    }

    fn flush_open(&mut self) {
        self.shipper.ship(&mut self.current);
        self.shipper.ship(&mut self.next);
    }

    fn report_rates(&self) {
        let metrics = &self.inner.metrics;
        info!(
            received_rate = metrics.received_rate(),
            dropped_rate = metrics.dropped_rate(),
            received = metrics.received(),
            dropped = metrics.dropped(),
            out_of_window = metrics.out_of_window(),
            "collector rates"
        );
    }
}

struct WorkerHandle {
    thread: JoinHandle<()>,
    done: mpsc::Receiver<()>,
    cancel: Arc<AtomicBool>,
}

// =============================================================================
// COLLECTOR
// =============================================================================

/// Samples, batches and ships traces on a background thread.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use trace_collector::{Collector, CollectorConfig, NullTransport, Span, Trace};
///
/// let mut collector = Collector::new(CollectorConfig::default(), Arc::new(NullTransport::new())).unwrap();
/// collector.start().unwrap();
///
/// let mut span = Span::new(0, "app.request");
/// span.ended_at = Some(1_000_000);
/// assert!(collector.submit(Trace::new("Users#index", vec![span])));
///
/// collector.shutdown();
/// assert!(!collector.is_running());
/// ```
pub struct Collector {
    config: CollectorConfig,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn TransportBoxed>,
    inner: Arc<Inner>,
    worker: Option<WorkerHandle>,
}

impl Collector {
    /// Creates a stopped collector on the monotonic clock.
    pub fn new(
        config: CollectorConfig,
        transport: Arc<dyn TransportBoxed>,
    ) -> Result<Self, CollectorError> {
        Self::with_clock(config, transport, Arc::new(MonotonicClock::new()))
    }

    /// Creates a stopped collector reading time from `clock`.
    pub fn with_clock(
        config: CollectorConfig,
        transport: Arc<dyn TransportBoxed>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CollectorError> {
        config.validate()?;

        let queue = BoundedQueue::new(config.queue_capacity)
            .map_err(|_| ConfigError::ZeroQueueCapacity)?;
        let inner = Arc::new(Inner {
            queue,
            running: AtomicBool::new(false),
            metrics: CollectorMetrics::new(&config, &clock),
        });

        Ok(Self {
            config,
            clock,
            transport,
            inner,
            worker: None,
        })
    }

    /// Starts the worker thread, stopping a running one first.
    ///
    /// String tables and the open windows start empty on every start.
    pub fn start(&mut self) -> Result<&mut Self, CollectorError> {
        if self.is_running() {
            self.shutdown();
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(CollectorError::Spawn)?;

        let layout = WindowLayout::new(
            nanos(self.config.flush_interval),
            nanos(self.config.flush_delay),
            self.config.sample_capacity,
        );
        let current = layout.containing(self.clock.now());
        let cancel = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            inner: Arc::clone(&self.inner),
            cancel: Arc::clone(&cancel),
            clock: Arc::clone(&self.clock),
            shipper: Shipper {
                inner: Arc::clone(&self.inner),
                transport: Arc::clone(&self.transport),
                runtime,
                protocol: self.config.protocol.build(),
                anchor: WallAnchor::capture(self.clock.as_ref()),
                send_timeout: self.config.send_timeout,
            },
            layout,
            next: current.following(),
            current,
            report: ReportSchedule::new(self.config.report_interval),
            poll_timeout: self.config.poll_timeout(),
        };

        let (done_tx, done_rx) = mpsc::channel();
        self.inner.running.store(true, Ordering::Release);

        let spawned = thread::Builder::new()
            .name("trace-collector".into())
            .spawn(move || {
                let _done = DoneGuard(done_tx);
                worker.run();
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                return Err(CollectorError::Spawn(e));
            }
        };

        self.worker = Some(WorkerHandle {
            thread,
            done: done_rx,
            cancel,
        });
        Ok(self)
    }

    /// Queues `trace` for the collector.
    ///
    /// Returns `false` if the collector is not running or the queue is full;
    /// a full queue drops the trace and counts it.
    pub fn submit(&self, trace: Trace) -> bool {
        self.inner.submit(trace)
    }

    /// A submission handle for other threads. Handles survive restarts.
    pub fn producer(&self) -> TraceProducer {
        TraceProducer {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn metrics(&self) -> &CollectorMetrics {
        &self.inner.metrics
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// The clock trace timestamps must be taken from.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Stops the worker after a final flush of both open windows.
    ///
    /// Waits up to `shutdown_timeout`; returns `false` if the worker had to
    /// be detached instead, in which case traces still queued are
    /// discarded. No-op returning `true` when not running.
    pub fn shutdown(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return true;
        };

        self.inner.running.store(false, Ordering::Release);

        if self.inner.queue.push(Message::Shutdown).is_err() {
            warn!("queue full at shutdown, cancelling collector");
            worker.cancel.store(true, Ordering::Release);
        }

        let clean = match worker.done.recv_timeout(self.config.shutdown_timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if worker.thread.join().is_err() {
                    error!("collector thread panicked");
                }
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                worker.cancel.store(true, Ordering::Release);
                warn!(
                    timeout = ?self.config.shutdown_timeout,
                    "collector did not stop in time, detaching"
                );
                false
            }
        };

        let discarded = self.inner.queue.clear();
        if discarded > 0 {
            debug!(discarded, "discarded pending traces");
        }
        clean
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("config", &self.config)
            .field("transport", &self.transport.name())
            .field("running", &self.is_running())
            .field("metrics", &self.inner.metrics)
            .finish_non_exhaustive()
    }
}
