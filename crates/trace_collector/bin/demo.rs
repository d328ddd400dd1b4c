//! # Trace Collector Demo
//!
//! Simulates a multi-threaded web application: each producer thread handles
//! fake requests, builds a trace per request with [`SpanTree`] and submits it.
//! The collector samples each interval and ships batches to a log or file
//! transport.
//!
//! ## Running
//!
//! ```bash
//! # Log batch summaries (RUST_LOG controls verbosity)
//! RUST_LOG=info cargo run -p trace_collector --bin demo --release
//!
//! # Write JSON batches to a directory, retrying failed writes
//! cargo run -p trace_collector --bin demo -- --protocol json --out-dir /tmp/batches --retries 3
//!
//! # Load collector settings from a JSON file
//! cargo run -p trace_collector --bin demo -- --config collector.json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use trace_collector::{
    AnnotationValue, Annotations, Clock, Collector, CollectorConfig, FileTransport, LogTransport,
    MonotonicClock, ProtocolKind, RetryConfig, RetryingTransport, SpanTree, TraceProducer,
    TransportBoxed,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Protocol {
    Binary,
    Json,
}

impl From<Protocol> for ProtocolKind {
    fn from(p: Protocol) -> Self {
        match p {
            Protocol::Binary => ProtocolKind::Binary,
            Protocol::Json => ProtocolKind::Json,
        }
    }
}

#[derive(Debug, Parser)]
#[command(about = "Generate synthetic request traces and run them through the collector")]
struct Args {
    /// Producer threads
    #[arg(long, default_value_t = 4)]
    producers: usize,

    /// Requests simulated per producer
    #[arg(long, default_value_t = 500)]
    requests: usize,

    /// Batch encoding
    #[arg(long, value_enum, default_value_t = Protocol::Binary)]
    protocol: Protocol,

    /// Write batches into this directory instead of logging them
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Retry failed sends this many times
    #[arg(long, default_value_t = 0)]
    retries: u32,

    /// JSON collector configuration; flags override its protocol
    #[arg(long)]
    config: Option<PathBuf>,

    /// Flush interval in milliseconds
    #[arg(long)]
    flush_ms: Option<u64>,

    /// Log payload bodies at debug level
    #[arg(long)]
    verbose: bool,
}

const ENDPOINTS: &[&str] = &["Users#index", "Users#show", "Posts#index", "Posts#create"];
const QUERIES: &[&str] = &[
    "SELECT * FROM users WHERE id = ?",
    "SELECT * FROM posts ORDER BY created_at DESC LIMIT ?",
    "INSERT INTO posts (title, body) VALUES (?, ?)",
    "UPDATE users SET last_seen_at = ? WHERE id = ?",
];

fn load_config(args: &Args) -> Result<CollectorConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => CollectorConfig::low_latency(),
    };

    config = config.with_protocol(args.protocol.into());
    if let Some(ms) = args.flush_ms {
        config = config.with_flush_interval(Duration::from_millis(ms));
    }
    config.validate()?;
    Ok(config)
}

fn build_transport(args: &Args, config: &CollectorConfig) -> Result<Arc<dyn TransportBoxed>> {
    // Give up before the collector's own send timeout cuts the sequence off
    let retry = RetryConfig::default()
        .with_max_retries(args.retries)
        .with_max_elapsed(config.send_timeout);

    let transport: Arc<dyn TransportBoxed> = match &args.out_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
            let file = FileTransport::new(dir);
            if args.retries > 0 {
                Arc::new(RetryingTransport::new(file, retry))
            } else {
                Arc::new(file)
            }
        }
        None => {
            let log = LogTransport::new(args.verbose);
            if args.retries > 0 {
                Arc::new(RetryingTransport::new(log, retry))
            } else {
                Arc::new(log)
            }
        }
    };
    Ok(transport)
}

/// Simulates one request, returning its closed span tree.
fn simulate_request(clock: &dyn Clock, rng: &mut impl Rng) -> SpanTree {
    let endpoint = ENDPOINTS.choose(rng).copied().unwrap_or("Unknown#index");
    let mut tree = SpanTree::new("Unknown#route");
    let mut annotations = Annotations::new();
    annotations.insert("method".into(), AnnotationValue::String("GET".into()));

    tree.start(clock.now(), "app.request", None, None, annotations);

    for _ in 0..rng.gen_range(1..=4) {
        let sql = QUERIES.choose(rng).copied().unwrap_or("SELECT 1");
        tree.start(clock.now(), "db.sql.query", None, Some(sql.to_owned()), Annotations::new());
        thread::sleep(Duration::from_micros(rng.gen_range(50..400)));
        // Balanced by construction
        let _ = tree.stop(clock.now());
    }

    if rng.gen_bool(0.3) {
        let _ = tree.record(clock.now(), "cache.miss", None, Some("users".into()), Annotations::new());
    }

    // Routing resolves the endpoint after the root span started
    tree.set_endpoint(endpoint);
    let _ = tree.stop(clock.now());
    tree
}

fn run_producer(producer: TraceProducer, clock: Arc<MonotonicClock>, requests: usize) -> (usize, usize) {
    let mut rng = rand::thread_rng();
    let mut accepted = 0;
    let mut rejected = 0;

    for _ in 0..requests {
        let Ok(trace) = simulate_request(clock.as_ref(), &mut rng).build() else {
            continue;
        };
        if producer.submit(trace) {
            accepted += 1;
        } else {
            rejected += 1;
        }
    }
    (accepted, rejected)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let transport = build_transport(&args, &config)?;
    let clock = Arc::new(MonotonicClock::new());

    info!(?config, transport = transport.name(), "starting demo");

    let mut collector = Collector::with_clock(config, transport, clock.clone())?;
    collector.start()?;

    let started = Instant::now();
    let handles: Vec<_> = (0..args.producers)
        .map(|_| {
            let producer = collector.producer();
            let clock = Arc::clone(&clock);
            let requests = args.requests;
            thread::spawn(move || run_producer(producer, clock, requests))
        })
        .collect();

    let (mut accepted, mut rejected) = (0, 0);
    for handle in handles {
        let (a, r) = handle
            .join()
            .map_err(|_| anyhow::anyhow!("producer thread panicked"))?;
        accepted += a;
        rejected += r;
    }
    let elapsed = started.elapsed();

    let clean = collector.shutdown();
    let metrics = collector.metrics();

    info!(
        accepted,
        rejected,
        elapsed = ?elapsed,
        received = metrics.received(),
        dropped = metrics.dropped(),
        out_of_window = metrics.out_of_window(),
        batches_sent = metrics.batches_sent(),
        traces_sent = metrics.traces_sent(),
        send_errors = metrics.send_errors(),
        received_rate = metrics.received_rate(),
        clean_shutdown = clean,
        "demo finished"
    );
    Ok(())
}
