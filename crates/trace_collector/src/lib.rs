//! In-process Trace Collector
//!
//! Application threads build traces (a timed tree of spans per request) and
//! hand them to a [`Collector`]. A background thread keeps a fixed-size
//! uniform sample of each flush interval together with exact per-endpoint
//! counts, encodes the sample and passes it to a [`Transport`].
//!
//! # Key Features
//!
//! - Producers never block: the hand-off queue drops the newest trace when full
//! - Traces are batched by the interval they ended in, with a grace delay
//!   for stragglers
//! - Reservoir sampling bounds memory per interval regardless of load
//! - Compact binary wire format with per-endpoint string tables that are sent
//!   once and omitted after the receiver acknowledges them
//! - JSON wire format for debugging
//! - Native async transports, with a retrying decorator
//! - EWMA rate meters for received and dropped traces
//!
//! # Example
//!
//! ```
//! use trace_collector::{Annotations, SpanTree};
//!
//! let mut tree = SpanTree::new("Users#index");
//! tree.start(0, "app.request", None, None, Annotations::new());
//! tree.record(100, "cache.hit", None, Some("users".into()), Annotations::new())
//!     .unwrap();
//! tree.stop(1_000).unwrap();
//!
//! let trace = tree.build().unwrap();
//! assert_eq!(trace.spans.len(), 2);
//! assert_eq!(trace.spans[0].parent, Some(1));
//! ```

pub mod batch;
pub mod clock;
pub mod collector;
pub mod config;
pub mod ewma;
pub mod meter;
pub mod retry;
pub mod sampler;
pub mod span;
pub mod span_tree;
pub mod transport;
pub mod wire;

// Re-export main types
pub use batch::{Batch, BatchMetrics, BatchProcessor, IntervalWindow, WindowLayout};
pub use clock::{Clock, ManualClock, MonotonicClock, WallAnchor};
pub use collector::{Collector, CollectorError, CollectorMetrics, TraceProducer};
pub use config::{CollectorConfig, ConfigError, MeterWindow, ProtocolKind};
pub use ewma::Ewma;
pub use meter::Meter;
pub use retry::{RetryConfig, RetryingTransport};
pub use sampler::{Draw, ReservoirSampler};
pub use span::{generate_ident, AnnotationValue, Annotations, Span, Timestamp, Trace, TraceId};
pub use span_tree::{SpanTree, TraceError};
pub use transport::{
    FileTransport, LogTransport, NullTransport, Payload, Transport, TransportBoxed, TransportError,
};
pub use wire::{BatchEncoder, BatchProtocol, EncodedBatch, JsonProtocol};
