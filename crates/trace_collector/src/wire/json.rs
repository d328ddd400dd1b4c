//! Human-readable JSON batch encoding.
//!
//! ```text
//! {"batch": {"timestamp": secs, "endpoints": [
//!   {"name": "...", "count": observed, "traces": [
//!     {"uuid": "<32 hex chars>", "spans": [
//!       [parent|null, start_offset_us, duration_us, category, title, description, annotations]
//!     ]}
//!   ]}
//! ]}}
//! ```
//!
//! Carries no string tables, so acknowledgements are a no-op.

use super::encoder::{validate_trace, EncodeError};
use super::{BatchProtocol, EncodedBatch};
use crate::batch::Batch;
use crate::span::{Annotations, Trace, TraceId};
use serde::Serialize;
use std::fmt::Write as _;

pub const CONTENT_TYPE: &str = "application/json";

#[derive(Serialize)]
struct Envelope<'a> {
    batch: JsonBatch<'a>,
}

#[derive(Serialize)]
struct JsonBatch<'a> {
    timestamp: u64,
    endpoints: Vec<JsonEndpoint<'a>>,
}

#[derive(Serialize)]
struct JsonEndpoint<'a> {
    name: &'a str,
    count: u64,
    traces: Vec<JsonTrace<'a>>,
}

#[derive(Serialize)]
struct JsonTrace<'a> {
    uuid: String,
    spans: Vec<JsonSpan<'a>>,
}

/// Serialized as a positional array.
type JsonSpan<'a> = (
    Option<usize>,
    u64,
    u64,
    &'a str,
    Option<&'a str>,
    Option<&'a str>,
    &'a Annotations,
);

fn hex(ident: &TraceId) -> String {
    let mut out = String::with_capacity(32);
    for byte in ident {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

fn json_trace(trace: &Trace) -> JsonTrace<'_> {
    let start = trace.started_at().unwrap_or(0);
    let spans = trace
        .spans
        .iter()
        .map(|span| {
            (
                span.parent,
                span.started_at.saturating_sub(start) / 1_000,
                span.duration().unwrap_or(0) / 1_000,
                span.category.as_str(),
                span.title.as_deref(),
                span.description.as_deref(),
                &span.annotations,
            )
        })
        .collect();

    JsonTrace {
        uuid: hex(&trace.ident),
        spans,
    }
}

/// Encodes batches as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonProtocol;

impl JsonProtocol {
    pub fn new() -> Self {
        Self
    }

    pub fn encode(&self, batch: &Batch) -> Result<EncodedBatch, EncodeError> {
        for trace in &batch.traces {
            validate_trace(trace)?;
        }

        let endpoints = batch
            .by_endpoint()
            .into_iter()
            .map(|(name, traces)| JsonEndpoint {
                name,
                count: batch.observed(name, traces.len()),
                traces: traces.into_iter().map(json_trace).collect(),
            })
            .collect();

        let envelope = Envelope {
            batch: JsonBatch {
                timestamp: batch.timestamp,
                endpoints,
            },
        };

        Ok(EncodedBatch {
            bytes: serde_json::to_vec(&envelope)?,
            content_type: CONTENT_TYPE,
            pending: Vec::new(),
        })
    }
}

impl BatchProtocol for JsonProtocol {
    fn content_type(&self) -> &'static str {
        CONTENT_TYPE
    }

    fn encode(&mut self, batch: &Batch) -> Result<EncodedBatch, EncodeError> {
        JsonProtocol::encode(self, batch)
    }
}
