//! Binary trace batch encoder.
//!
//! Layout (integers other than digests and idents are varints):
//!
//! ```text
//! batch   := kind:u8(0x00) segment_count timestamp_secs segment* trailer
//! segment := digest[16] observed sampled trace*
//! trace   := ident[16] start_offset_us span_count span*
//! span    := string_ref:u8 parent start_offset_us duration_us
//! trailer := table_count (len table_bytes)*
//! ```
//!
//! `parent` is `0` for a root span and `i + 1` for the span at index `i`.
//! Trace offsets are relative to the earliest trace in the batch, span offsets
//! to the start of their trace.

use super::string_table::{Digest, StringTable, UNKNOWN_STRING};
use super::varint::{append_bytes, append_varint};
use super::{BatchProtocol, EncodedBatch};
use crate::batch::Batch;
use crate::span::{Timestamp, Trace};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Message kind byte of a trace batch.
pub const TRACE_BATCH: u8 = 0x00;

/// Content type of the binary format.
pub const CONTENT_TYPE: &str = "application/x-trace-batch";

/// Spans allowed in one trace.
pub const MAX_SPANS_PER_TRACE: usize = u16::MAX as usize;

/// Reasons a batch cannot be encoded. Fatal to that batch only.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("span {index} of a {endpoint} trace was never closed")]
    OpenSpan { endpoint: String, index: usize },

    #[error("span {index} of a {endpoint} trace ends before it starts")]
    NegativeDuration { endpoint: String, index: usize },

    #[error("{endpoint} trace has {count} spans, over the per-trace limit")]
    TooManySpans { endpoint: String, count: usize },

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Checks that every span is closed with a non-negative duration.
pub fn validate_trace(trace: &Trace) -> Result<(), EncodeError> {
    if trace.spans.len() > MAX_SPANS_PER_TRACE {
        return Err(EncodeError::TooManySpans {
            endpoint: trace.endpoint.clone(),
            count: trace.spans.len(),
        });
    }

    for (index, span) in trace.spans.iter().enumerate() {
        match span.ended_at {
            None => {
                return Err(EncodeError::OpenSpan {
                    endpoint: trace.endpoint.clone(),
                    index,
                })
            }
            Some(ended_at) if ended_at < span.started_at => {
                return Err(EncodeError::NegativeDuration {
                    endpoint: trace.endpoint.clone(),
                    index,
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Nanoseconds to whole microseconds.
fn micros(nanos: u64) -> u64 {
    nanos / 1_000
}

/// Encodes batches, keeping one [`StringTable`] per endpoint across batches.
///
/// A table's bytes are appended to every batch until the transport confirms
/// delivery through [`acknowledge`](Self::acknowledge). Each table remembers
/// only its latest acknowledged digest.
#[derive(Debug, Default)]
pub struct BatchEncoder {
    tables: HashMap<String, StringTable>,
}

impl BatchEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table for `endpoint`, if one has been created.
    pub fn table(&self, endpoint: &str) -> Option<&StringTable> {
        self.tables.get(endpoint)
    }

    /// Marks tables as delivered so later batches omit them.
    ///
    /// Digests that no longer match their table's current form are ignored:
    /// the table has grown since and must be sent again anyway.
    pub fn acknowledge(&mut self, digests: &[Digest]) {
        for table in self.tables.values_mut() {
            if let Some(digest) = table.digest().filter(|d| digests.contains(d)) {
                table.acknowledge(digest);
            }
        }
    }

    /// Whether some table's current form is acknowledged as `digest`.
    pub fn is_acknowledged(&self, digest: &Digest) -> bool {
        self.tables
            .values()
            .any(|t| t.is_acknowledged() && t.digest().as_ref() == Some(digest))
    }

    /// Drops all tables and acknowledgements.
    pub fn reset(&mut self) {
        self.tables.clear();
    }

    /// Serializes `batch`.
    ///
    /// The returned [`EncodedBatch::pending`] lists the digests of the tables
    /// carried in the trailer.
    pub fn encode(&mut self, batch: &Batch) -> Result<EncodedBatch, EncodeError> {
        for trace in &batch.traces {
            validate_trace(trace)?;
        }

        let grouped = batch.by_endpoint();
        let base = batch.started_at().unwrap_or(0);

        let mut buf = Vec::with_capacity(64 + batch.span_count() * 8);
        buf.push(TRACE_BATCH);
        append_varint(&mut buf, grouped.len() as u64);
        append_varint(&mut buf, batch.timestamp);

        let mut unacknowledged = Vec::new();

        for (endpoint, traces) in &grouped {
            let table = self
                .tables
                .entry((*endpoint).to_owned())
                .or_insert_with(|| StringTable::new(*endpoint));

            for trace in traces {
                for span in &trace.spans {
                    let (category, description) = span.key();
                    table.push(category, description);
                }
            }
            let digest = table.generate();

            buf.extend_from_slice(&digest);
            append_varint(&mut buf, batch.observed(endpoint, traces.len()));
            append_varint(&mut buf, traces.len() as u64);

            for trace in traces {
                encode_trace(&mut buf, table, trace, base);
            }

            if !table.is_acknowledged() {
                unacknowledged.push(digest);
            }
        }

        // Trailer
        append_varint(&mut buf, unacknowledged.len() as u64);
        for endpoint in grouped.keys() {
            let Some(table) = self.tables.get(*endpoint) else {
                continue;
            };
            if let (Some(digest), Some(bytes)) = (table.digest(), table.bytes()) {
                if unacknowledged.contains(&digest) {
                    append_bytes(&mut buf, bytes);
                }
            }
        }

        debug!(
            endpoints = grouped.len(),
            traces = batch.traces.len(),
            tables = unacknowledged.len(),
            bytes = buf.len(),
            "encoded trace batch"
        );

        Ok(EncodedBatch {
            bytes: buf,
            content_type: CONTENT_TYPE,
            pending: unacknowledged,
        })
    }
}

fn encode_trace(buf: &mut Vec<u8>, table: &StringTable, trace: &Trace, base: Timestamp) {
    let start = trace.started_at().unwrap_or(base);

    buf.extend_from_slice(&trace.ident);
    append_varint(buf, micros(start.saturating_sub(base)));
    append_varint(buf, trace.spans.len() as u64);

    for span in &trace.spans {
        buf.push(table.index_of(span.key()).unwrap_or(UNKNOWN_STRING));
        append_varint(buf, span.parent.map_or(0, |p| p as u64 + 1));
        append_varint(buf, micros(span.started_at.saturating_sub(start)));
        append_varint(buf, micros(span.duration().unwrap_or(0)));
    }
}

impl BatchProtocol for BatchEncoder {
    fn content_type(&self) -> &'static str {
        CONTENT_TYPE
    }

    fn encode(&mut self, batch: &Batch) -> Result<EncodedBatch, EncodeError> {
        BatchEncoder::encode(self, batch)
    }

    fn acknowledge(&mut self, digests: &[Digest]) {
        BatchEncoder::acknowledge(self, digests);
    }

    fn reset(&mut self) {
        BatchEncoder::reset(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Span;
    use crate::wire::string_table::MAX_TUPLES;

    fn closed(start: Timestamp, end: Timestamp, category: &str) -> Span {
        let mut span = Span::new(start, category);
        span.ended_at = Some(end);
        span
    }

    fn batch(traces: Vec<Trace>) -> Batch {
        let mut batch = Batch {
            timestamp: 1_700_000_000,
            ..Batch::default()
        };
        for trace in &traces {
            *batch.counts.entry(trace.endpoint.clone()).or_insert(0) += 1;
        }
        batch.traces = traces;
        batch
    }

    #[test]
    fn test_header_layout() {
        let trace = Trace::with_ident("e", [1; 16], vec![closed(0, 2_000, "app")]);
        let encoded = BatchEncoder::new().encode(&batch(vec![trace])).unwrap();

        let mut expected = vec![TRACE_BATCH, 1];
        append_varint(&mut expected, 1_700_000_000);
        assert_eq!(&encoded.bytes[..expected.len()], &expected[..]);
        assert_eq!(encoded.content_type, CONTENT_TYPE);
        assert_eq!(encoded.pending.len(), 1);
    }

    #[test]
    fn test_span_fields() {
        let mut child = closed(1_500_000, 1_700_000, "db.query");
        child.parent = Some(1);
        let root = closed(1_000_000, 3_000_000, "app.request");
        let trace = Trace::with_ident("e", [9; 16], vec![child, root]);

        let mut encoder = BatchEncoder::new();
        let encoded = encoder.encode(&batch(vec![trace])).unwrap();
        let table = encoder.table("e").unwrap();
        assert_eq!(table.index_of(("app.request", "")), Some(0));
        assert_eq!(table.index_of(("db.query", "")), Some(1));

        // kind, segments, timestamp(5 bytes), digest, observed, sampled
        let mut offset = 1 + 1 + 5 + 16 + 1 + 1;
        assert_eq!(&encoded.bytes[offset..offset + 16], &[9; 16]);
        offset += 16;

        // Only trace in the batch: offset 0, two spans
        assert_eq!(&encoded.bytes[offset..offset + 2], &[0, 2]);
        offset += 2;

        // child: ref 1, parent 1 + 1, +500us, 200us
        assert_eq!(
            &encoded.bytes[offset..offset + 6],
            &[1, 2, 0xF4, 0x03, 0xC8, 0x01]
        );
        offset += 6;

        // root: ref 0, no parent, +0us, 2000us
        assert_eq!(&encoded.bytes[offset..offset + 5], &[0, 0, 0, 0xD0, 0x0F]);
    }

    #[test]
    fn test_open_span_rejected() {
        let open = Span::new(0, "app");
        let trace = Trace::new("Users#index", vec![open]);

        let err = BatchEncoder::new().encode(&batch(vec![trace])).unwrap_err();
        assert!(matches!(err, EncodeError::OpenSpan { index: 0, .. }));
    }

    #[test]
    fn test_negative_duration_rejected() {
        let trace = Trace::new("e", vec![closed(0, 1, "ok"), closed(10, 5, "bad")]);

        let err = BatchEncoder::new().encode(&batch(vec![trace])).unwrap_err();
        assert!(matches!(err, EncodeError::NegativeDuration { index: 1, .. }));
    }

    #[test]
    fn test_failed_encode_leaves_tables_untouched() {
        let good = Trace::new("e", vec![closed(0, 1, "ok")]);
        let bad = Trace::new("e", vec![Span::new(0, "open")]);

        let mut encoder = BatchEncoder::new();
        assert!(encoder.encode(&batch(vec![good, bad])).is_err());
        assert!(encoder.table("e").is_none());
    }

    #[test]
    fn test_acknowledged_tables_omitted() {
        let mut encoder = BatchEncoder::new();
        let trace = || Trace::new("e", vec![closed(0, 1, "app")]);

        let first = encoder.encode(&batch(vec![trace()])).unwrap();
        assert_eq!(first.pending.len(), 1);

        // Not acknowledged yet: table sent again
        let second = encoder.encode(&batch(vec![trace()])).unwrap();
        assert_eq!(second.pending, first.pending);
        assert_eq!(second.bytes.len(), first.bytes.len());

        encoder.acknowledge(&second.pending);
        let third = encoder.encode(&batch(vec![trace()])).unwrap();
        assert!(third.pending.is_empty());
        assert_eq!(*third.bytes.last().unwrap(), 0);
        assert!(third.bytes.len() < second.bytes.len());
    }

    #[test]
    fn test_acknowledgement_replaced_per_table() {
        let mut encoder = BatchEncoder::new();
        let mut digests = Vec::new();

        for i in 0..5 {
            let trace = Trace::new("e", vec![closed(0, 1, &format!("cat{}", i))]);
            let encoded = encoder.encode(&batch(vec![trace])).unwrap();
            assert_eq!(encoded.pending.len(), 1);
            encoder.acknowledge(&encoded.pending);
            digests.push(encoded.pending[0]);
        }

        // Only the latest form of the table counts as acknowledged
        assert!(encoder.is_acknowledged(&digests[4]));
        assert!(digests[..4].iter().all(|d| !encoder.is_acknowledged(d)));
        assert_eq!(encoder.table("e").unwrap().acknowledged(), Some(digests[4]));

        // A stale digest does not mark the current form as delivered
        let trace = Trace::new("e", vec![closed(0, 1, "fresh")]);
        let encoded = encoder.encode(&batch(vec![trace])).unwrap();
        encoder.acknowledge(&digests[..1]);
        assert!(!encoder.is_acknowledged(&encoded.pending[0]));
    }

    #[test]
    fn test_overflowing_table_writes_unknown_refs() {
        let spans: Vec<Span> = (0..MAX_TUPLES + 11)
            .map(|i| closed(0, 1, &format!("cat{:03}", i)))
            .collect();
        let trace = Trace::new("e", spans);

        let mut encoder = BatchEncoder::new();
        let encoded = encoder.encode(&batch(vec![trace])).unwrap();
        assert_eq!(encoder.table("e").unwrap().len(), MAX_TUPLES);

        let decoded = crate::wire::decode(&encoded.bytes).unwrap();
        let segment = &decoded.segments[0];
        let unknown = segment.traces[0]
            .spans
            .iter()
            .filter(|s| s.string_ref == UNKNOWN_STRING)
            .count();
        assert_eq!(unknown, 11);
    }

    #[test]
    fn test_new_tuple_requires_new_table() {
        let mut encoder = BatchEncoder::new();
        let first = encoder
            .encode(&batch(vec![Trace::new("e", vec![closed(0, 1, "a")])]))
            .unwrap();
        encoder.acknowledge(&first.pending);

        let second = encoder
            .encode(&batch(vec![Trace::new("e", vec![closed(0, 1, "b")])]))
            .unwrap();
        assert_eq!(second.pending.len(), 1);
        assert_ne!(second.pending, first.pending);
    }
}
