//! Binary trace batch decoder.
//!
//! The inverse of [`BatchEncoder`](super::BatchEncoder), for receivers and
//! tests. Tables in the trailer are parsed and re-digested so segments can
//! be resolved back to strings.

use super::encoder::TRACE_BATCH;
use super::string_table::{digest_of, Digest, UNKNOWN_STRING};
use super::varint::Reader;
use crate::span::TraceId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input at byte {offset}")]
    UnexpectedEof { offset: usize },

    #[error("varint at byte {offset} overflows u64")]
    VarintOverflow { offset: usize },

    #[error("invalid UTF-8 string at byte {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("unknown message kind {0:#04x}")]
    UnknownMessageKind(u8),

    #[error("span parent at byte {offset} is out of range")]
    InvalidParent { offset: usize },

    #[error("{count} trailing bytes after batch")]
    TrailingBytes { count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSpan {
    pub string_ref: u8,
    pub parent: Option<usize>,
    pub start_offset_us: u64,
    pub duration_us: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTrace {
    pub ident: TraceId,
    pub start_offset_us: u64,
    pub spans: Vec<DecodedSpan>,
}

/// One endpoint's section of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSegment {
    pub digest: Digest,
    /// Traces seen during the interval
    pub observed: u64,
    pub traces: Vec<DecodedTrace>,
}

/// A string table carried in the trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTable {
    pub digest: Digest,
    pub endpoint: String,
    pub tuples: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBatch {
    pub timestamp: u64,
    pub segments: Vec<DecodedSegment>,
    pub tables: Vec<DecodedTable>,
}

impl DecodedBatch {
    /// Trailer table with `digest`, if the batch carried it.
    pub fn table(&self, digest: &Digest) -> Option<&DecodedTable> {
        self.tables.iter().find(|t| &t.digest == digest)
    }

    /// Resolves a span's `(category, description)` through the segment's
    /// table. `None` for the unknown sentinel or a table not in this batch.
    pub fn resolve(&self, segment: &DecodedSegment, span: &DecodedSpan) -> Option<(&str, &str)> {
        if span.string_ref == UNKNOWN_STRING {
            return None;
        }
        let (category, description) = self
            .table(&segment.digest)?
            .tuples
            .get(usize::from(span.string_ref))?;
        Some((category.as_str(), description.as_str()))
    }
}

/// Parses a complete binary batch.
pub fn decode(bytes: &[u8]) -> Result<DecodedBatch, DecodeError> {
    let mut reader = Reader::new(bytes);

    let kind = reader.read_u8()?;
    if kind != TRACE_BATCH {
        return Err(DecodeError::UnknownMessageKind(kind));
    }

    let segment_count = reader.read_len()?;
    let timestamp = reader.read_varint()?;

    let mut segments = Vec::with_capacity(segment_count.min(1024));
    for _ in 0..segment_count {
        segments.push(decode_segment(&mut reader)?);
    }

    let table_count = reader.read_len()?;
    let mut tables = Vec::with_capacity(table_count.min(1024));
    for _ in 0..table_count {
        let raw = reader.read_prefixed()?;
        tables.push(decode_table(raw)?);
    }

    if !reader.is_empty() {
        return Err(DecodeError::TrailingBytes {
            count: bytes.len() - reader.position(),
        });
    }

    Ok(DecodedBatch {
        timestamp,
        segments,
        tables,
    })
}

fn decode_segment(reader: &mut Reader<'_>) -> Result<DecodedSegment, DecodeError> {
    let digest = reader.read_array::<16>()?;
    let observed = reader.read_varint()?;
    let sampled = reader.read_len()?;

    let mut traces = Vec::with_capacity(sampled.min(1024));
    for _ in 0..sampled {
        traces.push(decode_trace(reader)?);
    }

    Ok(DecodedSegment {
        digest,
        observed,
        traces,
    })
}

fn decode_trace(reader: &mut Reader<'_>) -> Result<DecodedTrace, DecodeError> {
    let ident = reader.read_array::<16>()?;
    let start_offset_us = reader.read_varint()?;
    let span_count = reader.read_len()?;

    let mut spans = Vec::with_capacity(span_count.min(1024));
    for _ in 0..span_count {
        let string_ref = reader.read_u8()?;

        let offset = reader.position();
        let parent = match reader.read_varint()? {
            0 => None,
            n => {
                let index = usize::try_from(n - 1)
                    .ok()
                    .filter(|&i| i < span_count)
                    .ok_or(DecodeError::InvalidParent { offset })?;
                Some(index)
            }
        };

        spans.push(DecodedSpan {
            string_ref,
            parent,
            start_offset_us: reader.read_varint()?,
            duration_us: reader.read_varint()?,
        });
    }

    Ok(DecodedTrace {
        ident,
        start_offset_us,
        spans,
    })
}

fn decode_table(raw: &[u8]) -> Result<DecodedTable, DecodeError> {
    let mut reader = Reader::new(raw);
    let endpoint = reader.read_string()?;
    let count = reader.read_len()?;

    let mut tuples = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let category = reader.read_string()?;
        let description = reader.read_string()?;
        tuples.push((category, description));
    }

    Ok(DecodedTable {
        digest: digest_of(raw),
        endpoint,
        tuples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::varint::append_varint;

    #[test]
    fn test_unknown_kind() {
        assert_eq!(
            decode(&[0x07, 0, 0, 0]).unwrap_err(),
            DecodeError::UnknownMessageKind(0x07)
        );
    }

    #[test]
    fn test_empty_batch() {
        let mut buf = vec![TRACE_BATCH, 0];
        append_varint(&mut buf, 1_700_000_000);
        buf.push(0);

        let batch = decode(&buf).unwrap();
        assert_eq!(batch.timestamp, 1_700_000_000);
        assert!(batch.segments.is_empty());
        assert!(batch.tables.is_empty());
    }

    #[test]
    fn test_trailing_bytes() {
        let buf = [TRACE_BATCH, 0, 0, 0, 0xAA, 0xBB];
        assert_eq!(
            decode(&buf).unwrap_err(),
            DecodeError::TrailingBytes { count: 2 }
        );
    }

    #[test]
    fn test_truncated() {
        let buf = [TRACE_BATCH, 1, 0, 0xAB];
        assert!(matches!(
            decode(&buf),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_parent_out_of_range() {
        let mut buf = vec![TRACE_BATCH, 1, 0];
        buf.extend_from_slice(&[0; 16]); // digest
        buf.extend_from_slice(&[1, 1]); // observed, sampled
        buf.extend_from_slice(&[0; 16]); // ident
        buf.extend_from_slice(&[0, 1]); // offset, one span
        buf.extend_from_slice(&[0, 2, 0, 0]); // parent index 1 of 1 span

        assert!(matches!(
            decode(&buf),
            Err(DecodeError::InvalidParent { .. })
        ));
    }
}
