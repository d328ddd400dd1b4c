//! Batch wire formats.
//!
//! Two encodings implement [`BatchProtocol`]: the compact binary format of
//! [`BatchEncoder`] with per-endpoint string tables, and [`JsonProtocol`].

mod decoder;
mod encoder;
mod json;
mod string_table;
mod varint;

pub use decoder::{
    decode, DecodeError, DecodedBatch, DecodedSegment, DecodedSpan, DecodedTable, DecodedTrace,
};
pub use encoder::{
    validate_trace, BatchEncoder, EncodeError, CONTENT_TYPE as BINARY_CONTENT_TYPE,
    MAX_SPANS_PER_TRACE, TRACE_BATCH,
};
pub use json::{JsonProtocol, CONTENT_TYPE as JSON_CONTENT_TYPE};
pub use string_table::{digest_of, Digest, StringTable, MAX_TUPLES, UNKNOWN_STRING};
pub use varint::{append_bytes, append_string, append_varint, Reader};

use crate::batch::Batch;

/// An encoded batch and the string tables it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBatch {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    /// Digests of the tables in the trailer, to acknowledge after delivery
    pub pending: Vec<Digest>,
}

/// A batch serialization format.
pub trait BatchProtocol: Send {
    fn content_type(&self) -> &'static str;

    fn encode(&mut self, batch: &Batch) -> Result<EncodedBatch, EncodeError>;

    /// Records that the tables with `digests` reached the receiver.
    fn acknowledge(&mut self, _digests: &[Digest]) {}

    /// Forgets all per-connection state.
    fn reset(&mut self) {}
}
