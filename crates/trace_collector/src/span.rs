use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Monotonic time in nanoseconds, as produced by a [`Clock`](crate::Clock).
pub type Timestamp = u64;

/// 128-bit trace identifier.
pub type TraceId = [u8; 16];

/// Span annotations. Carried through the pipeline untouched.
pub type Annotations = BTreeMap<String, AnnotationValue>;

/// Annotation value types for span metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnnotationValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<String>),
}

/// String-interning key of a span: `(category, description)`.
///
/// A missing description interns as the empty string.
pub type SpanKey<'a> = (&'a str, &'a str);

/// One timed, named unit of work within a trace.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    /// Index of the parent span within [`Trace::spans`], `None` for a root
    pub parent: Option<usize>,
    /// Span category, e.g. `db.sql.query`
    pub category: String,
    /// Short human-readable title
    pub title: Option<String>,
    /// Longer description (SQL text, template name, ...)
    pub description: Option<String>,
    pub annotations: Annotations,
    pub started_at: Timestamp,
    /// Set when the span is closed
    pub ended_at: Option<Timestamp>,
    /// Number of direct children recorded under this span
    pub children: u32,
}

impl Span {
    /// Creates an open span starting at `started_at`.
    pub fn new(started_at: Timestamp, category: impl Into<String>) -> Self {
        Self {
            parent: None,
            category: category.into(),
            title: None,
            description: None,
            annotations: Annotations::new(),
            started_at,
            ended_at: None,
            children: 0,
        }
    }

    /// Returns the string-interning key of this span.
    pub fn key(&self) -> SpanKey<'_> {
        (self.category.as_str(), self.description.as_deref().unwrap_or(""))
    }

    /// Returns `true` once `ended_at` is set.
    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Duration in nanoseconds.
    ///
    /// `None` while the span is open or if it ends before it starts.
    pub fn duration(&self) -> Option<u64> {
        self.ended_at
            .and_then(|ended_at| ended_at.checked_sub(self.started_at))
    }
}

/// An ordered tree of spans describing one unit of work (e.g. one request).
///
/// Spans are stored in the order they closed, so children precede their
/// parents.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub endpoint: String,
    pub ident: TraceId,
    pub spans: Vec<Span>,
}

impl Trace {
    /// Creates a trace with a freshly generated identifier.
    pub fn new(endpoint: impl Into<String>, spans: Vec<Span>) -> Self {
        let endpoint = endpoint.into();
        let ident = generate_ident(&endpoint);
        Self {
            endpoint,
            ident,
            spans,
        }
    }

    /// Creates a trace with a caller-chosen identifier.
    pub fn with_ident(endpoint: impl Into<String>, ident: TraceId, spans: Vec<Span>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ident,
            spans,
        }
    }

    /// Earliest span start, `None` for an empty trace.
    pub fn started_at(&self) -> Option<Timestamp> {
        self.spans.iter().map(|s| s.started_at).min()
    }

    /// Latest span end, `None` if no span is closed.
    pub fn ended_at(&self) -> Option<Timestamp> {
        self.spans.iter().filter_map(|s| s.ended_at).max()
    }

    /// Returns the number of spans in the trace.
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Returns true if the trace has no spans.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// Generates a trace identifier.
///
/// The first two bytes are derived from the endpoint name so traces of one
/// endpoint share a prefix; the remaining fourteen are random.
pub fn generate_ident(endpoint: &str) -> TraceId {
    let mut ident = [0u8; 16];
    let digest = Sha256::digest(endpoint.as_bytes());
    ident[..2].copy_from_slice(&digest[..2]);
    rand::thread_rng().fill_bytes(&mut ident[2..]);
    ident
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_key_defaults_description() {
        let mut span = Span::new(10, "app.request");
        assert_eq!(span.key(), ("app.request", ""));

        span.description = Some("GET /".into());
        assert_eq!(span.key(), ("app.request", "GET /"));
    }

    #[test]
    fn test_span_duration() {
        let mut span = Span::new(100, "db.query");
        assert_eq!(span.duration(), None);

        span.ended_at = Some(250);
        assert_eq!(span.duration(), Some(150));

        span.ended_at = Some(50);
        assert_eq!(span.duration(), None);
    }

    #[test]
    fn test_trace_bounds() {
        let mut a = Span::new(30, "a");
        a.ended_at = Some(40);
        let mut b = Span::new(10, "b");
        b.ended_at = Some(90);

        let trace = Trace::new("Users#index", vec![a, b]);
        assert_eq!(trace.started_at(), Some(10));
        assert_eq!(trace.ended_at(), Some(90));
        assert_eq!(trace.len(), 2);
    }

    #[test]
    fn test_ident_prefix_tracks_endpoint() {
        let a = generate_ident("Users#index");
        let b = generate_ident("Users#index");
        let digest = Sha256::digest(b"Users#index");

        assert_eq!(a[..2], digest[..2]);
        assert_eq!(a[..2], b[..2]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_annotation_value_json() {
        let mut annotations = Annotations::new();
        annotations.insert("rows".into(), AnnotationValue::Int(3));
        annotations.insert("cached".into(), AnnotationValue::Bool(false));

        let json = serde_json::to_string(&annotations).unwrap();
        assert_eq!(json, r#"{"cached":false,"rows":3}"#);
    }
}
