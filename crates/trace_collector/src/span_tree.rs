//! Stack-disciplined trace builder.
//!
//! A [`SpanTree`] is owned by the thread handling one unit of work. Every
//! `start` must be matched by a `stop`; spans are appended to the trace in
//! the order they close, and parent links are rewritten to point into that
//! close-ordered sequence when the trace is built.

use crate::span::{Annotations, Span, Timestamp, Trace, TraceId};
use thiserror::Error;

/// Errors raised by malformed start/stop sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TraceError {
    /// `stop`/`record` with no open span, or `build` with spans still open
    #[error("trace unbalanced")]
    Unbalanced,
    /// A span was stopped at a time before it started
    #[error("span stopped at {ended_at} before it started at {started_at}")]
    NegativeDuration {
        started_at: Timestamp,
        ended_at: Timestamp,
    },
}

/// Builds one [`Trace`] from nested start/stop calls.
///
/// # Example
///
/// ```
/// use trace_collector::{Annotations, SpanTree};
///
/// let mut tree = SpanTree::new("Users#index");
/// tree.start(0, "app.request", None, None, Annotations::new());
/// tree.start(10, "db.query", None, Some("SELECT 1".into()), Annotations::new());
/// tree.stop(30).unwrap();
/// tree.stop(50).unwrap();
///
/// let trace = tree.build().unwrap();
/// assert_eq!(trace.spans.len(), 2);
/// assert_eq!(trace.spans[0].parent, Some(1));
/// ```
#[derive(Debug)]
pub struct SpanTree {
    endpoint: String,
    ident: Option<TraceId>,
    /// Spans in start order; `parent` holds start-order ids until `build`
    opened: Vec<Span>,
    /// Start-order ids of the currently open spans, innermost last
    stack: Vec<usize>,
    /// Start-order ids in the order the spans closed
    closed: Vec<usize>,
}

impl SpanTree {
    /// Creates an empty builder for a trace of `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ident: None,
            opened: Vec::new(),
            stack: Vec::new(),
            closed: Vec::new(),
        }
    }

    /// Uses `ident` instead of generating an identifier at build time.
    pub fn with_ident(mut self, ident: TraceId) -> Self {
        self.ident = Some(ident);
        self
    }

    /// Renames the endpoint. Adapters often learn the endpoint name only after
    /// routing, well after the root span was started.
    pub fn set_endpoint(&mut self, endpoint: impl Into<String>) {
        self.endpoint = endpoint.into();
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Number of currently open spans.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Opens a span nested under the currently open span, if any.
    pub fn start(
        &mut self,
        time: Timestamp,
        category: impl Into<String>,
        title: Option<String>,
        description: Option<String>,
        annotations: Annotations,
    ) -> &mut Self {
        let parent = self.stack.last().copied();
        if let Some(parent) = parent {
            self.opened[parent].children += 1;
        }

        let mut span = Span::new(time, category);
        span.parent = parent;
        span.title = title;
        span.description = description;
        span.annotations = annotations;

        self.stack.push(self.opened.len());
        self.opened.push(span);
        self
    }

    /// Records a zero-duration span inside the currently open span.
    ///
    /// Fails with [`TraceError::Unbalanced`] if no span is open.
    pub fn record(
        &mut self,
        time: Timestamp,
        category: impl Into<String>,
        title: Option<String>,
        description: Option<String>,
        annotations: Annotations,
    ) -> Result<&mut Self, TraceError> {
        if self.stack.is_empty() {
            return Err(TraceError::Unbalanced);
        }

        self.start(time, category, title, description, annotations);
        self.stop(time)
    }

    /// Closes the innermost open span at `time`.
    pub fn stop(&mut self, time: Timestamp) -> Result<&mut Self, TraceError> {
        let id = *self.stack.last().ok_or(TraceError::Unbalanced)?;
        let span = &mut self.opened[id];

        if time < span.started_at {
            return Err(TraceError::NegativeDuration {
                started_at: span.started_at,
                ended_at: time,
            });
        }

        span.ended_at = Some(time);
        self.stack.pop();
        self.closed.push(id);
        Ok(self)
    }

    /// Finishes the trace.
    ///
    /// Fails with [`TraceError::Unbalanced`] if any span is still open.
    pub fn build(self) -> Result<Trace, TraceError> {
        if !self.stack.is_empty() {
            return Err(TraceError::Unbalanced);
        }

        // Map start-order ids to close-order positions
        let mut position = vec![0usize; self.opened.len()];
        for (pos, &id) in self.closed.iter().enumerate() {
            position[id] = pos;
        }

        let mut slots: Vec<Option<Span>> = self.opened.into_iter().map(Some).collect();
        let spans = self
            .closed
            .iter()
            .filter_map(|&id| slots[id].take())
            .map(|mut span| {
                span.parent = span.parent.map(|p| position[p]);
                span
            })
            .collect();

        Ok(match self.ident {
            Some(ident) => Trace::with_ident(self.endpoint, ident, spans),
            None => Trace::new(self.endpoint, spans),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(tree: &mut SpanTree, time: Timestamp, category: &str) {
        tree.start(time, category, None, None, Annotations::new());
    }

    #[test]
    fn test_balanced_trace() {
        let mut tree = SpanTree::new("Users#index");
        start(&mut tree, 0, "A");
        start(&mut tree, 5, "B");
        tree.stop(7).unwrap();
        tree.stop(10).unwrap();

        let trace = tree.build().unwrap();
        assert_eq!(trace.spans.len(), 2);

        // Close order: B then A
        let b = &trace.spans[0];
        let a = &trace.spans[1];
        assert_eq!(a.category, "A");
        assert_eq!(a.parent, None);
        assert_eq!(a.children, 1);
        assert_eq!(b.category, "B");
        assert_eq!(b.parent, Some(1));
        assert_eq!(b.children, 0);
        assert_eq!(b.duration(), Some(2));
        assert_eq!(a.duration(), Some(10));
    }

    #[test]
    fn test_stop_on_empty_stack_fails() {
        let mut tree = SpanTree::new("Users#index");
        assert_eq!(tree.stop(1).unwrap_err(), TraceError::Unbalanced);
    }

    #[test]
    fn test_build_with_open_span_fails() {
        let mut tree = SpanTree::new("Users#index");
        start(&mut tree, 0, "A");
        start(&mut tree, 1, "B");
        tree.stop(2).unwrap();

        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.build().unwrap_err(), TraceError::Unbalanced);
    }

    #[test]
    fn test_record_is_zero_duration_child() {
        let mut tree = SpanTree::new("Users#index");
        start(&mut tree, 0, "app.request");
        tree.record(4, "log.info", Some("hello".into()), None, Annotations::new())
            .unwrap()
            .stop(9)
            .unwrap();

        let trace = tree.build().unwrap();
        let log = &trace.spans[0];
        assert_eq!(log.category, "log.info");
        assert_eq!(log.title.as_deref(), Some("hello"));
        assert_eq!(log.started_at, 4);
        assert_eq!(log.ended_at, Some(4));
        assert_eq!(log.parent, Some(1));
        assert_eq!(trace.spans[1].children, 1);
    }

    #[test]
    fn test_record_without_open_span_fails() {
        let mut tree = SpanTree::new("Users#index");
        let result = tree.record(0, "log.info", None, None, Annotations::new());
        assert_eq!(result.unwrap_err(), TraceError::Unbalanced);
        assert!(tree.build().unwrap().is_empty());
    }

    #[test]
    fn test_negative_duration_rejected() {
        let mut tree = SpanTree::new("Users#index");
        start(&mut tree, 10, "A");

        assert_eq!(
            tree.stop(5).unwrap_err(),
            TraceError::NegativeDuration {
                started_at: 10,
                ended_at: 5
            }
        );
        // Span stays open
        assert_eq!(tree.depth(), 1);
    }

    #[test]
    fn test_sibling_parents_remapped() {
        let mut tree = SpanTree::new("Users#index").with_ident([7; 16]);
        start(&mut tree, 0, "root");
        start(&mut tree, 1, "first");
        tree.stop(2).unwrap();
        start(&mut tree, 3, "second");
        start(&mut tree, 4, "nested");
        tree.stop(5).unwrap();
        tree.stop(6).unwrap();
        tree.stop(7).unwrap();
        tree.set_endpoint("Users#show");

        let trace = tree.build().unwrap();
        assert_eq!(trace.endpoint, "Users#show");
        assert_eq!(trace.ident, [7; 16]);

        let order: Vec<_> = trace.spans.iter().map(|s| s.category.as_str()).collect();
        assert_eq!(order, ["first", "nested", "second", "root"]);

        let parents: Vec<_> = trace.spans.iter().map(|s| s.parent).collect();
        assert_eq!(parents, [Some(3), Some(2), Some(3), None]);
        assert_eq!(trace.spans[3].children, 2);
    }
}
