//! Request-scoped trace context.
//!
//! Every provider callback gets a fresh trace id that follows the work
//! through ingestion, matching and delivery enqueue, so log lines from one
//! spoken command can be correlated across components. Passed explicitly by
//! reference, never serialized into job payloads.

use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: Uuid,
    pub span: &'static str,
}

impl TraceContext {
    pub fn new(span: &'static str) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            span,
        }
    }

    /// A child context sharing the trace id but labelled with a new span.
    pub fn child(&self, span: &'static str) -> Self {
        Self {
            trace_id: self.trace_id,
            span,
        }
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.trace_id.simple(), self.span)
    }
}
