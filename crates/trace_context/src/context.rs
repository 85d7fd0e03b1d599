//! The extracted trace context.

use crate::baggage::Baggage;
use crate::ids::{SpanId, TraceFlags, TraceId};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Identifiers, sampling decision and baggage that correlate work across an
/// asynchronous boundary.
///
/// A context is built once (by extraction or by the publisher) and is not
/// mutated afterwards; the `with_*` methods return new values.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TraceContext {
    trace_id: TraceId,
    span_id: SpanId,
    trace_flags: TraceFlags,
    /// Raw `tracestate` value, vendor specific and passed through untouched.
    trace_state: Option<String>,
    baggage: Baggage,
}

impl TraceContext {
    pub fn new(trace_id: TraceId, span_id: SpanId, trace_flags: TraceFlags) -> Self {
        Self {
            trace_id,
            span_id,
            trace_flags,
            trace_state: None,
            baggage: Baggage::new(),
        }
    }

    /// The "no context" value: invalid ids, unset flags, no baggage.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A fresh sampled root context with random ids.
    pub fn new_root() -> Self {
        Self::new(TraceId::random(), SpanId::random(), TraceFlags::SAMPLED)
    }

    pub fn with_trace_state(mut self, trace_state: impl Into<String>) -> Self {
        let state = trace_state.into();
        self.trace_state = if state.trim().is_empty() { None } else { Some(state) };
        self
    }

    pub fn with_baggage(mut self, baggage: Baggage) -> Self {
        self.baggage = baggage;
        self
    }

    #[inline]
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    #[inline]
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    #[inline]
    pub fn trace_flags(&self) -> TraceFlags {
        self.trace_flags
    }

    pub fn trace_state(&self) -> Option<&str> {
        self.trace_state.as_deref()
    }

    pub fn baggage(&self) -> &Baggage {
        &self.baggage
    }

    /// True when both ids are non-zero, i.e. the context can be linked to.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.trace_id.is_valid() && self.span_id.is_valid()
    }

    #[inline]
    pub fn is_sampled(&self) -> bool {
        self.trace_flags.is_sampled()
    }

    /// True when nothing at all was carried: no ids and no baggage.
    pub fn is_empty(&self) -> bool {
        !self.is_valid() && self.baggage.is_empty()
    }
}
