use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;
use trace_context::{SpanId, TraceContext, TraceFlags, TraceId};

/// A finished (or in-progress) operation handed to the telemetry sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    /// Trace this span belongs to
    pub trace_id: TraceId,
    /// Unique span identifier
    pub span_id: SpanId,
    /// Parent span identifier (invalid if root span)
    pub parent_span_id: SpanId,
    /// Sampling decision carried by the span
    pub trace_flags: TraceFlags,
    /// Span start time (Unix nanoseconds)
    pub start_time: u64,
    /// Span end time (Unix nanoseconds)
    pub end_time: u64,
    /// Operation name
    pub name: String,
    /// Span kind
    pub kind: SpanKind,
    /// Span attributes (boxed to keep Span size manageable)
    pub attributes: Box<HashMap<String, AttributeValue>>,
    /// Causal links to spans that are related but not parents
    pub links: Vec<SpanLink>,
    /// Timestamped events, e.g. recorded exceptions
    pub events: Vec<SpanEvent>,
    /// Span status
    pub status: SpanStatus,
}

/// Attribute value types for span metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<String>),
}

/// Span execution status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    /// Span status unknown
    Unset,
    /// Span completed successfully
    Ok,
    /// Span completed with error
    Error { description: String },
}

/// Span kind according to OpenTelemetry specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    /// Internal operation span
    Internal,
    /// Server-side RPC span
    Server,
    /// Client-side RPC span
    Client,
    /// Producer span (messaging)
    Producer,
    /// Consumer span (messaging)
    Consumer,
}

/// Association with another span that does not imply parent/child nesting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanLink {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub trace_flags: TraceFlags,
    pub trace_state: Option<String>,
    pub attributes: HashMap<String, AttributeValue>,
}

/// A point-in-time annotation on a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    /// Unix nanoseconds
    pub timestamp: u64,
    pub attributes: HashMap<String, AttributeValue>,
}

/// Batch of spans for export
#[derive(Debug)]
pub struct SpanBatch {
    /// All spans in this batch
    pub spans: Vec<Span>,
    /// Batch creation timestamp
    pub timestamp: SystemTime,
}

pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

impl Span {
    /// Creates a new span with the given parameters
    pub fn new(
        trace_id: TraceId,
        span_id: SpanId,
        parent_span_id: SpanId,
        name: impl Into<String>,
        kind: SpanKind,
    ) -> Self {
        let now = now_nanos();

        Self {
            trace_id,
            span_id,
            parent_span_id,
            trace_flags: TraceFlags::SAMPLED,
            start_time: now,
            end_time: now,
            name: name.into(),
            kind,
            attributes: Box::new(HashMap::new()),
            links: Vec::new(),
            events: Vec::new(),
            status: SpanStatus::Unset,
        }
    }

    /// Starts a span in a fresh trace.
    pub fn root(name: impl Into<String>, kind: SpanKind) -> Self {
        Self::new(TraceId::random(), SpanId::random(), SpanId::INVALID, name, kind)
    }

    /// Starts a span parented to `parent`, or a root span if `parent` is not valid.
    pub fn child_of(parent: &TraceContext, name: impl Into<String>, kind: SpanKind) -> Self {
        if !parent.is_valid() {
            return Self::root(name, kind);
        }
        let mut span = Self::new(parent.trace_id(), SpanId::random(), parent.span_id(), name, kind);
        span.trace_flags = parent.trace_flags();
        span
    }

    /// Marks the span as completed with the given status
    pub fn finish(&mut self, status: SpanStatus) {
        self.end_time = now_nanos();
        self.status = status;
    }

    /// Marks the span failed and records an `exception` event.
    pub fn record_error(&mut self, error: &dyn std::error::Error) {
        let message = error.to_string();
        let mut attributes = HashMap::new();
        attributes.insert(
            "exception.message".to_string(),
            AttributeValue::String(message.clone()),
        );
        self.add_event("exception", attributes);
        self.finish(SpanStatus::Error { description: message });
    }

    /// Adds an attribute to the span
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn add_link(&mut self, link: SpanLink) {
        self.links.push(link);
    }

    pub fn add_event(&mut self, name: impl Into<String>, attributes: HashMap<String, AttributeValue>) {
        self.events.push(SpanEvent {
            name: name.into(),
            timestamp: now_nanos(),
            attributes,
        });
    }

    pub fn set_sampled(&mut self, sampled: bool) {
        self.trace_flags = self.trace_flags.with_sampled(sampled);
    }

    pub fn is_sampled(&self) -> bool {
        self.trace_flags.is_sampled()
    }

    /// Duration of the span in nanoseconds
    pub fn duration_nanos(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }
}

impl SpanLink {
    /// Link to the span identified by `context`. Baggage is not carried on links.
    pub fn from_context(context: &TraceContext) -> Self {
        Self {
            trace_id: context.trace_id(),
            span_id: context.span_id(),
            trace_flags: context.trace_flags(),
            trace_state: context.trace_state().map(str::to_string),
            attributes: HashMap::new(),
        }
    }
}

impl SpanBatch {
    /// Creates a new empty span batch
    pub fn new() -> Self {
        Self {
            spans: Vec::new(),
            timestamp: SystemTime::now(),
        }
    }

    /// Creates a batch with the given spans
    pub fn with_spans(spans: Vec<Span>) -> Self {
        Self {
            spans,
            timestamp: SystemTime::now(),
        }
    }

    /// Adds a span to the batch
    pub fn add(&mut self, span: Span) {
        self.spans.push(span);
    }

    /// Returns the number of spans in the batch
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Returns true if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

impl Default for SpanBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<usize> for AttributeValue {
    fn from(value: usize) -> Self {
        AttributeValue::Int(value as i64)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}
