//! Deliveries as the transport hands them over, and the typed message the
//! consumer works with after context extraction.

use trace_context::{Carrier, TraceContext};

/// One raw delivery from the queue transport.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Transport-assigned tag used to acknowledge this delivery
    pub delivery_tag: u64,
    pub routing_key: String,
    pub payload: Vec<u8>,
    /// Message metadata, including any propagated trace context
    pub headers: Carrier,
}

/// A received message plus the trace context its publisher attached.
///
/// `context` is [`TraceContext::empty`] when the headers carried none.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub context: TraceContext,
}

impl IncomingMessage {
    pub fn new(routing_key: impl Into<String>, payload: impl Into<Vec<u8>>, context: TraceContext) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload: payload.into(),
            context,
        }
    }
}
