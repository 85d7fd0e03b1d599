//! Trace context propagation for message headers.
//!
//! Publishers [`inject`] a [`TraceContext`] into a message's header
//! [`Carrier`]; consumers [`extract`] it back on receipt so work done later,
//! possibly batched with many other messages, can still be correlated with
//! the trace that produced each message.
//!
//! # Example
//!
//! ```
//! use trace_context::{extract, inject, Carrier, TraceContext};
//!
//! let cx = TraceContext::new_root().with_baggage([("client.id", "42")].into_iter().collect());
//!
//! let mut headers = Carrier::new();
//! inject(&cx, &mut headers);
//!
//! // Brokers frequently hand header values back as raw bytes
//! let headers = headers.into_byte_values();
//! assert_eq!(extract(&headers), cx);
//! ```
//!
//! Extraction never fails. A carrier with no (or unusable) context yields
//! [`TraceContext::empty`], which callers treat as "no parent".

mod baggage;
mod carrier;
mod context;
mod error;
mod ids;
mod propagator;

pub use baggage::{Baggage, MAX_BAGGAGE_MEMBERS};
pub use carrier::{Carrier, Extractor, HeaderValue, Injector};
pub use context::TraceContext;
pub use error::TraceParentError;
pub use ids::{SpanId, TraceFlags, TraceId};
pub use propagator::{
    extract, format_traceparent, inject, parse_traceparent, Propagator, W3cPropagator,
    BAGGAGE_HEADER, TRACEPARENT_HEADER, TRACESTATE_HEADER,
};
