//! Encoding and decoding of [`TraceContext`] into carriers.
//!
//! The wire format is W3C Trace Context (`traceparent`, `tracestate`) plus
//! W3C Baggage (`baggage`), the same headers an OpenTelemetry publisher puts
//! on outgoing messages.

use crate::baggage::Baggage;
use crate::carrier::{Extractor, Injector};
use crate::context::TraceContext;
use crate::error::TraceParentError;
use crate::ids::{is_lower_hex, SpanId, TraceFlags, TraceId};
use std::borrow::Cow;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";
pub const BAGGAGE_HEADER: &str = "baggage";

const SUPPORTED_VERSION: &str = "00";

/// Moves a [`TraceContext`] in and out of a carrier.
///
/// Implementations are stateless and must never fail on extraction: a
/// carrier without usable context yields [`TraceContext::empty`] (possibly
/// with baggage).
pub trait Propagator: Send + Sync {
    fn extract(&self, carrier: &dyn Extractor) -> TraceContext;

    fn inject(&self, context: &TraceContext, carrier: &mut dyn Injector);
}

/// W3C trace context + baggage propagator.
#[derive(Debug, Clone, Copy, Default)]
pub struct W3cPropagator;

impl W3cPropagator {
    pub fn new() -> Self {
        Self
    }
}

impl Propagator for W3cPropagator {
    fn extract(&self, carrier: &dyn Extractor) -> TraceContext {
        let baggage = read(carrier, BAGGAGE_HEADER)
            .map(|v| Baggage::from_header(&v))
            .unwrap_or_default();

        let Some(traceparent) = read(carrier, TRACEPARENT_HEADER) else {
            return TraceContext::empty().with_baggage(baggage);
        };

        match parse_traceparent(&traceparent) {
            Ok((trace_id, span_id, flags)) => {
                let mut cx = TraceContext::new(trace_id, span_id, flags).with_baggage(baggage);
                if let Some(state) = read(carrier, TRACESTATE_HEADER) {
                    cx = cx.with_trace_state(state.into_owned());
                }
                cx
            }
            Err(e) => {
                tracing::debug!(error = %e, value = %traceparent, "ignoring malformed traceparent");
                TraceContext::empty().with_baggage(baggage)
            }
        }
    }

    fn inject(&self, context: &TraceContext, carrier: &mut dyn Injector) {
        if context.is_valid() {
            carrier.set(TRACEPARENT_HEADER, format_traceparent(context));
            if let Some(state) = context.trace_state() {
                carrier.set(TRACESTATE_HEADER, state.to_string());
            }
        }
        if !context.baggage().is_empty() {
            carrier.set(BAGGAGE_HEADER, context.baggage().to_header());
        }
    }
}

/// Extracts a context from `carrier` with the W3C propagator.
pub fn extract(carrier: &dyn Extractor) -> TraceContext {
    W3cPropagator.extract(carrier)
}

/// Injects `context` into `carrier` with the W3C propagator.
pub fn inject(context: &TraceContext, carrier: &mut dyn Injector) {
    W3cPropagator.inject(context, carrier);
}

/// Renders `00-{trace-id}-{parent-id}-{flags}`.
pub fn format_traceparent(context: &TraceContext) -> String {
    format!(
        "{}-{}-{}-{}",
        SUPPORTED_VERSION,
        context.trace_id(),
        context.span_id(),
        context.trace_flags()
    )
}

/// Parses a `traceparent` value into its ids and flags.
pub fn parse_traceparent(value: &str) -> Result<(TraceId, SpanId, TraceFlags), TraceParentError> {
    let fields: Vec<&str> = value.trim().split('-').collect();
    if fields.len() < 4 {
        return Err(TraceParentError::FieldCount {
            expected: 4,
            found: fields.len(),
        });
    }

    let version = fields[0];
    if !is_lower_hex(version, 2) {
        return Err(TraceParentError::invalid("version", version));
    }
    if version == "ff" {
        return Err(TraceParentError::ForbiddenVersion);
    }
    // Later versions may append fields; version 00 may not
    if version == SUPPORTED_VERSION && fields.len() != 4 {
        return Err(TraceParentError::FieldCount {
            expected: 4,
            found: fields.len(),
        });
    }

    let trace_id = TraceId::from_hex(fields[1])?;
    if !trace_id.is_valid() {
        return Err(TraceParentError::ZeroTraceId);
    }
    let span_id = SpanId::from_hex(fields[2])?;
    if !span_id.is_valid() {
        return Err(TraceParentError::ZeroSpanId);
    }

    let flags = fields[3];
    if !is_lower_hex(flags, 2) {
        return Err(TraceParentError::invalid("trace-flags", flags));
    }
    let flags = u8::from_str_radix(flags, 16).map_err(|_| TraceParentError::invalid("trace-flags", flags))?;

    Ok((trace_id, span_id, TraceFlags(flags)))
}

/// Reads a header, treating empty or whitespace-only values as absent.
fn read<'a>(carrier: &'a dyn Extractor, key: &str) -> Option<Cow<'a, str>> {
    carrier.get(key).filter(|v| !v.trim().is_empty())
}
