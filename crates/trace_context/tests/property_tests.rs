//! Property-based tests for header propagation.
//!
//! Whatever a publisher injects, a consumer must extract the same context,
//! regardless of whether the broker returns header values as text or bytes.

use proptest::prelude::*;
use std::collections::HashMap;
use trace_context::{
    extract, inject, Baggage, Carrier, SpanId, TraceContext, TraceFlags, TraceId,
};

fn arb_context() -> impl Strategy<Value = TraceContext> {
    (
        1u128..,
        1u64..,
        any::<u8>(),
        proptest::option::of("[a-z]{1,8}=[a-z0-9]{1,8}"),
        proptest::collection::vec(("[a-zA-Z0-9._-]{1,12}", ".{0,16}"), 0..8),
    )
        .prop_map(|(trace_id, span_id, flags, state, entries)| {
            let baggage: Baggage = entries.into_iter().collect();
            let mut cx = TraceContext::new(TraceId(trace_id), SpanId(span_id), TraceFlags(flags))
                .with_baggage(baggage);
            if let Some(state) = state {
                cx = cx.with_trace_state(state);
            }
            cx
        })
}

proptest! {
    /// extract(inject(cx)) == cx for text carriers
    #[test]
    fn prop_round_trip_text_carrier(cx in arb_context()) {
        let mut carrier: HashMap<String, String> = HashMap::new();
        inject(&cx, &mut carrier);
        prop_assert_eq!(extract(&carrier), cx);
    }

    /// extract(inject(cx)) == cx when the broker hands back raw bytes
    #[test]
    fn prop_round_trip_byte_carrier(cx in arb_context()) {
        let mut carrier = Carrier::new();
        inject(&cx, &mut carrier);
        let carrier = carrier.into_byte_values();
        prop_assert_eq!(extract(&carrier), cx);
    }

    /// Arbitrary header garbage never panics and never yields a half-valid context
    #[test]
    fn prop_garbage_traceparent_is_harmless(value in ".{0,80}") {
        let carrier: Carrier = [("traceparent", value.as_str())].into_iter().collect();
        let cx = extract(&carrier);
        prop_assert_eq!(cx.trace_id().is_valid(), cx.span_id().is_valid());
    }
}

#[test]
fn test_round_trip_without_baggage() {
    let cx = TraceContext::new_root();
    let mut carrier = Carrier::new();
    inject(&cx, &mut carrier);
    assert_eq!(extract(&carrier), cx);
    assert!(extract(&carrier).baggage().is_empty());
}
