//! Message Receiver - turns a raw delivery into an [`IncomingMessage`].
//!
//! Per delivery: extract the trace context from the headers, optionally record
//! a consumer span parented to it, append to the aggregator, then ack. The ack
//! follows the hand-off immediately and does not wait for the batch outcome,
//! so delivery is at-most-once.
//!
//! Consumer spans are queued for [`run_span_export`](crate::exporter::run_span_export)
//! after the ack; a slow telemetry sink never holds up intake.

use crate::aggregator::{AggregatorError, BatchAggregator, BatchSink};
use crate::message::{Delivery, IncomingMessage};
use crate::metrics::ConsumerMetrics;
use crate::sampler::{AlwaysOn, Sampler};
use crate::span::{Span, SpanKind, SpanStatus};
use crate::tags;
use crate::transport::{QueueTransport, TransportError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use trace_context::{Propagator, TraceContext, W3cPropagator};

/// Value of `messaging.system` on consumer spans.
pub const MESSAGING_SYSTEM_NAME: &str = "rabbitmq";

/// Why a delivery could not be handed off.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReceiveError {
    /// The aggregator refused the message; it was not acknowledged.
    #[error(transparent)]
    Aggregator(#[from] AggregatorError),

    /// The message was batched but the ack failed.
    #[error("message batched but not acknowledged: {0}")]
    Ack(#[from] TransportError),
}

impl ReceiveError {
    /// Returns `true` if the consumer can no longer take deliveries.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Aggregator(e) => e.is_terminal(),
            Self::Ack(e) => e.is_terminal(),
        }
    }
}

/// Handles single deliveries for one consumer.
pub struct MessageReceiver<S = mpsc::UnboundedSender<crate::batch::Batch>> {
    queue: String,
    propagator: Arc<dyn Propagator>,
    aggregator: Arc<BatchAggregator<S>>,
    /// Queue of finished consumer spans; `None` disables them
    spans: Option<mpsc::UnboundedSender<Span>>,
    sampler: Arc<dyn Sampler>,
    metrics: Arc<ConsumerMetrics>,
}

impl<S: BatchSink> MessageReceiver<S> {
    pub fn new(queue: impl Into<String>, aggregator: Arc<BatchAggregator<S>>) -> Self {
        let metrics = Arc::clone(aggregator.metrics());
        Self {
            queue: queue.into(),
            propagator: Arc::new(W3cPropagator),
            aggregator,
            spans: None,
            sampler: Arc::new(AlwaysOn),
            metrics,
        }
    }

    pub fn with_propagator(mut self, propagator: Arc<dyn Propagator>) -> Self {
        self.propagator = propagator;
        self
    }

    /// Records a consumer span per delivery and queues it on `spans`.
    pub fn with_receive_spans(mut self, spans: mpsc::UnboundedSender<Span>) -> Self {
        self.spans = Some(spans);
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn aggregator(&self) -> &Arc<BatchAggregator<S>> {
        &self.aggregator
    }

    /// Extracts the context carried by `delivery`'s headers.
    pub fn decode(&self, delivery: Delivery) -> IncomingMessage {
        let context = self.propagator.extract(&delivery.headers);
        IncomingMessage::new(delivery.routing_key, delivery.payload, context)
    }

    /// Receives one delivery: extract, record, append, ack.
    pub async fn handle<T: QueueTransport>(&self, delivery: Delivery, transport: &T) -> Result<(), ReceiveError> {
        self.metrics.record_received();
        let tag = delivery.delivery_tag;
        let message = self.decode(delivery);

        if !message.context.is_valid() {
            tracing::debug!(tag, routing_key = %message.routing_key, "delivery carries no trace context");
        }

        let span = self.spans.as_ref().map(|_| self.start_span(&message));

        let result = match self.aggregator.append(message) {
            Ok(_) => transport.ack(tag).await.map_err(|e| {
                self.metrics.record_ack_failure();
                tracing::warn!(tag, error = %e, "ack failed");
                ReceiveError::from(e)
            }),
            Err(e) => {
                tracing::warn!(tag, error = %e, "delivery not batched, leaving unacknowledged");
                Err(e.into())
            }
        };

        if let Some(mut span) = span {
            match &result {
                Ok(()) => span.finish(SpanStatus::Ok),
                Err(e) => span.record_error(e),
            }
            self.queue_span(span);
        }
        result
    }

    fn start_span(&self, message: &IncomingMessage) -> Span {
        let parent: &TraceContext = &message.context;
        let mut span = Span::child_of(
            parent,
            format!("{} {}", message.routing_key, tags::OPERATION_PROCESS),
            SpanKind::Consumer,
        );
        let parent_sampled = parent.is_valid().then(|| parent.is_sampled());
        span.set_sampled(self.sampler.should_sample(parent_sampled));

        span.set_attribute(tags::MESSAGING_SYSTEM, MESSAGING_SYSTEM_NAME);
        span.set_attribute(tags::MESSAGING_DESTINATION_NAME, self.queue.as_str());
        span.set_attribute(tags::MESSAGING_DESTINATION_KIND, message.routing_key.as_str());
        span.set_attribute(tags::MESSAGING_OPERATION, tags::OPERATION_PROCESS);
        if let Some(client_id) = parent.baggage().get(tags::CLIENT_ID) {
            span.set_attribute(tags::CLIENT_ID, client_id);
        }
        span
    }

    fn queue_span(&self, span: Span) {
        let Some(spans) = &self.spans else {
            return;
        };
        if !span.is_sampled() {
            return;
        }
        if spans.send(span).is_err() {
            self.metrics.record_span_export_error();
            tracing::debug!("span export task gone, consumer span dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::CollectingSink;
    use crate::exporter::{run_span_export, ExportError, SpanExporter};
    use crate::span::{AttributeValue, SpanBatch};
    use crate::transport::InMemoryTransport;
    use std::time::Duration;
    use trace_context::{Baggage, Carrier, SpanId, TraceFlags, TraceId, TRACEPARENT_HEADER};

    fn receiver(limit: usize) -> (MessageReceiver<CollectingSink>, CollectingSink) {
        let sink = CollectingSink::new();
        let aggregator = Arc::new(BatchAggregator::new(limit, sink.clone()));
        (MessageReceiver::new("reporting", aggregator), sink)
    }

    fn delivery(tag: u64, headers: Carrier) -> Delivery {
        Delivery {
            delivery_tag: tag,
            routing_key: "client.created".to_string(),
            payload: format!("payload-{}", tag).into_bytes(),
            headers,
        }
    }

    fn traced_headers(cx: &TraceContext) -> Carrier {
        let mut headers = Carrier::new();
        W3cPropagator.inject(cx, &mut headers);
        headers.into_byte_values()
    }

    #[tokio::test]
    async fn test_handle_appends_then_acks() {
        let (receiver, sink) = receiver(2);
        let transport = InMemoryTransport::new();
        let cx = TraceContext::new(TraceId(0xabc), SpanId(0xdef), TraceFlags::SAMPLED);

        receiver.handle(delivery(1, traced_headers(&cx)), &transport).await.unwrap();
        receiver.handle(delivery(2, Carrier::new()), &transport).await.unwrap();

        assert_eq!(transport.acked(), vec![1, 2]);
        let batches = sink.take();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].links()[0], cx);
        assert!(batches[0].links()[1].is_empty());
        assert_eq!(batches[0].payloads()[1], b"payload-2");
    }

    #[tokio::test]
    async fn test_closed_aggregator_leaves_delivery_unacked() {
        let (receiver, _sink) = receiver(10);
        let transport = InMemoryTransport::new();
        receiver.aggregator().drain().unwrap();

        let err = receiver.handle(delivery(7, Carrier::new()), &transport).await.unwrap_err();
        assert_eq!(err, ReceiveError::Aggregator(AggregatorError::Closed));
        assert!(err.is_terminal());
        assert!(transport.acked().is_empty());
    }

    #[tokio::test]
    async fn test_ack_failure_is_reported_after_batching() {
        let (receiver, _sink) = receiver(10);
        let transport = InMemoryTransport::new();
        transport.close();

        let err = receiver.handle(delivery(3, Carrier::new()), &transport).await.unwrap_err();
        assert!(matches!(err, ReceiveError::Ack(TransportError::Closed)));
        assert_eq!(receiver.aggregator().pending_len(), 1);
        assert_eq!(receiver.metrics.snapshot().ack_failures, 1);
    }

    #[tokio::test]
    async fn test_malformed_traceparent_still_batches() {
        let (receiver, _sink) = receiver(10);
        let transport = InMemoryTransport::new();
        let mut headers = Carrier::new();
        headers.insert(TRACEPARENT_HEADER, b"00-garbage".to_vec());

        receiver.handle(delivery(1, headers), &transport).await.unwrap();
        assert_eq!(receiver.aggregator().pending_links(), 1);
    }

    #[tokio::test]
    async fn test_consumer_span_is_child_of_publisher() {
        let (tx, mut spans) = mpsc::unbounded_channel();
        let (receiver, _sink) = receiver(10);
        let receiver = receiver.with_receive_spans(tx);
        let transport = InMemoryTransport::new();

        let mut baggage = Baggage::new();
        baggage.insert(tags::CLIENT_ID, "client-42");
        let cx = TraceContext::new(TraceId(0x11), SpanId(0x22), TraceFlags::SAMPLED).with_baggage(baggage);

        receiver.handle(delivery(1, traced_headers(&cx)), &transport).await.unwrap();

        let span = spans.try_recv().unwrap();
        assert!(spans.try_recv().is_err());
        assert_eq!(span.name, "client.created process");
        assert_eq!(span.kind, SpanKind::Consumer);
        assert_eq!(span.status, SpanStatus::Ok);
        assert_eq!(span.trace_id, TraceId(0x11));
        assert_eq!(span.parent_span_id, SpanId(0x22));
        assert_eq!(
            span.attribute(tags::CLIENT_ID),
            Some(&AttributeValue::String("client-42".to_string()))
        );
        assert_eq!(
            span.attribute(tags::MESSAGING_DESTINATION_NAME),
            Some(&AttributeValue::String("reporting".to_string()))
        );
    }

    #[tokio::test]
    async fn test_consumer_span_without_context_starts_new_trace() {
        let (tx, mut spans) = mpsc::unbounded_channel();
        let (receiver, _sink) = receiver(10);
        let receiver = receiver.with_receive_spans(tx);
        let transport = InMemoryTransport::new();

        receiver.handle(delivery(1, Carrier::new()), &transport).await.unwrap();

        let span = spans.try_recv().unwrap();
        assert!(span.trace_id.is_valid());
        assert_eq!(span.parent_span_id, SpanId::INVALID);
        assert!(span.attribute(tags::CLIENT_ID).is_none());
    }

    #[tokio::test]
    async fn test_rejected_delivery_span_records_error() {
        let (tx, mut spans) = mpsc::unbounded_channel();
        let (receiver, _sink) = receiver(10);
        let receiver = receiver.with_receive_spans(tx);
        let transport = InMemoryTransport::new();
        receiver.aggregator().drain().unwrap();

        receiver.handle(delivery(1, Carrier::new()), &transport).await.unwrap_err();

        let span = spans.try_recv().unwrap();
        assert!(matches!(span.status, SpanStatus::Error { .. }));
        assert!(transport.acked().is_empty());
    }

    /// Telemetry sink that never completes an export.
    struct StuckExporter;

    impl SpanExporter for StuckExporter {
        async fn export(&self, _batch: SpanBatch) -> Result<(), ExportError> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> &str {
            "stuck"
        }
    }

    #[tokio::test]
    async fn test_stalled_span_export_does_not_hold_back_ack() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (receiver, sink) = receiver(2);
        let receiver = receiver.with_receive_spans(tx);
        let metrics = Arc::clone(&receiver.metrics);
        let export = tokio::spawn(run_span_export(Arc::new(StuckExporter), rx, metrics));
        let transport = InMemoryTransport::new();

        for tag in 1..=3 {
            tokio::time::timeout(
                Duration::from_secs(5),
                receiver.handle(delivery(tag, Carrier::new()), &transport),
            )
            .await
            .expect("handle waited on span export")
            .unwrap();
        }

        assert_eq!(transport.acked(), vec![1, 2, 3]);
        assert_eq!(sink.len(), 1);
        assert_eq!(receiver.aggregator().pending_len(), 1);
        export.abort();
    }
}
