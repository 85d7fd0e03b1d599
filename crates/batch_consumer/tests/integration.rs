use batch_consumer::trace_context::{extract, inject, Baggage, Carrier, SpanId, TraceContext, TraceFlags, TraceId};
use batch_consumer::{
    ActionError, AggregatorError, BatchAction, BatchAggregator, BatchConsumer, CollectingSink, ConsumerConfig,
    ConsumerState, FlushReason, InMemoryExporter, InMemoryTransport, IncomingMessage,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::Notify;

/// Records each batch it is given, optionally taking a while about it.
struct RecordingAction {
    delay: Duration,
    batches: Mutex<Vec<Vec<String>>>,
}

impl RecordingAction {
    fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            batches: Mutex::new(Vec::new()),
        }
    }

    fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }
}

impl BatchAction for RecordingAction {
    async fn execute(&self, payloads: &[Vec<u8>]) -> Result<(), ActionError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let batch = payloads
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect();
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Holds the first batch inside `execute` until `release` is notified.
struct GatedAction {
    gate_first: AtomicBool,
    entered: Notify,
    release: Notify,
    batches: Mutex<Vec<Vec<String>>>,
}

impl GatedAction {
    fn new() -> Self {
        Self {
            gate_first: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
            batches: Mutex::new(Vec::new()),
        }
    }

    fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }
}

impl BatchAction for GatedAction {
    async fn execute(&self, payloads: &[Vec<u8>]) -> Result<(), ActionError> {
        if self.gate_first.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        let batch = payloads
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect();
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }

    fn name(&self) -> &str {
        "gated"
    }
}

fn message(id: u64) -> IncomingMessage {
    let cx = TraceContext::new(TraceId(u128::from(id) + 1), SpanId(id + 1), TraceFlags::SAMPLED);
    IncomingMessage::new("client.report", format!("m{}", id), cx)
}

fn payload_ids(batch: &batch_consumer::Batch) -> Vec<String> {
    batch
        .payloads()
        .iter()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect()
}

#[test]
fn test_size_threshold_dispatches_first_three() {
    let sink = CollectingSink::new();
    let aggregator = BatchAggregator::new(3, sink.clone());

    for id in 1..=4 {
        aggregator.append(message(id)).unwrap();
    }

    let batches = sink.take();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].reason(), FlushReason::SizeThreshold);
    assert_eq!(payload_ids(&batches[0]), vec!["m1", "m2", "m3"]);
    assert_eq!(batches[0].links().len(), 3);
    assert_eq!(aggregator.pending_len(), 1);
}

#[test]
fn test_timer_tick_single_message() {
    let sink = CollectingSink::new();
    let aggregator = BatchAggregator::new(10, sink.clone());

    aggregator.timer_tick().unwrap();
    assert!(sink.is_empty());

    aggregator.append(message(1)).unwrap();
    aggregator.timer_tick().unwrap();

    let batches = sink.take();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].reason(), FlushReason::TimerElapsed);
    assert_eq!(payload_ids(&batches[0]), vec!["m1"]);
}

#[test]
fn test_drain_then_append_fails() {
    let sink = CollectingSink::new();
    let aggregator = BatchAggregator::new(10, sink.clone());
    aggregator.append(message(1)).unwrap();
    aggregator.append(message(2)).unwrap();

    aggregator.drain().unwrap();
    assert_eq!(aggregator.append(message(3)), Err(AggregatorError::Closed));
    aggregator.drain().unwrap();

    let batches = sink.take();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].reason(), FlushReason::ShutdownDrain);
    assert_eq!(payload_ids(&batches[0]), vec!["m1", "m2"]);
}

#[test]
fn test_inject_extract_round_trip_with_baggage() {
    let baggage: Baggage = [("client.id", "42"), ("region", "eu west")].into_iter().collect();
    let cx = TraceContext::new(TraceId(0x0af7651916cd43dd8448eb211c80319c), SpanId(0xb7ad6b7169203331), TraceFlags::SAMPLED)
        .with_trace_state("congo=t61rcWkgMzE")
        .with_baggage(baggage);

    let mut carrier = Carrier::new();
    inject(&cx, &mut carrier);
    assert_eq!(extract(&carrier.into_byte_values()), cx);
}

#[test]
fn test_concurrent_producers_no_loss_no_duplication() {
    const PRODUCERS: u64 = 8;
    const PER_PRODUCER: u64 = 2_000;
    const LIMIT: usize = 37;

    let sink = CollectingSink::new();
    let aggregator = Arc::new(BatchAggregator::new(LIMIT, sink.clone()));

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let aggregator = Arc::clone(&aggregator);
            thread::spawn(move || {
                for n in 0..PER_PRODUCER {
                    aggregator.append(message(p * PER_PRODUCER + n)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    aggregator.drain().unwrap();

    let batches = sink.take();
    let mut seen = HashSet::new();
    for batch in &batches {
        assert!(batch.len() <= LIMIT);
        assert_eq!(batch.len(), batch.links().len());
        if batch.reason() != FlushReason::ShutdownDrain {
            assert_eq!(batch.len(), LIMIT);
        }
        for (payload, link) in batch.payloads().iter().zip(batch.links()) {
            let id: u64 = String::from_utf8_lossy(payload)[1..].parse().unwrap();
            // Pairing survives concurrency: each payload sits next to its own context
            assert_eq!(link.span_id(), SpanId(id + 1));
            assert!(seen.insert(id), "message {} appeared twice", id);
        }
    }
    assert_eq!(seen.len() as u64, PRODUCERS * PER_PRODUCER);
    assert_eq!(
        batches.iter().filter(|b| b.reason() == FlushReason::ShutdownDrain).count(),
        usize::from((PRODUCERS * PER_PRODUCER) % LIMIT as u64 != 0)
    );
}

#[tokio::test]
async fn test_end_to_end_links_every_message() {
    let transport = Arc::new(InMemoryTransport::new());
    let action = Arc::new(RecordingAction::new());
    let exporter = Arc::new(InMemoryExporter::new());
    let consumer = BatchConsumer::new(
        ConsumerConfig::default().with_batch_size_limit(4),
        Arc::clone(&transport),
        action.clone(),
        exporter.clone(),
    );

    consumer.start().await.unwrap();
    let mut published = Vec::new();
    for n in 0..10 {
        let cx = TraceContext::new_root();
        transport.publish_with_context("client.report", format!("m{}", n), &cx);
        published.push(cx);
    }
    // One message without any trace context
    transport.publish("client.report", b"untraced".to_vec(), Carrier::new());

    while transport.acked().len() < 11 {
        tokio::task::yield_now().await;
    }
    let report = consumer.stop().await.unwrap();

    let sizes: Vec<usize> = action.batches().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![4, 4, 3]);
    assert_eq!(report.metrics.size_flushes, 2);
    assert_eq!(report.metrics.drain_flushes, 1);

    let spans = exporter.spans_named("Report Process");
    assert_eq!(spans.len(), 3);
    let linked: Vec<(TraceId, SpanId)> = spans
        .iter()
        .flat_map(|s| s.links.iter().map(|l| (l.trace_id, l.span_id)))
        .collect();
    let expected: Vec<(TraceId, SpanId)> = published.iter().map(|cx| (cx.trace_id(), cx.span_id())).collect();
    assert_eq!(linked, expected);

    // Batch spans start their own trace
    assert!(spans.iter().all(|s| s.parent_span_id == SpanId::INVALID));
    assert!(spans.iter().all(|s| !published.iter().any(|cx| cx.trace_id() == s.trace_id)));
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_batch() {
    let transport = Arc::new(InMemoryTransport::new());
    let action = Arc::new(RecordingAction::with_delay(Duration::from_millis(50)));
    let consumer = BatchConsumer::new(
        ConsumerConfig::default().with_batch_size_limit(2),
        Arc::clone(&transport),
        action.clone(),
        Arc::new(InMemoryExporter::new()),
    );

    consumer.start().await.unwrap();
    for n in 0..5 {
        transport.publish_with_context("client.report", format!("m{}", n), &TraceContext::new_root());
    }
    while transport.acked().len() < 5 {
        tokio::task::yield_now().await;
    }

    let mut states = consumer.subscribe_state();
    let report = consumer.stop().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConsumerState::Stopped);

    assert_eq!(action.batches().len(), 3);
    assert_eq!(report.metrics.messages_processed, 5);
}

#[tokio::test]
async fn test_intake_continues_while_batch_is_processed() {
    let transport = Arc::new(InMemoryTransport::new());
    let action = Arc::new(GatedAction::new());
    let consumer = BatchConsumer::new(
        ConsumerConfig::default().with_batch_size_limit(2),
        Arc::clone(&transport),
        action.clone(),
        Arc::new(InMemoryExporter::new()),
    );
    consumer.start().await.unwrap();

    for n in 0..2 {
        transport.publish_with_context("client.report", format!("m{}", n), &TraceContext::new_root());
    }
    tokio::time::timeout(Duration::from_secs(5), action.entered.notified())
        .await
        .unwrap();

    // First batch is parked in the action; intake must keep appending and acking
    for n in 2..7 {
        transport.publish_with_context("client.report", format!("m{}", n), &TraceContext::new_root());
    }
    tokio::time::timeout(Duration::from_secs(5), async {
        while transport.acked().len() < 7 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    let snapshot = consumer.metrics().snapshot();
    assert_eq!(snapshot.messages_appended, 7);
    assert_eq!(snapshot.size_flushes, 3);
    assert_eq!(snapshot.batches_processed, 0);
    assert!(action.batches().is_empty());

    action.release.notify_one();
    let report = consumer.stop().await.unwrap();

    assert_eq!(
        action.batches(),
        vec![vec!["m0", "m1"], vec!["m2", "m3"], vec!["m4", "m5"], vec!["m6"]]
    );
    assert_eq!(report.metrics.batches_processed, 4);
    assert_eq!(report.metrics.drain_flushes, 1);
}

#[tokio::test]
async fn test_restart_after_stop() {
    let transport = Arc::new(InMemoryTransport::new());
    let action = Arc::new(RecordingAction::new());
    let consumer = BatchConsumer::new(
        ConsumerConfig::default(),
        Arc::clone(&transport),
        action.clone(),
        Arc::new(InMemoryExporter::new()),
    );

    for round in 0..2u64 {
        consumer.start().await.unwrap();
        transport.publish_with_context("client.report", format!("r{}", round), &TraceContext::new_root());
        while transport.acked().len() < (round + 1) as usize {
            tokio::task::yield_now().await;
        }
        consumer.stop().await.unwrap();
    }

    assert_eq!(action.batches(), vec![vec!["r0".to_string()], vec!["r1".to_string()]]);
    assert_eq!(consumer.metrics().snapshot().drain_flushes, 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any interleaving of appends and timer ticks, then a drain, puts every
    /// message in exactly one batch, in arrival order.
    #[test]
    fn prop_every_message_in_exactly_one_batch(
        limit in 1usize..20,
        ops in proptest::collection::vec(prop_oneof![4 => Just(true), 1 => Just(false)], 0..200),
    ) {
        let sink = CollectingSink::new();
        let aggregator = BatchAggregator::new(limit, sink.clone());

        let mut appended = Vec::new();
        for (i, is_append) in ops.into_iter().enumerate() {
            if is_append {
                aggregator.append(message(i as u64)).unwrap();
                appended.push(format!("m{}", i));
            } else {
                aggregator.timer_tick().unwrap();
            }
            prop_assert_eq!(aggregator.pending_len(), aggregator.pending_links());
        }
        aggregator.drain().unwrap();

        let batches = sink.take();
        let flushed: Vec<String> = batches.iter().flat_map(payload_ids).collect();
        prop_assert_eq!(flushed, appended);
        for batch in &batches {
            prop_assert!(!batch.is_empty());
            prop_assert!(batch.len() <= limit);
            prop_assert_eq!(batch.len(), batch.links().len());
        }
    }
}
