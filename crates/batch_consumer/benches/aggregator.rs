use batch_consumer::trace_context::{Carrier, Propagator, TraceContext, W3cPropagator};
use batch_consumer::{BatchAggregator, CollectingSink, IncomingMessage};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::thread;

const MSG_PER_PRODUCER: u64 = 100_000;

fn message(n: u64, cx: &TraceContext) -> IncomingMessage {
    IncomingMessage::new("client.report", n.to_le_bytes().to_vec(), cx.clone())
}

fn bench_single_producer(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    group.throughput(Throughput::Elements(MSG_PER_PRODUCER));
    let cx = TraceContext::new_root();

    for limit in [10usize, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("single_producer", limit), &limit, |b, &limit| {
            b.iter(|| {
                let sink = CollectingSink::new();
                let aggregator = BatchAggregator::new(limit, sink.clone());
                for n in 0..MSG_PER_PRODUCER {
                    black_box(aggregator.append(message(n, &cx)).unwrap());
                }
                aggregator.drain().unwrap();
                black_box(sink.len());
            });
        });
    }

    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_contended");

    for producers in [2u64, 4, 8] {
        group.throughput(Throughput::Elements(MSG_PER_PRODUCER * producers));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}P", producers)),
            &producers,
            |b, &producers| {
                b.iter(|| {
                    let sink = CollectingSink::new();
                    let aggregator = Arc::new(BatchAggregator::new(100, sink.clone()));

                    let handles: Vec<_> = (0..producers)
                        .map(|_| {
                            let aggregator = Arc::clone(&aggregator);
                            thread::spawn(move || {
                                let cx = TraceContext::new_root();
                                for n in 0..MSG_PER_PRODUCER {
                                    aggregator.append(message(n, &cx)).unwrap();
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }

                    aggregator.drain().unwrap();
                    black_box(sink.len());
                });
            },
        );
    }

    group.finish();
}

fn bench_extract(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract");
    let cx = TraceContext::new_root()
        .with_trace_state("vendor=abc")
        .with_baggage([("client.id", "client-7"), ("tenant", "acme")].into_iter().collect());

    let mut headers = Carrier::new();
    W3cPropagator.inject(&cx, &mut headers);
    let headers = headers.into_byte_values();

    group.bench_function("w3c_byte_headers", |b| {
        b.iter(|| black_box(W3cPropagator.extract(black_box(&headers))));
    });

    group.finish();
}

criterion_group!(benches, bench_single_producer, bench_contended, bench_extract);
criterion_main!(benches);
