//! End-to-end demo: traced publishers, one batch consumer, in-memory broker.
//!
//! Run with: `cargo run -p batch_consumer --bin demo -- --messages 250 --publishers 4`

use anyhow::Context;
use batch_consumer::trace_context::{Baggage, TraceContext};
use batch_consumer::{
    init_logging, load_config, BatchActionBoxed, BatchConsumer, ConsumerConfig, FnAction, InMemoryExporter,
    InMemoryTransport, LogAction,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

#[derive(Parser)]
#[command(name = "demo")]
#[command(about = "Publish traced messages and consume them in linked batches", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Messages per publisher
    #[arg(short, long, default_value_t = 250)]
    messages: usize,

    /// Concurrent publishers
    #[arg(short, long, default_value_t = 4)]
    publishers: usize,

    /// Overrides batch.batch_size_limit
    #[arg(long)]
    batch_size: Option<usize>,

    /// Overrides batch.batch_timeout_ms
    #[arg(long)]
    batch_timeout_ms: Option<u64>,

    /// Log every payload of every batch
    #[arg(long)]
    print_payloads: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path).with_context(|| format!("loading {}", path.display()))?,
        None => ConsumerConfig::default().with_batch_timeout(Duration::from_millis(500)),
    };
    if let Some(size) = cli.batch_size {
        config = config.with_batch_size_limit(size);
    }
    if let Some(ms) = cli.batch_timeout_ms {
        config = config.with_batch_timeout(Duration::from_millis(ms));
    }
    init_logging(&config.logging);

    println!("=== Batch Consumer Demo ===\n");
    println!("Configuration:");
    println!("  Queue: {}", config.queue);
    println!("  Batch size limit: {}", config.batch.batch_size_limit);
    println!("  Batch timeout: {:?}", config.batch.batch_timeout());
    println!("  Publishers: {} x {} messages\n", cli.publishers, cli.messages);

    let transport = Arc::new(InMemoryTransport::new());
    let exporter = Arc::new(InMemoryExporter::new());
    let processed = Arc::new(AtomicU64::new(0));

    let action: Arc<dyn BatchActionBoxed> = if cli.print_payloads {
        Arc::new(LogAction)
    } else {
        let processed = Arc::clone(&processed);
        Arc::new(FnAction::new("count", move |payloads: &[Vec<u8>]| {
            processed.fetch_add(payloads.len() as u64, Ordering::Relaxed);
            Ok(())
        }))
    };

    let consumer = Arc::new(BatchConsumer::new(
        config,
        Arc::clone(&transport),
        action,
        exporter.clone(),
    ));

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let runner = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move {
            consumer
                .run_until(async {
                    let _ = stop_rx.await;
                })
                .await
        })
    };
    while transport.subscriber_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let started = Instant::now();
    let mut publishers = JoinSet::new();
    for id in 0..cli.publishers {
        let transport = Arc::clone(&transport);
        let messages = cli.messages;
        publishers.spawn(async move {
            let client_id = format!("client-{}", id);
            let baggage: Baggage = [("client.id", client_id.as_str())].into_iter().collect();
            for n in 0..messages {
                let cx = TraceContext::new_root().with_baggage(baggage.clone());
                let payload = format!(r#"{{"client":"{}","report":{}}}"#, client_id, n);
                transport.publish_with_context("client.report", payload, &cx);
                if n % 50 == 49 {
                    tokio::task::yield_now().await;
                }
            }
        });
    }
    while let Some(joined) = publishers.join_next().await {
        joined.context("publisher task failed")?;
    }

    let total = cli.publishers * cli.messages;
    let deadline = Instant::now() + Duration::from_secs(10);
    while transport.acked().len() < total && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let _ = stop_tx.send(());
    let report = runner.await.context("consumer task failed")??;
    let elapsed = started.elapsed();

    let batch_spans = exporter.spans_named(&consumer.config().processing.operation_name);
    let links: usize = batch_spans.iter().map(|s| s.links.len()).sum();

    println!("Results:");
    println!("  Published: {}", total);
    println!("  Acknowledged: {}", transport.acked().len());
    println!("  Received: {}", report.metrics.messages_received);
    println!(
        "  Flushes: {} (size {}, timer {}, drain {})",
        report.metrics.flushes(),
        report.metrics.size_flushes,
        report.metrics.timer_flushes,
        report.metrics.drain_flushes
    );
    println!("  Batches processed: {}", report.metrics.batches_processed);
    println!("  Batches failed: {}", report.metrics.batches_failed);
    if !cli.print_payloads {
        println!("  Messages processed by action: {}", processed.load(Ordering::Relaxed));
    }
    println!("  Batch spans: {} with {} links", batch_spans.len(), links);
    println!("  Spans exported: {}", report.metrics.spans_exported);
    println!("  Elapsed: {:?}", elapsed);

    println!("\nMetrics:\n{}", serde_json::to_string_pretty(&report.metrics)?);
    Ok(())
}
