//! Lifecycle Controller - start, run and stop one consumer instance.
//!
//! A running consumer is three tasks, plus a fourth exporting consumer spans
//! when those are enabled:
//!
//! ```text
//!  transport ──► intake ──► BatchAggregator ──(channel)──► processing worker
//!                  │          ▲
//!                  │          └ flush timer
//!                  └──(channel)──► span export
//! ```
//!
//! The timer sleeps until the open batch's first message is `batch_timeout`
//! old, so every timer flush is of a batch that waited the full timeout.
//!
//! `stop()` stops intake first, then the timer, then drains the aggregator
//! (which closes the batch channel), and finally waits for the worker and
//! the span export task to finish whatever is queued. A batch already being
//! processed is never aborted.

use crate::aggregator::BatchAggregator;
use crate::batch::Batch;
use crate::config::{ConfigError, ConsumerConfig};
use crate::exporter::{run_span_export, SpanExporterBoxed};
use crate::metrics::{ConsumerMetrics, MetricsSnapshot};
use crate::processor::{run_worker, BatchActionBoxed, BatchFailure, BatchProcessor};
use crate::receiver::{MessageReceiver, ReceiveError};
use crate::sampler::{sampler_for_rate, Sampler};
use crate::transport::{DeliveryStream, QueueTransport, TransportError};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};

/// Where a consumer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Stopped,
    Running,
    /// Intake has stopped: either `stop()` is in progress, or the delivery
    /// stream ended and the consumer waits for `stop()` to finish shutdown.
    Draining,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Draining => "draining",
        };
        f.write_str(s)
    }
}

/// Errors from starting or stopping a consumer.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("consumer is already {0}")]
    AlreadyStarted(ConsumerState),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not subscribe: {0}")]
    Subscribe(#[from] TransportError),

    #[error("consumer task failed: {0}")]
    Task(#[from] JoinError),
}

/// Summary returned by [`BatchConsumer::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerReport {
    pub metrics: MetricsSnapshot,
    /// The delivery stream ended on its own before `stop()` was called.
    pub stream_ended: bool,
}

/// Handles of a started consumer.
struct Running {
    shutdown_tx: watch::Sender<bool>,
    stream_ended: watch::Receiver<bool>,
    intake: JoinHandle<()>,
    timer: JoinHandle<()>,
    worker: JoinHandle<()>,
    spans: Option<JoinHandle<()>>,
    aggregator: Arc<BatchAggregator>,
}

/// One consumer instance bound to one queue.
///
/// All methods take `&self`; the consumer can be shared behind an `Arc` so
/// that one task runs it while another stops it.
pub struct BatchConsumer<T: QueueTransport> {
    config: ConsumerConfig,
    transport: Arc<T>,
    action: Arc<dyn BatchActionBoxed>,
    exporter: Arc<dyn SpanExporterBoxed>,
    metrics: Arc<ConsumerMetrics>,
    state: Arc<watch::Sender<ConsumerState>>,
    running: tokio::sync::Mutex<Option<Running>>,
    failures_tx: mpsc::UnboundedSender<BatchFailure>,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<BatchFailure>>>,
}

impl<T: QueueTransport> BatchConsumer<T> {
    pub fn new(
        config: ConsumerConfig,
        transport: Arc<T>,
        action: Arc<dyn BatchActionBoxed>,
        exporter: Arc<dyn SpanExporterBoxed>,
    ) -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConsumerState::Stopped);
        Self {
            config,
            transport,
            action,
            exporter,
            metrics: Arc::new(ConsumerMetrics::new()),
            state: Arc::new(state),
            running: tokio::sync::Mutex::new(None),
            failures_tx,
            failures_rx: Mutex::new(Some(failures_rx)),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Watches state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ConsumerMetrics> {
        &self.metrics
    }

    /// Batches whose action failed, in processing order. Available once.
    pub fn take_failures(&self) -> Option<mpsc::UnboundedReceiver<BatchFailure>> {
        self.failures_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Subscribes and starts the intake, timer and processing tasks.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ConsumerError::AlreadyStarted(self.state()));
        }
        self.config.validate().map_err(ConfigError::Invalid)?;

        let stream = self.transport.subscribe(&self.config.queue).await?;

        let (batch_tx, batch_rx) = mpsc::unbounded_channel::<Batch>();
        let aggregator = Arc::new(BatchAggregator::with_metrics(
            self.config.batch.batch_size_limit,
            batch_tx,
            Arc::clone(&self.metrics),
        ));

        let sampler: Arc<dyn Sampler> = Arc::from(sampler_for_rate(self.config.processing.sampling_rate));
        let processor = BatchProcessor::new(Arc::clone(&self.action), Arc::clone(&self.exporter))
            .with_operation_name(self.config.processing.operation_name.as_str())
            .with_sampler(Arc::clone(&sampler))
            .with_action_timeout(self.config.processing.action_timeout())
            .with_metrics(Arc::clone(&self.metrics));

        let mut receiver = MessageReceiver::new(self.config.queue.as_str(), Arc::clone(&aggregator))
            .with_sampler(sampler);
        let mut spans = None;
        if self.config.processing.record_receive_spans {
            let (span_tx, span_rx) = mpsc::unbounded_channel();
            receiver = receiver.with_receive_spans(span_tx);
            spans = Some(tokio::spawn(run_span_export(
                Arc::clone(&self.exporter),
                span_rx,
                Arc::clone(&self.metrics),
            )));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ended_tx, ended_rx) = watch::channel(false);

        let worker = tokio::spawn(run_worker(Arc::new(processor), batch_rx, self.failures_tx.clone()));
        let intake = tokio::spawn(run_intake(
            stream,
            Arc::new(receiver),
            Arc::clone(&self.transport),
            self.config.intake.max_in_flight_deliveries,
            shutdown_rx.clone(),
            ended_tx,
            Arc::clone(&self.state),
        ));
        let timer = tokio::spawn(run_timer(
            Arc::clone(&aggregator),
            self.config.batch.batch_timeout(),
            shutdown_rx,
        ));

        *running = Some(Running {
            shutdown_tx,
            stream_ended: ended_rx,
            intake,
            timer,
            worker,
            spans,
            aggregator,
        });
        self.state.send_replace(ConsumerState::Running);

        tracing::info!(
            queue = %self.config.queue,
            batch_size_limit = self.config.batch.batch_size_limit,
            batch_timeout_ms = self.config.batch.batch_timeout_ms,
            max_in_flight = self.config.intake.max_in_flight_deliveries,
            "consumer started"
        );
        Ok(())
    }

    /// Stops intake, flushes what is pending and waits for processing to finish.
    ///
    /// Stopping a stopped consumer returns the current metrics.
    pub async fn stop(&self) -> Result<ConsumerReport, ConsumerError> {
        let mut running = self.running.lock().await;
        let Some(handles) = running.take() else {
            return Ok(self.report(false));
        };

        self.state.send_replace(ConsumerState::Draining);
        tracing::info!(queue = %self.config.queue, "consumer draining");

        // Both intake and timer watch the same signal; an error only means they already exited
        let _ = handles.shutdown_tx.send(true);

        let intake = handles.intake.await;
        let stream_ended = *handles.stream_ended.borrow();
        let timer = handles.timer.await;

        match handles.aggregator.drain() {
            Ok(Some(size)) => tracing::info!(size, "final batch flushed"),
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "final flush failed"),
        }

        let worker = handles.worker.await;
        // The intake held the only span sender, so this ends once the queue is empty
        let spans = match handles.spans {
            Some(task) => task.await,
            None => Ok(()),
        };
        self.state.send_replace(ConsumerState::Stopped);

        intake?;
        timer?;
        worker?;
        spans?;

        let report = self.report(stream_ended);
        tracing::info!(
            queue = %self.config.queue,
            received = report.metrics.messages_received,
            batches = report.metrics.batches_processed,
            failed = report.metrics.batches_failed,
            "consumer stopped"
        );
        Ok(report)
    }

    /// Starts, runs until `signal` resolves or the delivery stream ends, then stops.
    pub async fn run_until<F>(&self, signal: F) -> Result<ConsumerReport, ConsumerError>
    where
        F: Future<Output = ()> + Send,
    {
        self.start().await?;

        let ended = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|handles| handles.stream_ended.clone());

        if let Some(ended) = ended {
            tokio::select! {
                () = signal => tracing::info!("shutdown requested"),
                () = wait_for_stream_end(ended) => {}
            }
        }
        self.stop().await
    }

    fn report(&self, stream_ended: bool) -> ConsumerReport {
        ConsumerReport {
            metrics: self.metrics.snapshot(),
            stream_ended,
        }
    }
}

/// Pulls deliveries until shutdown or end of stream.
///
/// With `max_in_flight == 1` each delivery is handled before the next one is
/// pulled. Larger values hand deliveries to a `JoinSet`, bounded by a
/// semaphore. Either way all handlers finish before this returns.
///
/// When the stream ends on its own the consumer moves to `Draining` and the
/// open batch is flushed here; `stop()` completes the shutdown.
async fn run_intake<T: QueueTransport>(
    mut stream: DeliveryStream,
    receiver: Arc<MessageReceiver>,
    transport: Arc<T>,
    max_in_flight: usize,
    mut shutdown: watch::Receiver<bool>,
    ended: watch::Sender<bool>,
    state: Arc<watch::Sender<ConsumerState>>,
) {
    let permits = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let mut handlers: JoinSet<Result<(), ReceiveError>> = JoinSet::new();
    let mut stream_ended = false;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            Some(joined) = handlers.join_next(), if !handlers.is_empty() => log_handler(joined),

            next = stream.next() => {
                let Some(delivery) = next else {
                    stream_ended = true;
                    break;
                };

                if max_in_flight <= 1 {
                    log_handler(Ok(receiver.handle(delivery, &*transport).await));
                    continue;
                }

                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let receiver = Arc::clone(&receiver);
                let transport = Arc::clone(&transport);
                handlers.spawn(async move {
                    let result = receiver.handle(delivery, &*transport).await;
                    drop(permit);
                    result
                });
            }
        }
    }

    // Unsubscribe before waiting, so nothing new is delivered to us
    drop(stream);
    while let Some(joined) = handlers.join_next().await {
        log_handler(joined);
    }

    if stream_ended {
        state.send_replace(ConsumerState::Draining);
        tracing::warn!("delivery stream ended, draining");
        match receiver.aggregator().drain() {
            Ok(Some(size)) => tracing::info!(size, "final batch flushed"),
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "final flush failed"),
        }
        ended.send_replace(true);
    }
    tracing::debug!("intake stopped");
}

async fn wait_for_stream_end(mut ended: watch::Receiver<bool>) {
    while !*ended.borrow_and_update() {
        if ended.changed().await.is_err() {
            return;
        }
    }
}

fn log_handler(joined: Result<Result<(), ReceiveError>, JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        // Already logged by the receiver
        Ok(Err(_)) => {}
        Err(e) => tracing::error!(error = %e, "delivery handler panicked"),
    }
}

/// Flushes the open batch once its first message has waited `max_age`.
///
/// Idles while the batch is empty. After any flush, by size or by time, the
/// next deadline is taken from the next batch's first message.
async fn run_timer(aggregator: Arc<BatchAggregator>, max_age: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        let opened_at = match aggregator.pending_since() {
            Some(opened_at) => opened_at,
            None => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    () = aggregator.wait_for_pending() => {}
                }
                continue;
            }
        };
        let Some(deadline) = opened_at.checked_add(max_age) else {
            // Timeout beyond the clock's range: only size and drain flush
            let _ = shutdown.changed().await;
            break;
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            () = tokio::time::sleep_until(deadline) => {
                match aggregator.flush_expired(max_age) {
                    Ok(Some(size)) => tracing::debug!(size, max_age_ms = max_age.as_millis() as u64, "timer flush"),
                    // Flushed by size in the meantime; re-arm from the new batch
                    Ok(None) => {}
                    Err(e) => tracing::error!(error = %e, "timer flush failed"),
                }
            }
        }
    }
}
