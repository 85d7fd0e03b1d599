//! Batch Processor - one aggregate operation per flushed batch.
//!
//! For every batch the processor opens a single span that *links* to the
//! trace context of each contributing message (links, not parents: the
//! batch summarises many messages and is caused by none of them alone),
//! runs the configured [`BatchAction`] over the payloads, and hands the
//! finished span to the telemetry sink.
//!
//! Failures are all-or-nothing per batch and are never retried: the span is
//! marked failed, the error is returned, and the batch is discarded.
//!
//! # Ordering
//!
//! [`run_worker`] consumes flushed batches from a single queue, so batches
//! are processed one at a time in flush order.

use crate::batch::{Batch, FlushReason};
use crate::exporter::SpanExporterBoxed;
use crate::metrics::ConsumerMetrics;
use crate::sampler::{AlwaysOn, Sampler};
use crate::span::{Span, SpanBatch, SpanKind, SpanLink, SpanStatus};
use crate::tags;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::Instrument;

/// Default name of the aggregate span.
pub const DEFAULT_OPERATION_NAME: &str = "Report Process";

/// Error returned by a [`BatchAction`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// The action reported a failure
    #[error("{0}")]
    Failed(String),
    /// The action did not finish within the configured limit
    #[error("batch action timed out after {0:?}")]
    Timeout(Duration),
}

impl ActionError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A batch whose action failed. Sent to the consumer's failure channel.
#[derive(Debug, Clone, Error)]
#[error("{reason} batch of {size} messages failed")]
pub struct BatchFailure {
    pub reason: FlushReason,
    pub size: usize,
    #[source]
    pub error: ActionError,
}

/// The downstream work done for each batch.
///
/// Uses native async fn in traits. Receives the payloads in arrival order.
pub trait BatchAction: Send + Sync {
    fn execute(&self, payloads: &[Vec<u8>]) -> impl Future<Output = Result<(), ActionError>> + Send;

    /// Returns the action name for logs.
    fn name(&self) -> &str;
}

/// Object-safe version of BatchAction for dynamic dispatch.
pub trait BatchActionBoxed: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        payloads: &'a [Vec<u8>],
    ) -> Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send + 'a>>;

    fn name(&self) -> &str;
}

/// Blanket implementation: any BatchAction can be used as BatchActionBoxed
impl<T: BatchAction> BatchActionBoxed for T {
    fn execute_boxed<'a>(
        &'a self,
        payloads: &'a [Vec<u8>],
    ) -> Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send + 'a>> {
        Box::pin(self.execute(payloads))
    }

    fn name(&self) -> &str {
        BatchAction::name(self)
    }
}

/// Logs the batch size and every payload as (lossy) UTF-8.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAction;

impl BatchAction for LogAction {
    async fn execute(&self, payloads: &[Vec<u8>]) -> Result<(), ActionError> {
        tracing::info!(messages = payloads.len(), "processing batch");
        for payload in payloads {
            tracing::info!(payload = %String::from_utf8_lossy(payload), "batch message");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Adapts a synchronous closure into a [`BatchAction`].
pub struct FnAction<F> {
    name: String,
    f: F,
}

impl<F> FnAction<F>
where
    F: Fn(&[Vec<u8>]) -> Result<(), ActionError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> BatchAction for FnAction<F>
where
    F: Fn(&[Vec<u8>]) -> Result<(), ActionError> + Send + Sync,
{
    async fn execute(&self, payloads: &[Vec<u8>]) -> Result<(), ActionError> {
        (self.f)(payloads)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Runs the batch action for one batch and records its aggregate span.
pub struct BatchProcessor {
    action: Arc<dyn BatchActionBoxed>,
    exporter: Arc<dyn SpanExporterBoxed>,
    sampler: Arc<dyn Sampler>,
    operation_name: String,
    action_timeout: Option<Duration>,
    metrics: Arc<ConsumerMetrics>,
}

impl BatchProcessor {
    pub fn new(action: Arc<dyn BatchActionBoxed>, exporter: Arc<dyn SpanExporterBoxed>) -> Self {
        Self {
            action,
            exporter,
            sampler: Arc::new(AlwaysOn),
            operation_name: DEFAULT_OPERATION_NAME.to_string(),
            action_timeout: None,
            metrics: Arc::new(ConsumerMetrics::new()),
        }
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = name.into();
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_action_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ConsumerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<ConsumerMetrics> {
        &self.metrics
    }

    /// Processes one batch.
    ///
    /// The span is exported (if sampled) whether or not the action succeeds;
    /// export errors are logged and counted but never fail the batch.
    pub async fn process(&self, batch: Batch) -> Result<(), BatchFailure> {
        let reason = batch.reason();
        let size = batch.len();
        let mut span = self.start_span(&batch);

        let result = self
            .run_action(batch.payloads())
            .instrument(tracing::info_span!(
                "batch.process",
                action = self.action.name(),
                size,
                reason = %reason
            ))
            .await;

        match &result {
            Ok(()) => span.finish(SpanStatus::Ok),
            Err(e) => span.record_error(e),
        }
        self.export(span).await;

        match result {
            Ok(()) => {
                self.metrics.record_processed(size as u64);
                tracing::info!(size, reason = %reason, "batch processed");
                Ok(())
            }
            Err(error) => {
                self.metrics.record_failed();
                tracing::error!(size, reason = %reason, error = %error, "batch action failed, batch discarded");
                Err(BatchFailure { reason, size, error })
            }
        }
    }

    fn start_span(&self, batch: &Batch) -> Span {
        let mut span = Span::root(self.operation_name.as_str(), SpanKind::Internal);
        span.set_sampled(self.sampler.should_sample(None));

        let mut unlinked = 0usize;
        for cx in batch.links() {
            if cx.is_valid() {
                span.add_link(SpanLink::from_context(cx));
            } else {
                unlinked += 1;
            }
        }

        span.set_attribute(tags::MESSAGING_BATCH_MESSAGE_COUNT, batch.len());
        span.set_attribute(tags::BATCH_FLUSH_REASON, batch.reason().as_str());
        let age = batch.created_at().elapsed().unwrap_or_default();
        span.set_attribute(tags::BATCH_AGE_MS, i64::try_from(age.as_millis()).unwrap_or(i64::MAX));
        if unlinked > 0 {
            span.set_attribute(tags::BATCH_UNLINKED_MESSAGES, unlinked);
        }
        span
    }

    async fn run_action(&self, payloads: &[Vec<u8>]) -> Result<(), ActionError> {
        match self.action_timeout {
            Some(limit) => tokio::time::timeout(limit, self.action.execute_boxed(payloads))
                .await
                .unwrap_or(Err(ActionError::Timeout(limit))),
            None => self.action.execute_boxed(payloads).await,
        }
    }

    async fn export(&self, span: Span) {
        if !span.is_sampled() {
            return;
        }
        match self.exporter.export_boxed(SpanBatch::with_spans(vec![span])).await {
            Ok(()) => self.metrics.record_spans_exported(1),
            Err(e) => {
                self.metrics.record_span_export_error();
                tracing::warn!(exporter = self.exporter.name(), error = %e, "span export failed");
            }
        }
    }
}

/// Processes batches one at a time until the batch queue closes.
///
/// The queue closes when the aggregator drains and drops its sender, so
/// this returns only after the final batch has been processed.
pub async fn run_worker(
    processor: Arc<BatchProcessor>,
    mut batches: mpsc::UnboundedReceiver<Batch>,
    failures: mpsc::UnboundedSender<BatchFailure>,
) {
    while let Some(batch) = batches.recv().await {
        if let Err(failure) = processor.process(batch).await {
            // Nobody listening for failures is fine, they are already logged
            let _ = failures.send(failure);
        }
    }
    tracing::debug!("batch queue closed, processing worker exiting");
}
