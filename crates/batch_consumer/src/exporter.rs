//! Telemetry sink: where finished spans go.
//!
//! Aggregate batch spans are exported by the processing worker. Consumer
//! spans are finished on the intake path, which must not wait on the sink, so
//! they are queued to [`run_span_export`] and exported from its own task.

use crate::metrics::ConsumerMetrics;
use crate::span::{Span, SpanBatch};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// Most spans handed to the exporter in one call by [`run_span_export`].
pub const MAX_EXPORT_BATCH_SIZE: usize = 512;

/// Error types for span export operations
#[derive(Debug, Error, Clone)]
pub enum ExportError {
    /// Transport-layer error (network, file, gRPC, HTTP)
    #[error("transport error: {0}")]
    Transport(String),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Export operation timed out
    #[error("export operation timed out")]
    Timeout,
}

/// Trait for exporting span batches to various backends.
///
/// Uses native async fn in traits instead of `#[async_trait]`.
///
/// # Note on Object Safety
///
/// This trait uses `impl Future` return types which are not object-safe.
/// For dynamic dispatch, use `Arc<dyn SpanExporterBoxed>`; every
/// `SpanExporter` gets it through the blanket impl.
pub trait SpanExporter: Send + Sync {
    /// Exports a batch of spans.
    fn export(&self, batch: SpanBatch) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of SpanExporter for dynamic dispatch.
pub trait SpanExporterBoxed: Send + Sync {
    /// Exports a batch of spans (boxed future for object safety).
    fn export_boxed(
        &self,
        batch: SpanBatch,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>>;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Blanket implementation: any SpanExporter can be used as SpanExporterBoxed
impl<T: SpanExporter> SpanExporterBoxed for T {
    fn export_boxed(
        &self,
        batch: SpanBatch,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>> {
        Box::pin(self.export(batch))
    }

    fn name(&self) -> &str {
        SpanExporter::name(self)
    }
}

/// Stdout exporter for local runs and debugging
pub struct StdoutExporter {
    verbose: bool,
}

impl StdoutExporter {
    /// Creates a new stdout exporter
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl SpanExporter for StdoutExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        if self.verbose {
            for span in &batch.spans {
                println!(
                    "span: trace_id={} span_id={} parent={} name={:?} kind={:?} links={} duration={}ns status={:?}",
                    span.trace_id,
                    span.span_id,
                    span.parent_span_id,
                    span.name,
                    span.kind,
                    span.links.len(),
                    span.duration_nanos(),
                    span.status
                );
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

/// JSON-lines file exporter for local development.
///
/// Each span is appended as one JSON object per line.
pub struct JsonFileExporter {
    file_path: String,
}

impl JsonFileExporter {
    /// Creates a new JSON file exporter
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }
}

impl SpanExporter for JsonFileExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        let mut lines = String::new();
        for span in &batch.spans {
            let json =
                serde_json::to_string(span).map_err(|e| ExportError::Serialization(e.to_string()))?;
            lines.push_str(&json);
            lines.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        file.write_all(lines.as_bytes())
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;

        Ok(())
    }

    fn name(&self) -> &str {
        "json_file"
    }
}

/// Null exporter that discards all spans (for benchmarking)
pub struct NullExporter;

impl NullExporter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanExporter for NullExporter {
    async fn export(&self, _batch: SpanBatch) -> Result<(), ExportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Exporter that keeps every span in memory, for tests and the demo.
#[derive(Default)]
pub struct InMemoryExporter {
    spans: Mutex<Vec<Span>>,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exported_count(&self) -> usize {
        self.lock().len()
    }

    pub fn all_spans(&self) -> Vec<Span> {
        self.lock().clone()
    }

    /// Spans with the given operation name, in export order.
    pub fn spans_named(&self, name: &str) -> Vec<Span> {
        self.lock().iter().filter(|s| s.name == name).cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Span>> {
        self.spans.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl SpanExporter for InMemoryExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        self.lock().extend(batch.spans);
        Ok(())
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}

/// Exports queued spans until every sender is gone.
///
/// Whatever is already queued when the task wakes up goes out in one
/// [`SpanBatch`], up to [`MAX_EXPORT_BATCH_SIZE`] spans. Export errors are
/// logged and counted; the spans are not retried.
pub async fn run_span_export(
    exporter: Arc<dyn SpanExporterBoxed>,
    mut spans: mpsc::UnboundedReceiver<Span>,
    metrics: Arc<ConsumerMetrics>,
) {
    while let Some(first) = spans.recv().await {
        let mut batch = SpanBatch::new();
        batch.add(first);
        while batch.len() < MAX_EXPORT_BATCH_SIZE {
            match spans.try_recv() {
                Ok(span) => batch.add(span),
                Err(_) => break,
            }
        }

        let count = batch.len() as u64;
        match exporter.export_boxed(batch).await {
            Ok(()) => metrics.record_spans_exported(count),
            Err(e) => {
                metrics.record_span_export_error();
                tracing::warn!(exporter = exporter.name(), spans = count, error = %e, "span export failed");
            }
        }
    }
    tracing::debug!("span queue closed, span export task exiting");
}

/// Exporter that always fails, for error-path testing
#[cfg(test)]
pub struct FailingExporter;

#[cfg(test)]
impl SpanExporter for FailingExporter {
    async fn export(&self, _batch: SpanBatch) -> Result<(), ExportError> {
        Err(ExportError::Transport("collector unreachable".to_string()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::SpanKind;

    #[tokio::test]
    async fn test_stdout_exporter() {
        let exporter = StdoutExporter::new(false);
        let mut batch = SpanBatch::new();
        batch.add(Span::root("test", SpanKind::Internal));

        let result = exporter.export(batch).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_in_memory_exporter() {
        let exporter = InMemoryExporter::new();
        let mut batch = SpanBatch::new();

        for i in 0..10 {
            batch.add(Span::root(format!("op-{}", i % 2), SpanKind::Internal));
        }

        exporter.export(batch).await.unwrap();
        assert_eq!(exporter.exported_count(), 10);
        assert_eq!(exporter.spans_named("op-0").len(), 5);
    }

    #[tokio::test]
    async fn test_json_file_exporter_appends_lines() {
        let path = std::env::temp_dir().join(format!("batch-consumer-{}.jsonl", rand::random::<u64>()));
        let exporter = JsonFileExporter::new(path.to_string_lossy().into_owned());

        for _ in 0..2 {
            let batch = SpanBatch::with_spans(vec![Span::root("Report Process", SpanKind::Internal)]);
            exporter.export(batch).await.unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        for line in contents.lines() {
            let span: Span = serde_json::from_str(line).unwrap();
            assert_eq!(span.name, "Report Process");
        }
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_span_export_task_drains_queue_then_exits() {
        let exporter = Arc::new(InMemoryExporter::new());
        let metrics = Arc::new(ConsumerMetrics::new());
        let (tx, rx) = mpsc::unbounded_channel();

        for i in 0..3 {
            tx.send(Span::root(format!("client.created {}", i), SpanKind::Consumer)).unwrap();
        }
        drop(tx);
        run_span_export(exporter.clone(), rx, Arc::clone(&metrics)).await;

        assert_eq!(exporter.exported_count(), 3);
        assert_eq!(metrics.snapshot().spans_exported, 3);
    }

    #[tokio::test]
    async fn test_span_export_task_counts_failures() {
        let metrics = Arc::new(ConsumerMetrics::new());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Span::root("lost", SpanKind::Consumer)).unwrap();
        drop(tx);

        run_span_export(Arc::new(FailingExporter), rx, Arc::clone(&metrics)).await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.spans_exported, 0);
        assert_eq!(snapshot.span_export_errors, 1);
    }

    #[tokio::test]
    async fn test_boxed_dispatch() {
        let exporter: std::sync::Arc<dyn SpanExporterBoxed> = std::sync::Arc::new(NullExporter::new());
        assert_eq!(exporter.name(), "null");
        assert!(exporter.export_boxed(SpanBatch::new()).await.is_ok());
    }
}
