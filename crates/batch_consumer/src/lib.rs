//! Trace-correlated batch consumer
//!
//! Consumes messages from a queue, groups them into batches flushed by size,
//! by a periodic timer, or on shutdown, and processes each batch as one unit
//! of work. The batch's span links back to the trace of every message in it,
//! so a single report run can be traced to each publisher.
//!
//! # Architecture
//!
//! ```text
//! QueueTransport ──► MessageReceiver ──► BatchAggregator ──► BatchProcessor ──► SpanExporter
//!   (deliveries)     (extract, ack)      (size/time/drain)   (action + span)
//! ```
//!
//! [`BatchConsumer`] owns the tasks and drives start/stop. Delivery is
//! at-most-once: a message is acknowledged as soon as it has been appended to
//! the open batch.
//!
//! Uses native async fn in traits (no `#[async_trait]`); the `*Boxed`
//! traits provide object safety where a `dyn` handle is needed.

pub mod aggregator;
pub mod batch;
pub mod config;
pub mod exporter;
mod invariants;
pub mod lifecycle;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod processor;
pub mod receiver;
pub mod sampler;
pub mod span;
pub mod tags;
pub mod transport;

// Re-export main types
pub use aggregator::{AggregatorError, BatchAggregator, BatchSink, CollectingSink};
pub use batch::{Batch, FlushReason};
pub use config::{
    load_config, BatchConfig, ConfigError, ConsumerConfig, IntakeConfig, LoggingConfig, ProcessingConfig,
};
pub use exporter::{
    run_span_export, ExportError, InMemoryExporter, JsonFileExporter, NullExporter, SpanExporter, SpanExporterBoxed,
    StdoutExporter, MAX_EXPORT_BATCH_SIZE,
};
pub use lifecycle::{BatchConsumer, ConsumerError, ConsumerReport, ConsumerState};
pub use logging::init_logging;
pub use message::{Delivery, IncomingMessage};
pub use metrics::{ConsumerMetrics, MetricsSnapshot};
pub use processor::{
    run_worker, ActionError, BatchAction, BatchActionBoxed, BatchFailure, BatchProcessor, FnAction, LogAction,
    DEFAULT_OPERATION_NAME,
};
pub use receiver::{MessageReceiver, ReceiveError};
pub use sampler::{sampler_for_rate, AlwaysOff, AlwaysOn, RateSampler, Sampler};
pub use span::{AttributeValue, Span, SpanBatch, SpanEvent, SpanKind, SpanLink, SpanStatus};
pub use transport::{DeliveryStream, InMemoryTransport, QueueTransport, TransportError};

pub use trace_context;
