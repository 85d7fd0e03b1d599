//! Consumer counters.
//!
//! Updated from the intake tasks, the timer and the processing worker
//! concurrently, hence atomics. `Relaxed` ordering is enough: the counters
//! are independent and only read for reporting.

use crate::batch::FlushReason;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters shared by every stage of the consumer.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    messages_received: AtomicU64,
    messages_appended: AtomicU64,
    messages_rejected: AtomicU64,
    ack_failures: AtomicU64,
    size_flushes: AtomicU64,
    timer_flushes: AtomicU64,
    drain_flushes: AtomicU64,
    messages_dropped: AtomicU64,
    batches_processed: AtomicU64,
    batches_failed: AtomicU64,
    messages_processed: AtomicU64,
    spans_exported: AtomicU64,
    span_export_errors: AtomicU64,
}

/// Point-in-time copy of [`ConsumerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_appended: u64,
    pub messages_rejected: u64,
    pub ack_failures: u64,
    pub size_flushes: u64,
    pub timer_flushes: u64,
    pub drain_flushes: u64,
    pub messages_dropped: u64,
    pub batches_processed: u64,
    pub batches_failed: u64,
    pub messages_processed: u64,
    pub spans_exported: u64,
    pub span_export_errors: u64,
}

impl MetricsSnapshot {
    /// Total flushes across all reasons.
    pub fn flushes(&self) -> u64 {
        self.size_flushes + self.timer_flushes + self.drain_flushes
    }
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_appended(&self) {
        self.messages_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ack_failure(&self) {
        self.ack_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, reason: FlushReason) {
        let counter = match reason {
            FlushReason::SizeThreshold => &self.size_flushes,
            FlushReason::TimerElapsed => &self.timer_flushes,
            FlushReason::ShutdownDrain => &self.drain_flushes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, messages: u64) {
        self.messages_dropped.fetch_add(messages, Ordering::Relaxed);
    }

    pub(crate) fn record_processed(&self, messages: u64) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        self.messages_processed.fetch_add(messages, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_spans_exported(&self, spans: u64) {
        self.spans_exported.fetch_add(spans, Ordering::Relaxed);
    }

    pub(crate) fn record_span_export_error(&self) {
        self.span_export_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_appended: self.messages_appended.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            size_flushes: self.size_flushes.load(Ordering::Relaxed),
            timer_flushes: self.timer_flushes.load(Ordering::Relaxed),
            drain_flushes: self.drain_flushes.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            spans_exported: self.spans_exported.load(Ordering::Relaxed),
            span_export_errors: self.span_export_errors.load(Ordering::Relaxed),
        }
    }
}
