//! Frozen batches handed from the aggregator to the processor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use trace_context::TraceContext;

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    /// The batch reached the configured size limit on append
    SizeThreshold,
    /// The periodic flush timer fired while the batch was non-empty
    TimerElapsed,
    /// The consumer is shutting down
    ShutdownDrain,
}

impl FlushReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FlushReason::SizeThreshold => "size_threshold",
            FlushReason::TimerElapsed => "timer_elapsed",
            FlushReason::ShutdownDrain => "shutdown_drain",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered, frozen group of message payloads with one trace context per
/// payload (same index).
///
/// Only the aggregator builds batches; each one is processed exactly once.
#[derive(Debug)]
pub struct Batch {
    payloads: Vec<Vec<u8>>,
    links: Vec<TraceContext>,
    created_at: SystemTime,
    reason: FlushReason,
}

impl Batch {
    pub(crate) fn new(
        payloads: Vec<Vec<u8>>,
        links: Vec<TraceContext>,
        created_at: SystemTime,
        reason: FlushReason,
    ) -> Self {
        debug_assert_eq!(payloads.len(), links.len());
        Self {
            payloads,
            links,
            created_at,
            reason,
        }
    }

    /// Payloads in order of arrival.
    pub fn payloads(&self) -> &[Vec<u8>] {
        &self.payloads
    }

    /// Trace contexts, `links()[i]` belongs to `payloads()[i]`.
    pub fn links(&self) -> &[TraceContext] {
        &self.links
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// When the first message of this batch arrived.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn reason(&self) -> FlushReason {
        self.reason
    }
}
