//! Batch Aggregator - the single open batch and its flush policy.
//!
//! Every message lands in exactly one batch. Three entry points mutate the
//! open batch, all under one mutex:
//!
//! | Operation         | Flushes when                          | Reason          |
//! |-------------------|---------------------------------------|-----------------|
//! | `append()`        | size reaches `batch_size_limit`       | `SizeThreshold` |
//! | `flush_expired()` | first message has waited `max_age`    | `TimerElapsed`  |
//! | `timer_tick()`    | batch is non-empty                    | `TimerElapsed`  |
//! | `drain()`         | batch is non-empty (then closes)      | `ShutdownDrain` |
//!
//! The size check runs inside every `append`, so a full batch is always
//! flushed before a timer tick can see it and no batch ever exceeds the limit.
//! Every flush starts a fresh batch, so the age used by `flush_expired` is
//! always measured from the first message of the current batch.
//!
//! # Swap, then process
//!
//! A flush swaps in a fresh buffer and hands the frozen [`Batch`] to a
//! [`BatchSink`] while still holding the lock; the sink must not block. The
//! (possibly slow) batch action runs elsewhere, after the lock is released,
//! so intake keeps filling the new batch while the old one is processed.
//! Dispatching under the lock keeps batches in flush order.

use crate::batch::{Batch, FlushReason};
use crate::invariants::{
    debug_assert_links_paired, debug_assert_nonempty_flush, debug_assert_within_limit,
};
use crate::message::IncomingMessage;
use crate::metrics::ConsumerMetrics;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use trace_context::TraceContext;

/// Errors surfaced by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AggregatorError {
    /// `drain()` already ran; the consumer no longer accepts messages.
    #[error("aggregator is closed, consumer is not accepting messages")]
    Closed,

    /// The batch could not be handed off because the processor is gone.
    #[error("batch processor unavailable, {dropped} messages dropped")]
    ProcessorUnavailable { dropped: usize },
}

impl AggregatorError {
    /// Returns `true` if the aggregator will reject all further work.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Receiving end of flushed batches.
///
/// Called with the aggregator lock held, so implementations must return
/// promptly and never wait on batch processing.
pub trait BatchSink: Send + Sync {
    /// Hands `batch` off, or returns it if the receiver is gone.
    fn dispatch(&self, batch: Batch) -> Result<(), Batch>;
}

impl BatchSink for mpsc::UnboundedSender<Batch> {
    fn dispatch(&self, batch: Batch) -> Result<(), Batch> {
        self.send(batch).map_err(|e| e.0)
    }
}

/// Sink that keeps flushed batches in memory, in flush order.
///
/// Useful for driving the aggregator without a processor, e.g. in tests.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    batches: Arc<Mutex<Vec<Batch>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything flushed so far.
    pub fn take(&self) -> Vec<Batch> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Batch>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BatchSink for CollectingSink {
    fn dispatch(&self, batch: Batch) -> Result<(), Batch> {
        self.lock().push(batch);
        Ok(())
    }
}

/// Upper bound on the buffer space reserved up front for a new batch.
///
/// Larger batches grow on demand.
const MAX_PREALLOCATED: usize = 1024;

/// The batch currently accepting appends.
struct OpenBatch {
    payloads: Vec<Vec<u8>>,
    links: Vec<TraceContext>,
    /// Wall-clock time the first message arrived
    created_at: Option<SystemTime>,
    /// Monotonic time the batch became non-empty (timer baseline)
    opened_at: Option<Instant>,
}

impl OpenBatch {
    fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_PREALLOCATED);
        Self {
            payloads: Vec::with_capacity(capacity),
            links: Vec::with_capacity(capacity),
            created_at: None,
            opened_at: None,
        }
    }

    fn push(&mut self, message: IncomingMessage) {
        if self.payloads.is_empty() {
            self.created_at = Some(SystemTime::now());
            self.opened_at = Some(Instant::now());
        }
        self.payloads.push(message.payload);
        self.links.push(message.context);

        debug_assert_links_paired!(self.payloads.len(), self.links.len());
    }

    #[inline]
    fn len(&self) -> usize {
        self.payloads.len()
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Swaps in a fresh buffer and returns the frozen batch.
    fn freeze(&mut self, reason: FlushReason, next_capacity: usize) -> Batch {
        let frozen = std::mem::replace(self, OpenBatch::with_capacity(next_capacity));

        debug_assert_links_paired!(frozen.payloads.len(), frozen.links.len());

        Batch::new(
            frozen.payloads,
            frozen.links,
            frozen.created_at.unwrap_or_else(SystemTime::now),
            reason,
        )
    }
}

struct State<S> {
    open: OpenBatch,
    /// `None` once drained: the aggregator is closed and the sink dropped
    sink: Option<S>,
}

/// Owns the single open batch of one consumer instance.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct BatchAggregator<S = mpsc::UnboundedSender<Batch>> {
    state: Mutex<State<S>>,
    batch_size_limit: usize,
    metrics: Arc<ConsumerMetrics>,
    /// Signalled when an empty batch receives its first message
    opened: Notify,
}

impl<S: BatchSink> BatchAggregator<S> {
    /// Creates an aggregator flushing at `batch_size_limit` messages (minimum 1).
    pub fn new(batch_size_limit: usize, sink: S) -> Self {
        Self::with_metrics(batch_size_limit, sink, Arc::new(ConsumerMetrics::new()))
    }

    pub fn with_metrics(batch_size_limit: usize, sink: S, metrics: Arc<ConsumerMetrics>) -> Self {
        let batch_size_limit = batch_size_limit.max(1);
        Self {
            state: Mutex::new(State {
                open: OpenBatch::with_capacity(batch_size_limit),
                sink: Some(sink),
            }),
            batch_size_limit,
            metrics,
            opened: Notify::new(),
        }
    }

    /// Adds a message to the open batch, flushing it if it is now full.
    ///
    /// Returns the size of the flushed batch, if this append caused one.
    pub fn append(&self, message: IncomingMessage) -> Result<Option<usize>, AggregatorError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.sink.is_none() {
            self.metrics.record_rejected();
            return Err(AggregatorError::Closed);
        }

        let was_empty = state.open.is_empty();
        state.open.push(message);
        self.metrics.record_appended();
        if was_empty {
            self.opened.notify_one();
        }

        if state.open.len() < self.batch_size_limit {
            return Ok(None);
        }
        self.flush_locked(state, FlushReason::SizeThreshold).map(Some)
    }

    /// Flushes the open batch if it holds anything. No-op when empty or closed.
    pub fn timer_tick(&self) -> Result<Option<usize>, AggregatorError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.sink.is_none() || state.open.is_empty() {
            return Ok(None);
        }
        self.flush_locked(state, FlushReason::TimerElapsed).map(Some)
    }

    /// Flushes the open batch if its first message arrived at least `max_age` ago.
    ///
    /// A batch flushed by size in the meantime is replaced by a younger one,
    /// which is left alone.
    pub fn flush_expired(&self, max_age: Duration) -> Result<Option<usize>, AggregatorError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let expired = state.open.opened_at.is_some_and(|t| t.elapsed() >= max_age);
        if state.sink.is_none() || !expired {
            return Ok(None);
        }
        self.flush_locked(state, FlushReason::TimerElapsed).map(Some)
    }

    /// Flushes any remaining messages and closes the aggregator.
    ///
    /// Subsequent `append` calls fail with [`AggregatorError::Closed`].
    /// Dropping the sink here is what lets the processing side observe the
    /// end of the batch stream. Calling `drain` again is a no-op.
    pub fn drain(&self) -> Result<Option<usize>, AggregatorError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.sink.is_none() {
            return Ok(None);
        }

        let result = if state.open.is_empty() {
            Ok(None)
        } else {
            self.flush_locked(state, FlushReason::ShutdownDrain).map(Some)
        };

        state.sink = None;
        tracing::debug!("aggregator closed");
        result
    }

    /// Number of messages in the open batch.
    pub fn pending_len(&self) -> usize {
        self.lock().open.len()
    }

    /// Number of trace links in the open batch; always equals `pending_len`.
    pub fn pending_links(&self) -> usize {
        self.lock().open.links.len()
    }

    /// How long the oldest message in the open batch has been waiting.
    pub fn oldest_pending_age(&self) -> Option<Duration> {
        self.pending_since().map(|t| t.elapsed())
    }

    /// When the open batch received its first message; `None` while empty.
    pub fn pending_since(&self) -> Option<Instant> {
        self.lock().open.opened_at
    }

    /// Resolves once the open batch holds at least one message.
    ///
    /// May also resolve early after a batch was opened and flushed again, so
    /// callers re-check [`pending_since`](Self::pending_since).
    pub async fn wait_for_pending(&self) {
        if self.pending_since().is_some() {
            return;
        }
        self.opened.notified().await;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().sink.is_none()
    }

    pub fn batch_size_limit(&self) -> usize {
        self.batch_size_limit
    }

    pub fn metrics(&self) -> &Arc<ConsumerMetrics> {
        &self.metrics
    }

    fn flush_locked(&self, state: &mut State<S>, reason: FlushReason) -> Result<usize, AggregatorError> {
        let Some(sink) = state.sink.as_ref() else {
            return Err(AggregatorError::Closed);
        };

        let batch = state.open.freeze(reason, self.batch_size_limit);
        let size = batch.len();

        debug_assert_nonempty_flush!(size, reason);
        debug_assert_within_limit!(size, self.batch_size_limit);

        match sink.dispatch(batch) {
            Ok(()) => {
                self.metrics.record_flush(reason);
                tracing::debug!(size, reason = %reason, "batch flushed");
                Ok(size)
            }
            Err(lost) => {
                self.metrics.record_dropped(lost.len() as u64);
                tracing::error!(size, reason = %reason, "batch processor gone, batch dropped");
                Err(AggregatorError::ProcessorUnavailable { dropped: size })
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
