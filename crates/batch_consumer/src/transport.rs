//! Queue Transport boundary.
//!
//! The consumer does not talk to a broker itself. A [`QueueTransport`]
//! subscribes to a queue, yields [`Delivery`] values as a stream, and accepts
//! acknowledgments. Dropping the stream unsubscribes. Connection handling,
//! exchange/queue declaration and binding all live behind this trait.
//!
//! [`InMemoryTransport`] is a fanout exchange in process memory: every
//! subscriber sees every published message.

use crate::message::Delivery;
use futures_core::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use trace_context::{Carrier, Propagator, TraceContext, W3cPropagator};

/// Stream of deliveries for one subscription. Ends when the transport goes away.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Errors reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("subscribe to queue {queue:?} failed: {reason}")]
    Subscribe { queue: String, reason: String },

    #[error("ack of delivery {tag} failed: {reason}")]
    Ack { tag: u64, reason: String },

    #[error("transport is closed")]
    Closed,
}

impl TransportError {
    /// Returns `true` if the transport cannot be used any more.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// A message broker connection the consumer can subscribe through.
///
/// Uses native async fn in traits; the consumer is generic over the
/// transport, so no boxed variant is needed.
pub trait QueueTransport: Send + Sync + 'static {
    /// Starts consuming `queue`.
    fn subscribe(&self, queue: &str) -> impl Future<Output = Result<DeliveryStream, TransportError>> + Send;

    /// Acknowledges one delivery.
    fn ack(&self, delivery_tag: u64) -> impl Future<Output = Result<(), TransportError>> + Send;
}

struct Subscriber {
    queue: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct Inner {
    subscribers: Vec<Subscriber>,
    next_tag: u64,
    acked: Vec<u64>,
    closed: bool,
}

/// In-process fanout exchange.
#[derive(Default)]
pub struct InMemoryTransport {
    inner: Mutex<Inner>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a message to every live subscriber. Returns how many got it.
    pub fn publish(&self, routing_key: &str, payload: impl Into<Vec<u8>>, headers: Carrier) -> usize {
        let payload = payload.into();
        let mut inner = self.lock();
        if inner.closed {
            return 0;
        }

        let mut delivered = 0;
        let mut subscribers = std::mem::take(&mut inner.subscribers);
        subscribers.retain(|sub| {
            inner.next_tag += 1;
            let delivery = Delivery {
                delivery_tag: inner.next_tag,
                routing_key: routing_key.to_string(),
                payload: payload.clone(),
                headers: headers.clone(),
            };
            let alive = sub.tx.send(delivery).is_ok();
            if alive {
                delivered += 1;
            } else {
                tracing::debug!(queue = %sub.queue, "dropping closed subscription");
            }
            alive
        });
        inner.subscribers = subscribers;
        delivered
    }

    /// Publishes with `context` injected into the headers, the way an
    /// instrumented publisher would. Header values travel as bytes.
    pub fn publish_with_context(
        &self,
        routing_key: &str,
        payload: impl Into<Vec<u8>>,
        context: &TraceContext,
    ) -> usize {
        let mut headers = Carrier::new();
        W3cPropagator.inject(context, &mut headers);
        self.publish(routing_key, payload, headers.into_byte_values())
    }

    /// Number of subscriptions still attached.
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|sub| !sub.tx.is_closed());
        inner.subscribers.len()
    }

    /// Delivery tags acknowledged so far, in ack order.
    pub fn acked(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }

    /// Ends every delivery stream and rejects new subscriptions.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl QueueTransport for InMemoryTransport {
    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream, TransportError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(TransportError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscribers.push(Subscriber {
            queue: queue.to_string(),
            tx,
        });
        tracing::debug!(queue, subscribers = inner.subscribers.len(), "subscribed");
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(TransportError::Closed);
        }
        inner.acked.push(delivery_tag);
        Ok(())
    }
}
