//! In-memory transport for the Courier messaging middleware.
//!
//! In-process delivery with no external dependencies: publishes are
//! dispatched inline to the broker's handlers, which preserves
//! per-publisher publish order by construction. Used for tests, local
//! development and single-process deployments.
//!
//! Acknowledgement is instant: there is no redelivery machinery, so the
//! ack capability is a delivery counter and `reject(requeue: true)`
//! re-dispatches the envelope once with an incremented retry count.
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_core::base::CoreBroker;
//! use courier_core::broker::BrokerExt;
//! use courier_memory::InMemoryTransport;
//!
//! let broker = CoreBroker::new(InMemoryTransport::new());
//! broker.subscribe::<OrderPlaced, _, _>(handler, Default::default()).await?;
//! broker.publish(&order, Default::default()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use courier_core::broker::{BrokerFuture, Dispatcher, SubscriptionInfo, Transport};
use courier_core::context::MessageContext;
use courier_core::message::Envelope;
use courier_core::options::PublishOptions;

/// Delivery counters exposed for tests and health checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InMemoryCounters {
    /// Envelopes published.
    pub published: u64,
    /// Envelopes dropped because nothing was subscribed yet.
    pub dropped: u64,
    /// Acknowledgements observed.
    pub acked: u64,
    /// Rejections observed.
    pub rejected: u64,
}

/// In-process transport.
#[derive(Default)]
pub struct InMemoryTransport {
    dispatcher: RwLock<Option<Dispatcher>>,
    subscriptions: AtomicUsize,
    published: AtomicU64,
    dropped: AtomicU64,
    acked: Arc<AtomicU64>,
    rejected: Arc<AtomicU64>,
}

impl InMemoryTransport {
    /// Create a transport with no subscriptions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current delivery counters.
    #[must_use]
    pub fn counters(&self) -> InMemoryCounters {
        InMemoryCounters {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::Relaxed)
    }

    fn context_for(
        &self,
        envelope: &Envelope,
        options: &PublishOptions,
        dispatcher: Dispatcher,
        retry_count: u32,
    ) -> MessageContext {
        let mut context = MessageContext::from_envelope(envelope).with_retry_count(retry_count);
        if let Some(routing_key) = &options.routing_key {
            context = context.with_routing_key(routing_key.clone());
        }
        if let Some(exchange) = &options.exchange {
            context = context.with_exchange(exchange.clone());
        }

        let acked = Arc::clone(&self.acked);
        context = context.with_ack(Arc::new(move || {
            let acked = Arc::clone(&acked);
            Box::pin(async move {
                acked.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        }));

        // Reject with requeue re-dispatches once, off the caller's path.
        let rejected = Arc::clone(&self.rejected);
        let envelope_for_requeue = envelope.clone();
        let options_for_requeue = options.clone();
        context.with_reject(Arc::new(move |requeue| {
            let rejected = Arc::clone(&rejected);
            let dispatcher = dispatcher.clone();
            let envelope = envelope_for_requeue.clone();
            let options = options_for_requeue.clone();
            Box::pin(async move {
                rejected.fetch_add(1, Ordering::Relaxed);
                if requeue && retry_count == 0 {
                    let mut context = MessageContext::from_envelope(&envelope)
                        .with_retry_count(retry_count + 1);
                    if let Some(routing_key) = &options.routing_key {
                        context = context.with_routing_key(routing_key.clone());
                    }
                    tokio::spawn(async move {
                        let _ = dispatcher.dispatch(envelope, context).await;
                    });
                }
                Ok(())
            })
        }))
    }
}

impl Transport for InMemoryTransport {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    fn publish_internal(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.published.fetch_add(1, Ordering::Relaxed);
            let dispatcher = self.dispatcher.read().await.clone();
            let Some(dispatcher) = dispatcher else {
                // Nothing subscribed yet; in-process delivery has nowhere
                // to buffer.
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    message_type = %envelope.message_type,
                    "No subscribers, dropping in-memory publish"
                );
                return Ok(());
            };

            let context = self.context_for(&envelope, &options, dispatcher.clone(), 0);
            // Inline dispatch keeps per-publisher order.
            dispatcher.dispatch(envelope, context).await
        })
    }

    fn subscribe_internal(
        &self,
        subscription: &SubscriptionInfo,
        dispatcher: Dispatcher,
    ) -> BrokerFuture<'_, ()> {
        debug!(message_type = %subscription.message_type, "In-memory subscription");
        self.subscriptions.fetch_add(1, Ordering::Relaxed);
        Box::pin(async move {
            *self.dispatcher.write().await = Some(dispatcher);
            Ok(())
        })
    }

    fn start_internal(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn stop_internal(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}
