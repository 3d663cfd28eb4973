//! Broker port, transport port and typed façade.
//!
//! Three surfaces meet here:
//!
//! - [`Transport`] is the narrow port a concrete transport implements:
//!   publish bytes, register a subscription, start and stop. Adapters own
//!   their connections and consumer loops.
//! - [`Broker`] is the uniform composition surface. The base broker
//!   implements it directly; every reliability layer implements it by
//!   wrapping another `Broker`, so a decorator chain is just
//!   `Arc<dyn Broker>` all the way down.
//! - [`BrokerExt`] carries the typed entry points. Serialization happens
//!   here, at the façade, so everything below it operates on envelopes.
//!
//! ```text
//! caller ──publish::<M>()──► BrokerExt ──Envelope──► decorators ──► base ──► Transport
//! wire ──► Transport ──Dispatcher──► base broker ──deserialize──► handlers
//! ```
//!
//! The traits return `Pin<Box<dyn Future>>` instead of `async fn` so they
//! stay dyn-compatible; that is what allows `Arc<dyn Broker>` chains and
//! `Arc<dyn Transport>` adapters.

use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::context::MessageContext;
use crate::error::BrokerError;
use crate::message::{headers, Envelope, Message};
use crate::options::{PublishOptions, SubscriptionOptions};
use crate::serialization::SerializationFormat;

/// Boxed future returned by the broker and transport ports.
pub type BrokerFuture<'a, T> = BoxFuture<'a, Result<T, BrokerError>>;

/// Type-erased handler stored in the subscription registry.
pub type ErasedHandler =
    Arc<dyn Fn(Envelope, MessageContext) -> BoxFuture<'static, Result<(), BrokerError>> + Send + Sync>;

/// One registered subscription: type tag, erased handler, options.
#[derive(Clone)]
pub struct SubscriptionInfo {
    /// The message type tag this subscription receives.
    pub message_type: String,
    /// Consumer options forwarded to the transport.
    pub options: SubscriptionOptions,
    /// The handler invoked per delivery.
    pub handler: ErasedHandler,
}

impl SubscriptionInfo {
    /// Create a subscription record.
    #[must_use]
    pub fn new(
        message_type: impl Into<String>,
        options: SubscriptionOptions,
        handler: ErasedHandler,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            options,
            handler,
        }
    }
}

impl fmt::Debug for SubscriptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionInfo")
            .field("message_type", &self.message_type)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Handle adapters use to feed received messages into the base broker's
/// dispatch. Cloneable and cheap; one per subscription or per consumer
/// loop, as the transport prefers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<
        dyn Fn(Envelope, MessageContext) -> BoxFuture<'static, Result<(), BrokerError>>
            + Send
            + Sync,
    >,
}

impl Dispatcher {
    /// Wrap a dispatch function.
    pub fn new<F>(dispatch: F) -> Self
    where
        F: Fn(Envelope, MessageContext) -> BoxFuture<'static, Result<(), BrokerError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            inner: Arc::new(dispatch),
        }
    }

    /// Deliver one envelope to the broker's handlers.
    ///
    /// # Errors
    ///
    /// Surfaces dispatch-level failures (for example an undecodable batch
    /// frame). Individual handler errors are caught inside dispatch and do
    /// not surface here.
    pub fn dispatch(
        &self,
        envelope: Envelope,
        context: MessageContext,
    ) -> BoxFuture<'static, Result<(), BrokerError>> {
        (self.inner)(envelope, context)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Dispatcher")
    }
}

/// The narrow port a concrete transport implements.
///
/// Adapters translate native acknowledgements to
/// [`MessageContext::acknowledge`] and native nacks to
/// [`MessageContext::reject`], own their consumer loops and connections,
/// and surface every failure as an error — never as a silent drop.
pub trait Transport: Send + Sync + 'static {
    /// Short transport name for logs.
    fn name(&self) -> &'static str;

    /// Publish one envelope to the wire.
    fn publish_internal(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()>;

    /// Register a subscription. Transports without per-type registration
    /// may no-op here and route everything through a shared consumer loop.
    fn subscribe_internal(
        &self,
        subscription: &SubscriptionInfo,
        dispatcher: Dispatcher,
    ) -> BrokerFuture<'_, ()>;

    /// Open connections and start consumer loops.
    fn start_internal(&self) -> BrokerFuture<'_, ()>;

    /// Stop consumer loops and close connections.
    fn stop_internal(&self) -> BrokerFuture<'_, ()>;

    /// Release any resources not already released by `stop_internal`.
    fn dispose_internal(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// The uniform broker surface.
///
/// The base broker implements this against a [`Transport`]; reliability
/// decorators implement it by delegating to an inner `Broker`. The chain
/// is fixed at construction from configuration and never reshaped at
/// runtime.
pub trait Broker: Send + Sync {
    /// Publish a pre-serialized envelope.
    fn publish_envelope(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()>;

    /// Register an erased subscription.
    fn subscribe_with(&self, subscription: SubscriptionInfo) -> BrokerFuture<'_, ()>;

    /// Start the broker. Idempotent.
    fn start(&self) -> BrokerFuture<'_, ()>;

    /// Stop the broker. Idempotent; a no-op before the first start.
    fn stop(&self) -> BrokerFuture<'_, ()>;

    /// Dispose the broker: stop it, join background tasks and release
    /// transport resources. Further operations fail with
    /// [`BrokerError::Disposed`].
    fn shutdown(&self) -> BrokerFuture<'_, ()>;

    /// The wire format the façade uses for typed publish/subscribe.
    /// Decorators forward to their inner broker.
    fn serialization(&self) -> SerializationFormat {
        SerializationFormat::default()
    }
}

/// Typed entry points over any [`Broker`].
///
/// Blanket-implemented, so `broker.publish(&msg, options)` works on the
/// base broker and on any decorator chain alike.
pub trait BrokerExt: Broker {
    /// Serialize `message` and publish it.
    ///
    /// The envelope carries the type tag, a fresh message id, the publish
    /// timestamp and the serializer's content type; options headers are
    /// merged in.
    fn publish<'a, M: Message>(
        &'a self,
        message: &M,
        options: PublishOptions,
    ) -> BrokerFuture<'a, ()> {
        let format = self.serialization();
        let serialized = format.serialize(message);
        Box::pin(async move {
            let payload = serialized?;
            let mut envelope = Envelope::new(M::message_type(), payload)
                .with_header(headers::CONTENT_TYPE, format.content_type());
            if let Some(correlation_id) = &options.correlation_id {
                envelope = envelope.with_correlation_id(correlation_id.clone());
            }
            for (name, value) in &options.headers {
                envelope = envelope.with_header(name.clone(), value.clone());
            }
            self.publish_envelope(envelope, options).await
        })
    }

    /// Subscribe a typed handler.
    ///
    /// The handler is wrapped in an erased closure that deserializes the
    /// payload with the broker's wire format before invoking it. A payload
    /// that fails to decode surfaces as [`BrokerError::Deserialization`]
    /// from the erased handler, which the dispatch loop logs (and the
    /// poison layer, when present, counts).
    fn subscribe<'a, M, F, Fut>(
        &'a self,
        handler: F,
        options: SubscriptionOptions,
    ) -> BrokerFuture<'a, ()>
    where
        M: Message,
        F: Fn(M, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BrokerError>> + Send + 'static,
    {
        let format = self.serialization();
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |envelope: Envelope, context| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let message: M = format.deserialize(&envelope.payload)?;
                handler(message, context).await
            })
        });
        self.subscribe_with(SubscriptionInfo::new(M::message_type(), options, erased))
    }
}

impl<B: Broker + ?Sized> BrokerExt for B {}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        id: u32,
    }

    impl Message for Ping {
        fn message_type() -> &'static str {
            "Ping.v1"
        }
    }

    /// Broker stub that records envelopes and can replay them to
    /// registered handlers.
    #[derive(Default)]
    struct RecordingBroker {
        published: Mutex<Vec<(Envelope, PublishOptions)>>,
        subscriptions: Mutex<Vec<SubscriptionInfo>>,
    }

    impl Broker for RecordingBroker {
        fn publish_envelope(
            &self,
            envelope: Envelope,
            options: PublishOptions,
        ) -> BrokerFuture<'_, ()> {
            Box::pin(async move {
                self.published.lock().unwrap().push((envelope, options));
                Ok(())
            })
        }

        fn subscribe_with(&self, subscription: SubscriptionInfo) -> BrokerFuture<'_, ()> {
            Box::pin(async move {
                self.subscriptions.lock().unwrap().push(subscription);
                Ok(())
            })
        }

        fn start(&self) -> BrokerFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn stop(&self) -> BrokerFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn shutdown(&self) -> BrokerFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn typed_publish_builds_an_envelope() {
        let broker = RecordingBroker::default();
        let options = PublishOptions::default()
            .with_correlation_id("corr-1")
            .with_header("X-Source", "test");

        broker.publish(&Ping { id: 7 }, options).await.unwrap();

        let published = broker.published.lock().unwrap();
        let (envelope, _) = &published[0];
        assert_eq!(envelope.message_type, "Ping.v1");
        assert_eq!(envelope.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(
            envelope.headers.get(headers::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(envelope.headers.get("X-Source").unwrap(), "test");

        let decoded: Ping = SerializationFormat::Json
            .deserialize(&envelope.payload)
            .unwrap();
        assert_eq!(decoded, Ping { id: 7 });
    }

    #[tokio::test]
    async fn typed_subscribe_registers_an_erased_handler() {
        let broker = RecordingBroker::default();
        broker
            .subscribe::<Ping, _, _>(
                |_message, _context| async { Ok(()) },
                SubscriptionOptions::default(),
            )
            .await
            .unwrap();

        let subscriptions = broker.subscriptions.lock().unwrap();
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].message_type, "Ping.v1");
    }

    #[tokio::test]
    async fn erased_handler_surfaces_deserialization_errors() {
        let broker = RecordingBroker::default();
        broker
            .subscribe::<Ping, _, _>(
                |_message, _context| async { Ok(()) },
                SubscriptionOptions::default(),
            )
            .await
            .unwrap();

        let subscription = broker.subscriptions.lock().unwrap().remove(0);
        let envelope = Envelope::new("Ping.v1", b"not json".to_vec());
        let context = MessageContext::from_envelope(&envelope);
        let result = (subscription.handler)(envelope, context).await;
        assert!(matches!(result, Err(BrokerError::Deserialization(_))));
    }
}
