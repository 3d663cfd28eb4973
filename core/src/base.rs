//! The base broker: subscription registry, dispatch loop and the
//! serialize→compress→transport publish path.
//!
//! [`CoreBroker`] is the innermost link of every decorator chain. It owns
//! the one subscription registry of the broker instance, forwards
//! envelopes to its [`Transport`], and hands adapters a [`Dispatcher`]
//! that feeds received envelopes back through decompression and into the
//! per-type handler lists.
//!
//! # Lifecycle
//!
//! The broker auto-starts on first publish or subscribe. Explicit
//! `start`/`stop` are idempotent, `stop` before the first start is a
//! no-op, and `shutdown` is terminal: every operation afterwards fails
//! with [`BrokerError::Disposed`].
//!
//! # Dispatch ordering
//!
//! Handlers for one message type run sequentially in registration order
//! per message; a failing handler is logged and the remaining handlers
//! still run. Dispatch across different message types is concurrent —
//! each transport delivery drives its own dispatch future.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::broker::{Broker, BrokerFuture, Dispatcher, SubscriptionInfo, Transport};
use crate::compression::{codec_for, decompress_auto, CompressionCodec};
use crate::config::{CompressionOptions, CourierConfig};
use crate::context::MessageContext;
use crate::error::BrokerError;
use crate::message::{headers, Envelope};
use crate::options::{routing_key_matches, PublishOptions};
use crate::serialization::SerializationFormat;

/// Shared dispatch state: the registry plus everything the receive path
/// needs without holding the broker itself.
struct DispatchState {
    registry: RwLock<HashMap<String, Vec<SubscriptionInfo>>>,
}

impl DispatchState {
    /// Decompress, unwrap batches and fan out to the handlers registered
    /// for the envelope's type.
    async fn process_message(
        &self,
        envelope: Envelope,
        context: MessageContext,
    ) -> Result<(), BrokerError> {
        let payload = decompress_auto(&envelope.payload)
            .map_err(|e| BrokerError::Deserialization(e.to_string()))?;
        let envelope = Envelope { payload, ..envelope };

        if envelope.is_batch() {
            let items = envelope.unbatch()?;
            debug!(
                message_type = %envelope.message_type,
                items = items.len(),
                "Dispatching batch envelope"
            );
            for payload in items {
                let mut item = envelope.clone();
                item.payload = payload;
                item.headers.remove(headers::BATCH_COUNT);
                self.dispatch_single(item, context.clone()).await;
            }
            return Ok(());
        }

        self.dispatch_single(envelope, context).await;
        Ok(())
    }

    async fn dispatch_single(&self, envelope: Envelope, context: MessageContext) {
        let handlers: Vec<SubscriptionInfo> = {
            let registry = self.registry.read().await;
            registry
                .get(&envelope.message_type)
                .cloned()
                .unwrap_or_default()
        };

        if handlers.is_empty() {
            debug!(
                message_type = %envelope.message_type,
                "No handlers registered for message type"
            );
            return;
        }

        for subscription in handlers {
            if let (Some(pattern), Some(key)) = (
                subscription.options.routing_key.as_deref(),
                context.routing_key.as_deref(),
            ) {
                if !routing_key_matches(pattern, key) {
                    continue;
                }
            }
            if let Err(handler_error) = (subscription.handler)(envelope.clone(), context.clone()).await
            {
                // Handler failures never reach the transport loop; the
                // remaining handlers still observe the message.
                error!(
                    message_type = %envelope.message_type,
                    message_id = %envelope.message_id,
                    error = %handler_error,
                    "Handler failed, continuing with remaining handlers"
                );
            }
        }
    }
}

/// The base broker over a concrete [`Transport`].
pub struct CoreBroker<T: Transport> {
    transport: Arc<T>,
    dispatch: Arc<DispatchState>,
    lifecycle: Mutex<()>,
    started: AtomicBool,
    disposed: AtomicBool,
    serialization: SerializationFormat,
    compression: CompressionOptions,
    codec: Option<Arc<dyn CompressionCodec>>,
}

impl<T: Transport> CoreBroker<T> {
    /// Create a broker with default (JSON, no compression) settings.
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self::with_settings(
            transport,
            SerializationFormat::default(),
            CompressionOptions::default(),
        )
    }

    /// Create a broker from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidOptions`] if `config` fails eager
    /// validation.
    pub fn from_config(transport: T, config: &CourierConfig) -> Result<Self, BrokerError> {
        config.validate()?;
        Ok(Self::with_settings(
            transport,
            config.serialization.effective_format(),
            config.compression.clone(),
        ))
    }

    /// Create a broker with explicit serialization and compression
    /// settings.
    #[must_use]
    pub fn with_settings(
        transport: T,
        serialization: SerializationFormat,
        compression: CompressionOptions,
    ) -> Self {
        let codec = if compression.enabled {
            codec_for(compression.algorithm, compression.level).map(Arc::from)
        } else {
            None
        };
        Self {
            transport: Arc::new(transport),
            dispatch: Arc::new(DispatchState {
                registry: RwLock::new(HashMap::new()),
            }),
            lifecycle: Mutex::new(()),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            serialization,
            compression,
            codec,
        }
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// A dispatcher feeding this broker's handlers. Adapters hold one per
    /// consumer loop; tests use it to drive the receive path directly.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        let dispatch = Arc::clone(&self.dispatch);
        Dispatcher::new(move |envelope, context| {
            let dispatch = Arc::clone(&dispatch);
            Box::pin(async move { dispatch.process_message(envelope, context).await })
        })
    }

    fn check_not_disposed(&self) -> Result<(), BrokerError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BrokerError::Disposed);
        }
        Ok(())
    }

    /// Start the transport exactly once, no matter how many publishes race
    /// over it.
    async fn ensure_started(&self) -> Result<(), BrokerError> {
        self.check_not_disposed()?;
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.lifecycle.lock().await;
        self.check_not_disposed()?;
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        self.transport.start_internal().await?;
        self.started.store(true, Ordering::Release);
        info!(transport = self.transport.name(), "Broker started");
        Ok(())
    }

    /// Apply the compression policy: compress iff enabled, the payload
    /// meets the minimum size, and the content type is compressible.
    fn maybe_compress(&self, envelope: &mut Envelope) -> Result<(), BrokerError> {
        let Some(codec) = &self.codec else {
            return Ok(());
        };
        if envelope.payload.len() < self.compression.min_size_bytes {
            return Ok(());
        }
        if let Some(content_type) = envelope.headers.get(headers::CONTENT_TYPE) {
            if self
                .compression
                .non_compressible_types
                .iter()
                .any(|t| t == content_type)
            {
                return Ok(());
            }
        }
        envelope.payload = codec
            .compress(&envelope.payload)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;
        Ok(())
    }
}

impl<T: Transport> Broker for CoreBroker<T> {
    fn publish_envelope(
        &self,
        mut envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if envelope.message_type.is_empty() {
                return Err(BrokerError::InvalidArgument(
                    "message type must not be empty".to_string(),
                ));
            }
            self.ensure_started().await?;
            self.maybe_compress(&mut envelope)?;

            if let Err(publish_error) = self
                .transport
                .publish_internal(envelope.clone(), options)
                .await
            {
                error!(
                    transport = self.transport.name(),
                    message_type = %envelope.message_type,
                    message_id = %envelope.message_id,
                    error = %publish_error,
                    "Publish failed"
                );
                return Err(publish_error);
            }
            debug!(
                transport = self.transport.name(),
                message_type = %envelope.message_type,
                message_id = %envelope.message_id,
                size = envelope.payload.len(),
                "Published"
            );
            Ok(())
        })
    }

    fn subscribe_with(&self, subscription: SubscriptionInfo) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.check_not_disposed()?;
            {
                let mut registry = self.dispatch.registry.write().await;
                registry
                    .entry(subscription.message_type.clone())
                    .or_default()
                    .push(subscription.clone());
            }
            self.transport
                .subscribe_internal(&subscription, self.dispatcher())
                .await?;
            self.ensure_started().await?;
            info!(
                transport = self.transport.name(),
                message_type = %subscription.message_type,
                "Subscribed"
            );
            Ok(())
        })
    }

    fn start(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move { self.ensure_started().await })
    }

    fn stop(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if self.disposed.load(Ordering::Acquire) {
                return Ok(());
            }
            let _guard = self.lifecycle.lock().await;
            if !self.started.load(Ordering::Acquire) {
                return Ok(());
            }
            self.transport.stop_internal().await?;
            self.started.store(false, Ordering::Release);
            info!(transport = self.transport.name(), "Broker stopped");
            Ok(())
        })
    }

    fn shutdown(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let _guard = self.lifecycle.lock().await;
            if self.disposed.load(Ordering::Acquire) {
                return Ok(());
            }
            if self.started.load(Ordering::Acquire) {
                if let Err(stop_error) = self.transport.stop_internal().await {
                    // Disposal proceeds regardless; resources are released
                    // by dispose_internal below.
                    error!(
                        transport = self.transport.name(),
                        error = %stop_error,
                        "Stop during shutdown failed"
                    );
                }
                self.started.store(false, Ordering::Release);
            }
            self.transport.dispose_internal().await?;
            self.disposed.store(true, Ordering::Release);
            info!(transport = self.transport.name(), "Broker disposed");
            Ok(())
        })
    }

    fn serialization(&self) -> SerializationFormat {
        self.serialization
    }
}
