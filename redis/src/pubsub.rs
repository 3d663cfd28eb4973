//! Redis pub/sub transport: lightweight at-most-once fan-out.
//!
//! `PUBLISH` on the publish path, a `SUBSCRIBE` loop per subscription on
//! the receive path. No persistence and no acknowledgement: a
//! subscriber that is not connected at publish time never sees the
//! message. Suited to ephemeral signals (cache invalidation, presence),
//! not to anything the at-least-once layers are expected to protect.

use futures::StreamExt;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_core::broker::{BrokerFuture, Dispatcher, SubscriptionInfo, Transport};
use courier_core::config::RedisOptions;
use courier_core::context::MessageContext;
use courier_core::error::BrokerError;
use courier_core::message::Envelope;
use courier_core::options::PublishOptions;

use crate::{decode_envelope, encode_envelope, keyspace};

/// Redis pub/sub transport.
pub struct RedisPubSubTransport {
    options: RedisOptions,
    client: Mutex<Option<Client>>,
    consumer_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisPubSubTransport {
    /// Create a transport; the connection opens on start.
    #[must_use]
    pub fn new(options: RedisOptions) -> Self {
        Self {
            options,
            client: Mutex::new(None),
            consumer_tasks: Mutex::new(Vec::new()),
        }
    }

    async fn client(&self) -> Result<Client, BrokerError> {
        self.client.lock().await.clone().ok_or_else(|| {
            BrokerError::TransportUnavailable("redis client not started".to_string())
        })
    }
}

impl Transport for RedisPubSubTransport {
    fn name(&self) -> &'static str {
        "redis-pubsub"
    }

    fn publish_internal(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let client = self.client().await?;
            let channel = keyspace(
                &self.options.key_prefix,
                options
                    .exchange
                    .as_deref()
                    .unwrap_or(&envelope.message_type),
            );
            let bytes = encode_envelope(&envelope)?;

            let mut connection = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| BrokerError::TransportUnavailable(e.to_string()))?;
            let receivers: i64 = connection
                .publish(&channel, bytes)
                .await
                .map_err(|e| BrokerError::PublishFailure(format!("PUBLISH failed: {e}")))?;

            debug!(channel = %channel, receivers, "Published to channel");
            Ok(())
        })
    }

    fn subscribe_internal(
        &self,
        subscription: &SubscriptionInfo,
        dispatcher: Dispatcher,
    ) -> BrokerFuture<'_, ()> {
        let channel = keyspace(
            &self.options.key_prefix,
            subscription
                .options
                .queue_name
                .as_deref()
                .unwrap_or(&subscription.message_type),
        );

        Box::pin(async move {
            let client = self.client().await?;
            let mut pubsub = client.get_async_pubsub().await.map_err(|e| {
                BrokerError::TransportUnavailable(format!("pubsub connect failed: {e}"))
            })?;
            pubsub.subscribe(&channel).await.map_err(|e| {
                BrokerError::TransportUnavailable(format!(
                    "SUBSCRIBE '{channel}' failed: {e}"
                ))
            })?;
            info!(channel = %channel, "Pub/sub subscription started");

            let task = tokio::spawn(async move {
                let mut messages = pubsub.on_message();
                while let Some(message) = messages.next().await {
                    let bytes: Vec<u8> = match message.get_payload() {
                        Ok(bytes) => bytes,
                        Err(payload_error) => {
                            warn!(error = %payload_error, "Unreadable pub/sub payload");
                            continue;
                        },
                    };
                    let envelope = match decode_envelope(&bytes) {
                        Ok(envelope) => envelope,
                        Err(decode_error) => {
                            error!(error = %decode_error, "Undecodable pub/sub message");
                            continue;
                        },
                    };

                    // At-most-once: no ack capabilities to bind.
                    let context = MessageContext::from_envelope(&envelope)
                        .with_exchange(message.get_channel_name().to_string());
                    if let Err(dispatch_error) = dispatcher.dispatch(envelope, context).await {
                        error!(error = %dispatch_error, "Dispatch failed");
                    }
                }
                debug!("Pub/sub consumer task exiting");
            });
            self.consumer_tasks.lock().await.push(task);
            Ok(())
        })
    }

    fn start_internal(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let mut client = self.client.lock().await;
            if client.is_none() {
                *client = Some(Client::open(self.options.url.as_str()).map_err(|e| {
                    BrokerError::TransportUnavailable(format!("redis open failed: {e}"))
                })?);
                info!(url = %self.options.url, "Redis pub/sub client created");
            }
            Ok(())
        })
    }

    fn stop_internal(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            for task in self.consumer_tasks.lock().await.drain(..) {
                task.abort();
            }
            self.client.lock().await.take();
            info!("Redis pub/sub transport stopped");
            Ok(())
        })
    }
}
