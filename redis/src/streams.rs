//! Redis streams transport: an append-only log with consumer groups.

use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use std::sync::atomic::{AtomicBool, Ordering};
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

/// Stream field holding the serialized envelope.
const ENVELOPE_FIELD: &str = "envelope";

/// Redis streams transport.
pub struct RedisStreamsTransport {
    options: RedisOptions,
    client: Mutex<Option<Client>>,
    consumer_tasks: Mutex<Vec<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
}

impl RedisStreamsTransport {
    /// Create a transport; the connection opens on start.
    #[must_use]
    pub fn new(options: RedisOptions) -> Self {
        Self {
            options,
            client: Mutex::new(None),
            consumer_tasks: Mutex::new(Vec::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn client(&self) -> Result<Client, BrokerError> {
        self.client.lock().await.clone().ok_or_else(|| {
            BrokerError::TransportUnavailable("redis client not started".to_string())
        })
    }
}

impl Transport for RedisStreamsTransport {
    fn name(&self) -> &'static str {
        "redis-streams"
    }

    fn publish_internal(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let client = self.client().await?;
            let stream = keyspace(
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
            let entry_id: String = connection
                .xadd(&stream, "*", &[(ENVELOPE_FIELD, bytes.as_slice())])
                .await
                .map_err(|e| BrokerError::PublishFailure(format!("XADD failed: {e}")))?;

            debug!(stream = %stream, entry_id = %entry_id, "Appended to stream");
            Ok(())
        })
    }

    #[allow(clippy::too_many_lines)] // Consumer loop owns the full at-least-once handshake
    fn subscribe_internal(
        &self,
        subscription: &SubscriptionInfo,
        dispatcher: Dispatcher,
    ) -> BrokerFuture<'_, ()> {
        let stream = keyspace(
            &self.options.key_prefix,
            subscription
                .options
                .queue_name
                .as_deref()
                .unwrap_or(&subscription.message_type),
        );
        let group = subscription
            .options
            .consumer_group
            .clone()
            .unwrap_or_else(|| format!("courier-{}", subscription.message_type));
        let consumer_name = self.options.consumer_name.clone();
        let block_ms = self.options.block_ms;
        let stopping = Arc::clone(&self.stopping);

        Box::pin(async move {
            let client = self.client().await?;
            let mut connection = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| BrokerError::TransportUnavailable(e.to_string()))?;

            // Create the group (and the stream) if they do not exist;
            // BUSYGROUP means another consumer got there first.
            let created: Result<(), redis::RedisError> = connection
                .xgroup_create_mkstream(&stream, &group, "$")
                .await;
            if let Err(group_error) = created {
                if !group_error.to_string().contains("BUSYGROUP") {
                    return Err(BrokerError::TransportUnavailable(format!(
                        "XGROUP CREATE failed: {group_error}"
                    )));
                }
            }
            info!(stream = %stream, group = %group, "Stream subscription started");

            let task = tokio::spawn(async move {
                loop {
                    if stopping.load(Ordering::Acquire) {
                        break;
                    }

                    let read_options = StreamReadOptions::default()
                        .group(&group, &consumer_name)
                        .block(usize::try_from(block_ms).unwrap_or(5_000))
                        .count(10);
                    let reply: Result<StreamReadReply, redis::RedisError> = connection
                        .xread_options(&[stream.as_str()], &[">"], &read_options)
                        .await;

                    let reply = match reply {
                        Ok(reply) => reply,
                        Err(read_error) => {
                            warn!(error = %read_error, "XREADGROUP failed, backing off");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                            continue;
                        },
                    };

                    for key in reply.keys {
                        for entry in key.ids {
                            let Some(redis::Value::BulkString(bytes)) =
                                entry.map.get(ENVELOPE_FIELD)
                            else {
                                warn!(entry_id = %entry.id, "Stream entry without envelope field");
                                continue;
                            };

                            let envelope = match decode_envelope(bytes) {
                                Ok(envelope) => envelope,
                                Err(decode_error) => {
                                    error!(
                                        entry_id = %entry.id,
                                        error = %decode_error,
                                        "Undecodable stream entry, acking to skip"
                                    );
                                    let _: Result<i64, _> = connection
                                        .xack(&stream, &group, &[&entry.id])
                                        .await;
                                    continue;
                                },
                            };

                            let mut context = MessageContext::from_envelope(&envelope)
                                .with_exchange(stream.clone());

                            let ack_client = client.clone();
                            let ack_stream = stream.clone();
                            let ack_group = group.clone();
                            let ack_id = entry.id.clone();
                            context = context.with_ack(Arc::new(move || {
                                let client = ack_client.clone();
                                let stream = ack_stream.clone();
                                let group = ack_group.clone();
                                let id = ack_id.clone();
                                Box::pin(async move {
                                    let mut connection = client
                                        .get_multiplexed_async_connection()
                                        .await
                                        .map_err(|e| {
                                            BrokerError::TransportUnavailable(e.to_string())
                                        })?;
                                    let _: i64 = connection
                                        .xack(&stream, &group, &[&id])
                                        .await
                                        .map_err(|e| {
                                            BrokerError::TransportUnavailable(e.to_string())
                                        })?;
                                    Ok(())
                                })
                            }));

                            match dispatcher.dispatch(envelope, context).await {
                                Ok(()) => {
                                    // Ack after dispatch; a crash before
                                    // this leaves the entry pending for
                                    // redelivery.
                                    let acked: Result<i64, _> =
                                        connection.xack(&stream, &group, &[&entry.id]).await;
                                    if let Err(ack_error) = acked {
                                        warn!(
                                            entry_id = %entry.id,
                                            error = %ack_error,
                                            "XACK failed, entry stays pending"
                                        );
                                    }
                                },
                                Err(dispatch_error) => {
                                    // Not acked: the entry stays in the
                                    // pending list for redelivery.
                                    error!(
                                        entry_id = %entry.id,
                                        error = %dispatch_error,
                                        "Dispatch failed, leaving entry pending"
                                    );
                                },
                            }
                        }
                    }
                }
                debug!("Stream consumer task exiting");
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
                info!(url = %self.options.url, "Redis streams client created");
            }
            self.stopping.store(false, Ordering::Release);
            Ok(())
        })
    }

    fn stop_internal(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.stopping.store(true, Ordering::Release);
            for task in self.consumer_tasks.lock().await.drain(..) {
                task.abort();
            }
            self.client.lock().await.take();
            info!("Redis streams transport stopped");
            Ok(())
        })
    }
}
