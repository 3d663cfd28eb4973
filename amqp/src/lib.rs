//! AMQP 0.9.1 transport for Courier.
//!
//! Speaks the classic broker protocol via `lapin`: RabbitMQ and the
//! AMQP endpoints of cloud service buses.
//!
//! # Mapping
//!
//! - **Exchange**: the publish `exchange` override, else the configured
//!   default; declared with the configured kind (topic by default).
//! - **Routing key**: the publish routing key, else the message type
//!   tag. Subscriptions bind their queue with the pattern from their
//!   options (`*` wildcards translate directly to AMQP topic matching).
//! - **Properties**: priority, expiration, persistence and correlation
//!   id map onto `AMQPProperties`; envelope headers become the header
//!   table.
//! - **Ack/nack**: the delivery's `Acker` is bound into the
//!   [`MessageContext`] capabilities, so `reject(requeue)` becomes a
//!   native nack with the requeue flag.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::basic::AMQPProperties;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_core::broker::{BrokerFuture, Dispatcher, SubscriptionInfo, Transport};
use courier_core::config::AmqpOptions;
use courier_core::context::MessageContext;
use courier_core::error::BrokerError;
use courier_core::message::{headers as wire, Envelope};
use courier_core::options::PublishOptions;

/// Exchange used when neither the publish call nor the subscription
/// names one.
const DEFAULT_EXCHANGE: &str = "courier";

/// AMQP transport.
pub struct AmqpTransport {
    options: AmqpOptions,
    connection: Mutex<Option<Connection>>,
    channel: Mutex<Option<Channel>>,
    consumer_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AmqpTransport {
    /// Create a transport; the connection opens on start.
    #[must_use]
    pub fn new(options: AmqpOptions) -> Self {
        Self {
            options,
            connection: Mutex::new(None),
            channel: Mutex::new(None),
            consumer_tasks: Mutex::new(Vec::new()),
        }
    }

    fn exchange_kind(&self) -> ExchangeKind {
        match self.options.exchange_type.as_str() {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "headers" => ExchangeKind::Headers,
            _ => ExchangeKind::Topic,
        }
    }

    async fn channel(&self) -> Result<Channel, BrokerError> {
        self.channel.lock().await.clone().ok_or_else(|| {
            BrokerError::TransportUnavailable("AMQP channel not started".to_string())
        })
    }

    async fn declare_exchange(&self, channel: &Channel, exchange: &str) -> Result<(), BrokerError> {
        channel
            .exchange_declare(
                exchange,
                self.exchange_kind(),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BrokerError::TransportUnavailable(format!(
                    "failed to declare exchange '{exchange}': {e}"
                ))
            })
    }
}

fn properties_for(envelope: &Envelope, options: &PublishOptions) -> AMQPProperties {
    let mut header_table = FieldTable::default();
    for (name, value) in &envelope.headers {
        header_table.insert(
            ShortString::from(name.clone()),
            AMQPValue::LongString(value.clone().into()),
        );
    }

    let mut properties = AMQPProperties::default()
        .with_message_id(ShortString::from(envelope.message_id.clone()))
        .with_timestamp(u64::try_from(envelope.timestamp.timestamp()).unwrap_or_default())
        .with_headers(header_table)
        .with_content_type(ShortString::from(
            envelope
                .headers
                .get(wire::CONTENT_TYPE)
                .cloned()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        ));

    if let Some(correlation_id) = &envelope.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(priority) = options.priority {
        properties = properties.with_priority(priority);
    }
    if let Some(expiration) = options.expiration {
        properties =
            properties.with_expiration(ShortString::from(expiration.as_millis().to_string()));
    }
    // Delivery mode 2 is persistent.
    if options.persistent.unwrap_or(true) {
        properties = properties.with_delivery_mode(2);
    } else {
        properties = properties.with_delivery_mode(1);
    }
    properties
}

/// Rebuild an envelope from a consumed delivery.
fn envelope_from_delivery(payload: Vec<u8>, properties: &AMQPProperties) -> Envelope {
    let mut headers = HashMap::new();
    if let Some(table) = properties.headers() {
        for (name, value) in table.inner() {
            if let AMQPValue::LongString(value) = value {
                headers.insert(name.to_string(), value.to_string());
            }
        }
    }

    let message_type = headers
        .get(wire::MESSAGE_TYPE)
        .cloned()
        .unwrap_or_default();
    let mut envelope = Envelope::new(message_type, payload);
    if let Some(message_id) = properties.message_id() {
        envelope.message_id = message_id.to_string();
    }
    if let Some(timestamp) = headers.get(wire::TIMESTAMP) {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp) {
            envelope.timestamp = parsed.with_timezone(&Utc);
        }
    }
    envelope.correlation_id = properties
        .correlation_id()
        .as_ref()
        .map(ToString::to_string);
    envelope.headers = headers;
    envelope
}

impl Transport for AmqpTransport {
    fn name(&self) -> &'static str {
        "amqp"
    }

    fn publish_internal(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let channel = self.channel().await?;
            let exchange = options
                .exchange
                .clone()
                .unwrap_or_else(|| DEFAULT_EXCHANGE.to_string());
            let routing_key = options
                .routing_key
                .clone()
                .unwrap_or_else(|| envelope.message_type.clone());

            self.declare_exchange(&channel, &exchange).await?;

            let confirm = channel
                .basic_publish(
                    &exchange,
                    &routing_key,
                    BasicPublishOptions::default(),
                    &envelope.payload,
                    properties_for(&envelope, &options),
                )
                .await
                .map_err(|e| BrokerError::PublishFailure(e.to_string()))?;

            if self.options.publisher_confirms {
                confirm
                    .await
                    .map_err(|e| BrokerError::PublishFailure(e.to_string()))?;
            }
            debug!(
                exchange = %exchange,
                routing_key = %routing_key,
                message_id = %envelope.message_id,
                "Published to AMQP"
            );
            Ok(())
        })
    }

    #[allow(clippy::too_many_lines)] // Consumer loop owns the full at-least-once handshake
    fn subscribe_internal(
        &self,
        subscription: &SubscriptionInfo,
        dispatcher: Dispatcher,
    ) -> BrokerFuture<'_, ()> {
        let message_type = subscription.message_type.clone();
        let options = subscription.options.clone();

        Box::pin(async move {
            let channel = self.channel().await?;
            let exchange = DEFAULT_EXCHANGE;
            self.declare_exchange(&channel, exchange).await?;

            let queue_name = options
                .queue_name
                .clone()
                .unwrap_or_else(|| format!("courier.{message_type}"));
            let binding_key = options
                .routing_key
                .clone()
                .unwrap_or_else(|| message_type.clone());

            channel
                .queue_declare(
                    &queue_name,
                    QueueDeclareOptions {
                        durable: options.durable,
                        exclusive: options.exclusive,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    BrokerError::TransportUnavailable(format!(
                        "failed to declare queue '{queue_name}': {e}"
                    ))
                })?;
            channel
                .queue_bind(
                    &queue_name,
                    exchange,
                    &binding_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    BrokerError::TransportUnavailable(format!(
                        "failed to bind queue '{queue_name}': {e}"
                    ))
                })?;
            channel
                .basic_qos(options.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| BrokerError::TransportUnavailable(e.to_string()))?;

            let consumer_tag = options
                .consumer_group
                .clone()
                .unwrap_or_else(|| format!("courier-{queue_name}"));
            let mut consumer = channel
                .basic_consume(
                    &queue_name,
                    &consumer_tag,
                    BasicConsumeOptions {
                        no_ack: options.auto_ack,
                        ..BasicConsumeOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    BrokerError::TransportUnavailable(format!(
                        "failed to consume from '{queue_name}': {e}"
                    ))
                })?;

            info!(
                queue = %queue_name,
                binding_key = %binding_key,
                prefetch = options.prefetch_count,
                auto_ack = options.auto_ack,
                "AMQP subscription started"
            );

            let auto_ack = options.auto_ack;
            let task = tokio::spawn(async move {
                while let Some(delivery) = consumer.next().await {
                    match delivery {
                        Ok(delivery) => {
                            let envelope =
                                envelope_from_delivery(delivery.data.clone(), &delivery.properties);
                            let mut context = MessageContext::from_envelope(&envelope)
                                .with_routing_key(delivery.routing_key.to_string())
                                .with_exchange(delivery.exchange.to_string());

                            let acker = Arc::new(delivery.acker);
                            if !auto_ack {
                                let ack_acker = Arc::clone(&acker);
                                context = context.with_ack(Arc::new(move || {
                                    let acker = Arc::clone(&ack_acker);
                                    Box::pin(async move {
                                        acker.ack(BasicAckOptions::default()).await.map_err(|e| {
                                            BrokerError::TransportUnavailable(e.to_string())
                                        })
                                    })
                                }));
                                let nack_acker = Arc::clone(&acker);
                                context = context.with_reject(Arc::new(move |requeue| {
                                    let acker = Arc::clone(&nack_acker);
                                    Box::pin(async move {
                                        acker
                                            .nack(BasicNackOptions {
                                                requeue,
                                                ..BasicNackOptions::default()
                                            })
                                            .await
                                            .map_err(|e| {
                                                BrokerError::TransportUnavailable(e.to_string())
                                            })
                                    })
                                }));
                            }

                            match dispatcher.dispatch(envelope, context).await {
                                Ok(()) => {
                                    if !auto_ack {
                                        if let Err(ack_error) =
                                            acker.ack(BasicAckOptions::default()).await
                                        {
                                            // Already acked by the handler
                                            // is the common cause here.
                                            debug!(error = %ack_error, "Post-dispatch ack skipped");
                                        }
                                    }
                                },
                                Err(dispatch_error) => {
                                    error!(error = %dispatch_error, "Dispatch failed");
                                    if !auto_ack {
                                        if let Err(nack_error) = acker
                                            .nack(BasicNackOptions {
                                                requeue: true,
                                                ..BasicNackOptions::default()
                                            })
                                            .await
                                        {
                                            debug!(error = %nack_error, "Post-dispatch nack skipped");
                                        }
                                    }
                                },
                            }
                        },
                        Err(consume_error) => {
                            warn!(error = %consume_error, "AMQP consumer error");
                        },
                    }
                }
                debug!("AMQP consumer task exiting");
            });
            self.consumer_tasks.lock().await.push(task);
            Ok(())
        })
    }

    fn start_internal(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let mut connection = self.connection.lock().await;
            if connection.is_some() {
                return Ok(());
            }
            let conn = Connection::connect(&self.options.uri, ConnectionProperties::default())
                .await
                .map_err(|e| {
                    BrokerError::TransportUnavailable(format!("AMQP connect failed: {e}"))
                })?;
            let channel = conn.create_channel().await.map_err(|e| {
                BrokerError::TransportUnavailable(format!("AMQP channel failed: {e}"))
            })?;
            if self.options.publisher_confirms {
                channel
                    .confirm_select(lapin::options::ConfirmSelectOptions::default())
                    .await
                    .map_err(|e| BrokerError::TransportUnavailable(e.to_string()))?;
            }
            *self.channel.lock().await = Some(channel);
            *connection = Some(conn);
            info!(uri = %self.options.uri, "AMQP connected");
            Ok(())
        })
    }

    fn stop_internal(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            for task in self.consumer_tasks.lock().await.drain(..) {
                task.abort();
            }
            self.channel.lock().await.take();
            if let Some(connection) = self.connection.lock().await.take() {
                if let Err(close_error) = connection.close(0, "courier stop").await {
                    warn!(error = %close_error, "AMQP close reported an error");
                }
            }
            info!("AMQP transport stopped");
            Ok(())
        })
    }
}
