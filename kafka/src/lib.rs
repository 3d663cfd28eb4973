//! Kafka-compatible streaming transport for Courier.
//!
//! Works against Kafka, Redpanda and any other Kafka-protocol broker via
//! `rdkafka`.
//!
//! # Mapping
//!
//! - **Topic**: the publish `exchange` override, else the message type
//!   tag. One topic per message type keeps subscription wiring trivial.
//! - **Partition key**: the routing key, else the message type — events
//!   sharing a key stay ordered within their partition.
//! - **Headers**: envelope headers map one-to-one onto Kafka headers;
//!   the payload travels as the record value.
//!
//! # Delivery semantics
//!
//! At-least-once with manual offset commits: an offset is committed only
//! AFTER the envelope has been handed to dispatch. A crash between
//! dispatch and commit redelivers the message, so handlers must be
//! idempotent (the deduplication layer helps). Ordering is per
//! partition; the transport adds no reordering of its own.
//!
//! Acknowledgement maps onto offset commits, which the consumer loop
//! performs itself post-dispatch; the per-message ack capability is
//! therefore a no-op here and `reject(requeue: false)` simply lets the
//! commit proceed.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message as KafkaMessage, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_core::broker::{BrokerFuture, Dispatcher, SubscriptionInfo, Transport};
use courier_core::config::KafkaOptions;
use courier_core::context::MessageContext;
use courier_core::error::BrokerError;
use courier_core::message::{headers as wire, Envelope};
use courier_core::options::PublishOptions;

/// Kafka transport.
pub struct KafkaTransport {
    options: KafkaOptions,
    producer: Mutex<Option<FutureProducer>>,
    consumer_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KafkaTransport {
    /// Create a transport; connections open on start.
    #[must_use]
    pub fn new(options: KafkaOptions) -> Self {
        Self {
            options,
            producer: Mutex::new(None),
            consumer_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Broker addresses this transport connects to.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.options.brokers
    }

    fn build_producer(&self) -> Result<FutureProducer, BrokerError> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.options.brokers)
            .set("message.timeout.ms", self.options.timeout_ms.to_string())
            .set("acks", &self.options.producer_acks)
            .create()
            .map_err(|e| {
                BrokerError::TransportUnavailable(format!("failed to create producer: {e}"))
            })
    }

    fn build_consumer(&self, group: &str) -> Result<StreamConsumer, BrokerError> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.options.brokers)
            .set("group.id", group)
            // Manual commit for at-least-once delivery.
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.options.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| {
                BrokerError::TransportUnavailable(format!("failed to create consumer: {e}"))
            })
    }
}

/// Topic for an envelope: publish exchange override, else the type tag.
fn topic_for(envelope: &Envelope, options: &PublishOptions) -> String {
    options
        .exchange
        .clone()
        .unwrap_or_else(|| envelope.message_type.clone())
}

/// Topic for a subscription: queue name override, else the type tag.
fn subscription_topic(subscription: &SubscriptionInfo) -> String {
    subscription
        .options
        .queue_name
        .clone()
        .unwrap_or_else(|| subscription.message_type.clone())
}

fn kafka_headers(envelope: &Envelope) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new();
    for (name, value) in &envelope.headers {
        headers = headers.insert(Header {
            key: name,
            value: Some(value.as_bytes()),
        });
    }
    headers
}

/// Rebuild an envelope from a consumed record.
fn envelope_from_record(
    payload: &[u8],
    record_headers: Option<&rdkafka::message::BorrowedHeaders>,
) -> Envelope {
    let mut headers = HashMap::new();
    if let Some(record_headers) = record_headers {
        for header in record_headers.iter() {
            if let Some(value) = header.value {
                headers.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }

    let message_type = headers
        .get(wire::MESSAGE_TYPE)
        .cloned()
        .unwrap_or_default();
    let mut envelope = Envelope::new(message_type, payload.to_vec());
    if let Some(message_id) = headers.get(wire::MESSAGE_ID) {
        envelope.message_id = message_id.clone();
    }
    if let Some(timestamp) = headers.get(wire::TIMESTAMP) {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp) {
            envelope.timestamp = parsed.with_timezone(&Utc);
        }
    }
    envelope.correlation_id = headers.get(wire::CORRELATION_ID).cloned();
    envelope.headers = headers;
    envelope
}

impl Transport for KafkaTransport {
    fn name(&self) -> &'static str {
        "kafka"
    }

    fn publish_internal(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let producer = {
                let guard = self.producer.lock().await;
                guard.clone().ok_or_else(|| {
                    BrokerError::TransportUnavailable("producer not started".to_string())
                })?
            };

            let topic = topic_for(&envelope, &options);
            // Records sharing a key share a partition, which is what
            // gives per-key ordering.
            let key = options
                .routing_key
                .clone()
                .unwrap_or_else(|| envelope.message_type.clone());
            let record = FutureRecord::to(&topic)
                .payload(&envelope.payload)
                .key(key.as_bytes())
                .headers(kafka_headers(&envelope));

            match producer
                .send(record, Timeout::After(self.options.timeout()))
                .await
            {
                Ok((partition, offset)) => {
                    debug!(
                        topic = %topic,
                        partition,
                        offset,
                        message_type = %envelope.message_type,
                        "Record published"
                    );
                    Ok(())
                },
                Err((kafka_error, _record)) => {
                    error!(topic = %topic, error = %kafka_error, "Publish failed");
                    Err(BrokerError::PublishFailure(kafka_error.to_string()))
                },
            }
        })
    }

    #[allow(clippy::too_many_lines)] // Consumer loop owns the full at-least-once handshake
    fn subscribe_internal(
        &self,
        subscription: &SubscriptionInfo,
        dispatcher: Dispatcher,
    ) -> BrokerFuture<'_, ()> {
        let topic = subscription_topic(subscription);
        let group = subscription
            .options
            .consumer_group
            .clone()
            .unwrap_or_else(|| format!("courier-{topic}"));

        Box::pin(async move {
            let consumer = self.build_consumer(&group)?;
            consumer.subscribe(&[topic.as_str()]).map_err(|e| {
                BrokerError::TransportUnavailable(format!(
                    "failed to subscribe to '{topic}': {e}"
                ))
            })?;
            info!(topic = %topic, consumer_group = %group, "Kafka subscription started");

            let task = tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();
                while let Some(record) = stream.next().await {
                    match record {
                        Ok(record) => {
                            let Some(payload) = record.payload() else {
                                warn!(topic = record.topic(), "Record with no payload");
                                if let Err(commit_error) =
                                    consumer.commit_message(&record, CommitMode::Async)
                                {
                                    warn!(error = %commit_error, "Commit failed for empty record");
                                }
                                continue;
                            };

                            let envelope = envelope_from_record(payload, record.headers());
                            let mut context = MessageContext::from_envelope(&envelope)
                                .with_exchange(record.topic().to_string());
                            if let Some(Ok(key)) = record.key_view::<str>() {
                                context = context.with_routing_key(key.to_string());
                            }

                            if let Err(dispatch_error) =
                                dispatcher.dispatch(envelope, context).await
                            {
                                error!(
                                    topic = record.topic(),
                                    error = %dispatch_error,
                                    "Dispatch failed; committing anyway (poison handling owns retries)"
                                );
                            }

                            // Commit AFTER dispatch: a crash before this
                            // point redelivers the record.
                            if let Err(commit_error) =
                                consumer.commit_message(&record, CommitMode::Async)
                            {
                                warn!(
                                    topic = record.topic(),
                                    offset = record.offset(),
                                    error = %commit_error,
                                    "Offset commit failed, record may be redelivered"
                                );
                            }
                        },
                        Err(consume_error) => {
                            warn!(error = %consume_error, "Consumer error");
                        },
                    }
                }
                debug!("Kafka consumer task exiting");
            });
            self.consumer_tasks.lock().await.push(task);
            Ok(())
        })
    }

    fn start_internal(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let mut producer = self.producer.lock().await;
            if producer.is_none() {
                *producer = Some(self.build_producer()?);
                info!(
                    brokers = %self.options.brokers,
                    acks = %self.options.producer_acks,
                    "Kafka producer created"
                );
            }
            Ok(())
        })
    }

    fn stop_internal(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            for task in self.consumer_tasks.lock().await.drain(..) {
                task.abort();
            }
            self.producer.lock().await.take();
            info!("Kafka transport stopped");
            Ok(())
        })
    }
}
