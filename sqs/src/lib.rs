//! Cloud queue transport for Courier backed by AWS SQS.
//!
//! # Mapping
//!
//! - **Queue**: one queue per message type, addressed as
//!   `{queue_url_prefix}{queue-name}`; the subscription's queue name
//!   overrides the derived one.
//! - **Body**: the payload travels base64-encoded (SQS bodies are text
//!   and compressed or encrypted payloads are binary).
//! - **Attributes**: envelope headers map onto string message
//!   attributes.
//! - **Ack/nack**: ack deletes the message; `reject(requeue: true)`
//!   zeroes its visibility timeout so SQS redelivers immediately,
//!   `reject(requeue: false)` leaves it to the queue's own redrive
//!   policy.
//!
//! Delivery is at-least-once with the visibility-timeout semantics SQS
//! provides; a consumer crash simply lets the timeout lapse and the
//! message reappear.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use aws_sdk_sqs::types::{MessageAttributeValue, MessageSystemAttributeName};
use aws_sdk_sqs::Client;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_core::broker::{BrokerFuture, Dispatcher, SubscriptionInfo, Transport};
use courier_core::config::SqsOptions;
use courier_core::context::MessageContext;
use courier_core::error::BrokerError;
use courier_core::message::{headers as wire, Envelope};
use courier_core::options::PublishOptions;

/// SQS transport.
pub struct SqsTransport {
    options: SqsOptions,
    client: Mutex<Option<Client>>,
    consumer_tasks: Mutex<Vec<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
}

impl SqsTransport {
    /// Create a transport; the client is built on start from the
    /// ambient AWS configuration (environment, profile, instance role).
    #[must_use]
    pub fn new(options: SqsOptions) -> Self {
        Self {
            options,
            client: Mutex::new(None),
            consumer_tasks: Mutex::new(Vec::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a transport over an existing client (tests, custom
    /// endpoints).
    #[must_use]
    pub fn with_client(options: SqsOptions, client: Client) -> Self {
        Self {
            options,
            client: Mutex::new(Some(client)),
            consumer_tasks: Mutex::new(Vec::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn client(&self) -> Result<Client, BrokerError> {
        self.client.lock().await.clone().ok_or_else(|| {
            BrokerError::TransportUnavailable("SQS client not started".to_string())
        })
    }
}

/// Queue URL for a message type: sanitize the tag the way SQS queue
/// names require (alphanumeric, dash, underscore).
fn queue_url(prefix: &str, queue_name: &str) -> String {
    let sanitized: String = queue_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{prefix}{sanitized}")
}

fn attributes_for(envelope: &Envelope) -> HashMap<String, MessageAttributeValue> {
    envelope
        .headers
        .iter()
        .filter_map(|(name, value)| {
            MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .ok()
                .map(|attribute| (name.clone(), attribute))
        })
        .collect()
}

/// Rebuild an envelope from a received SQS message.
fn envelope_from_message(
    body: &str,
    attributes: Option<&HashMap<String, MessageAttributeValue>>,
) -> Result<Envelope, BrokerError> {
    let payload = BASE64
        .decode(body)
        .map_err(|e| BrokerError::Deserialization(format!("invalid base64 body: {e}")))?;

    let mut headers = HashMap::new();
    if let Some(attributes) = attributes {
        for (name, attribute) in attributes {
            if let Some(value) = attribute.string_value() {
                headers.insert(name.clone(), value.to_string());
            }
        }
    }

    let message_type = headers
        .get(wire::MESSAGE_TYPE)
        .cloned()
        .unwrap_or_default();
    let mut envelope = Envelope::new(message_type, payload);
    if let Some(message_id) = headers.get(wire::MESSAGE_ID) {
        envelope.message_id = message_id.clone();
    }
    envelope.correlation_id = headers.get(wire::CORRELATION_ID).cloned();
    envelope.headers = headers;
    Ok(envelope)
}

impl Transport for SqsTransport {
    fn name(&self) -> &'static str {
        "sqs"
    }

    fn publish_internal(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let client = self.client().await?;
            let queue = options
                .exchange
                .clone()
                .unwrap_or_else(|| envelope.message_type.clone());
            let url = queue_url(&self.options.queue_url_prefix, &queue);

            let mut request = client
                .send_message()
                .queue_url(&url)
                .message_body(BASE64.encode(&envelope.payload));
            for (name, attribute) in attributes_for(&envelope) {
                request = request.message_attributes(name, attribute);
            }
            if let Some(expiration) = options.expiration {
                // SQS has no per-message TTL; the delay is the nearest
                // native fit for "do not deliver yet" semantics callers
                // use expiration for on other transports.
                let delay = i32::try_from(expiration.as_secs().min(900)).unwrap_or(900);
                request = request.delay_seconds(delay);
            }

            request.send().await.map_err(|e| {
                BrokerError::PublishFailure(format!("SQS send failed: {e:?}"))
            })?;
            debug!(queue_url = %url, message_id = %envelope.message_id, "Sent to SQS");
            Ok(())
        })
    }

    #[allow(clippy::too_many_lines)] // Consumer loop owns the full at-least-once handshake
    fn subscribe_internal(
        &self,
        subscription: &SubscriptionInfo,
        dispatcher: Dispatcher,
    ) -> BrokerFuture<'_, ()> {
        let queue_name = subscription
            .options
            .queue_name
            .clone()
            .unwrap_or_else(|| subscription.message_type.clone());
        let url = queue_url(&self.options.queue_url_prefix, &queue_name);
        let wait_time = i32::try_from(self.options.wait_time_secs).unwrap_or(10);
        let visibility = i32::try_from(self.options.visibility_timeout_secs).unwrap_or(30);
        let max_messages = i32::try_from(self.options.max_messages).unwrap_or(10);
        let auto_ack = subscription.options.auto_ack;
        let stopping = Arc::clone(&self.stopping);

        Box::pin(async move {
            let client = self.client().await?;
            info!(queue_url = %url, "SQS subscription started");

            let task = tokio::spawn(async move {
                loop {
                    if stopping.load(Ordering::Acquire) {
                        break;
                    }

                    let received = client
                        .receive_message()
                        .queue_url(&url)
                        .max_number_of_messages(max_messages)
                        .wait_time_seconds(wait_time)
                        .visibility_timeout(visibility)
                        .message_attribute_names("All")
                        .message_system_attribute_names(MessageSystemAttributeName::All)
                        .send()
                        .await;

                    let messages = match received {
                        Ok(output) => output.messages.unwrap_or_default(),
                        Err(receive_error) => {
                            warn!(error = ?receive_error, "SQS receive failed, backing off");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                            continue;
                        },
                    };

                    for message in messages {
                        let Some(receipt_handle) = message.receipt_handle().map(ToString::to_string)
                        else {
                            warn!("SQS message without receipt handle");
                            continue;
                        };
                        let body = message.body().unwrap_or_default();

                        let envelope =
                            match envelope_from_message(body, message.message_attributes()) {
                                Ok(envelope) => envelope,
                                Err(decode_error) => {
                                    error!(error = %decode_error, "Undecodable SQS message, deleting");
                                    let _ = client
                                        .delete_message()
                                        .queue_url(&url)
                                        .receipt_handle(&receipt_handle)
                                        .send()
                                        .await;
                                    continue;
                                },
                            };

                        let retry_count = message
                            .attributes()
                            .and_then(|a| {
                                a.get(&MessageSystemAttributeName::ApproximateReceiveCount)
                            })
                            .and_then(|c| c.parse::<u32>().ok())
                            .map_or(0, |c| c.saturating_sub(1));

                        let mut context = MessageContext::from_envelope(&envelope)
                            .with_retry_count(retry_count);

                        let ack_client = client.clone();
                        let ack_url = url.clone();
                        let ack_handle = receipt_handle.clone();
                        context = context.with_ack(Arc::new(move || {
                            let client = ack_client.clone();
                            let url = ack_url.clone();
                            let handle = ack_handle.clone();
                            Box::pin(async move {
                                client
                                    .delete_message()
                                    .queue_url(&url)
                                    .receipt_handle(&handle)
                                    .send()
                                    .await
                                    .map(|_| ())
                                    .map_err(|e| {
                                        BrokerError::TransportUnavailable(format!(
                                            "SQS delete failed: {e:?}"
                                        ))
                                    })
                            })
                        }));

                        let nack_client = client.clone();
                        let nack_url = url.clone();
                        let nack_handle = receipt_handle.clone();
                        context = context.with_reject(Arc::new(move |requeue| {
                            let client = nack_client.clone();
                            let url = nack_url.clone();
                            let handle = nack_handle.clone();
                            Box::pin(async move {
                                if requeue {
                                    client
                                        .change_message_visibility()
                                        .queue_url(&url)
                                        .receipt_handle(&handle)
                                        .visibility_timeout(0)
                                        .send()
                                        .await
                                        .map(|_| ())
                                        .map_err(|e| {
                                            BrokerError::TransportUnavailable(format!(
                                                "SQS visibility change failed: {e:?}"
                                            ))
                                        })
                                } else {
                                    // Leave it to the queue's redrive
                                    // policy.
                                    Ok(())
                                }
                            })
                        }));

                        let dispatch_result = dispatcher.dispatch(envelope, context).await;

                        match dispatch_result {
                            Ok(()) => {
                                // Delete on success (or immediately under
                                // auto-ack): at-least-once either way.
                                if let Err(delete_error) = client
                                    .delete_message()
                                    .queue_url(&url)
                                    .receipt_handle(&receipt_handle)
                                    .send()
                                    .await
                                {
                                    warn!(
                                        error = ?delete_error,
                                        "SQS delete after dispatch failed, message may redeliver"
                                    );
                                }
                            },
                            Err(dispatch_error) => {
                                error!(error = %dispatch_error, "Dispatch failed");
                                if auto_ack {
                                    // Auto-ack deletes regardless of the
                                    // handler outcome.
                                    let _ = client
                                        .delete_message()
                                        .queue_url(&url)
                                        .receipt_handle(&receipt_handle)
                                        .send()
                                        .await;
                                }
                                // Otherwise the visibility timeout lapses
                                // and SQS redelivers.
                            },
                        }
                    }
                }
                debug!("SQS consumer task exiting");
            });
            self.consumer_tasks.lock().await.push(task);
            Ok(())
        })
    }

    fn start_internal(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let mut client = self.client.lock().await;
            if client.is_none() {
                let config =
                    aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                *client = Some(Client::new(&config));
                info!(
                    queue_url_prefix = %self.options.queue_url_prefix,
                    "SQS client created"
                );
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
            info!("SQS transport stopped");
            Ok(())
        })
    }
}
