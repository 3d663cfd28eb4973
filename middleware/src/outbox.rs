//! Outbox: persist-before-publish.
//!
//! A publish through the outbox decorator is stored first and pushed to
//! the wire later by a relay loop, so a caller observing a successful
//! `store` knows the message will eventually go out (at-least-once)
//! even if the process dies in between. The relay drains Pending
//! messages in creation order; failures mark the record Failed with the
//! error and retry accounting, and failed records can be re-driven in
//! bounded batches.
//!
//! The store is a trait so the outbox can sit on a database in real
//! deployments; the in-memory implementation covers single-process
//! brokers and tests.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_core::broker::{Broker, BrokerFuture, SubscriptionInfo};
use courier_core::config::OutboxOptions;
use courier_core::error::BrokerError;
use courier_core::message::Envelope;
use courier_core::options::PublishOptions;
use courier_core::serialization::SerializationFormat;

/// Delivery status of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    /// Stored, not yet published.
    Pending,
    /// Published successfully.
    Published,
    /// Last publish attempt failed.
    Failed,
}

/// One stored outbox record.
#[derive(Debug, Clone)]
pub struct OutboxMessage {
    /// Record id.
    pub id: Uuid,
    /// Message type tag.
    pub message_type: String,
    /// Serialized payload.
    pub payload: Vec<u8>,
    /// Wire headers captured at store time.
    pub headers: HashMap<String, String>,
    /// Publish options captured at store time.
    pub options: PublishOptions,
    /// Delivery status.
    pub status: OutboxStatus,
    /// When the record was stored.
    pub created_at: DateTime<Utc>,
    /// When the record was published, if it was.
    pub published_at: Option<DateTime<Utc>>,
    /// Failed publish attempts.
    pub retry_count: u32,
    /// Error from the last failed attempt.
    pub last_error: Option<String>,
}

/// Storage for outbox records.
pub trait OutboxStore: Send + Sync {
    /// Persist a new Pending record.
    fn store(&self, message: OutboxMessage) -> BrokerFuture<'_, ()>;

    /// Up to `limit` Pending records in creation order.
    fn pending(&self, limit: usize) -> BrokerFuture<'_, Vec<OutboxMessage>>;

    /// Mark a record Published.
    fn mark_published(&self, id: Uuid, at: DateTime<Utc>) -> BrokerFuture<'_, ()>;

    /// Mark a record Failed, retaining the error and bumping the retry
    /// count.
    fn mark_failed<'a>(&'a self, id: Uuid, error: &'a str) -> BrokerFuture<'a, ()>;

    /// Up to `limit` Failed records in creation order, for inspection or
    /// re-driving.
    fn failed(&self, limit: usize) -> BrokerFuture<'_, Vec<OutboxMessage>>;

    /// Reset a Failed record to Pending.
    fn redrive(&self, id: Uuid) -> BrokerFuture<'_, ()>;

    /// Total records in the store.
    fn len(&self) -> BrokerFuture<'_, usize>;

    /// Whether the store is empty.
    fn is_empty(&self) -> BrokerFuture<'_, bool> {
        Box::pin(async move { Ok(self.len().await? == 0) })
    }
}

/// In-memory outbox store.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    records: RwLock<HashMap<Uuid, OutboxMessage>>,
}

impl InMemoryOutboxStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn by_status(&self, status: OutboxStatus, limit: usize) -> Vec<OutboxMessage> {
        let records = self.records.read().await;
        let mut list: Vec<OutboxMessage> = records
            .values()
            .filter(|m| m.status == status)
            .cloned()
            .collect();
        list.sort_by_key(|m| m.created_at);
        list.truncate(limit);
        list
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn store(&self, message: OutboxMessage) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.records.write().await.insert(message.id, message);
            Ok(())
        })
    }

    fn pending(&self, limit: usize) -> BrokerFuture<'_, Vec<OutboxMessage>> {
        Box::pin(async move { Ok(self.by_status(OutboxStatus::Pending, limit).await) })
    }

    fn mark_published(&self, id: Uuid, at: DateTime<Utc>) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if let Some(record) = self.records.write().await.get_mut(&id) {
                record.status = OutboxStatus::Published;
                record.published_at = Some(at);
            }
            Ok(())
        })
    }

    fn mark_failed<'a>(&'a self, id: Uuid, error: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            if let Some(record) = self.records.write().await.get_mut(&id) {
                record.status = OutboxStatus::Failed;
                record.retry_count += 1;
                record.last_error = Some(error.to_string());
            }
            Ok(())
        })
    }

    fn failed(&self, limit: usize) -> BrokerFuture<'_, Vec<OutboxMessage>> {
        Box::pin(async move { Ok(self.by_status(OutboxStatus::Failed, limit).await) })
    }

    fn redrive(&self, id: Uuid) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if let Some(record) = self.records.write().await.get_mut(&id) {
                if record.status == OutboxStatus::Failed {
                    record.status = OutboxStatus::Pending;
                }
            }
            Ok(())
        })
    }

    fn len(&self) -> BrokerFuture<'_, usize> {
        Box::pin(async move { Ok(self.records.read().await.len()) })
    }
}

/// State shared between the decorator and its relay task.
struct OutboxState {
    inner: Arc<dyn Broker>,
    store: Arc<dyn OutboxStore>,
    options: OutboxOptions,
}

impl OutboxState {
    /// One relay pass: drain a batch of Pending records oldest-first.
    async fn relay_once(&self) -> Result<usize, BrokerError> {
        let pending = self.store.pending(self.options.relay_batch_size).await?;
        let mut published = 0;
        for record in pending {
            let mut envelope = Envelope::new(record.message_type.clone(), record.payload.clone());
            envelope.headers.extend(record.headers.clone());

            match self
                .inner
                .publish_envelope(envelope, record.options.clone())
                .await
            {
                Ok(()) => {
                    self.store.mark_published(record.id, Utc::now()).await?;
                    published += 1;
                },
                Err(publish_error) => {
                    warn!(
                        outbox_id = %record.id,
                        message_type = %record.message_type,
                        error = %publish_error,
                        "Outbox relay publish failed"
                    );
                    self.store
                        .mark_failed(record.id, &publish_error.to_string())
                        .await?;
                },
            }
        }
        Ok(published)
    }
}

/// Outbox broker decorator.
pub struct OutboxBroker {
    state: Arc<OutboxState>,
    relay_task: Mutex<Option<JoinHandle<()>>>,
    disposed: Arc<AtomicBool>,
}

impl OutboxBroker {
    /// Wrap `inner` with an outbox over `store`.
    #[must_use]
    pub fn new(
        inner: Arc<dyn Broker>,
        options: OutboxOptions,
        store: Arc<dyn OutboxStore>,
    ) -> Self {
        Self {
            state: Arc::new(OutboxState {
                inner,
                store,
                options,
            }),
            relay_task: Mutex::new(None),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The outbox store, for inspection and re-driving.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn OutboxStore> {
        &self.state.store
    }

    /// Run one relay pass immediately; returns how many records were
    /// published.
    ///
    /// # Errors
    ///
    /// Surfaces store failures. Publish failures are recorded on the
    /// affected records, not returned.
    pub async fn relay_once(&self) -> Result<usize, BrokerError> {
        self.state.relay_once().await
    }

    /// Reset up to `limit` Failed records to Pending.
    ///
    /// # Errors
    ///
    /// Surfaces store failures.
    pub async fn redrive_failed(&self, limit: usize) -> Result<usize, BrokerError> {
        let failed = self.state.store.failed(limit).await?;
        let count = failed.len();
        for record in failed {
            self.state.store.redrive(record.id).await?;
        }
        Ok(count)
    }

    async fn start_relay(&self) {
        if !self.state.options.enabled {
            return;
        }
        let mut task = self.relay_task.lock().await;
        if task.is_some() {
            return;
        }
        let state = Arc::clone(&self.state);
        let disposed = Arc::clone(&self.disposed);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(state.options.relay_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if disposed.load(Ordering::Acquire) {
                    break;
                }
                match state.relay_once().await {
                    Ok(0) => {},
                    Ok(published) => debug!(published, "Outbox relay pass"),
                    Err(relay_error) => {
                        warn!(error = %relay_error, "Outbox relay pass failed");
                    },
                }
            }
        }));
        info!(
            relay_interval_ms = self.state.options.relay_interval_ms,
            relay_batch_size = self.state.options.relay_batch_size,
            "Outbox relay started"
        );
    }

    async fn stop_relay(&self) {
        if let Some(task) = self.relay_task.lock().await.take() {
            task.abort();
        }
    }
}

impl Broker for OutboxBroker {
    fn publish_envelope(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if self.disposed.load(Ordering::Acquire) {
                return Err(BrokerError::Disposed);
            }
            if !self.state.options.enabled {
                return self.state.inner.publish_envelope(envelope, options).await;
            }

            let record = OutboxMessage {
                id: Uuid::new_v4(),
                message_type: envelope.message_type,
                payload: envelope.payload,
                headers: envelope.headers,
                options,
                status: OutboxStatus::Pending,
                created_at: Utc::now(),
                published_at: None,
                retry_count: 0,
                last_error: None,
            };
            debug!(outbox_id = %record.id, "Message stored in outbox");
            self.state.store.store(record).await
        })
    }

    fn subscribe_with(&self, subscription: SubscriptionInfo) -> BrokerFuture<'_, ()> {
        self.state.inner.subscribe_with(subscription)
    }

    fn start(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.state.inner.start().await?;
            self.start_relay().await;
            Ok(())
        })
    }

    fn stop(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.stop_relay().await;
            self.state.inner.stop().await
        })
    }

    fn shutdown(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if self.disposed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            self.stop_relay().await;
            self.state.inner.shutdown().await
        })
    }

    fn serialization(&self) -> SerializationFormat {
        self.state.inner.serialization()
    }
}
