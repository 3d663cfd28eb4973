//! Poison-message quarantine.
//!
//! A message that keeps failing is worse than a lost message: it wedges
//! consumers and burns retries. The poison handler tracks failures per
//! message id; once a message crosses `failure_threshold` it is moved —
//! atomically, together with its accumulated context — into the poison
//! store and its in-memory tracker entry is cleared. Quarantined
//! messages can be inspected, reprocessed (which removes them from the
//! store) or left to age out under the retention sweep.
//!
//! The store is a trait so deployments can persist quarantine durably;
//! the in-memory implementation here covers single-process brokers and
//! tests.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_core::broker::{Broker, BrokerFuture, SubscriptionInfo};
use courier_core::config::PoisonMessageOptions;
use courier_core::context::MessageContext;
use courier_core::error::BrokerError;
use courier_core::message::Envelope;
use courier_core::options::PublishOptions;
use courier_core::serialization::SerializationFormat;

/// A quarantined message with its accumulated failure context.
#[derive(Debug, Clone)]
pub struct PoisonedMessage {
    /// Quarantine record id.
    pub id: Uuid,
    /// The original message id.
    pub original_message_id: String,
    /// The message type tag.
    pub message_type: String,
    /// The payload as last delivered.
    pub payload: Vec<u8>,
    /// How many times handling failed before quarantine.
    pub failure_count: u32,
    /// Every failure reason, in order.
    pub errors: Vec<String>,
    /// When the first failure was recorded.
    pub first_failure_at: DateTime<Utc>,
    /// When the last failure was recorded.
    pub last_failure_at: DateTime<Utc>,
    /// Wire headers at delivery time.
    pub headers: HashMap<String, String>,
    /// Routing key the message arrived under, if any.
    pub routing_key: Option<String>,
    /// Exchange or topic the message arrived on, if any.
    pub exchange: Option<String>,
    /// Correlation id, if any.
    pub correlation_id: Option<String>,
}

/// Storage for quarantined messages.
pub trait PoisonStore: Send + Sync {
    /// Insert a quarantined message.
    fn insert(&self, message: PoisonedMessage) -> BrokerFuture<'_, ()>;

    /// List up to `limit` quarantined messages, oldest first.
    fn list(&self, limit: usize) -> BrokerFuture<'_, Vec<PoisonedMessage>>;

    /// Remove and return a quarantined message (reprocessing).
    fn take(&self, id: Uuid) -> BrokerFuture<'_, Option<PoisonedMessage>>;

    /// Remove records whose last failure predates `cutoff`; returns how
    /// many were removed.
    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> BrokerFuture<'_, usize>;

    /// Number of quarantined messages.
    fn len(&self) -> BrokerFuture<'_, usize>;

    /// Whether the store is empty.
    fn is_empty(&self) -> BrokerFuture<'_, bool> {
        Box::pin(async move { Ok(self.len().await? == 0) })
    }
}

/// In-memory poison store.
#[derive(Default)]
pub struct InMemoryPoisonStore {
    records: RwLock<HashMap<Uuid, PoisonedMessage>>,
}

impl InMemoryPoisonStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PoisonStore for InMemoryPoisonStore {
    fn insert(&self, message: PoisonedMessage) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.records.write().await.insert(message.id, message);
            Ok(())
        })
    }

    fn list(&self, limit: usize) -> BrokerFuture<'_, Vec<PoisonedMessage>> {
        Box::pin(async move {
            let records = self.records.read().await;
            let mut list: Vec<PoisonedMessage> = records.values().cloned().collect();
            list.sort_by_key(|m| m.first_failure_at);
            list.truncate(limit);
            Ok(list)
        })
    }

    fn take(&self, id: Uuid) -> BrokerFuture<'_, Option<PoisonedMessage>> {
        Box::pin(async move { Ok(self.records.write().await.remove(&id)) })
    }

    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> BrokerFuture<'_, usize> {
        Box::pin(async move {
            let mut records = self.records.write().await;
            let before = records.len();
            records.retain(|_, m| m.last_failure_at >= cutoff);
            Ok(before - records.len())
        })
    }

    fn len(&self) -> BrokerFuture<'_, usize> {
        Box::pin(async move { Ok(self.records.read().await.len()) })
    }
}

/// Per-message-id failure accumulator.
struct FailureEntry {
    count: u32,
    errors: Vec<String>,
    first_failure_at: DateTime<Utc>,
}

/// Tracks handler failures and quarantines messages past the threshold.
pub struct PoisonMessageHandler {
    options: PoisonMessageOptions,
    store: Arc<dyn PoisonStore>,
    tracker: Mutex<HashMap<String, FailureEntry>>,
}

impl PoisonMessageHandler {
    /// Create a handler over `store`.
    #[must_use]
    pub fn new(options: PoisonMessageOptions, store: Arc<dyn PoisonStore>) -> Self {
        Self {
            options,
            store,
            tracker: Mutex::new(HashMap::new()),
        }
    }

    /// The quarantine store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PoisonStore> {
        &self.store
    }

    /// Record one handling failure for the envelope.
    ///
    /// Returns the quarantine record id when this failure crossed the
    /// threshold and moved the message into the store.
    ///
    /// # Errors
    ///
    /// Surfaces store failures.
    pub async fn record_failure(
        &self,
        envelope: &Envelope,
        context: &MessageContext,
        reason: &str,
    ) -> Result<Option<Uuid>, BrokerError> {
        let now = Utc::now();
        let quarantine = {
            let mut tracker = self.tracker.lock().await;
            let entry = tracker
                .entry(envelope.message_id.clone())
                .or_insert_with(|| FailureEntry {
                    count: 0,
                    errors: Vec::new(),
                    first_failure_at: now,
                });
            entry.count += 1;
            entry.errors.push(reason.to_string());
            debug!(
                message_id = %envelope.message_id,
                failures = entry.count,
                threshold = self.options.failure_threshold,
                "Recorded handler failure"
            );
            if entry.count >= self.options.failure_threshold {
                // The tracker entry moves out atomically with the insert
                // below; it must not survive quarantine.
                tracker.remove(&envelope.message_id)
            } else {
                None
            }
        };

        let Some(entry) = quarantine else {
            return Ok(None);
        };

        let record = PoisonedMessage {
            id: Uuid::new_v4(),
            original_message_id: envelope.message_id.clone(),
            message_type: envelope.message_type.clone(),
            payload: envelope.payload.clone(),
            failure_count: entry.count,
            errors: entry.errors,
            first_failure_at: entry.first_failure_at,
            last_failure_at: now,
            headers: envelope.headers.clone(),
            routing_key: context.routing_key.clone(),
            exchange: context.exchange.clone(),
            correlation_id: envelope.correlation_id.clone(),
        };
        let record_id = record.id;
        warn!(
            message_id = %envelope.message_id,
            message_type = %envelope.message_type,
            failures = record.failure_count,
            "Message quarantined"
        );
        self.store.insert(record).await?;
        Ok(Some(record_id))
    }

    /// Current failure count for a message id still under tracking.
    pub async fn failure_count(&self, message_id: &str) -> u32 {
        self.tracker
            .lock()
            .await
            .get(message_id)
            .map_or(0, |entry| entry.count)
    }

    /// Remove a message from quarantine and republish it through
    /// `broker`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidArgument`] for an unknown id and
    /// surfaces publish failures (the record is re-inserted on failure so
    /// nothing is lost).
    pub async fn reprocess(
        &self,
        id: Uuid,
        broker: &dyn Broker,
    ) -> Result<(), BrokerError> {
        let Some(record) = self.store.take(id).await? else {
            return Err(BrokerError::InvalidArgument(format!(
                "no quarantined message with id {id}"
            )));
        };

        let mut envelope = Envelope::new(record.message_type.clone(), record.payload.clone());
        envelope.headers.extend(record.headers.clone());
        if let Some(correlation_id) = &record.correlation_id {
            envelope = envelope.with_correlation_id(correlation_id.clone());
        }
        let options = record
            .routing_key
            .clone()
            .map_or_else(PublishOptions::default, |key| {
                PublishOptions::default().with_routing_key(key)
            });

        if let Err(publish_error) = broker.publish_envelope(envelope, options).await {
            self.store.insert(record).await?;
            return Err(publish_error);
        }
        info!(quarantine_id = %id, "Quarantined message reprocessed");
        Ok(())
    }

    /// Drop quarantined records older than the retention period.
    ///
    /// # Errors
    ///
    /// Surfaces store failures.
    pub async fn purge_expired(&self) -> Result<usize, BrokerError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.options.retention_period())
                .unwrap_or_else(|_| chrono::Duration::days(1));
        self.store.purge_older_than(cutoff).await
    }
}

/// Broker decorator that counts handler failures per delivery and feeds
/// the quarantine.
pub struct PoisonBroker {
    inner: Arc<dyn Broker>,
    handler: Arc<PoisonMessageHandler>,
    enabled: bool,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    disposed: Arc<AtomicBool>,
}

impl PoisonBroker {
    /// Wrap `inner` with poison-message handling over `store`.
    #[must_use]
    pub fn new(
        inner: Arc<dyn Broker>,
        options: PoisonMessageOptions,
        store: Arc<dyn PoisonStore>,
    ) -> Self {
        let enabled = options.enabled;
        Self {
            inner,
            handler: Arc::new(PoisonMessageHandler::new(options, store)),
            enabled,
            sweep_task: Mutex::new(None),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The failure tracker and quarantine handle.
    #[must_use]
    pub fn handler(&self) -> &Arc<PoisonMessageHandler> {
        &self.handler
    }

    async fn start_sweeper(&self) {
        if !self.enabled {
            return;
        }
        let mut task = self.sweep_task.lock().await;
        if task.is_some() {
            return;
        }
        let handler = Arc::clone(&self.handler);
        let disposed = Arc::clone(&self.disposed);
        let interval = handler.options.sweep_interval();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if disposed.load(Ordering::Acquire) {
                    break;
                }
                match handler.purge_expired().await {
                    Ok(0) => {},
                    Ok(removed) => {
                        info!(removed, "Poison retention sweep removed records");
                    },
                    Err(sweep_error) => {
                        warn!(error = %sweep_error, "Poison retention sweep failed");
                    },
                }
            }
        }));
    }

    async fn stop_sweeper(&self) {
        if let Some(task) = self.sweep_task.lock().await.take() {
            task.abort();
        }
    }
}

impl Broker for PoisonBroker {
    fn publish_envelope(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()> {
        self.inner.publish_envelope(envelope, options)
    }

    fn subscribe_with(&self, subscription: SubscriptionInfo) -> BrokerFuture<'_, ()> {
        if !self.enabled {
            return self.inner.subscribe_with(subscription);
        }

        // Wrap the handler so every failure feeds the tracker before the
        // error continues to the dispatch loop's logging.
        let handler = Arc::clone(&self.handler);
        let user_handler = subscription.handler;
        let wrapped: courier_core::broker::ErasedHandler =
            Arc::new(move |envelope: Envelope, context: MessageContext| {
                let handler = Arc::clone(&handler);
                let user_handler = Arc::clone(&user_handler);
                Box::pin(async move {
                    match user_handler(envelope.clone(), context.clone()).await {
                        Ok(()) => Ok(()),
                        Err(handler_error) => {
                            let reason = handler_error.to_string();
                            if let Err(track_error) =
                                handler.record_failure(&envelope, &context, &reason).await
                            {
                                warn!(
                                    error = %track_error,
                                    "Failed to record poison failure"
                                );
                            }
                            Err(handler_error)
                        },
                    }
                })
            });

        let subscription = SubscriptionInfo {
            message_type: subscription.message_type,
            options: subscription.options,
            handler: wrapped,
        };
        self.inner.subscribe_with(subscription)
    }

    fn start(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.inner.start().await?;
            self.start_sweeper().await;
            Ok(())
        })
    }

    fn stop(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.stop_sweeper().await;
            self.inner.stop().await
        })
    }

    fn shutdown(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.disposed.store(true, Ordering::Release);
            self.stop_sweeper().await;
            self.inner.shutdown().await
        })
    }

    fn serialization(&self) -> SerializationFormat {
        self.inner.serialization()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options(failure_threshold: u32) -> PoisonMessageOptions {
        PoisonMessageOptions {
            enabled: true,
            failure_threshold,
            retention_period_ms: 86_400_000,
            sweep_interval_ms: 50,
        }
    }

    fn handler_with_store(threshold: u32) -> (Arc<InMemoryPoisonStore>, PoisonMessageHandler) {
        let store = Arc::new(InMemoryPoisonStore::new());
        let handler = PoisonMessageHandler::new(
            options(threshold),
            Arc::clone(&store) as Arc<dyn PoisonStore>,
        );
        (store, handler)
    }

    #[tokio::test]
    async fn threshold_moves_message_into_quarantine() {
        let (store, handler) = handler_with_store(3);
        let envelope = Envelope::new("Order.v1", vec![1, 2, 3]).with_correlation_id("corr-9");
        let context = MessageContext::from_envelope(&envelope).with_routing_key("orders.eu");

        assert!(
            handler
                .record_failure(&envelope, &context, "first")
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            handler
                .record_failure(&envelope, &context, "second")
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(handler.failure_count(&envelope.message_id).await, 2);

        let quarantined = handler
            .record_failure(&envelope, &context, "third")
            .await
            .unwrap();
        assert!(quarantined.is_some());

        // Tracker entry cleared atomically with the move.
        assert_eq!(handler.failure_count(&envelope.message_id).await, 0);

        let records = store.list(10).await.unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.failure_count, 3);
        assert_eq!(record.errors, vec!["first", "second", "third"]);
        assert_eq!(record.original_message_id, envelope.message_id);
        assert_eq!(record.routing_key.as_deref(), Some("orders.eu"));
        assert_eq!(record.correlation_id.as_deref(), Some("corr-9"));
        assert!(record.first_failure_at <= record.last_failure_at);
    }

    #[tokio::test]
    async fn distinct_message_ids_are_tracked_separately() {
        let (store, handler) = handler_with_store(2);
        let first = Envelope::new("T.v1", vec![1]);
        let second = Envelope::new("T.v1", vec![2]);
        let ctx1 = MessageContext::from_envelope(&first);
        let ctx2 = MessageContext::from_envelope(&second);

        handler.record_failure(&first, &ctx1, "a").await.unwrap();
        handler.record_failure(&second, &ctx2, "b").await.unwrap();
        assert!(store.is_empty().await.unwrap());

        handler.record_failure(&first, &ctx1, "a2").await.unwrap();
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retention_purge_removes_old_records() {
        let (store, handler) = handler_with_store(1);
        let envelope = Envelope::new("T.v1", vec![1]);
        let context = MessageContext::from_envelope(&envelope);
        handler
            .record_failure(&envelope, &context, "boom")
            .await
            .unwrap();

        // Nothing is old enough yet.
        assert_eq!(handler.purge_expired().await.unwrap(), 0);

        // Future cutoff removes everything.
        let removed = store
            .purge_older_than(Utc::now() + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.is_empty().await.unwrap());
    }

    #[derive(Default)]
    struct NullBroker {
        published: std::sync::Mutex<Vec<Envelope>>,
    }

    impl Broker for NullBroker {
        fn publish_envelope(
            &self,
            envelope: Envelope,
            _options: PublishOptions,
        ) -> BrokerFuture<'_, ()> {
            Box::pin(async move {
                self.published.lock().unwrap().push(envelope);
                Ok(())
            })
        }

        fn subscribe_with(&self, _subscription: SubscriptionInfo) -> BrokerFuture<'_, ()> {
            Box::pin(async { Ok(()) })
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
    async fn reprocess_removes_from_store_and_republishes() {
        let (store, handler) = handler_with_store(1);
        let envelope = Envelope::new("T.v1", vec![9]);
        let context = MessageContext::from_envelope(&envelope);
        let id = handler
            .record_failure(&envelope, &context, "boom")
            .await
            .unwrap()
            .unwrap();

        let target = NullBroker::default();
        handler.reprocess(id, &target).await.unwrap();

        assert!(store.is_empty().await.unwrap());
        let published = target.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload, vec![9]);
    }

    /// Inner broker that captures the (wrapped) subscription it receives.
    struct Capturing {
        slot: Arc<std::sync::Mutex<Option<SubscriptionInfo>>>,
    }

    impl Broker for Capturing {
        fn publish_envelope(
            &self,
            _envelope: Envelope,
            _options: PublishOptions,
        ) -> BrokerFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
        fn subscribe_with(&self, subscription: SubscriptionInfo) -> BrokerFuture<'_, ()> {
            *self.slot.lock().unwrap() = Some(subscription);
            Box::pin(async { Ok(()) })
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
    async fn decorator_counts_failures_through_the_handler_chain() {
        let store = Arc::new(InMemoryPoisonStore::new());
        let failing: courier_core::broker::ErasedHandler = Arc::new(|_, _| {
            Box::pin(async { Err(BrokerError::Handler("kaboom".to_string())) })
        });
        let captured: Arc<std::sync::Mutex<Option<SubscriptionInfo>>> =
            Arc::new(std::sync::Mutex::new(None));

        let capturing = Arc::new(Capturing {
            slot: Arc::clone(&captured),
        });
        let broker = PoisonBroker::new(
            capturing as Arc<dyn Broker>,
            options(2),
            Arc::clone(&store) as Arc<dyn PoisonStore>,
        );

        broker
            .subscribe_with(SubscriptionInfo::new(
                "T.v1",
                courier_core::options::SubscriptionOptions::default(),
                failing,
            ))
            .await
            .unwrap();

        let wrapped = captured.lock().unwrap().take().unwrap();
        let envelope = Envelope::new("T.v1", vec![1]);
        let context = MessageContext::from_envelope(&envelope);

        let _first = (wrapped.handler)(envelope.clone(), context.clone()).await;
        assert!(store.is_empty().await.unwrap());
        let _second = (wrapped.handler)(envelope, context).await;
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sweeper_runs_under_decorator_lifecycle() {
        let store = Arc::new(InMemoryPoisonStore::new());
        let mut opts = options(1);
        opts.retention_period_ms = 10;
        let broker = PoisonBroker::new(
            Arc::new(NullBroker::default()) as Arc<dyn Broker>,
            opts,
            Arc::clone(&store) as Arc<dyn PoisonStore>,
        );

        let envelope = Envelope::new("T.v1", vec![1]);
        let context = MessageContext::from_envelope(&envelope);
        broker
            .handler()
            .record_failure(&envelope, &context, "boom")
            .await
            .unwrap();
        assert_eq!(store.len().await.unwrap(), 1);

        broker.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.is_empty().await.unwrap());
        broker.shutdown().await.unwrap();
    }
}
