//! Publish batching decorator.
//!
//! Accumulates serialized payloads per message type and hands the inner
//! broker one framed batch envelope per flush. A flush fires when a
//! type's accumulator reaches `max_batch_size`, when its oldest item
//! exceeds `flush_interval` (background timer), or on an explicit
//! [`BatchBroker::flush_all`]. Disposal flushes synchronously before the
//! inner broker shuts down; publishing after disposal fails with
//! [`BrokerError::Disposed`].
//!
//! On a failed flush with `partial_retry` enabled, the affected items are
//! re-enqueued for the next flush (a transport that cannot report a
//! partial result is treated as all-failed). With `partial_retry` off the
//! error propagates to whichever caller triggered the flush.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use courier_core::broker::{Broker, BrokerFuture, SubscriptionInfo};
use courier_core::config::BatchOptions;
use courier_core::error::BrokerError;
use courier_core::message::Envelope;
use courier_core::options::PublishOptions;
use courier_core::serialization::SerializationFormat;

/// Outcome of one batch dispatch. Adapters that can report per-item
/// failures populate `failed_indices`; an empty set means the whole batch
/// succeeded. Adapters without partial reporting return all-or-nothing
/// and the decorator maps a whole-batch error onto "all indices failed".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Zero-based indices of items that failed to publish.
    pub failed_indices: Vec<usize>,
}

/// Per-type accumulator.
struct Accumulator {
    items: Vec<Vec<u8>>,
    options: PublishOptions,
    first_at: Instant,
}

/// State shared between the decorator and its flush timer task.
struct BatchState {
    inner: Arc<dyn Broker>,
    options: BatchOptions,
    accumulators: Mutex<HashMap<String, Accumulator>>,
    disposed: AtomicBool,
}

impl BatchState {
    async fn dispatch_batch(
        &self,
        message_type: &str,
        accumulator: Accumulator,
    ) -> Result<(), BrokerError> {
        if accumulator.items.is_empty() {
            return Ok(());
        }
        let count = accumulator.items.len();
        let batch = Envelope::batch(message_type, &accumulator.items)?;
        debug!(message_type, count, "Flushing batch");

        match self
            .inner
            .publish_envelope(batch, accumulator.options.clone())
            .await
        {
            Ok(()) => Ok(()),
            Err(publish_error) if self.options.partial_retry => {
                // No partial result from the transport: treat the whole
                // batch as failed and requeue every item.
                error!(
                    message_type,
                    count,
                    error = %publish_error,
                    "Batch flush failed, re-enqueueing items"
                );
                let mut accumulators = self.accumulators.lock().await;
                let entry = accumulators
                    .entry(message_type.to_string())
                    .or_insert_with(|| Accumulator {
                        items: Vec::new(),
                        options: accumulator.options,
                        first_at: accumulator.first_at,
                    });
                let mut items = accumulator.items;
                items.append(&mut entry.items);
                entry.items = items;
                entry.first_at = entry.first_at.min(accumulator.first_at);
                Ok(())
            },
            Err(publish_error) => Err(publish_error),
        }
    }

    async fn flush_all(&self) -> Result<(), BrokerError> {
        let drained: Vec<(String, Accumulator)> = {
            let mut accumulators = self.accumulators.lock().await;
            accumulators.drain().collect()
        };
        for (message_type, accumulator) in drained {
            self.dispatch_batch(&message_type, accumulator).await?;
        }
        Ok(())
    }

    /// Drain accumulators whose oldest item is past the flush interval.
    async fn flush_expired(&self) {
        let interval = self.options.flush_interval();
        let expired: Vec<(String, Accumulator)> = {
            let mut accumulators = self.accumulators.lock().await;
            let expired_types: Vec<String> = accumulators
                .iter()
                .filter(|(_, a)| a.first_at.elapsed() >= interval)
                .map(|(t, _)| t.clone())
                .collect();
            expired_types
                .into_iter()
                .filter_map(|t| accumulators.remove_entry(&t))
                .collect()
        };
        for (message_type, accumulator) in expired {
            if let Err(flush_error) = self.dispatch_batch(&message_type, accumulator).await {
                error!(
                    message_type = %message_type,
                    error = %flush_error,
                    "Timed batch flush failed"
                );
            }
        }
    }
}

/// Batching broker decorator.
pub struct BatchBroker {
    state: Arc<BatchState>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl BatchBroker {
    /// Wrap `inner` with batching.
    #[must_use]
    pub fn new(inner: Arc<dyn Broker>, options: BatchOptions) -> Self {
        Self {
            state: Arc::new(BatchState {
                inner,
                options,
                accumulators: Mutex::new(HashMap::new()),
                disposed: AtomicBool::new(false),
            }),
            flush_task: Mutex::new(None),
        }
    }

    /// Flush every accumulator immediately.
    ///
    /// # Errors
    ///
    /// Returns the first flush failure. With `partial_retry` enabled a
    /// failed batch is re-enqueued instead and this returns `Ok`.
    pub async fn flush_all(&self) -> Result<(), BrokerError> {
        self.state.flush_all().await
    }

    /// Number of items currently buffered across all types.
    pub async fn buffered(&self) -> usize {
        let accumulators = self.state.accumulators.lock().await;
        accumulators.values().map(|a| a.items.len()).sum()
    }

    async fn start_flush_timer(&self) {
        if !self.state.options.enabled {
            return;
        }
        let mut task = self.flush_task.lock().await;
        if task.is_some() {
            return;
        }
        let state = Arc::clone(&self.state);
        // Tick faster than the interval so age-triggered flushes land
        // close to their deadline.
        let tick =
            (self.state.options.flush_interval() / 4).max(std::time::Duration::from_millis(10));
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if state.disposed.load(Ordering::Acquire) {
                    break;
                }
                state.flush_expired().await;
            }
        }));
        info!(
            flush_interval_ms = self.state.options.flush_interval_ms,
            max_batch_size = self.state.options.max_batch_size,
            "Batch flush timer started"
        );
    }

    async fn stop_flush_timer(&self) {
        if let Some(task) = self.flush_task.lock().await.take() {
            task.abort();
        }
    }
}

impl Broker for BatchBroker {
    fn publish_envelope(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if self.state.disposed.load(Ordering::Acquire) {
                return Err(BrokerError::Disposed);
            }
            if !self.state.options.enabled || envelope.is_batch() {
                return self.state.inner.publish_envelope(envelope, options).await;
            }

            let full = {
                let mut accumulators = self.state.accumulators.lock().await;
                let accumulator = accumulators
                    .entry(envelope.message_type.clone())
                    .or_insert_with(|| Accumulator {
                        items: Vec::new(),
                        options: options.clone(),
                        first_at: Instant::now(),
                    });
                accumulator.items.push(envelope.payload);
                if accumulator.items.len() >= self.state.options.max_batch_size {
                    accumulators.remove_entry(&envelope.message_type)
                } else {
                    None
                }
            };

            if let Some((message_type, accumulator)) = full {
                self.state.dispatch_batch(&message_type, accumulator).await?;
            }
            Ok(())
        })
    }

    fn subscribe_with(&self, subscription: SubscriptionInfo) -> BrokerFuture<'_, ()> {
        self.state.inner.subscribe_with(subscription)
    }

    fn start(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.state.inner.start().await?;
            self.start_flush_timer().await;
            Ok(())
        })
    }

    fn stop(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.stop_flush_timer().await;
            self.state.flush_all().await?;
            self.state.inner.stop().await
        })
    }

    fn shutdown(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if self.state.disposed.load(Ordering::Acquire) {
                return Ok(());
            }
            self.stop_flush_timer().await;
            // Synchronous final flush: buffered items must not be lost.
            self.state.flush_all().await?;
            self.state.disposed.store(true, Ordering::Release);
            self.state.inner.shutdown().await
        })
    }

    fn serialization(&self) -> SerializationFormat {
        self.state.inner.serialization()
    }
}
