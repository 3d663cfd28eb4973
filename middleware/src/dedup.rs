//! Deduplication cache and decorator.
//!
//! Suppresses repeated publishes of identical payloads within a time
//! window. Identity is the SHA-256 of the payload bytes, so semantically
//! identical messages published twice hash the same regardless of their
//! message ids. The cache is bounded: when `max_cache_size` is reached
//! the oldest entry (by insertion) is evicted, and a background sweep
//! drops expired entries between checks.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use courier_core::broker::{Broker, BrokerFuture, SubscriptionInfo};
use courier_core::config::DeduplicationOptions;
use courier_core::error::BrokerError;
use courier_core::message::Envelope;
use courier_core::options::PublishOptions;
use courier_core::serialization::SerializationFormat;

/// Hash a payload for deduplication.
#[must_use]
pub fn payload_hash(payload: &[u8]) -> String {
    use std::fmt::Write;

    let digest = Sha256::digest(payload);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        // Writing into a String cannot fail.
        let _ = write!(out, "{byte:02x}");
    }
    out
}

struct CacheEntry {
    inserted_at: Instant,
    expires_at: Instant,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    // Insertion order; stale rows (whose hash was refreshed later) are
    // skipped lazily during eviction.
    order: VecDeque<(String, Instant)>,
}

/// Point-in-time cache metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeduplicationMetrics {
    /// `is_duplicate` checks performed.
    pub total_checks: u64,
    /// Checks that found a duplicate.
    pub duplicates_detected: u64,
    /// Entries evicted by the size bound.
    pub evictions: u64,
    /// Live entries.
    pub current_size: usize,
    /// Duplicates per check, `0.0` when no checks have run.
    pub hit_rate: f64,
}

/// Bounded, time-windowed duplicate detector.
pub struct DeduplicationCache {
    options: DeduplicationOptions,
    inner: Mutex<CacheInner>,
    total_checks: AtomicU64,
    duplicates: AtomicU64,
    evictions: AtomicU64,
}

impl DeduplicationCache {
    /// Create a cache.
    #[must_use]
    pub fn new(options: DeduplicationOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            total_checks: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Record `hash` with the configured window.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidArgument`] for a blank hash.
    pub async fn add(&self, hash: &str) -> Result<(), BrokerError> {
        self.add_with_ttl(hash, self.options.window()).await
    }

    /// Record `hash` with an explicit time-to-live.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidArgument`] for a blank hash.
    pub async fn add_with_ttl(&self, hash: &str, ttl: Duration) -> Result<(), BrokerError> {
        Self::require_hash(hash)?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.entries.insert(
            hash.to_string(),
            CacheEntry {
                inserted_at: now,
                expires_at: now + ttl,
            },
        );
        inner.order.push_back((hash.to_string(), now));
        self.enforce_bound(&mut inner);
        Ok(())
    }

    /// Whether `hash` was added within its window and not evicted.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidArgument`] for a blank hash.
    pub async fn is_duplicate(&self, hash: &str) -> Result<bool, BrokerError> {
        Self::require_hash(hash)?;
        self.total_checks.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let inner = self.inner.lock().await;
        let duplicate = inner
            .entries
            .get(hash)
            .is_some_and(|entry| entry.expires_at > now);
        drop(inner);
        if duplicate {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
        }
        Ok(duplicate)
    }

    /// Drop expired entries. Called by the background sweep.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        let CacheInner { entries, order } = &mut *inner;
        entries.retain(|_, entry| entry.expires_at > now);
        // Compact the order queue down to live rows.
        order.retain(|(hash, inserted_at)| {
            entries
                .get(hash)
                .is_some_and(|entry| entry.inserted_at == *inserted_at)
        });
        before - entries.len()
    }

    /// Current metrics.
    pub async fn metrics(&self) -> DeduplicationMetrics {
        let total = self.total_checks.load(Ordering::Relaxed);
        let duplicates = self.duplicates.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if total == 0 {
            0.0
        } else {
            duplicates as f64 / total as f64
        };
        DeduplicationMetrics {
            total_checks: total,
            duplicates_detected: duplicates,
            evictions: self.evictions.load(Ordering::Relaxed),
            current_size: self.inner.lock().await.entries.len(),
            hit_rate,
        }
    }

    fn enforce_bound(&self, inner: &mut CacheInner) {
        while inner.entries.len() > self.options.max_cache_size {
            let Some((hash, inserted_at)) = inner.order.pop_front() else {
                break;
            };
            // Skip rows superseded by a later re-add of the same hash.
            let current = inner.entries.get(&hash);
            if current.is_some_and(|entry| entry.inserted_at == inserted_at) {
                inner.entries.remove(&hash);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn require_hash(hash: &str) -> Result<(), BrokerError> {
        if hash.trim().is_empty() {
            return Err(BrokerError::InvalidArgument(
                "deduplication hash must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

/// Deduplicating broker decorator. A duplicate publish is dropped with a
/// debug log and reported as success to the caller; at-least-once
/// delivery makes a dropped duplicate indistinguishable from a delivered
/// one at the consumer.
pub struct DedupBroker {
    inner: Arc<dyn Broker>,
    cache: Arc<DeduplicationCache>,
    enabled: bool,
    sweep_interval: Duration,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    disposed: Arc<AtomicBool>,
}

impl DedupBroker {
    /// Wrap `inner` with deduplication.
    #[must_use]
    pub fn new(inner: Arc<dyn Broker>, options: DeduplicationOptions) -> Self {
        let enabled = options.enabled;
        let sweep_interval = options.sweep_interval();
        Self {
            inner,
            cache: Arc::new(DeduplicationCache::new(options)),
            enabled,
            sweep_interval,
            sweep_task: Mutex::new(None),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The underlying cache, for metrics inspection.
    #[must_use]
    pub fn cache(&self) -> &Arc<DeduplicationCache> {
        &self.cache
    }

    async fn start_sweeper(&self) {
        if !self.enabled {
            return;
        }
        let mut task = self.sweep_task.lock().await;
        if task.is_some() {
            return;
        }
        let cache = Arc::clone(&self.cache);
        let disposed = Arc::clone(&self.disposed);
        let interval = self.sweep_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if disposed.load(Ordering::Acquire) {
                    break;
                }
                let removed = cache.sweep().await;
                if removed > 0 {
                    debug!(removed, "Deduplication sweep removed expired entries");
                }
            }
        }));
        info!(
            sweep_interval_ms = self.sweep_interval.as_millis() as u64,
            "Deduplication sweeper started"
        );
    }

    async fn stop_sweeper(&self) {
        if let Some(task) = self.sweep_task.lock().await.take() {
            task.abort();
        }
    }
}

impl Broker for DedupBroker {
    fn publish_envelope(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if !self.enabled {
                return self.inner.publish_envelope(envelope, options).await;
            }

            let hash = payload_hash(&envelope.payload);
            if self.cache.is_duplicate(&hash).await? {
                debug!(
                    message_type = %envelope.message_type,
                    message_id = %envelope.message_id,
                    "Duplicate payload suppressed"
                );
                return Ok(());
            }
            self.cache.add(&hash).await?;
            self.inner.publish_envelope(envelope, options).await
        })
    }

    fn subscribe_with(&self, subscription: SubscriptionInfo) -> BrokerFuture<'_, ()> {
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
    use std::sync::atomic::AtomicUsize;

    fn options(window_ms: u64, max_cache_size: usize) -> DeduplicationOptions {
        DeduplicationOptions {
            enabled: true,
            window_ms,
            max_cache_size,
            sweep_interval_ms: 50,
        }
    }

    #[tokio::test]
    async fn added_hash_is_a_duplicate_within_window() {
        let cache = DeduplicationCache::new(options(300_000, 1_000));
        cache.add("h1").await.unwrap();
        assert!(cache.is_duplicate("h1").await.unwrap());
        assert!(!cache.is_duplicate("h2").await.unwrap());
    }

    #[tokio::test]
    async fn short_ttl_expires() {
        let cache = DeduplicationCache::new(options(300_000, 1_000));
        cache
            .add_with_ttl("h2", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(cache.is_duplicate("h2").await.unwrap());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!cache.is_duplicate("h2").await.unwrap());
    }

    #[tokio::test]
    async fn blank_hashes_are_rejected() {
        let cache = DeduplicationCache::new(options(1_000, 10));
        assert!(matches!(
            cache.add("").await,
            Err(BrokerError::InvalidArgument(_))
        ));
        assert!(matches!(
            cache.is_duplicate("   ").await,
            Err(BrokerError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn size_bound_evicts_oldest() {
        let cache = DeduplicationCache::new(options(300_000, 3));
        for hash in ["a", "b", "c", "d"] {
            cache.add(hash).await.unwrap();
        }

        // "a" was the oldest and must be gone; the rest remain.
        assert!(!cache.is_duplicate("a").await.unwrap());
        assert!(cache.is_duplicate("b").await.unwrap());
        assert!(cache.is_duplicate("d").await.unwrap());

        let metrics = cache.metrics().await;
        assert_eq!(metrics.evictions, 1);
        assert!(metrics.current_size <= 3);
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let cache = DeduplicationCache::new(options(300_000, 100));
        cache
            .add_with_ttl("short", Duration::from_millis(10))
            .await
            .unwrap();
        cache.add("long").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let removed = cache.sweep().await;
        assert_eq!(removed, 1);
        assert_eq!(cache.metrics().await.current_size, 1);
    }

    #[tokio::test]
    async fn metrics_track_checks_and_hit_rate() {
        let cache = DeduplicationCache::new(options(300_000, 100));
        cache.add("x").await.unwrap();
        let _hit = cache.is_duplicate("x").await.unwrap();
        let _miss = cache.is_duplicate("y").await.unwrap();

        let metrics = cache.metrics().await;
        assert_eq!(metrics.total_checks, 2);
        assert_eq!(metrics.duplicates_detected, 1);
        assert!((metrics.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[derive(Default)]
    struct CountingInner {
        published: AtomicUsize,
    }

    impl Broker for CountingInner {
        fn publish_envelope(
            &self,
            _envelope: Envelope,
            _options: PublishOptions,
        ) -> BrokerFuture<'_, ()> {
            self.published.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
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
    async fn decorator_suppresses_identical_payloads() {
        let inner = Arc::new(CountingInner::default());
        let broker = DedupBroker::new(Arc::clone(&inner) as Arc<dyn Broker>, options(300_000, 100));

        broker
            .publish_envelope(Envelope::new("T.v1", vec![1, 2, 3]), PublishOptions::default())
            .await
            .unwrap();
        // Same payload, different message id: suppressed.
        broker
            .publish_envelope(Envelope::new("T.v1", vec![1, 2, 3]), PublishOptions::default())
            .await
            .unwrap();
        // Different payload: forwarded.
        broker
            .publish_envelope(Envelope::new("T.v1", vec![4]), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(inner.published.load(Ordering::SeqCst), 2);
        assert_eq!(broker.cache().metrics().await.duplicates_detected, 1);
    }
}
