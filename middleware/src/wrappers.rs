//! Resilience wrapper decorators.
//!
//! Thin brokers applying the `courier-resilience` primitives around the
//! publish (and for the bulkhead, also the subscribe) path:
//!
//! - [`RateLimitBroker`] — tenant-keyed admission; allowed publishes are
//!   stamped with `X-RateLimit-Remaining` / `X-RateLimit-Reset` headers
//! - [`CircuitBreakerBroker`] — rejects pre-flight while the circuit is
//!   open
//! - [`BulkheadBroker`] — separate concurrency partitions for publish
//!   and subscribe
//! - [`BackpressureBroker`] — feeds publish latency into the controller
//!   and holds publishers back while throttling is active

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use courier_core::broker::{Broker, BrokerFuture, SubscriptionInfo};
use courier_core::config::{BackpressureOptions, BulkheadOptions, CircuitBreakerOptions, RateLimitOptions};
use courier_core::error::BrokerError;
use courier_core::message::{headers, Envelope};
use courier_core::options::PublishOptions;
use courier_core::serialization::SerializationFormat;
use courier_core::tenant::extract_tenant;
use courier_resilience::backpressure::BackpressureController;
use courier_resilience::bulkhead::Bulkhead;
use courier_resilience::circuit_breaker::CircuitBreaker;
use courier_resilience::rate_limiter::{RateLimitDecision, RateLimiter};

/// Rate-limiting broker decorator with per-tenant keying.
pub struct RateLimitBroker {
    inner: Arc<dyn Broker>,
    limiter: Arc<RateLimiter>,
    options: RateLimitOptions,
}

impl RateLimitBroker {
    /// Wrap `inner` with rate limiting.
    #[must_use]
    pub fn new(inner: Arc<dyn Broker>, options: RateLimitOptions) -> Self {
        Self {
            inner,
            limiter: Arc::new(RateLimiter::new(options.clone())),
            options,
        }
    }

    /// The underlying limiter, for counters.
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn key_for(&self, envelope: &Envelope, options: &PublishOptions) -> String {
        if !self.options.per_tenant {
            return self.options.default_key.clone();
        }
        // Publish-call headers win over envelope headers.
        extract_tenant(&options.headers, None)
            .or_else(|| extract_tenant(&envelope.headers, None))
            .unwrap_or_else(|| self.options.default_key.clone())
    }
}

impl Broker for RateLimitBroker {
    fn publish_envelope(
        &self,
        mut envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if !self.options.enabled {
                return self.inner.publish_envelope(envelope, options).await;
            }

            let key = self.key_for(&envelope, &options);
            match self.limiter.check(&key).await {
                RateLimitDecision::Allow {
                    remaining,
                    reset_at,
                } => {
                    envelope = envelope
                        .with_header(headers::RATE_LIMIT_REMAINING, remaining.to_string())
                        .with_header(
                            headers::RATE_LIMIT_RESET,
                            reset_at.timestamp_millis().to_string(),
                        );
                    self.inner.publish_envelope(envelope, options).await
                },
                RateLimitDecision::Reject {
                    retry_after,
                    reset_at,
                } => Err(BrokerError::RateLimited {
                    key,
                    retry_after,
                    reset_at,
                }),
            }
        })
    }

    fn subscribe_with(&self, subscription: SubscriptionInfo) -> BrokerFuture<'_, ()> {
        self.inner.subscribe_with(subscription)
    }

    fn start(&self) -> BrokerFuture<'_, ()> {
        self.inner.start()
    }

    fn stop(&self) -> BrokerFuture<'_, ()> {
        self.inner.stop()
    }

    fn shutdown(&self) -> BrokerFuture<'_, ()> {
        self.inner.shutdown()
    }

    fn serialization(&self) -> SerializationFormat {
        self.inner.serialization()
    }
}

/// Circuit-breaking broker decorator guarding the publish path.
pub struct CircuitBreakerBroker {
    inner: Arc<dyn Broker>,
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerBroker {
    /// Wrap `inner` with a circuit breaker named `publish`.
    #[must_use]
    pub fn new(inner: Arc<dyn Broker>, options: CircuitBreakerOptions) -> Self {
        Self {
            inner,
            breaker: Arc::new(CircuitBreaker::new("publish", options)),
        }
    }

    /// The underlying breaker, for state inspection and manual control.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

impl Broker for CircuitBreakerBroker {
    fn publish_envelope(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.breaker
                .execute(|| self.inner.publish_envelope(envelope, options))
                .await
        })
    }

    fn subscribe_with(&self, subscription: SubscriptionInfo) -> BrokerFuture<'_, ()> {
        self.inner.subscribe_with(subscription)
    }

    fn start(&self) -> BrokerFuture<'_, ()> {
        self.inner.start()
    }

    fn stop(&self) -> BrokerFuture<'_, ()> {
        self.inner.stop()
    }

    fn shutdown(&self) -> BrokerFuture<'_, ()> {
        self.inner.shutdown()
    }

    fn serialization(&self) -> SerializationFormat {
        self.inner.serialization()
    }
}

/// Bulkhead broker decorator with separate publish and subscribe
/// partitions.
pub struct BulkheadBroker {
    inner: Arc<dyn Broker>,
    publish_bulkhead: Arc<Bulkhead>,
    subscribe_bulkhead: Arc<Bulkhead>,
}

impl BulkheadBroker {
    /// Wrap `inner` with bulkheads.
    #[must_use]
    pub fn new(inner: Arc<dyn Broker>, options: BulkheadOptions) -> Self {
        Self {
            inner,
            publish_bulkhead: Arc::new(Bulkhead::new("publish", options.clone())),
            subscribe_bulkhead: Arc::new(Bulkhead::new("subscribe", options)),
        }
    }

    /// The publish-side bulkhead.
    #[must_use]
    pub fn publish_bulkhead(&self) -> &Arc<Bulkhead> {
        &self.publish_bulkhead
    }

    /// The subscribe-side bulkhead.
    #[must_use]
    pub fn subscribe_bulkhead(&self) -> &Arc<Bulkhead> {
        &self.subscribe_bulkhead
    }
}

impl Broker for BulkheadBroker {
    fn publish_envelope(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.publish_bulkhead
                .execute(|| self.inner.publish_envelope(envelope, options))
                .await
        })
    }

    fn subscribe_with(&self, subscription: SubscriptionInfo) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.subscribe_bulkhead
                .execute(|| self.inner.subscribe_with(subscription))
                .await
        })
    }

    fn start(&self) -> BrokerFuture<'_, ()> {
        self.inner.start()
    }

    fn stop(&self) -> BrokerFuture<'_, ()> {
        self.inner.stop()
    }

    fn shutdown(&self) -> BrokerFuture<'_, ()> {
        self.inner.shutdown()
    }

    fn serialization(&self) -> SerializationFormat {
        self.inner.serialization()
    }
}

/// How long a throttled publish waits between signal polls.
const THROTTLE_POLL: Duration = Duration::from_millis(20);

/// Backpressure broker decorator.
///
/// Publish durations feed the controller's latency window. While the
/// throttle signal is active, publishers are held back (cooperative
/// slowdown) up to the activation latency threshold; a publisher that
/// waits longer than that fails with [`BrokerError::Timeout`].
pub struct BackpressureBroker {
    inner: Arc<dyn Broker>,
    controller: Arc<BackpressureController>,
    enabled: bool,
    max_wait: Duration,
}

impl BackpressureBroker {
    /// Wrap `inner` with backpressure control.
    #[must_use]
    pub fn new(inner: Arc<dyn Broker>, options: BackpressureOptions) -> Self {
        let enabled = options.enabled;
        let max_wait = options.latency_threshold();
        Self {
            inner,
            controller: Arc::new(BackpressureController::new(options)),
            enabled,
            max_wait,
        }
    }

    /// The underlying controller, for queue-depth updates and metrics.
    #[must_use]
    pub fn controller(&self) -> &Arc<BackpressureController> {
        &self.controller
    }
}

impl Broker for BackpressureBroker {
    fn publish_envelope(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if !self.enabled {
                return self.inner.publish_envelope(envelope, options).await;
            }

            if self.controller.should_throttle() {
                debug!("Backpressure active, holding publisher");
                let waited_from = Instant::now();
                while self.controller.should_throttle() {
                    if waited_from.elapsed() >= self.max_wait {
                        return Err(BrokerError::Timeout(self.max_wait));
                    }
                    tokio::time::sleep(THROTTLE_POLL).await;
                }
            }

            let started = Instant::now();
            let result = self.inner.publish_envelope(envelope, options).await;
            self.controller.record_sample(started.elapsed()).await;
            result
        })
    }

    fn subscribe_with(&self, subscription: SubscriptionInfo) -> BrokerFuture<'_, ()> {
        self.inner.subscribe_with(subscription)
    }

    fn start(&self) -> BrokerFuture<'_, ()> {
        self.inner.start()
    }

    fn stop(&self) -> BrokerFuture<'_, ()> {
        self.inner.stop()
    }

    fn shutdown(&self) -> BrokerFuture<'_, ()> {
        self.inner.shutdown()
    }

    fn serialization(&self) -> SerializationFormat {
        self.inner.serialization()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as SyncMutex;

    #[derive(Default)]
    struct RecordingInner {
        envelopes: SyncMutex<Vec<Envelope>>,
        publishes: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    impl Broker for RecordingInner {
        fn publish_envelope(
            &self,
            envelope: Envelope,
            _options: PublishOptions,
        ) -> BrokerFuture<'_, ()> {
            Box::pin(async move {
                self.publishes.fetch_add(1, Ordering::SeqCst);
                if self.fail.load(Ordering::SeqCst) {
                    return Err(BrokerError::TransportUnavailable("down".into()));
                }
                self.envelopes.lock().unwrap().push(envelope);
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
    async fn rate_limit_rejects_and_stamps_headers() {
        let inner = Arc::new(RecordingInner::default());
        let options = RateLimitOptions {
            enabled: true,
            rate_per_second: 0.1,
            burst: 2,
            per_tenant: false,
            ..RateLimitOptions::default()
        };
        let broker = RateLimitBroker::new(Arc::clone(&inner) as Arc<dyn Broker>, options);

        broker
            .publish_envelope(Envelope::new("T.v1", vec![1]), PublishOptions::default())
            .await
            .unwrap();
        broker
            .publish_envelope(Envelope::new("T.v1", vec![2]), PublishOptions::default())
            .await
            .unwrap();

        let result = broker
            .publish_envelope(Envelope::new("T.v1", vec![3]), PublishOptions::default())
            .await;
        assert!(matches!(result, Err(BrokerError::RateLimited { .. })));

        let envelopes = inner.envelopes.lock().unwrap();
        assert!(envelopes[0]
            .headers
            .contains_key(headers::RATE_LIMIT_REMAINING));
        assert!(envelopes[0].headers.contains_key(headers::RATE_LIMIT_RESET));
    }

    #[tokio::test]
    async fn rate_limit_keys_by_tenant_header() {
        let inner = Arc::new(RecordingInner::default());
        let options = RateLimitOptions {
            enabled: true,
            rate_per_second: 0.1,
            burst: 1,
            per_tenant: true,
            ..RateLimitOptions::default()
        };
        let broker = RateLimitBroker::new(Arc::clone(&inner) as Arc<dyn Broker>, options);

        let publish_for = |tenant: &str| {
            let envelope =
                Envelope::new("T.v1", vec![1]).with_header(headers::TENANT_ID, tenant);
            broker.publish_envelope(envelope, PublishOptions::default())
        };

        assert!(publish_for("acme").await.is_ok());
        assert!(publish_for("acme").await.is_err());
        // A different tenant has its own bucket.
        assert!(publish_for("globex").await.is_ok());
    }

    #[tokio::test]
    async fn circuit_breaker_rejects_after_failures() {
        let inner = Arc::new(RecordingInner::default());
        inner.fail.store(true, Ordering::SeqCst);
        let options = CircuitBreakerOptions {
            enabled: true,
            failure_threshold: 2,
            ..CircuitBreakerOptions::default()
        };
        let broker = CircuitBreakerBroker::new(Arc::clone(&inner) as Arc<dyn Broker>, options);

        for _ in 0..2 {
            let _failed = broker
                .publish_envelope(Envelope::new("T.v1", vec![1]), PublishOptions::default())
                .await;
        }

        let result = broker
            .publish_envelope(Envelope::new("T.v1", vec![1]), PublishOptions::default())
            .await;
        assert!(matches!(result, Err(BrokerError::CircuitOpen { .. })));
        // The open circuit never reached the transport.
        assert_eq!(inner.publishes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn bulkhead_guards_publish_path() {
        let inner = Arc::new(RecordingInner::default());
        let options = BulkheadOptions {
            enabled: true,
            max_concurrent: 1,
            max_queued: 0,
            acquisition_timeout_ms: 50,
        };
        let broker = Arc::new(BulkheadBroker::new(
            Arc::clone(&inner) as Arc<dyn Broker>,
            options,
        ));

        // Single publish passes.
        broker
            .publish_envelope(Envelope::new("T.v1", vec![1]), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(broker.publish_bulkhead().metrics().in_flight, 0);
    }

    #[tokio::test]
    async fn backpressure_holds_then_times_out() {
        let inner = Arc::new(RecordingInner::default());
        let options = BackpressureOptions {
            enabled: true,
            latency_threshold_ms: 100,
            recovery_latency_threshold_ms: 50,
            queue_depth_threshold: 10,
            recovery_queue_depth_threshold: 5,
            sample_size: 10,
        };
        let broker = BackpressureBroker::new(Arc::clone(&inner) as Arc<dyn Broker>, options);

        // Force throttling via queue depth and keep it active.
        broker.controller().set_queue_depth(100).await;
        assert!(broker.controller().should_throttle());

        let result = broker
            .publish_envelope(Envelope::new("T.v1", vec![1]), PublishOptions::default())
            .await;
        assert!(matches!(result, Err(BrokerError::Timeout(_))));
        assert_eq!(inner.publishes.load(Ordering::SeqCst), 0);

        // Release the signal; publishes flow again.
        broker.controller().set_queue_depth(0).await;
        broker
            .publish_envelope(Envelope::new("T.v1", vec![2]), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(inner.publishes.load(Ordering::SeqCst), 1);
    }
}
