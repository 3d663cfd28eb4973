//! Bulkhead admission control.
//!
//! Bounds the damage a slow or saturated resource can do: at most
//! `max_concurrent` operations run at once, at most `max_queued` wait for
//! a slot, and a queued operation waits no longer than
//! `acquisition_timeout`. Anything beyond that is rejected immediately,
//! so pressure surfaces at the caller instead of piling up inside the
//! broker. Publish and subscribe paths get separate instances.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

use courier_core::config::BulkheadOptions;
use courier_core::error::BrokerError;

/// Point-in-time bulkhead metrics: configured caps plus live occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadMetrics {
    /// Configured concurrency cap.
    pub max_concurrent: usize,
    /// Configured wait-queue cap.
    pub max_queued: usize,
    /// Operations currently executing.
    pub in_flight: usize,
    /// Operations currently waiting for a slot.
    pub queued: usize,
}

/// Concurrency-admission isolator for one logical partition.
pub struct Bulkhead {
    name: String,
    options: BulkheadOptions,
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
}

impl Bulkhead {
    /// Create a bulkhead guarding one partition.
    #[must_use]
    pub fn new(name: impl Into<String>, options: BulkheadOptions) -> Self {
        let permits = options.max_concurrent;
        Self {
            name: name.into(),
            options,
            semaphore: Arc::new(Semaphore::new(permits)),
            queued: AtomicUsize::new(0),
        }
    }

    /// Bulkhead name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute `operation` under the bulkhead's admission policy.
    ///
    /// Runs immediately when a slot is free, waits up to the acquisition
    /// timeout when the queue has room, and rejects otherwise.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::BulkheadFull`] when both the concurrency cap and
    ///   the wait queue are exhausted.
    /// - [`BrokerError::Timeout`] when a queued operation waits past the
    ///   acquisition timeout.
    /// - The operation's own error, unmodified.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, BrokerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, BrokerError>>,
    {
        if !self.options.enabled {
            return operation().await;
        }

        // Fast path: a free slot means no queueing at all.
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let queued_before = self.queued.fetch_add(1, Ordering::AcqRel);
                if queued_before >= self.options.max_queued {
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    warn!(bulkhead = %self.name, "Bulkhead full, rejecting");
                    return Err(BrokerError::BulkheadFull(self.name.clone()));
                }

                let acquired = tokio::time::timeout(
                    self.options.acquisition_timeout(),
                    Arc::clone(&self.semaphore).acquire_owned(),
                )
                .await;
                self.queued.fetch_sub(1, Ordering::AcqRel);

                match acquired {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_closed)) => {
                        return Err(BrokerError::BulkheadFull(self.name.clone()));
                    },
                    Err(_elapsed) => {
                        warn!(
                            bulkhead = %self.name,
                            timeout_ms = self.options.acquisition_timeout_ms,
                            "Bulkhead acquisition timed out"
                        );
                        return Err(BrokerError::Timeout(self.options.acquisition_timeout()));
                    },
                }
            },
        };

        let result = operation().await;
        drop(permit);
        result
    }

    /// Current metrics.
    #[must_use]
    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            max_concurrent: self.options.max_concurrent,
            max_queued: self.options.max_queued,
            in_flight: self
                .options
                .max_concurrent
                .saturating_sub(self.semaphore.available_permits()),
            queued: self.queued.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options(max_concurrent: usize, max_queued: usize, timeout_ms: u64) -> BulkheadOptions {
        BulkheadOptions {
            enabled: true,
            max_concurrent,
            max_queued,
            acquisition_timeout_ms: timeout_ms,
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let bulkhead = Arc::new(Bulkhead::new("test", options(2, 10, 5_000)));
        let peak = Arc::new(AtomicUsize::new(0));
        let live = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let bulkhead = Arc::clone(&bulkhead);
            let peak = Arc::clone(&peak);
            let live = Arc::clone(&live);
            handles.push(tokio::spawn(async move {
                bulkhead
                    .execute(|| async {
                        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        live.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, BrokerError>(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn queue_overflow_is_rejected_immediately() {
        let bulkhead = Arc::new(Bulkhead::new("test", options(1, 0, 5_000)));

        // Occupy the single slot.
        let blocker = Arc::clone(&bulkhead);
        let handle = tokio::spawn(async move {
            blocker
                .execute(|| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, BrokerError>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // No queue capacity: immediate rejection, not a timeout.
        let result = bulkhead.execute(|| async { Ok::<_, BrokerError>(()) }).await;
        assert!(matches!(result, Err(BrokerError::BulkheadFull(_))));

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn queued_operation_times_out() {
        let bulkhead = Arc::new(Bulkhead::new("test", options(1, 5, 50)));

        let blocker = Arc::clone(&bulkhead);
        let handle = tokio::spawn(async move {
            blocker
                .execute(|| async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok::<_, BrokerError>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = bulkhead.execute(|| async { Ok::<_, BrokerError>(()) }).await;
        assert!(matches!(result, Err(BrokerError::Timeout(_))));

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn queued_operation_runs_once_a_slot_frees() {
        let bulkhead = Arc::new(Bulkhead::new("test", options(1, 5, 1_000)));

        let blocker = Arc::clone(&bulkhead);
        let handle = tokio::spawn(async move {
            blocker
                .execute(|| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, BrokerError>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = bulkhead.execute(|| async { Ok::<_, BrokerError>(42) }).await;
        assert_eq!(result.unwrap(), 42);

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn metrics_expose_caps_and_occupancy() {
        let bulkhead = Bulkhead::new("test", options(3, 7, 1_000));
        let metrics = bulkhead.metrics();
        assert_eq!(metrics.max_concurrent, 3);
        assert_eq!(metrics.max_queued, 7);
        assert_eq!(metrics.in_flight, 0);
        assert_eq!(metrics.queued, 0);
    }

    #[tokio::test]
    async fn disabled_bulkhead_admits_everything() {
        let mut opts = options(1, 0, 10);
        opts.enabled = false;
        let bulkhead = Arc::new(Bulkhead::new("test", opts));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let bulkhead = Arc::clone(&bulkhead);
            handles.push(tokio::spawn(async move {
                bulkhead
                    .execute(|| async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok::<_, BrokerError>(())
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
    }
}
