//! Hosted-service lifecycle wrapper.
//!
//! Binds a broker's lifecycle to a host application: the host's start
//! signal forwards to the broker's `start` (errors surface, so a broker
//! that cannot come up fails the host's startup), the stop signal
//! forwards to `stop` with errors logged and swallowed (shutdown keeps
//! going no matter what), and disposal happens exactly once.
//! Cancellation is forwarded verbatim: a cancelled start surfaces
//! [`BrokerError::Cancelled`] without leaving the broker half-started.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use courier_core::broker::Broker;
use courier_core::error::BrokerError;

/// Lifecycle adapter between a host application and a broker.
pub struct BrokerHost {
    broker: Arc<dyn Broker>,
    disposed: AtomicBool,
}

impl BrokerHost {
    /// Bind `broker` to the host lifecycle.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            disposed: AtomicBool::new(false),
        }
    }

    /// The wrapped broker.
    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Forward the host's start signal.
    ///
    /// # Errors
    ///
    /// Surfaces the broker's start error to the host, or
    /// [`BrokerError::Cancelled`] when `cancellation` fires first.
    pub async fn start(&self, cancellation: &CancellationToken) -> Result<(), BrokerError> {
        tokio::select! {
            () = cancellation.cancelled() => Err(BrokerError::Cancelled),
            started = self.broker.start() => {
                if started.is_ok() {
                    info!("Broker host started");
                }
                started
            },
        }
    }

    /// Forward the host's stop signal. Stop errors are logged and
    /// swallowed so host shutdown always proceeds.
    pub async fn stop(&self, cancellation: &CancellationToken) {
        let stopped = tokio::select! {
            () = cancellation.cancelled() => Err(BrokerError::Cancelled),
            stopped = self.broker.stop() => stopped,
        };
        match stopped {
            Ok(()) => info!("Broker host stopped"),
            Err(stop_error) => {
                error!(error = %stop_error, "Broker stop failed during host shutdown");
            },
        }
    }

    /// Dispose the broker. Exactly one call reaches the broker; the
    /// rest are no-ops.
    ///
    /// # Errors
    ///
    /// Surfaces the broker's shutdown error from the first call.
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.broker.shutdown().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use courier_core::broker::{BrokerFuture, SubscriptionInfo};
    use courier_core::message::Envelope;
    use courier_core::options::PublishOptions;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeBroker {
        starts: AtomicUsize,
        stops: AtomicUsize,
        shutdowns: AtomicUsize,
        fail_start: AtomicBool,
        fail_stop: AtomicBool,
        slow_start: AtomicBool,
    }

    impl Broker for FakeBroker {
        fn publish_envelope(
            &self,
            _envelope: Envelope,
            _options: PublishOptions,
        ) -> BrokerFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn subscribe_with(&self, _subscription: SubscriptionInfo) -> BrokerFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn start(&self) -> BrokerFuture<'_, ()> {
            Box::pin(async move {
                if self.slow_start.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                self.starts.fetch_add(1, Ordering::SeqCst);
                if self.fail_start.load(Ordering::SeqCst) {
                    return Err(BrokerError::TransportUnavailable("no broker".into()));
                }
                Ok(())
            })
        }

        fn stop(&self) -> BrokerFuture<'_, ()> {
            Box::pin(async move {
                self.stops.fetch_add(1, Ordering::SeqCst);
                if self.fail_stop.load(Ordering::SeqCst) {
                    return Err(BrokerError::TransportUnavailable("gone".into()));
                }
                Ok(())
            })
        }

        fn shutdown(&self) -> BrokerFuture<'_, ()> {
            Box::pin(async move {
                self.shutdowns.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn start_forwards_and_surfaces_errors() {
        let broker = Arc::new(FakeBroker::default());
        let host = BrokerHost::new(Arc::clone(&broker) as Arc<dyn Broker>);

        host.start(&CancellationToken::new()).await.unwrap();
        assert_eq!(broker.starts.load(Ordering::SeqCst), 1);

        broker.fail_start.store(true, Ordering::SeqCst);
        let result = host.start(&CancellationToken::new()).await;
        assert!(matches!(result, Err(BrokerError::TransportUnavailable(_))));
    }

    #[tokio::test]
    async fn stop_errors_are_swallowed() {
        let broker = Arc::new(FakeBroker::default());
        broker.fail_stop.store(true, Ordering::SeqCst);
        let host = BrokerHost::new(Arc::clone(&broker) as Arc<dyn Broker>);

        // Does not panic, does not surface.
        host.stop(&CancellationToken::new()).await;
        assert_eq!(broker.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_preempts_start() {
        let broker = Arc::new(FakeBroker::default());
        broker.slow_start.store(true, Ordering::SeqCst);
        let host = BrokerHost::new(Arc::clone(&broker) as Arc<dyn Broker>);

        let token = CancellationToken::new();
        token.cancel();
        let result = host.start(&token).await;
        assert!(matches!(result, Err(BrokerError::Cancelled)));
    }

    #[tokio::test]
    async fn shutdown_reaches_the_broker_once() {
        let broker = Arc::new(FakeBroker::default());
        let host = BrokerHost::new(Arc::clone(&broker) as Arc<dyn Broker>);

        host.shutdown().await.unwrap();
        host.shutdown().await.unwrap();
        assert_eq!(broker.shutdowns.load(Ordering::SeqCst), 1);
    }
}
