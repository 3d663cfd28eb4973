//! Testing utilities for the Courier messaging middleware.
//!
//! - [`RecordingTransport`]: a [`Transport`] that records every
//!   published envelope and captures the dispatcher, so tests can both
//!   assert on the wire and drive the receive path by hand.
//! - [`CollectingHandler`]: a typed handler that stores every message
//!   it receives.
//!
//! ## Example
//!
//! ```rust,ignore
//! let broker = CoreBroker::new(RecordingTransport::new());
//! let (handler, received) = CollectingHandler::<Ping>::new();
//! broker.subscribe::<Ping, _, _>(handler, Default::default()).await?;
//!
//! broker.publish(&Ping { id: 1 }, Default::default()).await?;
//! assert_eq!(broker.transport().published().len(), 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use courier_core::broker::{BrokerFuture, Dispatcher, SubscriptionInfo, Transport};
use courier_core::context::MessageContext;
use courier_core::error::BrokerError;
use courier_core::message::{Envelope, Message};
use courier_core::options::PublishOptions;

/// Transport that records publishes and captures the dispatcher.
#[derive(Default)]
pub struct RecordingTransport {
    published: Mutex<Vec<(Envelope, PublishOptions)>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl RecordingTransport {
    /// Create an empty recording transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every envelope published so far.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (a prior test panic).
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn published(&self) -> Vec<Envelope> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(envelope, _)| envelope.clone())
            .collect()
    }

    /// Number of `start_internal` calls observed.
    #[must_use]
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of `stop_internal` calls observed.
    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Drive the receive path with an envelope, as a real transport's
    /// consumer loop would.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TransportUnavailable`] before any
    /// subscription captured a dispatcher; otherwise surfaces dispatch
    /// errors.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (a prior test panic).
    #[allow(clippy::unwrap_used)]
    pub async fn deliver(&self, envelope: Envelope) -> Result<(), BrokerError> {
        let dispatcher = self.dispatcher.lock().unwrap().clone();
        let Some(dispatcher) = dispatcher else {
            return Err(BrokerError::TransportUnavailable(
                "no subscription captured a dispatcher yet".to_string(),
            ));
        };
        let context = MessageContext::from_envelope(&envelope);
        dispatcher.dispatch(envelope, context).await
    }
}

impl Transport for RecordingTransport {
    fn name(&self) -> &'static str {
        "recording"
    }

    #[allow(clippy::unwrap_used)]
    fn publish_internal(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.published.lock().unwrap().push((envelope, options));
            Ok(())
        })
    }

    #[allow(clippy::unwrap_used)]
    fn subscribe_internal(
        &self,
        _subscription: &SubscriptionInfo,
        dispatcher: Dispatcher,
    ) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            *self.dispatcher.lock().unwrap() = Some(dispatcher);
            Ok(())
        })
    }

    fn start_internal(&self) -> BrokerFuture<'_, ()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn stop_internal(&self) -> BrokerFuture<'_, ()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// Typed handler that collects every message it receives.
pub struct CollectingHandler;

impl CollectingHandler {
    /// Build a handler closure plus the shared vector it fills.
    #[must_use]
    pub fn new<M: Message + Clone>() -> (
        impl Fn(M, MessageContext) -> futures::future::Ready<Result<(), BrokerError>>
        + Send
        + Sync
        + 'static,
        Arc<Mutex<Vec<M>>>,
    ) {
        let received: Arc<Mutex<Vec<M>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let handler = move |message: M, _context: MessageContext| {
            #[allow(clippy::unwrap_used)]
            sink.lock().unwrap().push(message);
            futures::future::ready(Ok(()))
        };
        (handler, received)
    }
}
