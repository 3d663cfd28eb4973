//! Decorator chain assembly.
//!
//! [`build_pipeline`] wraps a base broker with every reliability layer
//! the configuration enables. The chain is fixed at construction and
//! ordered so that admission control sits closest to the transport and
//! store-and-forward sits closest to the caller:
//!
//! ```text
//! caller
//!   └─ dedup         (drop repeated caller publishes before they cost anything)
//!      └─ outbox     (persist first; everything below runs in the relay)
//!         └─ batch   (accumulate serialized items)
//!            └─ rate limit
//!               └─ backpressure
//!                  └─ bulkhead
//!                     └─ circuit breaker
//!                        └─ base broker → transport
//! ```
//!
//! Dedup sits above the outbox on purpose: the relay may legitimately
//! retry an identical payload, and a dedup layer underneath it would
//! swallow the retry. Disabled layers are skipped entirely rather than
//! wrapped as no-ops.

use std::sync::Arc;

use courier_core::broker::Broker;
use courier_core::config::CourierConfig;
use courier_core::error::BrokerError;

use crate::batch::BatchBroker;
use crate::dedup::DedupBroker;
use crate::outbox::{InMemoryOutboxStore, OutboxBroker, OutboxStore};
use crate::poison::{InMemoryPoisonStore, PoisonBroker, PoisonStore};
use crate::wrappers::{
    BackpressureBroker, BulkheadBroker, CircuitBreakerBroker, RateLimitBroker,
};

/// Stores a pipeline needs when the corresponding layers are enabled.
/// Defaults to in-memory implementations.
pub struct PipelineStores {
    /// Outbox persistence.
    pub outbox: Arc<dyn OutboxStore>,
    /// Poison-message quarantine persistence.
    pub poison: Arc<dyn PoisonStore>,
}

impl Default for PipelineStores {
    fn default() -> Self {
        Self {
            outbox: Arc::new(InMemoryOutboxStore::new()),
            poison: Arc::new(InMemoryPoisonStore::new()),
        }
    }
}

/// Wrap `base` with every decorator `config` enables, using in-memory
/// stores.
///
/// # Errors
///
/// Returns [`BrokerError::InvalidOptions`] if `config` fails validation.
pub fn build_pipeline(
    base: Arc<dyn Broker>,
    config: &CourierConfig,
) -> Result<Arc<dyn Broker>, BrokerError> {
    build_pipeline_with(base, config, PipelineStores::default())
}

/// Wrap `base` with every decorator `config` enables, over the given
/// stores.
///
/// # Errors
///
/// Returns [`BrokerError::InvalidOptions`] if `config` fails validation.
pub fn build_pipeline_with(
    base: Arc<dyn Broker>,
    config: &CourierConfig,
    stores: PipelineStores,
) -> Result<Arc<dyn Broker>, BrokerError> {
    config.validate()?;

    let mut broker: Arc<dyn Broker> = base;

    if config.circuit_breaker.enabled {
        broker = Arc::new(CircuitBreakerBroker::new(
            broker,
            config.circuit_breaker.clone(),
        ));
    }
    if config.bulkhead.enabled {
        broker = Arc::new(BulkheadBroker::new(broker, config.bulkhead.clone()));
    }
    if config.backpressure.enabled {
        broker = Arc::new(BackpressureBroker::new(broker, config.backpressure.clone()));
    }
    if config.rate_limit.enabled {
        broker = Arc::new(RateLimitBroker::new(broker, config.rate_limit.clone()));
    }
    if config.poison.enabled {
        broker = Arc::new(PoisonBroker::new(broker, config.poison.clone(), stores.poison));
    }
    if config.batch.enabled {
        broker = Arc::new(BatchBroker::new(broker, config.batch.clone()));
    }
    if config.outbox.enabled {
        broker = Arc::new(OutboxBroker::new(broker, config.outbox.clone(), stores.outbox));
    }
    if config.deduplication.enabled {
        broker = Arc::new(DedupBroker::new(broker, config.deduplication.clone()));
    }

    Ok(broker)
}
