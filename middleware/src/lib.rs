//! Reliability decorators for Courier brokers.
//!
//! Every type here implements [`courier_core::broker::Broker`] by
//! wrapping another broker, so reliability features compose uniformly:
//! a decorator chain is built once from configuration (see
//! [`pipeline::build_pipeline`]) and behaves like any single broker to
//! its caller.
//!
//! Layers:
//!
//! - [`batch::BatchBroker`] — per-type accumulation with size/age
//!   triggered flushes
//! - [`dedup::DedupBroker`] — SHA-256 payload dedup over a bounded time
//!   window
//! - [`poison::PoisonBroker`] — failure tracking and quarantine past a
//!   threshold
//! - [`outbox::OutboxBroker`] — persist-before-publish with a relay loop
//! - [`wrappers`] — rate-limit, circuit-breaker, bulkhead and
//!   backpressure wrappers over `courier-resilience`
//!
//! Background work (flush timers, sweeps, the relay) starts with the
//! broker's `start` and is joined by `stop`/`shutdown`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batch;
pub mod dedup;
pub mod outbox;
pub mod pipeline;
pub mod poison;
pub mod wrappers;

pub use batch::{BatchBroker, BatchResult};
pub use dedup::{DedupBroker, DeduplicationCache, DeduplicationMetrics};
pub use outbox::{InMemoryOutboxStore, OutboxBroker, OutboxMessage, OutboxStatus, OutboxStore};
pub use pipeline::{build_pipeline, build_pipeline_with, PipelineStores};
pub use poison::{
    InMemoryPoisonStore, PoisonBroker, PoisonMessageHandler, PoisonStore, PoisonedMessage,
};
pub use wrappers::{BackpressureBroker, BulkheadBroker, CircuitBreakerBroker, RateLimitBroker};
