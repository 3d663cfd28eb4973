//! Redis transports for Courier.
//!
//! Two distinct transports share this crate:
//!
//! - [`streams::RedisStreamsTransport`] — the streaming-key-value log:
//!   `XADD` per publish, consumer-group reads (`XREADGROUP`) per
//!   subscription, `XACK` as the native acknowledgement. At-least-once:
//!   an entry not acked stays in the group's pending list.
//! - [`pubsub::RedisPubSubTransport`] — lightweight `PUBLISH`/
//!   `SUBSCRIBE` fan-out. At-most-once: a subscriber that is down
//!   misses the message; there is no ack.
//!
//! Envelopes travel as JSON in a single `envelope` field (streams) or
//! as the raw channel payload (pub/sub).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod pubsub;
pub mod streams;

pub use pubsub::RedisPubSubTransport;
pub use streams::RedisStreamsTransport;

use courier_core::error::BrokerError;
use courier_core::message::Envelope;

/// Stream key or channel for a message type under the configured
/// prefix.
#[must_use]
pub(crate) fn keyspace(prefix: &str, name: &str) -> String {
    format!("{prefix}:{name}")
}

pub(crate) fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, BrokerError> {
    serde_json::to_vec(envelope).map_err(|e| BrokerError::Serialization(e.to_string()))
}

pub(crate) fn decode_envelope(bytes: &[u8]) -> Result<Envelope, BrokerError> {
    serde_json::from_slice(bytes).map_err(|e| BrokerError::Deserialization(e.to_string()))
}
