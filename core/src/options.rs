//! Per-call publish and subscription options.
//!
//! Every field is optional or defaulted: an absent value means "use the
//! broker default". Transports map these onto their native message and
//! consumer properties and ignore the fields their protocol has no
//! equivalent for.

use std::collections::HashMap;
use std::time::Duration;

/// Per-publish overrides.
#[derive(Clone, Debug, Default)]
pub struct PublishOptions {
    /// Routing key (AMQP routing key, Kafka/stream partition key).
    pub routing_key: Option<String>,
    /// Target exchange or topic override.
    pub exchange: Option<String>,
    /// Message priority where the transport supports it.
    pub priority: Option<u8>,
    /// Time-to-live after which the transport may drop the message.
    pub expiration: Option<Duration>,
    /// Extra headers merged into the envelope headers.
    pub headers: HashMap<String, String>,
    /// Whether the transport should persist the message.
    pub persistent: Option<bool>,
    /// Correlation id stamped onto the envelope.
    pub correlation_id: Option<String>,
}

impl PublishOptions {
    /// Set the routing key.
    #[must_use]
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Set the target exchange or topic.
    #[must_use]
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Set the message priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the message time-to-live.
    #[must_use]
    pub const fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the persistence flag.
    #[must_use]
    pub const fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Consumer-side subscription options.
#[derive(Clone, Debug)]
pub struct SubscriptionOptions {
    /// Queue or stream name; defaults to a name derived from the type tag.
    pub queue_name: Option<String>,
    /// Routing key or pattern. Patterns may contain `*` wildcard segments
    /// (`orders.*.created`).
    pub routing_key: Option<String>,
    /// Whether the queue survives broker restarts.
    pub durable: bool,
    /// Whether the queue is exclusive to this consumer.
    pub exclusive: bool,
    /// Acknowledge at delivery time instead of waiting for the handler.
    ///
    /// With `auto_ack` the transport acknowledges as soon as the message is
    /// handed to dispatch; a throwing handler does NOT trigger transport
    /// redelivery — failures are routed to the poison tracker instead.
    pub auto_ack: bool,
    /// Number of unacknowledged messages the transport may have in flight.
    pub prefetch_count: u16,
    /// Consumer group for transports with group semantics.
    pub consumer_group: Option<String>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            queue_name: None,
            routing_key: None,
            durable: true,
            exclusive: false,
            auto_ack: false,
            prefetch_count: 10,
            consumer_group: None,
        }
    }
}

impl SubscriptionOptions {
    /// Set the queue or stream name.
    #[must_use]
    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    /// Set the routing key or pattern.
    #[must_use]
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Set the durability flag.
    #[must_use]
    pub const fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Set the auto-acknowledge flag.
    #[must_use]
    pub const fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Set the prefetch count.
    #[must_use]
    pub const fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Set the consumer group.
    #[must_use]
    pub fn with_consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }
}

/// Match a routing key against a pattern with `*` wildcard segments.
///
/// Segments are dot-separated; `*` matches exactly one segment. A pattern
/// without wildcards must match exactly. An empty pattern matches
/// everything (subscription to all keys).
///
/// # Examples
///
/// ```
/// use courier_core::options::routing_key_matches;
///
/// assert!(routing_key_matches("orders.*.created", "orders.eu.created"));
/// assert!(!routing_key_matches("orders.*.created", "orders.eu.cancelled"));
/// assert!(routing_key_matches("", "anything.at.all"));
/// ```
#[must_use]
pub fn routing_key_matches(pattern: &str, key: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    let key_segments: Vec<&str> = key.split('.').collect();
    if pattern_segments.len() != key_segments.len() {
        return false;
    }
    pattern_segments
        .iter()
        .zip(&key_segments)
        .all(|(p, k)| *p == "*" || p == k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_options_builder_chains() {
        let options = PublishOptions::default()
            .with_routing_key("orders.eu")
            .with_priority(5)
            .with_expiration(Duration::from_secs(60))
            .persistent(true)
            .with_header("X-Source", "web");

        assert_eq!(options.routing_key.as_deref(), Some("orders.eu"));
        assert_eq!(options.priority, Some(5));
        assert_eq!(options.expiration, Some(Duration::from_secs(60)));
        assert_eq!(options.persistent, Some(true));
        assert_eq!(options.headers.get("X-Source").map(String::as_str), Some("web"));
    }

    #[test]
    fn subscription_defaults_are_safe() {
        let options = SubscriptionOptions::default();
        assert!(options.durable);
        assert!(!options.auto_ack);
        assert!(!options.exclusive);
        assert_eq!(options.prefetch_count, 10);
    }

    #[test]
    fn wildcard_matches_single_segment() {
        assert!(routing_key_matches("orders.*", "orders.created"));
        assert!(!routing_key_matches("orders.*", "orders.eu.created"));
        assert!(routing_key_matches("*.*.created", "orders.eu.created"));
        assert!(routing_key_matches("orders.eu", "orders.eu"));
        assert!(!routing_key_matches("orders.eu", "orders.us"));
    }
}
