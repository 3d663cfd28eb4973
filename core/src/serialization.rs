//! Message serialization.
//!
//! JSON is the default wire format: it round-trips the full serde data
//! model (nested structs, enums, maps, optional fields, `chrono` dates) and
//! stays debuggable on the wire. Bincode is available where payload size
//! and encode speed matter more than readability; both sides of a topic
//! must agree on the format, which is why it is part of the broker
//! configuration rather than a per-call choice.

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::message::Message;

/// Wire format used to encode message bodies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// Canonical textual encoding via `serde_json`. The default.
    #[default]
    Json,
    /// Compact binary encoding via `bincode`.
    Bincode,
}

impl SerializationFormat {
    /// Encode a message to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Serialization`] if the value cannot be
    /// encoded (rare for JSON; bincode rejects some serde shapes such as
    /// untagged enums).
    pub fn serialize<M: Message>(self, message: &M) -> Result<Vec<u8>, BrokerError> {
        match self {
            Self::Json => serde_json::to_vec(message)
                .map_err(|e| BrokerError::Serialization(e.to_string())),
            Self::Bincode => {
                bincode::serialize(message).map_err(|e| BrokerError::Serialization(e.to_string()))
            },
        }
    }

    /// Decode a message from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Deserialization`] if the bytes are not a
    /// valid encoding of `M`.
    pub fn deserialize<M: Message>(self, bytes: &[u8]) -> Result<M, BrokerError> {
        match self {
            Self::Json => serde_json::from_slice(bytes)
                .map_err(|e| BrokerError::Deserialization(e.to_string())),
            Self::Bincode => {
                bincode::deserialize(bytes).map_err(|e| BrokerError::Deserialization(e.to_string()))
            },
        }
    }

    /// MIME-style content type recorded in the `ContentType` header.
    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Bincode => "application/octet-stream",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    enum Status {
        Pending,
        Shipped { tracking: String },
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: String,
        items: Vec<String>,
        attributes: HashMap<String, String>,
        placed_at: DateTime<Utc>,
        status: Status,
        note: Option<String>,
        delay_ms: u64,
    }

    impl Message for Order {
        fn message_type() -> &'static str {
            "Order.v1"
        }
    }

    fn sample_order() -> Order {
        let mut attributes = HashMap::new();
        attributes.insert("channel".to_string(), "web".to_string());
        Order {
            id: "order-1".to_string(),
            items: vec!["sku-1".to_string(), "sku-2".to_string()],
            attributes,
            placed_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).single().unwrap(),
            status: Status::Shipped {
                tracking: "TRK-9".to_string(),
            },
            note: None,
            delay_ms: 1500,
        }
    }

    #[test]
    fn json_roundtrips_nested_graph() {
        let order = sample_order();
        let bytes = SerializationFormat::Json.serialize(&order).unwrap();
        let decoded: Order = SerializationFormat::Json.deserialize(&bytes).unwrap();
        assert_eq!(order, decoded);
    }

    #[test]
    fn bincode_roundtrips_nested_graph() {
        let order = sample_order();
        let bytes = SerializationFormat::Bincode.serialize(&order).unwrap();
        let decoded: Order = SerializationFormat::Bincode.deserialize(&bytes).unwrap();
        assert_eq!(order, decoded);
    }

    #[test]
    fn garbage_fails_with_deserialization_error() {
        let result: Result<Order, _> = SerializationFormat::Json.deserialize(b"not json");
        assert!(matches!(result, Err(BrokerError::Deserialization(_))));
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u64,
        name: String,
        tags: Vec<String>,
        score: Option<i32>,
    }

    impl Message for Sample {
        fn message_type() -> &'static str {
            "Sample.v1"
        }
    }

    proptest! {
        #[test]
        fn json_roundtrip_property(
            id in any::<u64>(),
            name in ".*",
            tags in proptest::collection::vec(".*", 0..4),
            score in any::<Option<i32>>(),
        ) {
            let sample = Sample { id, name, tags, score };
            let bytes = SerializationFormat::Json.serialize(&sample).unwrap();
            let decoded: Sample = SerializationFormat::Json.deserialize(&bytes).unwrap();
            prop_assert_eq!(sample, decoded);
        }
    }
}
