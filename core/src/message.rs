//! Message trait, wire envelope and header contract.
//!
//! A message is any caller-supplied serde value with a stable type tag. The
//! tag travels in the `MessageType` header and keys the subscription
//! registry, so it must never change once consumers exist.
//!
//! # Example
//!
//! ```
//! use courier_core::message::Message;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct OrderPlaced {
//!     order_id: String,
//!     total_cents: u64,
//! }
//!
//! impl Message for OrderPlaced {
//!     fn message_type() -> &'static str {
//!         "OrderPlaced.v1"
//!     }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::BrokerError;

/// Well-known wire header names. These are a stable contract shared with
/// every transport; adapters map them onto native message properties.
pub mod headers {
    /// Fully qualified message type tag.
    pub const MESSAGE_TYPE: &str = "MessageType";
    /// Opaque message id.
    pub const MESSAGE_ID: &str = "MessageId";
    /// ISO-8601 UTC publish timestamp.
    pub const TIMESTAMP: &str = "Timestamp";
    /// Correlation id linking related messages.
    pub const CORRELATION_ID: &str = "CorrelationId";
    /// Serialized content type (e.g. `application/json`).
    pub const CONTENT_TYPE: &str = "ContentType";
    /// Tenant identity, canonical form.
    pub const TENANT_ID: &str = "TenantId";
    /// Tenant identity, HTTP-style form.
    pub const X_TENANT_ID: &str = "X-Tenant-Id";
    /// Tenant identity, short HTTP-style form.
    pub const X_TENANT: &str = "X-Tenant";
    /// Tenant identity, snake-case form.
    pub const TENANT_ID_SNAKE: &str = "tenant_id";
    /// Bearer token carrying caller identity.
    pub const AUTHORIZATION: &str = "Authorization";
    /// Tokens remaining in the caller's rate-limit window.
    pub const RATE_LIMIT_REMAINING: &str = "X-RateLimit-Remaining";
    /// Epoch-millis instant at which the rate-limit window resets.
    pub const RATE_LIMIT_RESET: &str = "X-RateLimit-Reset";
    /// Number of items in a batch envelope.
    pub const BATCH_COUNT: &str = "BatchCount";
    /// Algorithm used by the security envelope.
    pub const ENCRYPTION_ALGORITHM: &str = "EncryptionAlgorithm";
    /// Key id used by the security envelope.
    pub const ENCRYPTION_KEY_ID: &str = "EncryptionKeyId";
}

/// A typed message that can travel through a broker.
///
/// The type tag returned by [`Message::message_type`] is the wire identity
/// of the type. Version it explicitly (`"OrderPlaced.v1"`) so schemas can
/// evolve without breaking existing consumers.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type tag carried in the `MessageType` header.
    fn message_type() -> &'static str;
}

/// The wire carrier for a serialized message.
///
/// Everything past the typed façade operates on envelopes: decorators
/// inspect headers and payload bytes, transports map the fields onto native
/// message properties. The payload is whatever the configured serializer
/// produced, possibly compressed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique id assigned at publish time.
    pub message_id: String,
    /// The message type tag.
    pub message_type: String,
    /// Serialized (and possibly compressed) message body.
    pub payload: Vec<u8>,
    /// Wire headers. See [`headers`] for the well-known names.
    pub headers: HashMap<String, String>,
    /// Correlation id linking related messages, if any.
    pub correlation_id: Option<String>,
    /// Publish timestamp.
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Create a new envelope with a fresh message id and the current time.
    #[must_use]
    pub fn new(message_type: impl Into<String>, payload: Vec<u8>) -> Self {
        let message_type = message_type.into();
        let message_id = Uuid::new_v4().to_string();
        let timestamp = Utc::now();
        let mut headers = HashMap::new();
        headers.insert(headers::MESSAGE_TYPE.to_string(), message_type.clone());
        headers.insert(headers::MESSAGE_ID.to_string(), message_id.clone());
        headers.insert(headers::TIMESTAMP.to_string(), timestamp.to_rfc3339());
        Self {
            message_id,
            message_type,
            payload,
            headers,
            correlation_id: None,
            timestamp,
        }
    }

    /// Set the correlation id, mirroring it into the headers.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        let correlation_id = correlation_id.into();
        self.headers
            .insert(headers::CORRELATION_ID.to_string(), correlation_id.clone());
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Add a header, returning the envelope for chaining.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Whether this envelope carries a framed batch of messages.
    #[must_use]
    pub fn is_batch(&self) -> bool {
        self.headers.contains_key(headers::BATCH_COUNT)
    }

    /// Frame a list of serialized items into a single batch envelope.
    ///
    /// The payload is a length-prefixed concatenation (u32 big-endian length
    /// followed by the item bytes) and the envelope carries a `BatchCount`
    /// header equal to the number of items. All items must share a message
    /// type.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidArgument`] if `items` is empty or an
    /// item exceeds `u32::MAX` bytes.
    pub fn batch(message_type: impl Into<String>, items: &[Vec<u8>]) -> Result<Self, BrokerError> {
        if items.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "batch requires at least one item".to_string(),
            ));
        }
        let mut payload = Vec::with_capacity(items.iter().map(|i| i.len() + 4).sum());
        for item in items {
            let len = u32::try_from(item.len()).map_err(|_| {
                BrokerError::InvalidArgument(format!("batch item too large: {} bytes", item.len()))
            })?;
            payload.extend_from_slice(&len.to_be_bytes());
            payload.extend_from_slice(item);
        }
        Ok(Self::new(message_type, payload)
            .with_header(headers::BATCH_COUNT, items.len().to_string()))
    }

    /// Split a batch envelope back into its item payloads.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Deserialization`] if the framing is truncated
    /// or the item count disagrees with the `BatchCount` header.
    pub fn unbatch(&self) -> Result<Vec<Vec<u8>>, BrokerError> {
        let declared: usize = self
            .headers
            .get(headers::BATCH_COUNT)
            .ok_or_else(|| {
                BrokerError::Deserialization("envelope is not a batch".to_string())
            })?
            .parse()
            .map_err(|_| BrokerError::Deserialization("invalid BatchCount header".to_string()))?;

        let mut items = Vec::with_capacity(declared);
        let mut rest = self.payload.as_slice();
        while !rest.is_empty() {
            if rest.len() < 4 {
                return Err(BrokerError::Deserialization(
                    "truncated batch length prefix".to_string(),
                ));
            }
            let (prefix, tail) = rest.split_at(4);
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(prefix);
            let len = u32::from_be_bytes(len_bytes) as usize;
            if tail.len() < len {
                return Err(BrokerError::Deserialization(format!(
                    "truncated batch item: need {len} bytes, have {}",
                    tail.len()
                )));
            }
            let (item, tail) = tail.split_at(len);
            items.push(item.to_vec());
            rest = tail;
        }
        if items.len() != declared {
            return Err(BrokerError::Deserialization(format!(
                "BatchCount says {declared} items, framing holds {}",
                items.len()
            )));
        }
        Ok(items)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope {{ id: {}, type: {}, size: {} bytes }}",
            self.message_id,
            self.message_type,
            self.payload.len()
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn new_envelope_carries_identity_headers() {
        let envelope = Envelope::new("OrderPlaced.v1", vec![1, 2, 3]);
        assert_eq!(
            envelope.headers.get(headers::MESSAGE_TYPE).unwrap(),
            "OrderPlaced.v1"
        );
        assert_eq!(
            envelope.headers.get(headers::MESSAGE_ID).unwrap(),
            &envelope.message_id
        );
        assert!(envelope.headers.contains_key(headers::TIMESTAMP));
        assert!(!envelope.is_batch());
    }

    #[test]
    fn correlation_id_is_mirrored_into_headers() {
        let envelope = Envelope::new("T.v1", vec![]).with_correlation_id("saga-7");
        assert_eq!(envelope.correlation_id.as_deref(), Some("saga-7"));
        assert_eq!(
            envelope.headers.get(headers::CORRELATION_ID).unwrap(),
            "saga-7"
        );
    }

    #[test]
    fn batch_roundtrip_preserves_items() {
        let items = vec![vec![1u8, 2, 3], vec![], vec![42u8; 1000]];
        let batch = Envelope::batch("T.v1", &items).unwrap();

        assert!(batch.is_batch());
        assert_eq!(batch.headers.get(headers::BATCH_COUNT).unwrap(), "3");
        assert_eq!(batch.unbatch().unwrap(), items);
    }

    #[test]
    fn empty_batch_is_rejected() {
        let err = Envelope::batch("T.v1", &[]).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument(_)));
    }

    #[test]
    fn truncated_batch_fails_to_unbatch() {
        let mut batch = Envelope::batch("T.v1", &[vec![1, 2, 3, 4]]).unwrap();
        batch.payload.truncate(5);
        assert!(matches!(
            batch.unbatch(),
            Err(BrokerError::Deserialization(_))
        ));
    }

    #[test]
    fn batch_count_mismatch_is_detected() {
        let mut batch = Envelope::batch("T.v1", &[vec![1], vec![2]]).unwrap();
        batch
            .headers
            .insert(headers::BATCH_COUNT.to_string(), "3".to_string());
        assert!(matches!(
            batch.unbatch(),
            Err(BrokerError::Deserialization(_))
        ));
    }
}
