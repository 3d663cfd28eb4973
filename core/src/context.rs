//! Per-delivery message context.
//!
//! A [`MessageContext`] accompanies every handler invocation. It carries
//! the envelope metadata plus two capability closures, `acknowledge` and
//! `reject`, which the transport adapter binds to its native ack/nack
//! primitives before dispatch. Handlers that never touch them simply rely
//! on the subscription's acknowledgement mode.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::BrokerError;
use crate::message::{headers, Envelope};

/// Capability closure for acknowledging a delivery.
pub type AckAction = Arc<dyn Fn() -> BoxFuture<'static, Result<(), BrokerError>> + Send + Sync>;

/// Capability closure for rejecting a delivery. The `bool` is the requeue
/// flag.
pub type RejectAction =
    Arc<dyn Fn(bool) -> BoxFuture<'static, Result<(), BrokerError>> + Send + Sync>;

/// Context passed to every handler invocation.
#[derive(Clone)]
pub struct MessageContext {
    /// Message id from the envelope.
    pub message_id: String,
    /// Correlation id, if the publisher set one.
    pub correlation_id: Option<String>,
    /// Publish timestamp.
    pub timestamp: DateTime<Utc>,
    /// Routing key the message was delivered under.
    pub routing_key: Option<String>,
    /// Exchange or topic the message arrived on.
    pub exchange: Option<String>,
    /// Wire headers.
    pub headers: HashMap<String, String>,
    /// How many times this delivery has been retried.
    pub retry_count: u32,
    /// Verified claims attached by the security layer, if authentication
    /// ran for this delivery.
    pub claims: Option<serde_json::Value>,
    ack: Option<AckAction>,
    reject: Option<RejectAction>,
}

impl MessageContext {
    /// Build a context from an envelope's metadata.
    #[must_use]
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            message_id: envelope.message_id.clone(),
            correlation_id: envelope.correlation_id.clone(),
            timestamp: envelope.timestamp,
            routing_key: None,
            exchange: None,
            headers: envelope.headers.clone(),
            retry_count: 0,
            claims: None,
            ack: None,
            reject: None,
        }
    }

    /// Set the routing key the delivery arrived under.
    #[must_use]
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Set the exchange or topic the delivery arrived on.
    #[must_use]
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Set the delivery retry count.
    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Bind the acknowledge capability. Called by transport adapters.
    #[must_use]
    pub fn with_ack(mut self, ack: AckAction) -> Self {
        self.ack = Some(ack);
        self
    }

    /// Bind the reject capability. Called by transport adapters.
    #[must_use]
    pub fn with_reject(mut self, reject: RejectAction) -> Self {
        self.reject = Some(reject);
        self
    }

    /// Attach verified claims. Called by the security layer.
    #[must_use]
    pub fn with_claims(mut self, claims: serde_json::Value) -> Self {
        self.claims = Some(claims);
        self
    }

    /// Acknowledge the delivery.
    ///
    /// A no-op when the transport did not bind an ack action (in-memory
    /// transport, auto-ack subscriptions).
    ///
    /// # Errors
    ///
    /// Surfaces the transport's error if the native ack fails.
    pub async fn acknowledge(&self) -> Result<(), BrokerError> {
        match &self.ack {
            Some(ack) => ack().await,
            None => Ok(()),
        }
    }

    /// Reject the delivery, optionally asking the transport to requeue it.
    ///
    /// A no-op when the transport did not bind a reject action.
    ///
    /// # Errors
    ///
    /// Surfaces the transport's error if the native nack fails.
    pub async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        match &self.reject {
            Some(reject) => reject(requeue).await,
            None => Ok(()),
        }
    }

    /// The tenant header value, if any of the recognized forms is present.
    #[must_use]
    pub fn tenant_header(&self) -> Option<&str> {
        [
            headers::TENANT_ID,
            headers::X_TENANT_ID,
            headers::X_TENANT,
            headers::TENANT_ID_SNAKE,
        ]
        .iter()
        .find_map(|name| self.headers.get(*name))
        .map(String::as_str)
        .filter(|value| !value.trim().is_empty())
    }
}

impl fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("message_id", &self.message_id)
            .field("correlation_id", &self.correlation_id)
            .field("routing_key", &self.routing_key)
            .field("retry_count", &self.retry_count)
            .field("has_ack", &self.ack.is_some())
            .field("has_reject", &self.reject.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[tokio::test]
    async fn unbound_capabilities_are_noops() {
        let envelope = Envelope::new("T.v1", vec![]);
        let ctx = MessageContext::from_envelope(&envelope);
        assert!(ctx.acknowledge().await.is_ok());
        assert!(ctx.reject(true).await.is_ok());
    }

    #[tokio::test]
    async fn bound_ack_is_invoked() {
        let acked = Arc::new(AtomicUsize::new(0));
        let acked_clone = Arc::clone(&acked);
        let envelope = Envelope::new("T.v1", vec![]);
        let ctx = MessageContext::from_envelope(&envelope).with_ack(Arc::new(move || {
            let acked = Arc::clone(&acked_clone);
            Box::pin(async move {
                acked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));

        ctx.acknowledge().await.unwrap();
        assert_eq!(acked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reject_forwards_requeue_flag() {
        let requeued = Arc::new(AtomicBool::new(false));
        let requeued_clone = Arc::clone(&requeued);
        let envelope = Envelope::new("T.v1", vec![]);
        let ctx = MessageContext::from_envelope(&envelope).with_reject(Arc::new(move |requeue| {
            let requeued = Arc::clone(&requeued_clone);
            Box::pin(async move {
                requeued.store(requeue, Ordering::SeqCst);
                Ok(())
            })
        }));

        ctx.reject(true).await.unwrap();
        assert!(requeued.load(Ordering::SeqCst));
    }

    #[test]
    fn tenant_header_checks_all_forms() {
        let envelope = Envelope::new("T.v1", vec![]);
        let mut ctx = MessageContext::from_envelope(&envelope);
        assert_eq!(ctx.tenant_header(), None);

        ctx.headers
            .insert(headers::X_TENANT.to_string(), "acme".to_string());
        assert_eq!(ctx.tenant_header(), Some("acme"));

        // Canonical form wins over the HTTP-style forms.
        ctx.headers
            .insert(headers::TENANT_ID.to_string(), "globex".to_string());
        assert_eq!(ctx.tenant_header(), Some("globex"));
    }
}
