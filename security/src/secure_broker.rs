//! Security broker decorator.
//!
//! On publish, the payload is sealed into an [`EncryptedEnvelope`] and
//! the wire headers note the algorithm and key id. On subscribe, the
//! handler is wrapped so that — before it ever runs — the bearer token
//! is validated (rejecting the message outright on failure) and the
//! payload is decrypted back to plaintext. Sits outside the base broker,
//! so compression applies to the sealed payload and is undone before
//! decryption on the way in.

use std::sync::Arc;
use tracing::{debug, warn};

use courier_core::broker::{Broker, BrokerFuture, ErasedHandler, SubscriptionInfo};
use courier_core::config::SecurityOptions;
use courier_core::context::MessageContext;
use courier_core::error::BrokerError;
use courier_core::message::{headers, Envelope};
use courier_core::options::PublishOptions;
use courier_core::serialization::SerializationFormat;

use crate::auth::Authenticator;
use crate::encryption::{EncryptedEnvelope, MessageEncryptor};

/// Wire value of the `EncryptionAlgorithm` header.
const ALGORITHM: &str = "AES-256-GCM";

/// Broker decorator applying payload encryption and bearer-token
/// authentication.
pub struct SecureBroker {
    inner: Arc<dyn Broker>,
    options: SecurityOptions,
    encryptor: Option<Arc<MessageEncryptor>>,
    authenticator: Option<Arc<Authenticator>>,
}

impl SecureBroker {
    /// Wrap `inner` per the security options.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidOptions`] when an enabled feature is
    /// missing its material (no encryptor while `encrypt_payloads`, no
    /// usable authentication settings while `authenticate`).
    pub fn new(
        inner: Arc<dyn Broker>,
        options: SecurityOptions,
        encryptor: Option<MessageEncryptor>,
    ) -> Result<Self, BrokerError> {
        options.validate()?;

        let encryptor = match (options.enabled && options.encrypt_payloads, encryptor) {
            (true, Some(encryptor)) => Some(Arc::new(encryptor)),
            (true, None) => {
                return Err(BrokerError::InvalidOptions(
                    "encrypt_payloads requires an encryptor with key material".to_string(),
                ));
            },
            (false, _) => None,
        };
        let authenticator = if options.enabled && options.authenticate {
            Some(Arc::new(Authenticator::from_options(&options)?))
        } else {
            None
        };

        Ok(Self {
            inner,
            options,
            encryptor,
            authenticator,
        })
    }

    fn seal(&self, envelope: &mut Envelope) -> Result<(), BrokerError> {
        let Some(encryptor) = &self.encryptor else {
            return Ok(());
        };
        let sealed: EncryptedEnvelope = encryptor.encrypt(&envelope.payload, None)?;
        envelope.payload = serde_json::to_vec(&sealed)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;
        debug!(
            message_id = %envelope.message_id,
            key_id = %sealed.key_id,
            "Payload sealed"
        );
        envelope
            .headers
            .insert(headers::ENCRYPTION_ALGORITHM.to_string(), ALGORITHM.to_string());
        envelope
            .headers
            .insert(headers::ENCRYPTION_KEY_ID.to_string(), sealed.key_id);
        Ok(())
    }
}

impl Broker for SecureBroker {
    fn publish_envelope(
        &self,
        mut envelope: Envelope,
        options: PublishOptions,
    ) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.seal(&mut envelope)?;
            self.inner.publish_envelope(envelope, options).await
        })
    }

    fn subscribe_with(&self, subscription: SubscriptionInfo) -> BrokerFuture<'_, ()> {
        if !self.options.enabled {
            return self.inner.subscribe_with(subscription);
        }

        let encryptor = self.encryptor.clone();
        let authenticator = self.authenticator.clone();
        let user_handler = subscription.handler;

        let wrapped: ErasedHandler =
            Arc::new(move |mut envelope: Envelope, mut context: MessageContext| {
                let encryptor = encryptor.clone();
                let authenticator = authenticator.clone();
                let user_handler = Arc::clone(&user_handler);
                Box::pin(async move {
                    // Authentication first: a message that fails it is
                    // rejected before any decryption or handler work.
                    if let Some(authenticator) = &authenticator {
                        let bearer = context
                            .headers
                            .get(headers::AUTHORIZATION)
                            .cloned()
                            .unwrap_or_default();
                        match authenticator.authenticate(&bearer) {
                            Ok(claims) => {
                                context = context.with_claims(claims);
                            },
                            Err(auth_error) => {
                                warn!(
                                    message_id = %envelope.message_id,
                                    error = %auth_error,
                                    "Message rejected by authentication"
                                );
                                // No requeue: a bad token does not get
                                // better on redelivery.
                                let _ = context.reject(false).await;
                                return Err(auth_error);
                            },
                        }
                    }

                    if let Some(encryptor) = &encryptor {
                        if envelope.headers.contains_key(headers::ENCRYPTION_KEY_ID) {
                            let sealed: EncryptedEnvelope =
                                serde_json::from_slice(&envelope.payload).map_err(|e| {
                                    BrokerError::Authentication(format!(
                                        "malformed encrypted envelope: {e}"
                                    ))
                                })?;
                            envelope.payload = encryptor.decrypt(&sealed)?;
                        }
                    }

                    user_handler(envelope, context).await
                })
            });

        self.inner.subscribe_with(SubscriptionInfo {
            message_type: subscription.message_type,
            options: subscription.options,
            handler: wrapped,
        })
    }

    fn start(&self) -> BrokerFuture<'_, ()> {
        self.inner.start()
    }

    fn stop(&self) -> BrokerFuture<'_, ()> {
        self.inner.stop()
    }

    fn shutdown(&self) -> BrokerFuture<'_, ()> {
        self.inner.shutdown()
    }

    fn serialization(&self) -> SerializationFormat {
        self.inner.serialization()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use courier_core::config::AuthenticationMode;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as SyncMutex;

    const SECRET: &str = "secure-broker-secret";

    /// Inner broker that records publishes and captures subscriptions.
    #[derive(Default)]
    struct Capturing {
        published: SyncMutex<Vec<Envelope>>,
        subscription: SyncMutex<Option<SubscriptionInfo>>,
    }

    impl Broker for Capturing {
        fn publish_envelope(
            &self,
            envelope: Envelope,
            _options: PublishOptions,
        ) -> BrokerFuture<'_, ()> {
            Box::pin(async move {
                self.published.lock().unwrap().push(envelope);
                Ok(())
            })
        }

        fn subscribe_with(&self, subscription: SubscriptionInfo) -> BrokerFuture<'_, ()> {
            *self.subscription.lock().unwrap() = Some(subscription);
            Box::pin(async { Ok(()) })
        }

        fn start(&self) -> BrokerFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn stop(&self) -> BrokerFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn shutdown(&self) -> BrokerFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    fn encryption_options() -> SecurityOptions {
        SecurityOptions {
            enabled: true,
            encrypt_payloads: true,
            default_key_id: "k1".to_string(),
            ..SecurityOptions::default()
        }
    }

    fn auth_options() -> SecurityOptions {
        SecurityOptions {
            enabled: true,
            authenticate: true,
            authentication_mode: AuthenticationMode::SharedSecret,
            shared_secret: SECRET.to_string(),
            ..SecurityOptions::default()
        }
    }

    fn encryptor() -> MessageEncryptor {
        MessageEncryptor::new("k1").with_key("k1", &[3u8; 32])
    }

    fn valid_token() -> String {
        let claims = serde_json::json!({
            "sub": "user-1",
            "tenant_id": "acme",
            "exp": (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp(),
        });
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn publish_seals_payload_and_stamps_headers() {
        let inner = Arc::new(Capturing::default());
        let broker = SecureBroker::new(
            Arc::clone(&inner) as Arc<dyn Broker>,
            encryption_options(),
            Some(encryptor()),
        )
        .unwrap();

        broker
            .publish_envelope(
                Envelope::new("T.v1", b"top secret".to_vec()),
                PublishOptions::default(),
            )
            .await
            .unwrap();

        let published = inner.published.lock().unwrap();
        let wire = &published[0];
        assert_eq!(
            wire.headers.get(headers::ENCRYPTION_ALGORITHM).unwrap(),
            "AES-256-GCM"
        );
        assert_eq!(wire.headers.get(headers::ENCRYPTION_KEY_ID).unwrap(), "k1");

        // The wire payload is a sealed envelope, not the plaintext.
        let sealed: EncryptedEnvelope = serde_json::from_slice(&wire.payload).unwrap();
        assert_eq!(sealed.key_id, "k1");
        assert_eq!(encryptor().decrypt(&sealed).unwrap(), b"top secret");
    }

    #[tokio::test]
    async fn subscribe_decrypts_before_the_handler() {
        let inner = Arc::new(Capturing::default());
        let broker = SecureBroker::new(
            Arc::clone(&inner) as Arc<dyn Broker>,
            encryption_options(),
            Some(encryptor()),
        )
        .unwrap();

        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let handler: ErasedHandler = Arc::new(move |envelope, _| {
            let seen = Arc::clone(&seen_clone);
            Box::pin(async move {
                seen.lock().unwrap().push(envelope.payload);
                Ok(())
            })
        });
        broker
            .subscribe_with(SubscriptionInfo::new(
                "T.v1",
                courier_core::options::SubscriptionOptions::default(),
                handler,
            ))
            .await
            .unwrap();

        // Publish through the same broker, then feed the wire envelope to
        // the wrapped handler as a transport would.
        broker
            .publish_envelope(
                Envelope::new("T.v1", b"round trip".to_vec()),
                PublishOptions::default(),
            )
            .await
            .unwrap();
        let wire = inner.published.lock().unwrap().remove(0);
        let context = MessageContext::from_envelope(&wire);
        let wrapped = inner.subscription.lock().unwrap().take().unwrap();
        (wrapped.handler)(wire, context).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![b"round trip".to_vec()]);
    }

    #[tokio::test]
    async fn authenticated_delivery_attaches_claims() {
        let inner = Arc::new(Capturing::default());
        let broker = SecureBroker::new(
            Arc::clone(&inner) as Arc<dyn Broker>,
            auth_options(),
            None,
        )
        .unwrap();

        let claims_seen = Arc::new(SyncMutex::new(None));
        let claims_clone = Arc::clone(&claims_seen);
        let handler: ErasedHandler = Arc::new(move |_, context| {
            let claims_seen = Arc::clone(&claims_clone);
            Box::pin(async move {
                *claims_seen.lock().unwrap() = context.claims.clone();
                Ok(())
            })
        });
        broker
            .subscribe_with(SubscriptionInfo::new(
                "T.v1",
                courier_core::options::SubscriptionOptions::default(),
                handler,
            ))
            .await
            .unwrap();

        let envelope = Envelope::new("T.v1", vec![1]).with_header(
            headers::AUTHORIZATION,
            format!("Bearer {}", valid_token()),
        );
        let context = MessageContext::from_envelope(&envelope);
        let wrapped = inner.subscription.lock().unwrap().take().unwrap();
        (wrapped.handler)(envelope, context).await.unwrap();

        let claims = claims_seen.lock().unwrap().clone().unwrap();
        assert_eq!(claims["tenant_id"], "acme");
    }

    #[tokio::test]
    async fn unauthenticated_delivery_never_reaches_the_handler() {
        let inner = Arc::new(Capturing::default());
        let broker = SecureBroker::new(
            Arc::clone(&inner) as Arc<dyn Broker>,
            auth_options(),
            None,
        )
        .unwrap();

        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked_clone = Arc::clone(&invoked);
        let handler: ErasedHandler = Arc::new(move |_, _| {
            let invoked = Arc::clone(&invoked_clone);
            Box::pin(async move {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        broker
            .subscribe_with(SubscriptionInfo::new(
                "T.v1",
                courier_core::options::SubscriptionOptions::default(),
                handler,
            ))
            .await
            .unwrap();

        // No Authorization header at all.
        let envelope = Envelope::new("T.v1", vec![1]);
        let context = MessageContext::from_envelope(&envelope);
        let wrapped = inner.subscription.lock().unwrap().take().unwrap();
        let result = (wrapped.handler)(envelope, context).await;

        assert!(matches!(result, Err(BrokerError::Authentication(_))));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn enabling_encryption_without_keys_fails_construction() {
        let inner = Arc::new(Capturing::default());
        let result = SecureBroker::new(inner as Arc<dyn Broker>, encryption_options(), None);
        assert!(matches!(result, Err(BrokerError::InvalidOptions(_))));
    }
}
