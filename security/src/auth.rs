//! Bearer-token authentication.
//!
//! Validates the `Authorization` header of incoming messages before any
//! handler runs. Two modes, both verifying an HS256 signature with the
//! configured shared secret:
//!
//! - **shared-secret**: signature and expiry only
//! - **identity-provider**: additionally pins issuer and audience
//!
//! Key issuance and rotation are the identity provider's side of the
//! contract and out of scope here; the middleware verifies with the
//! material it is configured with.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use courier_core::config::{AuthenticationMode, SecurityOptions};
use courier_core::error::BrokerError;

/// Bearer-token validator attaching verified claims to deliveries.
pub struct Authenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    /// Build a validator from the security options.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidOptions`] when the configured mode
    /// is missing its material.
    pub fn from_options(options: &SecurityOptions) -> Result<Self, BrokerError> {
        if options.shared_secret.trim().is_empty() {
            return Err(BrokerError::InvalidOptions(
                "authentication requires a shared secret for signature verification".to_string(),
            ));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = options.leeway_secs;
        match options.authentication_mode {
            AuthenticationMode::SharedSecret => {
                validation.validate_aud = false;
            },
            AuthenticationMode::IdentityProvider => {
                if options.issuer.trim().is_empty() || options.audience.trim().is_empty() {
                    return Err(BrokerError::InvalidOptions(
                        "identity-provider mode requires issuer and audience".to_string(),
                    ));
                }
                validation.set_issuer(&[options.issuer.clone()]);
                validation.set_audience(&[options.audience.clone()]);
            },
        }

        Ok(Self {
            decoding_key: DecodingKey::from_secret(options.shared_secret.as_bytes()),
            validation,
        })
    }

    /// Validate a bearer token (with or without the `Bearer ` prefix)
    /// and return its claims.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Authentication`] for a missing, malformed,
    /// expired or otherwise invalid token.
    pub fn authenticate(&self, bearer: &str) -> Result<serde_json::Value, BrokerError> {
        let token = bearer
            .strip_prefix("Bearer ")
            .or_else(|| bearer.strip_prefix("bearer "))
            .unwrap_or(bearer)
            .trim();
        if token.is_empty() {
            return Err(BrokerError::Authentication(
                "empty bearer token".to_string(),
            ));
        }

        let data = decode::<serde_json::Value>(token, &self.decoding_key, &self.validation)
            .map_err(|e| BrokerError::Authentication(format!("token rejected: {e}")))?;
        Ok(data.claims)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "unit-test-secret";

    fn options(mode: AuthenticationMode) -> SecurityOptions {
        SecurityOptions {
            enabled: true,
            authenticate: true,
            authentication_mode: mode,
            shared_secret: SECRET.to_string(),
            issuer: "https://issuer.example".to_string(),
            audience: "courier".to_string(),
            leeway_secs: 0,
            ..SecurityOptions::default()
        }
    }

    fn token_with(claims: &serde_json::Value) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> i64 {
        (Utc::now() + chrono::Duration::hours(1)).timestamp()
    }

    #[test]
    fn valid_token_yields_claims() {
        let authenticator =
            Authenticator::from_options(&options(AuthenticationMode::SharedSecret)).unwrap();
        let token = token_with(&serde_json::json!({
            "sub": "user-1",
            "tenant_id": "acme",
            "exp": future_exp(),
        }));

        let claims = authenticator
            .authenticate(&format!("Bearer {token}"))
            .unwrap();
        assert_eq!(claims["sub"], "user-1");
        assert_eq!(claims["tenant_id"], "acme");
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let authenticator =
            Authenticator::from_options(&options(AuthenticationMode::SharedSecret)).unwrap();
        let forged = encode(
            &Header::default(),
            &serde_json::json!({ "sub": "user-1", "exp": future_exp() }),
            &EncodingKey::from_secret(b"other-secret"),
        )
        .unwrap();

        assert!(matches!(
            authenticator.authenticate(&forged),
            Err(BrokerError::Authentication(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let authenticator =
            Authenticator::from_options(&options(AuthenticationMode::SharedSecret)).unwrap();
        let token = token_with(&serde_json::json!({
            "sub": "user-1",
            "exp": (Utc::now() - chrono::Duration::hours(1)).timestamp(),
        }));

        assert!(authenticator.authenticate(&token).is_err());
    }

    #[test]
    fn identity_provider_mode_pins_issuer_and_audience() {
        let authenticator =
            Authenticator::from_options(&options(AuthenticationMode::IdentityProvider)).unwrap();

        let good = token_with(&serde_json::json!({
            "sub": "user-1",
            "iss": "https://issuer.example",
            "aud": "courier",
            "exp": future_exp(),
        }));
        assert!(authenticator.authenticate(&good).is_ok());

        let wrong_issuer = token_with(&serde_json::json!({
            "sub": "user-1",
            "iss": "https://evil.example",
            "aud": "courier",
            "exp": future_exp(),
        }));
        assert!(authenticator.authenticate(&wrong_issuer).is_err());

        let wrong_audience = token_with(&serde_json::json!({
            "sub": "user-1",
            "iss": "https://issuer.example",
            "aud": "other",
            "exp": future_exp(),
        }));
        assert!(authenticator.authenticate(&wrong_audience).is_err());
    }

    #[test]
    fn missing_material_fails_construction() {
        let mut opts = options(AuthenticationMode::SharedSecret);
        opts.shared_secret = String::new();
        assert!(matches!(
            Authenticator::from_options(&opts),
            Err(BrokerError::InvalidOptions(_))
        ));

        let mut opts = options(AuthenticationMode::IdentityProvider);
        opts.audience = String::new();
        assert!(Authenticator::from_options(&opts).is_err());
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        let authenticator =
            Authenticator::from_options(&options(AuthenticationMode::SharedSecret)).unwrap();
        assert!(authenticator.authenticate("").is_err());
        assert!(authenticator.authenticate("Bearer not.a.jwt").is_err());
    }
}
