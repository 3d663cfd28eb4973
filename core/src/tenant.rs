//! Tenant identity extraction.
//!
//! Multi-tenant rate limiting and routing need a tenant key per message.
//! The key is taken from the first non-empty tenant header
//! (`TenantId`, `X-Tenant-Id`, `X-Tenant`, `tenant_id`); failing that,
//! the bearer token in `Authorization` is peeked for a `tenant_id` or
//! `tid` claim. Peeking only base64-decodes the payload segment — this is
//! extraction, not authentication; signature verification lives in the
//! security layer.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::collections::HashMap;

use crate::message::headers;

/// Header names checked for a tenant identity, in priority order.
const TENANT_HEADERS: [&str; 4] = [
    headers::TENANT_ID,
    headers::X_TENANT_ID,
    headers::X_TENANT,
    headers::TENANT_ID_SNAKE,
];

/// Extract the tenant identity from a headers map.
///
/// Returns the first non-empty tenant header, then the `tenant_id` or
/// `tid` claim of a bearer token in `Authorization`, then `default`.
#[must_use]
pub fn extract_tenant(
    headers: &HashMap<String, String>,
    default: Option<&str>,
) -> Option<String> {
    for name in TENANT_HEADERS {
        if let Some(value) = headers.get(name) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }

    if let Some(authorization) = headers.get(headers::AUTHORIZATION) {
        if let Some(tenant) = tenant_from_bearer(authorization) {
            return Some(tenant);
        }
    }

    default.map(ToString::to_string)
}

/// Decode the payload segment of a bearer JWT and pull the tenant claim.
fn tenant_from_bearer(authorization: &str) -> Option<String> {
    let token = authorization
        .strip_prefix("Bearer ")
        .or_else(|| authorization.strip_prefix("bearer "))?
        .trim();

    let mut segments = token.split('.');
    let _header = segments.next()?;
    let payload = segments.next()?;
    // A JWT has exactly three segments.
    if segments.next().is_none() || token.split('.').count() != 3 {
        return None;
    }

    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;

    ["tenant_id", "tid"]
        .iter()
        .find_map(|claim| claims.get(*claim))
        .and_then(|value| value.as_str())
        .filter(|value| !value.trim().is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn bearer_for(claims: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
        format!("Bearer {header}.{payload}.signature")
    }

    #[test]
    fn first_non_empty_header_wins() {
        let mut headers = HashMap::new();
        headers.insert(headers::TENANT_ID.to_string(), "  ".to_string());
        headers.insert(headers::X_TENANT_ID.to_string(), "acme".to_string());
        headers.insert(headers::X_TENANT.to_string(), "other".to_string());

        assert_eq!(extract_tenant(&headers, None), Some("acme".to_string()));
    }

    #[test]
    fn bearer_token_tenant_claim_is_used() {
        let mut headers = HashMap::new();
        headers.insert(
            headers::AUTHORIZATION.to_string(),
            bearer_for(&serde_json::json!({ "sub": "user-1", "tenant_id": "globex" })),
        );

        assert_eq!(extract_tenant(&headers, None), Some("globex".to_string()));
    }

    #[test]
    fn tid_claim_is_a_fallback() {
        let mut headers = HashMap::new();
        headers.insert(
            headers::AUTHORIZATION.to_string(),
            bearer_for(&serde_json::json!({ "tid": "initech" })),
        );

        assert_eq!(extract_tenant(&headers, None), Some("initech".to_string()));
    }

    #[test]
    fn malformed_tokens_fall_through_to_default() {
        let mut headers = HashMap::new();
        headers.insert(
            headers::AUTHORIZATION.to_string(),
            "Bearer not-a-jwt".to_string(),
        );

        assert_eq!(
            extract_tenant(&headers, Some("fallback")),
            Some("fallback".to_string())
        );
        assert_eq!(extract_tenant(&HashMap::new(), None), None);
    }

    #[test]
    fn header_takes_priority_over_token() {
        let mut headers = HashMap::new();
        headers.insert(headers::TENANT_ID.to_string(), "from-header".to_string());
        headers.insert(
            headers::AUTHORIZATION.to_string(),
            bearer_for(&serde_json::json!({ "tenant_id": "from-token" })),
        );

        assert_eq!(
            extract_tenant(&headers, None),
            Some("from-header".to_string())
        );
    }
}
