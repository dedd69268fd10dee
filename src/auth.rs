//! Ingress and tunnel authentication.
//!
//! Two independent credential checks:
//!
//! - **Proxy ingress** — the `x-goog-api-key` header (or `key` query
//!   parameter, which is where Google SDKs put it) is matched against the
//!   configured API key. All authorized callers are attributed to the
//!   configured single-tenant user id.
//! - **Tunnel upgrade** — the `auth_token` query parameter is resolved to a
//!   user id through the configured token table (browsers can't set headers
//!   on WebSocket upgrades).

use std::collections::HashMap;

use axum::extract::Query;
use axum::http::{HeaderMap, Uri};
use tracing::error;

use crate::config::Config;
use crate::error::ProxyError;

/// Authenticate an inbound proxy request and return the attributed user id.
///
/// # Errors
///
/// - [`ProxyError::ServerConfig`] — no API key configured (`AUTH_API_KEY` unset)
/// - [`ProxyError::AuthFailure`] — key missing or mismatched
pub fn authenticate_proxy_request(
    config: &Config,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<String, ProxyError> {
    let Some(ref expected) = config.auth.api_key else {
        error!("AUTH_API_KEY not set; rejecting proxy request");
        return Err(ProxyError::ServerConfig);
    };

    let header_key = headers
        .get("x-goog-api-key")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    let provided = match header_key {
        Some(k) if !k.is_empty() => k,
        _ => Query::<HashMap<String, String>>::try_from_uri(uri)
            .ok()
            .and_then(|Query(params)| params.get("key").cloned())
            .unwrap_or_default(),
    };

    if provided.is_empty() || !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return Err(ProxyError::AuthFailure);
    }

    Ok(config.auth.proxy_user_id.clone())
}

/// Resolve a tunnel `auth_token` to a user id, or `None` if unknown.
pub fn validate_tunnel_token(config: &Config, token: &str) -> Option<String> {
    if token.is_empty() {
        return None;
    }
    // Compare against every configured token so response time doesn't depend
    // on which entry matched.
    let mut matched: Option<String> = None;
    for (candidate, user_id) in &config.auth.tunnel_tokens {
        if constant_time_eq(candidate.as_bytes(), token.as_bytes()) {
            matched = Some(user_id.clone());
        }
    }
    matched
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config_with_key(key: Option<&str>) -> Config {
        let mut config: Config = toml::from_str("").unwrap();
        config.auth.api_key = key.map(ToString::to_string);
        config
            .auth
            .tunnel_tokens
            .insert("valid-token-user-1".to_string(), "user-1".to_string());
        config
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secres"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_proxy_auth_header() {
        let config = config_with_key(Some("k-123"));
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", "k-123".parse().unwrap());
        let uri: Uri = "/v1beta/models/x:generateContent".parse().unwrap();
        assert_eq!(
            authenticate_proxy_request(&config, &headers, &uri).unwrap(),
            "user-1"
        );
    }

    #[test]
    fn test_proxy_auth_query_param() {
        let config = config_with_key(Some("k-123"));
        let headers = HeaderMap::new();
        let uri: Uri = "/v1beta/models/x:generateContent?key=k-123".parse().unwrap();
        assert_eq!(
            authenticate_proxy_request(&config, &headers, &uri).unwrap(),
            "user-1"
        );
    }

    #[test]
    fn test_proxy_auth_mismatch() {
        let config = config_with_key(Some("k-123"));
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", "wrong".parse().unwrap());
        let uri: Uri = "/".parse().unwrap();
        assert!(matches!(
            authenticate_proxy_request(&config, &headers, &uri),
            Err(ProxyError::AuthFailure)
        ));
    }

    #[test]
    fn test_proxy_auth_missing_key() {
        let config = config_with_key(Some("k-123"));
        let headers = HeaderMap::new();
        let uri: Uri = "/".parse().unwrap();
        assert!(matches!(
            authenticate_proxy_request(&config, &headers, &uri),
            Err(ProxyError::AuthFailure)
        ));
    }

    #[test]
    fn test_proxy_auth_unconfigured_server() {
        let config = config_with_key(None);
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", "anything".parse().unwrap());
        let uri: Uri = "/".parse().unwrap();
        assert!(matches!(
            authenticate_proxy_request(&config, &headers, &uri),
            Err(ProxyError::ServerConfig)
        ));
    }

    #[test]
    fn test_tunnel_token() {
        let config = config_with_key(Some("k"));
        assert_eq!(
            validate_tunnel_token(&config, "valid-token-user-1").as_deref(),
            Some("user-1")
        );
        assert!(validate_tunnel_token(&config, "bogus").is_none());
        assert!(validate_tunnel_token(&config, "").is_none());
    }
}
