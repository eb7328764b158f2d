//! AuthGate (spec §4.7): decides whether an incoming connection or HTTP
//! call is permitted, evaluating four paths in order — first match wins.
//!
//! Grounded on `require_api_key`/`constant_time_eq`, generalized from a
//! single pre-shared-key check into the full precedence chain spec.md §4.7
//! requires: a trusted-proxy header, a loopback peer address, "no token
//! configured", and finally the matching-secret check. `constant_time_eq`
//! is reused verbatim — it has no dependency on the single-header shape it
//! used to serve.

use std::net::IpAddr;

use axum::http::HeaderMap;

use crate::config::Config;

/// Header a trusted reverse proxy (e.g. Tailscale Serve) sets once it has
/// already authenticated the caller.
const TRUSTED_PROXY_HEADER: &str = "tailscale-user-login";

/// Evaluate the four-path precedence chain. `peer_addr` is the directly
/// connected socket's address (not trusted beyond loopback detection);
/// `query_token` is the `token` query parameter, when present.
pub fn is_authorized(
    config: &Config,
    peer_addr: Option<IpAddr>,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> bool {
    if headers.contains_key(TRUSTED_PROXY_HEADER) {
        return true;
    }

    if peer_addr.map_or(false, |addr| addr.is_loopback()) {
        return true;
    }

    let Some(expected) = config.gateway.auth.token.as_ref() else {
        return true;
    };

    match extract_secret(headers, query_token) {
        Some(provided) => constant_time_eq(expected.as_bytes(), provided.as_bytes()),
        None => false,
    }
}

/// `Authorization` header (optionally `Bearer `-prefixed), then
/// `X-Auth-Token`, then the `token` query parameter — first present wins.
fn extract_secret(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        return Some(value.strip_prefix("Bearer ").unwrap_or(value).to_string());
    }
    if let Some(value) = headers.get("x-auth-token").and_then(|v| v.to_str().ok()) {
        return Some(value.to_string());
    }
    query_token.map(|t| t.to_string())
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of
/// `provided` length, so an attacker cannot determine the token length from
/// response times.
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
    use crate::config::{AuthConfig, ChannelsConfig, GatewayConfig, LoggingConfig, StorageConfig};
    use std::net::Ipv4Addr;

    fn config_with_token(token: Option<&str>) -> Config {
        Config {
            channels: ChannelsConfig::default(),
            gateway: GatewayConfig {
                auth: AuthConfig {
                    token: token.map(str::to_string),
                },
            },
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn no_token_configured_always_accepts() {
        let config = config_with_token(None);
        let headers = HeaderMap::new();
        let remote: IpAddr = "203.0.113.5".parse().unwrap();
        assert!(is_authorized(&config, Some(remote), &headers, None));
    }

    #[test]
    fn loopback_peer_bypasses_token_check() {
        let config = config_with_token(Some("secret"));
        let headers = HeaderMap::new();
        let loopback: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(is_authorized(&config, Some(loopback), &headers, None));
    }

    #[test]
    fn trusted_proxy_header_bypasses_token_check() {
        let config = config_with_token(Some("secret"));
        let mut headers = HeaderMap::new();
        headers.insert(TRUSTED_PROXY_HEADER, "alice@example.com".parse().unwrap());
        let remote: IpAddr = "203.0.113.5".parse().unwrap();
        assert!(is_authorized(&config, Some(remote), &headers, None));
    }

    #[test]
    fn remote_peer_without_matching_secret_is_rejected() {
        let config = config_with_token(Some("secret"));
        let headers = HeaderMap::new();
        let remote: IpAddr = "203.0.113.5".parse().unwrap();
        assert!(!is_authorized(&config, Some(remote), &headers, None));
    }

    #[test]
    fn query_token_satisfies_remote_check() {
        let config = config_with_token(Some("secret"));
        let headers = HeaderMap::new();
        let remote: IpAddr = "203.0.113.5".parse().unwrap();
        assert!(is_authorized(&config, Some(remote), &headers, Some("secret")));
        assert!(!is_authorized(&config, Some(remote), &headers, Some("wrong")));
    }

    #[test]
    fn bearer_prefix_is_stripped_before_comparison() {
        let config = config_with_token(Some("secret"));
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer secret".parse().unwrap());
        let remote: IpAddr = "203.0.113.5".parse().unwrap();
        assert!(is_authorized(&config, Some(remote), &headers, None));
    }

    #[test]
    fn x_auth_token_header_is_accepted() {
        let config = config_with_token(Some("secret"));
        let mut headers = HeaderMap::new();
        headers.insert("x-auth-token", "secret".parse().unwrap());
        let remote: IpAddr = "203.0.113.5".parse().unwrap();
        assert!(is_authorized(&config, Some(remote), &headers, None));
    }

    #[test]
    fn constant_time_eq_rejects_mismatched_length() {
        assert!(!constant_time_eq(b"secret", b"short"));
        assert!(constant_time_eq(b"secret", b"secret"));
    }
}
