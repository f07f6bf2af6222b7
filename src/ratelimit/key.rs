//! Limiting key derivation.

use std::fmt;
use std::net::IpAddr;

/// The subject a quota is counted against.
///
/// Authenticated callers are keyed by principal so that users behind a
/// shared address are not pooled together; everyone else is keyed by
/// client address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LimitingKey {
    Principal(String),
    Ip(String),
}

impl LimitingKey {
    /// Derive the key for a request.
    ///
    /// `forwarded_for` (an `X-Forwarded-For` value) is consulted only when
    /// the direct peer is `trusted_proxy`. The right-most hop is used: it was
    /// appended by the trusted proxy, while anything left of it is
    /// client-controlled.
    pub fn derive(
        principal: Option<&str>,
        peer: &str,
        forwarded_for: Option<&str>,
        trusted_proxy: Option<IpAddr>,
    ) -> Self {
        if let Some(id) = principal.map(str::trim).filter(|id| !id.is_empty()) {
            return LimitingKey::Principal(id.to_string());
        }

        let peer = peer.trim();
        let from_trusted_proxy = trusted_proxy
            .is_some_and(|proxy| peer.parse::<IpAddr>().is_ok_and(|addr| addr == proxy));

        if from_trusted_proxy {
            let forwarded = forwarded_for
                .and_then(|header| header.rsplit(',').next())
                .map(str::trim)
                .and_then(|hop| hop.parse::<IpAddr>().ok());
            if let Some(client) = forwarded {
                return LimitingKey::Ip(client.to_string());
            }
        }

        let peer = if peer.is_empty() { "unknown" } else { peer };
        LimitingKey::Ip(peer.to_string())
    }

    /// Store key for this subject under `policy`.
    pub fn scoped(&self, prefix: &str, policy: &str) -> String {
        format!("{prefix}{policy}|{self}")
    }
}

impl fmt::Display for LimitingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitingKey::Principal(id) => write!(f, "principal:{id}"),
            LimitingKey::Ip(addr) => write!(f, "ip:{addr}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> Option<IpAddr> {
        Some("10.0.0.1".parse().unwrap())
    }

    #[test]
    fn test_principal_wins_over_address() {
        let key = LimitingKey::derive(Some("42"), "203.0.113.9", None, None);
        assert_eq!(key.to_string(), "principal:42");
    }

    #[test]
    fn test_blank_principal_falls_back_to_ip() {
        let key = LimitingKey::derive(Some("  "), "203.0.113.9", None, None);
        assert_eq!(key.to_string(), "ip:203.0.113.9");
    }

    #[test]
    fn test_forwarded_header_ignored_without_trusted_proxy() {
        let key = LimitingKey::derive(None, "203.0.113.9", Some("1.2.3.4"), None);
        assert_eq!(key, LimitingKey::Ip("203.0.113.9".to_string()));
    }

    #[test]
    fn test_forwarded_header_ignored_from_untrusted_peer() {
        let key = LimitingKey::derive(None, "203.0.113.9", Some("1.2.3.4"), proxy());
        assert_eq!(key.to_string(), "ip:203.0.113.9");
    }

    #[test]
    fn test_trusted_proxy_uses_rightmost_hop() {
        // The client spoofed 6.6.6.6; the proxy appended the real address.
        let key = LimitingKey::derive(None, "10.0.0.1", Some("6.6.6.6, 198.51.100.7"), proxy());
        assert_eq!(key.to_string(), "ip:198.51.100.7");
    }

    #[test]
    fn test_trusted_proxy_with_garbage_header_uses_peer() {
        let key = LimitingKey::derive(None, "10.0.0.1", Some("not-an-ip"), proxy());
        assert_eq!(key.to_string(), "ip:10.0.0.1");
    }

    #[test]
    fn test_missing_peer() {
        let key = LimitingKey::derive(None, "", None, None);
        assert_eq!(key.to_string(), "ip:unknown");
    }

    #[test]
    fn test_scoped_store_key() {
        let key = LimitingKey::Principal("7".to_string());
        assert_eq!(
            key.scoped("rate_limit:", "/api/v1/auth/login"),
            "rate_limit:/api/v1/auth/login|principal:7"
        );
    }
}
