//! Header sanitization shared by every forwarding path
//!
//! Headers travel through the gateway as `(name, value)` pairs so the same
//! policy applies regardless of which dispatcher sends the request.

use std::collections::HashSet;

use super::responses::is_hop_by_hop_header;

/// Request headers that are never forwarded upstream
const BLOCKED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "cookie",
    "authorization",
    "content-length",
    "forwarded",
    "x-real-ip",
    "x-api-key",
    "x-admin-key",
    // Bodies are inspected for challenge markers, so ask for identity encoding
    "accept-encoding",
];

/// Response headers that are never relayed to clients
const BLOCKED_RESPONSE_HEADERS: &[&str] = &["set-cookie", "set-cookie2", "content-length"];

// ===============================
// HEADER POLICY
// ===============================

/// Block-list driven header sanitizer
#[derive(Debug, Clone)]
pub struct HeaderPolicy {
    extra_blocked: HashSet<String>,
    user_agent: String,
}

impl HeaderPolicy {
    /// Policy used by the forwarding engine
    #[must_use]
    pub fn for_proxy(user_agent: &str, extra_blocked: &[String]) -> Self {
        Self {
            extra_blocked: extra_blocked
                .iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            user_agent: user_agent.to_string(),
        }
    }

    /// Check if an inbound header must be dropped before forwarding
    #[must_use]
    pub fn should_skip_request_header(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        is_hop_by_hop_header(&name)
            || BLOCKED_REQUEST_HEADERS.contains(&name.as_str())
            || name.starts_with("x-forwarded-")
            || self.extra_blocked.contains(&name)
    }

    /// Check if an upstream header must be dropped before relaying
    #[must_use]
    pub fn should_skip_response_header(name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        is_hop_by_hop_header(&name) || BLOCKED_RESPONSE_HEADERS.contains(&name.as_str())
    }

    /// Sanitize inbound headers and inject the configured User-Agent if absent
    #[must_use]
    pub fn sanitize_request(&self, headers: &[(String, String)]) -> Vec<(String, String)> {
        let mut sanitized: Vec<(String, String)> = headers
            .iter()
            .filter(|(name, _)| !self.should_skip_request_header(name))
            .cloned()
            .collect();

        let has_user_agent = sanitized
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("user-agent"));
        if !has_user_agent && !self.user_agent.is_empty() {
            sanitized.push(("user-agent".to_string(), self.user_agent.clone()));
        }
        sanitized
    }

    /// Sanitize upstream response headers
    #[must_use]
    pub fn sanitize_response(&self, headers: &[(String, String)]) -> Vec<(String, String)> {
        headers
            .iter()
            .filter(|(name, _)| !Self::should_skip_response_header(name))
            .cloned()
            .collect()
    }
}

/// Case-insensitive header lookup
#[must_use]
pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(n, v)| ((*n).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_request_sanitization() {
        let policy = HeaderPolicy::for_proxy("sessiongate/test", &[]);
        let headers = pairs(&[
            ("Host", "gateway.internal"),
            ("Cookie", "client=1"),
            ("X-Forwarded-For", "10.0.0.1"),
            ("X-Real-IP", "10.0.0.1"),
            ("Accept", "application/json"),
            ("Authorization", "Bearer client-token"),
            ("x-api-key", "secret"),
            ("Connection", "keep-alive"),
            ("Content-Length", "12"),
        ]);

        let sanitized = policy.sanitize_request(&headers);
        assert_eq!(find_header(&sanitized, "accept"), Some("application/json"));
        assert_eq!(find_header(&sanitized, "user-agent"), Some("sessiongate/test"));
        for dropped in [
            "host",
            "cookie",
            "x-forwarded-for",
            "x-real-ip",
            "authorization",
            "x-api-key",
            "connection",
            "content-length",
        ] {
            assert!(find_header(&sanitized, dropped).is_none(), "{dropped} leaked");
        }
    }

    #[test]
    fn test_client_user_agent_is_kept() {
        let policy = HeaderPolicy::for_proxy("sessiongate/test", &[]);
        let sanitized = policy.sanitize_request(&pairs(&[("User-Agent", "curl/8.0")]));
        assert_eq!(sanitized.len(), 1);
        assert_eq!(find_header(&sanitized, "user-agent"), Some("curl/8.0"));
    }

    #[test]
    fn test_extra_blocked_headers() {
        let policy = HeaderPolicy::for_proxy("", &["X-Tenant".to_string()]);
        let sanitized = policy.sanitize_request(&pairs(&[("x-tenant", "a"), ("accept", "*/*")]));
        assert_eq!(sanitized, pairs(&[("accept", "*/*")]));
    }

    #[test]
    fn test_response_sanitization() {
        let policy = HeaderPolicy::for_proxy("", &[]);
        let headers = pairs(&[
            ("Set-Cookie", "sid=upstream; HttpOnly"),
            ("set-cookie", "other=1"),
            ("Content-Length", "100"),
            ("Transfer-Encoding", "chunked"),
            ("Content-Type", "text/html"),
            ("Location", "/next"),
        ]);
        let sanitized = policy.sanitize_response(&headers);
        assert_eq!(
            sanitized,
            pairs(&[("Content-Type", "text/html"), ("Location", "/next")])
        );
    }
}
