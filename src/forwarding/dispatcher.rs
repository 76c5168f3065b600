//! Upstream transports
//!
//! A [`Dispatcher`] sends one sanitized [`UpstreamRequest`] on behalf of an
//! [`AuthenticatedClient`] and buffers the response. The fast path reuses the
//! client's pooled connections; the slow path opens a fresh connection, looks
//! like a browser navigation and allows twice the timeout.

use async_trait::async_trait;
use reqwest::{header, Client};
use std::time::Duration;

use super::{UpstreamRequest, UpstreamResponse};
use crate::session::{AuthenticatedClient, ClientOptions};
use crate::utils::headers::find_header;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36";
const DOCUMENT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,\
     image/avif,image/webp,image/apng,*/*;q=0.8";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("upstream request timed out")]
    Timeout,
    #[error("could not connect to upstream: {0}")]
    Connect(String),
    #[error("upstream request failed: {0}")]
    Other(String),
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.without_url().to_string())
        } else {
            Self::Other(err.without_url().to_string())
        }
    }
}

/// Sends one upstream request
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Send `request` with the session of `client` and buffer the response
    ///
    /// # Errors
    ///
    /// Returns a `DispatchError` on connect failures, timeouts or body read errors
    async fn dispatch(
        &self,
        client: &AuthenticatedClient,
        request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, DispatchError>;

    /// Short identifier used in logs
    fn name(&self) -> &'static str;
}

/// Send with `http`, attaching the session cookie header for the target URL
async fn send(
    http: &Client,
    client: &AuthenticatedClient,
    request: &UpstreamRequest,
    headers: &[(String, String)],
    timeout: Option<Duration>,
) -> Result<UpstreamResponse, DispatchError> {
    let mut builder = http.request(request.method.clone(), request.url.clone());
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(cookie_header) = client.cookie_header(&request.url) {
        builder = builder.header(header::COOKIE, cookie_header);
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = response.bytes().await?;

    Ok(UpstreamResponse {
        status,
        headers,
        body,
    })
}

// ===============================
// FAST PATH
// ===============================

/// Uses the pooled client owned by the current session
#[derive(Debug, Clone, Default)]
pub struct FastDispatcher;

#[async_trait]
impl Dispatcher for FastDispatcher {
    async fn dispatch(
        &self,
        client: &AuthenticatedClient,
        request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, DispatchError> {
        send(client.http(), client, request, &request.headers, None).await
    }

    fn name(&self) -> &'static str {
        "fast"
    }
}

// ===============================
// SLOW PATH
// ===============================

/// Fresh connection per request with a browser navigation header profile
#[derive(Debug, Clone)]
pub struct SlowDispatcher {
    http: Client,
    timeout: Duration,
}

impl SlowDispatcher {
    /// Build the fallback transport with twice the configured timeout
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed
    pub fn new(options: &ClientOptions) -> reqwest::Result<Self> {
        let timeout = options.timeout.saturating_mul(2);
        Ok(Self {
            http: options.build_unpooled(timeout)?,
            timeout,
        })
    }

    /// Apply the browser profile on top of the sanitized headers
    #[must_use]
    pub fn browser_headers(request: &UpstreamRequest) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = request
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("user-agent"))
            .cloned()
            .collect();
        headers.push(("user-agent".to_string(), BROWSER_USER_AGENT.to_string()));

        let accept = accept_for_path(request.url.path());
        let origin = request.url.origin().ascii_serialization();
        let defaults = [
            ("accept", accept),
            ("accept-language", "en-US,en;q=0.9"),
            ("cache-control", "no-cache"),
            ("pragma", "no-cache"),
            ("sec-fetch-site", "same-origin"),
            ("sec-fetch-mode", "navigate"),
            ("sec-fetch-dest", "document"),
            ("upgrade-insecure-requests", "1"),
            ("referer", origin.as_str()),
        ];
        for (name, value) in defaults {
            if find_header(&headers, name).is_none() {
                headers.push((name.to_string(), value.to_string()));
            }
        }
        headers
    }
}

fn accept_for_path(path: &str) -> &'static str {
    let path = path.to_ascii_lowercase();
    let is_image = [".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".webp"]
        .iter()
        .any(|ext| path.ends_with(ext));
    if path.ends_with(".css") {
        "text/css,*/*;q=0.1"
    } else if path.ends_with(".js") {
        "*/*"
    } else if is_image {
        "image/avif,image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8"
    } else {
        DOCUMENT_ACCEPT
    }
}

#[async_trait]
impl Dispatcher for SlowDispatcher {
    async fn dispatch(
        &self,
        client: &AuthenticatedClient,
        request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, DispatchError> {
        let headers = Self::browser_headers(request);
        send(&self.http, client, request, &headers, Some(self.timeout)).await
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;
    use url::Url;

    fn request(path: &str, headers: &[(&str, &str)]) -> UpstreamRequest {
        UpstreamRequest {
            method: Method::GET,
            url: Url::parse("https://app.example.com").unwrap().join(path).unwrap(),
            headers: headers
                .iter()
                .map(|(n, v)| ((*n).to_string(), (*v).to_string()))
                .collect(),
            body: None,
        }
    }

    #[test]
    fn test_browser_profile_keeps_client_accept() {
        let headers = SlowDispatcher::browser_headers(&request(
            "/api/data",
            &[("accept", "application/json"), ("user-agent", "sessiongate/test")],
        ));
        assert_eq!(find_header(&headers, "accept"), Some("application/json"));
        assert_eq!(find_header(&headers, "user-agent"), Some(BROWSER_USER_AGENT));
        assert_eq!(find_header(&headers, "referer"), Some("https://app.example.com"));
        assert_eq!(
            headers
                .iter()
                .filter(|(n, _)| n.eq_ignore_ascii_case("user-agent"))
                .count(),
            1
        );
    }

    #[test]
    fn test_accept_by_extension() {
        let headers = SlowDispatcher::browser_headers(&request("/static/site.css", &[]));
        assert_eq!(find_header(&headers, "accept"), Some("text/css,*/*;q=0.1"));
        assert_eq!(accept_for_path("/logo.PNG"), accept_for_path("/logo.png"));
        assert_eq!(accept_for_path("/dashboard"), DOCUMENT_ACCEPT);
    }

    #[test]
    fn test_slow_timeout_is_doubled() {
        let options = ClientOptions {
            timeout: Duration::from_secs(15),
            follow_redirects: false,
        };
        let dispatcher = SlowDispatcher::new(&options).unwrap();
        assert_eq!(dispatcher.timeout, Duration::from_secs(30));
    }
}
