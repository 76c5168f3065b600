//! Authenticated forwarding
//!
//! # Modules
//!
//! - [`dispatcher`] - transports that send one upstream request
//! - [`classifier`] - failure taxonomy and retry policy
//! - [`rewrite`] - optional HTML link rewriting
//! - [`engine`] - request building, sanitization and the retry state machine

pub mod classifier;
pub mod dispatcher;
pub mod engine;
pub mod rewrite;

use actix_web::{web::Bytes, HttpRequest};
use reqwest::Method;
use url::Url;

use crate::error::ProxyError;
use crate::utils::headers::find_header;
use crate::utils::responses::convert_http_method;

pub use classifier::{ErrorClassifier, FailureKind, RetryAction};
pub use dispatcher::{DispatchError, Dispatcher, FastDispatcher, SlowDispatcher};
pub use engine::ForwardingEngine;
pub use rewrite::LinkRewriter;

/// One inbound client request, detached from the HTTP framework
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    /// Raw query string, forwarded verbatim
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl InboundRequest {
    /// Capture an actix request; headers with non-UTF-8 values are dropped
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` if the method cannot be represented
    pub fn from_http_request(req: &HttpRequest, body: Bytes) -> Result<Self, ProxyError> {
        let headers = req
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let query = req.query_string();

        Ok(Self {
            method: convert_http_method(req.method())?,
            path: req.path().to_string(),
            query: (!query.is_empty()).then(|| query.to_string()),
            headers,
            body: (!body.is_empty()).then_some(body),
        })
    }

    #[must_use]
    pub fn is_idempotent_fetch(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }
}

/// The request actually sent upstream, headers already sanitized
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

/// A fully buffered upstream response
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl UpstreamResponse {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn is_html(&self) -> bool {
        self.content_type()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"))
    }

    /// Whether the body is text worth inspecting; an unlabelled body counts as text
    #[must_use]
    pub fn is_textual(&self) -> bool {
        self.content_type().map_or(true, |ct| {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("text/")
                || ct.contains("json")
                || ct.contains("xml")
                || ct.contains("javascript")
        })
    }
}
