//! HTTP response helpers
//!
//! Every JSON error the gateway produces has the shape
//! `{"error": kind, "message": text}`. Handlers and `ProxyError` both go
//! through [`ResponseBuilder`] so the shape stays uniform.

use actix_web::{http::header, http::StatusCode, HttpResponse};
use serde_json::json;
use url::Url;

/// Entry point for building gateway responses
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Error response with an arbitrary status code
    #[must_use]
    pub fn error(status: StatusCode) -> ErrorResponseBuilder {
        ErrorResponseBuilder::new(status)
    }

    /// Create an OK response (200) with JSON content
    #[must_use]
    pub fn ok() -> JsonResponseBuilder {
        JsonResponseBuilder::new(StatusCode::OK)
    }
}

// ===============================
// BUILDER TYPES
// ===============================

/// Builder for error responses with fluent interface
pub struct ErrorResponseBuilder {
    status: StatusCode,
    error_code: Option<String>,
    message: Option<String>,
}

/// Builder for JSON responses
pub struct JsonResponseBuilder {
    status: StatusCode,
}

impl ErrorResponseBuilder {
    fn new(status: StatusCode) -> Self {
        Self {
            status,
            error_code: None,
            message: None,
        }
    }

    /// Set the machine-readable error kind (e.g. "`session_unavailable`")
    #[must_use]
    pub fn with_error_code(mut self, code: &str) -> Self {
        self.error_code = Some(code.to_string());
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }

    /// Build the final `HttpResponse`
    #[must_use]
    pub fn build(self) -> HttpResponse {
        let error_code = self
            .error_code
            .unwrap_or_else(|| default_error_code(self.status).to_string());
        let message = self.message.unwrap_or_else(|| {
            self.status
                .canonical_reason()
                .unwrap_or("Request failed")
                .to_string()
        });

        HttpResponse::build(self.status)
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .json(json!({ "error": error_code, "message": message }))
    }
}

fn default_error_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "invalid_request",
        StatusCode::UNAUTHORIZED => "unauthorized",
        StatusCode::BAD_GATEWAY => "transport_error",
        StatusCode::SERVICE_UNAVAILABLE => "session_unavailable",
        _ => "server_error",
    }
}

impl JsonResponseBuilder {
    fn new(status: StatusCode) -> Self {
        Self { status }
    }

    /// Build the response with JSON content
    #[must_use]
    pub fn json<T: serde::Serialize>(self, data: &T) -> HttpResponse {
        HttpResponse::build(self.status).json(data)
    }
}

// ===============================
// UTILITY FUNCTIONS
// ===============================

/// Helper function to check for hop-by-hop headers
#[must_use]
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Convert an actix request method to the method type used by reqwest
///
/// # Errors
///
/// Returns an error if the method name is not a valid HTTP token
pub fn convert_http_method(
    method: &actix_web::http::Method,
) -> Result<reqwest::Method, crate::error::ProxyError> {
    reqwest::Method::from_bytes(method.as_str().as_bytes()).map_err(|_| {
        crate::error::ProxyError::BadRequest(format!("unsupported HTTP method {method}"))
    })
}

/// Build the upstream URL from the base, the request path and the raw query string
///
/// The request path is always appended to the base path, so it can never
/// switch scheme or host, nor climb above the base path with `..` segments.
/// The query is appended verbatim. An empty path maps to `root_path`.
///
/// # Errors
///
/// Returns `ProxyError::BadRequest` if the resulting URL falls outside the base
pub fn build_upstream_url(
    base: &Url,
    request_path: &str,
    query: Option<&str>,
    root_path: &str,
) -> Result<Url, crate::error::ProxyError> {
    use log::{debug, warn};

    let path = if request_path.trim_start_matches('/').is_empty() {
        root_path
    } else {
        request_path
    };

    let base_path = base.path().trim_end_matches('/');
    let scope = format!("{base_path}/");

    let mut url = base.clone();
    url.set_path(&format!("{scope}{}", path.trim_start_matches('/')));
    url.set_fragment(None);

    if url.origin() != base.origin() || !url.path().starts_with(&scope) {
        warn!("Rejected request path '{path}' escaping upstream base '{base}'");
        return Err(crate::error::ProxyError::BadRequest(
            "Request path resolves outside the upstream".to_string(),
        ));
    }
    url.set_query(query.filter(|q| !q.is_empty()));

    debug!("Built upstream URL: {url}");
    Ok(url)
}
