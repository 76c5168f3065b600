//! Errors surfaced to gateway clients

use actix_web::{http::StatusCode, HttpResponse, ResponseError};

use crate::utils::responses::ResponseBuilder;

/// Every failure a client can observe
///
/// Messages are safe to return to clients: they never carry cookie values,
/// upstream `Set-Cookie` headers or credentials.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    /// Connect error or timeout talking to the upstream, after the fallback retry
    #[error("{0}")]
    Transport(String),
    /// No session could be acquired and no usable fallback cookie file exists
    #[error("{0}")]
    SessionUnavailable(String),
    /// The upstream still rejects the session after a forced refresh
    #[error("{0}")]
    SessionRejected(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    /// Machine-readable error kind returned in the `error` field
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport_error",
            Self::SessionUnavailable(_) | Self::SessionRejected(_) => "session_unavailable",
            Self::BadRequest(_) => "invalid_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Internal(_) => "server_error",
        }
    }
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::SessionUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::SessionRejected(_) | Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        ResponseBuilder::error(self.status_code())
            .with_error_code(self.kind())
            .with_message(&self.to_string())
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_error_body_shape() {
        let error = ProxyError::SessionRejected("upstream rejected the refreshed session".into());
        let response = error.error_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "session_unavailable");
        assert_eq!(json["message"], "upstream rejected the refreshed session");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::Transport("down".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::SessionUnavailable("none".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ProxyError::Transport("down".into()).kind(), "transport_error");
        assert_eq!(
            ProxyError::Unauthorized("missing key".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
    }
}
