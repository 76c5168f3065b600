use actix_web::{web, HttpResponse, Result};

use crate::models::HealthResponse;
use crate::session::SessionManager;

/// Health check endpoint
///
/// Never triggers a refresh; only reports whether a session is loaded.
///
/// # Errors
///
/// This function currently never returns an error, but uses Result for consistency
pub async fn health(sessions: web::Data<SessionManager>) -> Result<HttpResponse> {
    let response = HealthResponse {
        status: "ok".to_string(),
        message: "Session gateway is running".to_string(),
        session_loaded: sessions.has_session().await,
    };
    Ok(HttpResponse::Ok().json(response))
}
