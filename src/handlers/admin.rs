//! Operator endpoints: session inspection, forced refresh, manual cookies and cache flush

use actix_web::{web, HttpRequest, HttpResponse};

use crate::{
    error::ProxyError,
    forwarding::ForwardingEngine,
    models::{ActionResponse, ClearCacheResponse, UpdateCookiesRequest},
    session::SessionManager,
    utils::{auth::AccessKeys, responses::ResponseBuilder},
};

/// Report the current session without side effects
pub async fn session_status(sessions: web::Data<SessionManager>) -> HttpResponse {
    ResponseBuilder::ok().json(&sessions.status().await)
}

/// Invalidate the current session and acquire a new one
///
/// # Errors
///
/// Returns `ProxyError::Unauthorized` for a bad admin key and
/// `ProxyError::SessionUnavailable` if the refresh fails
pub async fn refresh_session(
    req: HttpRequest,
    sessions: web::Data<SessionManager>,
    keys: web::Data<AccessKeys>,
) -> Result<HttpResponse, ProxyError> {
    keys.admin.verify_request(&req)?;

    log::info!("🔄 Session refresh requested by operator");
    sessions.force_refresh().await?;

    Ok(ResponseBuilder::ok().json(&ActionResponse {
        success: true,
        message: "Session refreshed".to_string(),
        session: Some(sessions.status().await),
    }))
}

/// Persist and install operator-supplied cookies
///
/// # Errors
///
/// Returns `ProxyError::Unauthorized` for a bad admin key and
/// `ProxyError::BadRequest` if the body holds no usable cookies
pub async fn update_cookies(
    req: HttpRequest,
    body: web::Bytes,
    sessions: web::Data<SessionManager>,
    engine: web::Data<ForwardingEngine>,
    keys: web::Data<AccessKeys>,
) -> Result<HttpResponse, ProxyError> {
    keys.admin.verify_request(&req)?;

    let request: UpdateCookiesRequest = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::BadRequest(format!("Invalid request body: {e}")))?;
    let domain = engine.upstream().host_str().unwrap_or_default();
    let cookies = request
        .into_cookie_set(domain)
        .map_err(|e| ProxyError::BadRequest(e.to_string()))?;

    let count = cookies.len();
    let status = sessions.update_cookies(cookies).await?;

    Ok(ResponseBuilder::ok().json(&ActionResponse {
        success: true,
        message: format!("Installed {count} cookies"),
        session: Some(status),
    }))
}

/// Drop every cached response
///
/// # Errors
///
/// Returns `ProxyError::Unauthorized` if the client key is missing or wrong
pub async fn clear_cache(
    req: HttpRequest,
    sessions: web::Data<SessionManager>,
    keys: web::Data<AccessKeys>,
) -> Result<HttpResponse, ProxyError> {
    keys.client.verify_request(&req)?;

    let cleared = sessions.cache().clear();
    log::info!("🧹 Cleared {cleared} cached responses on request");

    Ok(ResponseBuilder::ok().json(&ClearCacheResponse {
        success: true,
        cleared,
    }))
}
