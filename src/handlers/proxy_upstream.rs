use actix_web::{http::StatusCode, web, HttpRequest, HttpResponse};

use crate::{
    cache::{CacheEntry, CacheKey},
    error::ProxyError,
    forwarding::{ForwardingEngine, InboundRequest},
    session::SessionManager,
    utils::auth::AccessKeys,
};

/// Catch-all handler that forwards any request to the upstream with the shared session
///
/// Idempotent fetches are answered from the response cache when possible; a
/// cache hit never touches the session, so it keeps working while the
/// session is being refreshed or is unavailable.
///
/// # Errors
///
/// Returns a `ProxyError` if:
/// - The client API key is missing or wrong
/// - No upstream session can be established
/// - The upstream is unreachable or keeps rejecting the session
pub async fn proxy_upstream(
    req: HttpRequest,
    body: web::Bytes,
    sessions: web::Data<SessionManager>,
    engine: web::Data<ForwardingEngine>,
    keys: web::Data<AccessKeys>,
) -> Result<HttpResponse, ProxyError> {
    // 1. Gate on the client key before anything else
    keys.client.verify_request(&req)?;

    let inbound = InboundRequest::from_http_request(&req, body)?;
    let target = engine.target_url(&inbound)?;
    let cache = sessions.cache();

    // 2. Serve from cache when allowed
    let cache_key = if cache.is_enabled() && inbound.is_idempotent_fetch() {
        Some(CacheKey::new(inbound.method.clone(), &target))
    } else {
        None
    };
    if let Some(entry) = cache_key.as_ref().and_then(|key| cache.lookup(key)) {
        log::debug!("📦 Cache hit for {} {}", inbound.method, inbound.path);
        return Ok(relay(entry.status, &entry.headers, entry.body));
    }

    // 3. Forward with the current session; the lease's epoch goes stale as
    //    soon as that session is replaced
    let lease = sessions.checkout().await?;
    let epoch = lease.cache_epoch;
    let response = engine.forward(&inbound, lease.client, &sessions).await?;

    // 4. Remember successful idempotent fetches
    if let Some(key) = cache_key {
        if response.is_success() {
            let entry = CacheEntry::new(
                response.status,
                response.headers.clone(),
                response.body.clone(),
            );
            if !cache.insert(key, entry, epoch) {
                log::debug!("Discarded cache insert for {} after a flush", inbound.path);
            }
        }
    }

    Ok(relay(response.status, &response.headers, response.body))
}

/// Build the client response from already sanitized upstream parts
fn relay(status: u16, headers: &[(String, String)], body: web::Bytes) -> HttpResponse {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = HttpResponse::build(status);
    for (name, value) in headers {
        builder.append_header((name.as_str(), value.as_str()));
    }
    builder.body(body)
}
