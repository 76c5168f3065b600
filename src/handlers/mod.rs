// HTTP request handlers for the session gateway
pub mod admin;
pub mod health;
pub mod proxy_upstream;

use actix_web::{guard, web};

// Re-export the main handler functions
pub use admin::{clear_cache, refresh_session, session_status, update_cookies};
pub use health::health;
pub use proxy_upstream::proxy_upstream;

/// Paths served by the gateway itself and never forwarded upstream
pub const GATEWAY_PATHS: [&str; 5] = [
    "/health",
    "/session-status",
    "/refresh-session",
    "/update-cookies",
    "/clear-cache",
];

#[must_use]
pub fn is_gateway_path(path: &str) -> bool {
    GATEWAY_PATHS.contains(&path)
}

/// Register every route on an actix `App`
pub fn configure_services(cfg: &mut web::ServiceConfig) {
    cfg
        // Operator endpoints
        .route("/session-status", web::get().to(session_status))
        .route("/refresh-session", web::post().to(refresh_session))
        .route("/update-cookies", web::post().to(update_cookies))
        .route("/clear-cache", web::post().to(clear_cache))
        // Health endpoint
        .route("/health", web::get().to(health))
        // Catch-all proxy for any other path
        .default_service(
            web::route()
                .guard(guard::fn_guard(|ctx| !is_gateway_path(ctx.head().uri.path())))
                .to(proxy_upstream),
        );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_paths_are_exact() {
        assert!(is_gateway_path("/health"));
        assert!(is_gateway_path("/clear-cache"));
        assert!(!is_gateway_path("/health/deep"));
        assert!(!is_gateway_path("/api/health"));
        assert!(!is_gateway_path("/"));
    }
}
