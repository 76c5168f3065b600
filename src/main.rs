#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use std::sync::Arc;

use sessiongate::{
    cache::ResponseCache,
    configure_services,
    forwarding::ForwardingEngine,
    session::{ClientOptions, SessionManager},
    settings::GatewaySettings,
    utils::auth::AccessKeys,
};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load configuration from Settings.toml and environment variables
    // This also loads .env file and initializes the logger
    let settings = GatewaySettings::load()
        .map_err(|e| std::io::Error::other(format!("Failed to load settings: {e}")))?;

    let cache = Arc::new(ResponseCache::from_settings(&settings.cache));
    let session_manager = SessionManager::from_settings(&settings, Arc::clone(&cache))
        .map_err(|e| std::io::Error::other(format!("Failed to initialize sessions: {e:#}")))?;
    let engine = ForwardingEngine::from_settings(
        &settings,
        &ClientOptions::from_settings(&settings.proxy),
    )
    .map_err(|e| std::io::Error::other(format!("Failed to initialize forwarding: {e:#}")))?;
    let access_keys = AccessKeys::from_settings(&settings.security);

    if access_keys.client.is_open() {
        log::warn!("⚠️ No client API key configured, proxied requests are not authenticated");
    }
    if settings.security.admin_key.is_empty() {
        log::warn!("⚠️ No admin key configured, operator endpoints are disabled");
    }

    start_server(settings, session_manager, engine, access_keys).await
}

/// Start the gateway server
///
/// # Errors
///
/// Returns an error if:
/// - Server binding fails
/// - Server fails to start
async fn start_server(
    settings: GatewaySettings,
    session_manager: SessionManager,
    engine: ForwardingEngine,
    access_keys: AccessKeys,
) -> std::io::Result<()> {
    let bind_address = settings.get_bind_address();
    print_startup_info(&bind_address, &settings);

    let session_manager = web::Data::new(session_manager);
    let engine = web::Data::new(engine);
    let access_keys = web::Data::new(access_keys);

    // Configure CORS for browser clients
    let cors_origins = settings.get_cors_origins();

    HttpServer::new(move || {
        let cors_origins = cors_origins.clone();
        let cors = Cors::default()
            .allowed_origin_fn(move |origin, _| {
                cors_origins
                    .iter()
                    .any(|allowed| allowed == origin.to_str().unwrap_or(""))
            })
            .allowed_methods(vec!["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"])
            .allowed_headers(vec!["Content-Type", "Accept", "X-Api-Key", "X-Admin-Key"])
            .max_age(3600);

        App::new()
            .app_data(session_manager.clone())
            .app_data(engine.clone())
            .app_data(access_keys.clone())
            .app_data(web::PayloadConfig::new(16 * 1024 * 1024))
            .wrap(cors)
            .wrap(Logger::default())
            .configure(configure_services)
    })
    .bind(&bind_address)?
    .run()
    .await
}

fn print_startup_info(bind_address: &str, settings: &GatewaySettings) {
    println!("Starting sessiongate on http://{bind_address}");
    println!("Upstream: {}", settings.proxy.upstream_url);
    println!("Cookie acquirer: {}", settings.session.acquirer);
    println!(
        "Response cache: {}",
        if settings.cache.enabled {
            format!(
                "{} entries, {}s TTL",
                settings.cache.capacity, settings.cache.ttl_seconds
            )
        } else {
            "disabled".to_string()
        }
    );
    println!();
    println!("Gateway endpoints:");
    println!("  GET  /health          - Health check");
    println!("  GET  /session-status  - Current upstream session");
    println!("  POST /refresh-session - Force a session refresh (x-admin-key)");
    println!("  POST /update-cookies  - Install cookies manually (x-admin-key)");
    println!("  POST /clear-cache     - Drop cached responses (x-api-key)");
    println!();
    println!("Proxy endpoints:");
    println!("  ALL {{any other path}}  - Forwarded to the upstream with the shared session");
}
