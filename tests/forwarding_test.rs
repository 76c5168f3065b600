// Forwarding against a real local upstream over HTTP
use actix_web::{http::StatusCode, test, web, App, HttpRequest, HttpResponse, HttpServer};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tempfile::TempDir;

use sessiongate::{
    cache::ResponseCache,
    configure_services,
    forwarding::ForwardingEngine,
    session::{ClientOptions, SessionManager},
    settings::GatewaySettings,
    testing::{constants::TEST_API_KEY, TestFixtures},
    utils::auth::{AccessKeys, API_KEY_HEADER},
};

// ===============================
// FAKE UPSTREAM
// ===============================

async fn echo(req: HttpRequest, body: web::Bytes) -> HttpResponse {
    let headers: Map<String, Value> = req
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                Value::String(value.to_str().unwrap_or_default().to_string()),
            )
        })
        .collect();

    HttpResponse::Ok()
        .insert_header(("set-cookie", "upstream_sid=rotated; Path=/; HttpOnly"))
        .insert_header(("x-upstream", "echo"))
        .json(json!({
            "method": req.method().as_str(),
            "path": req.path(),
            "query": req.query_string(),
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
        }))
}

async fn relative_redirect() -> HttpResponse {
    HttpResponse::Found()
        .insert_header(("location", "/login?next=%2Fsecure"))
        .finish()
}

async fn absolute_redirect(req: HttpRequest) -> HttpResponse {
    let host = req.connection_info().host().to_string();
    HttpResponse::Found()
        .insert_header(("location", format!("http://{host}/login")))
        .finish()
}

async fn page(req: HttpRequest) -> HttpResponse {
    let host = req.connection_info().host().to_string();
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(format!(
            r#"<a href="http://{host}/next">next</a><img src="//{host}/logo.png"><a href="https://elsewhere.test/">x</a>"#
        ))
}

/// Start the fake upstream on an ephemeral port and return its base URL
fn start_upstream() -> String {
    let server = HttpServer::new(|| {
        App::new()
            .route("/redirect", web::get().to(relative_redirect))
            .route("/absolute-redirect", web::get().to(absolute_redirect))
            .route("/page", web::get().to(page))
            .default_service(web::to(echo))
    })
    .workers(1)
    .disable_signals()
    .bind(("127.0.0.1", 0))
    .unwrap();
    let addr = server.addrs()[0];
    actix_web::rt::spawn(server.run());
    format!("http://{addr}/")
}

// ===============================
// GATEWAY WIRING
// ===============================

struct Gateway {
    _dir: TempDir,
    sessions: web::Data<SessionManager>,
    engine: web::Data<ForwardingEngine>,
    keys: web::Data<AccessKeys>,
}

fn gateway_settings(upstream: &str, dir: &TempDir) -> GatewaySettings {
    let mut settings = TestFixtures::settings_for_upstream(upstream);
    settings.session.acquirer = "manual".to_string();
    settings.session.cookie_string = "sid=local-session; theme=dark".to_string();
    settings.session.cookie_file = dir
        .path()
        .join("session_cookies.json")
        .display()
        .to_string();
    settings
}

fn gateway(settings: &GatewaySettings, dir: TempDir) -> Gateway {
    let cache = Arc::new(ResponseCache::from_settings(&settings.cache));
    let sessions = SessionManager::from_settings(settings, cache).unwrap();
    let engine =
        ForwardingEngine::from_settings(settings, &ClientOptions::from_settings(&settings.proxy))
            .unwrap();

    Gateway {
        _dir: dir,
        sessions: web::Data::new(sessions),
        engine: web::Data::new(engine),
        keys: web::Data::new(AccessKeys::from_settings(&settings.security)),
    }
}

macro_rules! init_app {
    ($gateway:expr) => {
        test::init_service(
            App::new()
                .app_data($gateway.sessions.clone())
                .app_data($gateway.engine.clone())
                .app_data($gateway.keys.clone())
                .configure(configure_services),
        )
        .await
    };
}

// ===============================
// TESTS
// ===============================

#[actix_web::test]
async fn test_forwarded_request_carries_session_and_sanitized_headers() {
    let upstream = start_upstream();
    let dir = tempfile::tempdir().unwrap();
    let gateway = gateway(&gateway_settings(&upstream, &dir), dir);
    let app = init_app!(gateway);

    let req = test::TestRequest::get()
        .uri("/api/search?q=rust%20lang&tags=a&tags=b")
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .insert_header(("host", "gateway.example"))
        .insert_header(("accept", "application/json"))
        .insert_header(("cookie", "client_cookie=must-not-leak"))
        .insert_header(("x-forwarded-for", "198.51.100.4"))
        .insert_header(("x-real-ip", "198.51.100.4"))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get("set-cookie").is_none());
    assert_eq!(resp.headers().get("x-upstream").unwrap(), "echo");

    let echoed: Value = test::read_body_json(resp).await;
    assert_eq!(echoed["method"], "GET");
    assert_eq!(echoed["path"], "/api/search");
    assert_eq!(echoed["query"], "q=rust%20lang&tags=a&tags=b");

    let headers = &echoed["headers"];
    assert_eq!(headers["cookie"], "sid=local-session; theme=dark");
    assert_eq!(headers["accept"], "application/json");
    assert!(headers.get("x-forwarded-for").is_none());
    assert!(headers.get("x-real-ip").is_none());
    assert!(headers.get(API_KEY_HEADER).is_none());
    assert_ne!(headers["host"], "gateway.example");
    assert!(headers["user-agent"]
        .as_str()
        .unwrap()
        .starts_with("sessiongate/"));
}

#[actix_web::test]
async fn test_post_body_is_forwarded() {
    let upstream = start_upstream();
    let dir = tempfile::tempdir().unwrap();
    let gateway = gateway(&gateway_settings(&upstream, &dir), dir);
    let app = init_app!(gateway);

    let req = test::TestRequest::post()
        .uri("/api/items")
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .insert_header(("content-type", "application/json"))
        .set_payload(r#"{"name":"widget"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let echoed: Value = test::read_body_json(resp).await;
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["body"], r#"{"name":"widget"}"#);
    assert_eq!(echoed["headers"]["content-type"], "application/json");
}

#[actix_web::test]
async fn test_redirects_are_returned_not_followed() {
    let upstream = start_upstream();
    let dir = tempfile::tempdir().unwrap();
    let gateway = gateway(&gateway_settings(&upstream, &dir), dir);
    let app = init_app!(gateway);

    let req = test::TestRequest::get()
        .uri("/redirect")
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(
        resp.headers().get("location").unwrap(),
        "/login?next=%2Fsecure"
    );
}

#[actix_web::test]
async fn test_links_and_location_rewritten_to_public_base() {
    let upstream = start_upstream();
    let dir = tempfile::tempdir().unwrap();
    let mut settings = gateway_settings(&upstream, &dir);
    settings.proxy.rewrite_html = true;
    settings.application.public_base_url = "https://gateway.example".to_string();
    let gateway = gateway(&settings, dir);
    let app = init_app!(gateway);

    let req = test::TestRequest::get()
        .uri("/absolute-redirect")
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(
        resp.headers().get("location").unwrap(),
        "https://gateway.example/login"
    );

    let req = test::TestRequest::get()
        .uri("/page")
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let html = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
    assert!(html.contains(r#"href="https://gateway.example/next""#));
    assert!(html.contains(r#"src="https://gateway.example/logo.png""#));
    assert!(html.contains(r#"href="https://elsewhere.test/""#));
}

#[actix_web::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let dir = tempfile::tempdir().unwrap();
    // Nothing listens on port 1
    let gateway = gateway(&gateway_settings("http://127.0.0.1:1/", &dir), dir);
    let app = init_app!(gateway);

    let req = test::TestRequest::get()
        .uri("/anything")
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "transport_error");
    // The session itself is still fine
    assert!(gateway.sessions.has_session().await);
}
