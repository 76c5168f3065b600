//! Forwarding engine
//!
//! Turns one [`InboundRequest`] into one upstream request, with at most one
//! retry: either a fallback-dispatcher retry after a transport failure or a
//! refresh-and-retry after the upstream rejected the session.

use actix_web::web::Bytes;
use std::sync::Arc;
use url::Url;

use super::classifier::{ErrorClassifier, FailureKind, RetryAction};
use super::dispatcher::{DispatchError, Dispatcher, FastDispatcher, SlowDispatcher};
use super::rewrite::LinkRewriter;
use super::{InboundRequest, UpstreamRequest, UpstreamResponse};
use crate::error::ProxyError;
use crate::session::{AuthenticatedClient, ClientOptions, SessionManager};
use crate::settings::GatewaySettings;
use crate::utils::headers::HeaderPolicy;
use crate::utils::responses::build_upstream_url;

/// Result of inspecting one attempt
enum Step {
    Deliver(UpstreamResponse),
    Retry(RetryAction),
}

pub struct ForwardingEngine {
    upstream: Url,
    root_path: String,
    policy: HeaderPolicy,
    classifier: ErrorClassifier,
    primary: Arc<dyn Dispatcher>,
    fallback: Option<Arc<dyn Dispatcher>>,
    rewriter: Option<LinkRewriter>,
}

impl ForwardingEngine {
    /// Engine with the fast dispatcher, default policy and no fallback
    #[must_use]
    pub fn new(upstream: Url) -> Self {
        Self {
            upstream,
            root_path: "/".to_string(),
            policy: HeaderPolicy::for_proxy(&format!("sessiongate/{}", crate::VERSION), &[]),
            classifier: ErrorClassifier::default(),
            primary: Arc::new(FastDispatcher),
            fallback: None,
            rewriter: None,
        }
    }

    /// Build the engine described by the settings
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream URL is invalid, the fallback client
    /// cannot be built or the link rewriter cannot be compiled
    pub fn from_settings(settings: &GatewaySettings, options: &ClientOptions) -> anyhow::Result<Self> {
        let proxy = &settings.proxy;
        let upstream = settings.upstream_base()?;

        let mut engine = Self::new(upstream.clone())
            .with_root_path(&proxy.root_path)
            .with_policy(HeaderPolicy::for_proxy(&proxy.user_agent, &proxy.extra_blocked_headers))
            .with_classifier(ErrorClassifier::new(&proxy.challenge_signatures));

        if proxy.fallback == "slow" {
            engine = engine.with_fallback(Arc::new(SlowDispatcher::new(options)?));
        }
        if proxy.rewrite_html && !settings.application.public_base_url.is_empty() {
            engine = engine.with_rewriter(LinkRewriter::new(
                &upstream,
                &settings.application.public_base_url,
            )?);
        }
        Ok(engine)
    }

    #[must_use]
    pub fn with_root_path(mut self, root_path: &str) -> Self {
        self.root_path = if root_path.is_empty() { "/" } else { root_path }.to_string();
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: HeaderPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    #[must_use]
    pub fn with_primary(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.primary = dispatcher;
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.fallback = Some(dispatcher);
        self
    }

    #[must_use]
    pub fn with_rewriter(mut self, rewriter: LinkRewriter) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    #[must_use]
    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// Absolute upstream URL for `inbound`, also used as the cache key
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` if the target URL cannot be built
    pub fn target_url(&self, inbound: &InboundRequest) -> Result<Url, ProxyError> {
        build_upstream_url(
            &self.upstream,
            &inbound.path,
            inbound.query.as_deref(),
            &self.root_path,
        )
    }

    /// Build the sanitized upstream request for `inbound`
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` if the target URL cannot be built
    pub fn build_request(&self, inbound: &InboundRequest) -> Result<UpstreamRequest, ProxyError> {
        Ok(UpstreamRequest {
            method: inbound.method.clone(),
            url: self.target_url(inbound)?,
            headers: self.policy.sanitize_request(&inbound.headers),
            body: inbound.body.clone(),
        })
    }

    /// Forward `inbound` using `client`, retrying at most once
    ///
    /// # Errors
    ///
    /// - `ProxyError::Transport` when the upstream is unreachable after the fallback
    /// - `ProxyError::SessionRejected` when the refreshed session is rejected again
    /// - `ProxyError::SessionUnavailable` when the forced refresh fails
    pub async fn forward(
        &self,
        inbound: &InboundRequest,
        client: Arc<AuthenticatedClient>,
        sessions: &SessionManager,
    ) -> Result<UpstreamResponse, ProxyError> {
        let request = self.build_request(inbound)?;
        log::debug!("Forwarding {} {}", request.method, request.url.path());

        let first = self.primary.dispatch(&client, &request).await;
        let action = match self.assess(first, false)? {
            Step::Deliver(response) => return Ok(self.finalize(response)),
            Step::Retry(action) => action,
        };

        let second = match (action, &self.fallback) {
            (RetryAction::Fallback, Some(fallback)) => {
                log::warn!(
                    "🔁 Transport failure on {}, retrying via {} dispatcher",
                    request.url.path(),
                    fallback.name()
                );
                fallback.dispatch(&client, &request).await
            }
            _ => {
                log::warn!(
                    "🔁 Upstream rejected session generation {}, refreshing",
                    client.generation()
                );
                let fresh = sessions.force_refresh_stale(client.generation()).await?;
                self.primary.dispatch(&fresh, &request).await
            }
        };

        match self.assess(second, true)? {
            Step::Deliver(response) => Ok(self.finalize(response)),
            Step::Retry(_) => Err(ProxyError::Internal(
                "Retry budget exhausted".to_string(),
            )),
        }
    }

    /// Classify one attempt and decide whether to deliver, retry or fail
    fn assess(
        &self,
        outcome: Result<UpstreamResponse, DispatchError>,
        already_retried: bool,
    ) -> Result<Step, ProxyError> {
        let has_fallback = self.fallback.is_some();
        let (kind, detail) = match outcome {
            Ok(response) => match self.classifier.classify_response(&response) {
                None => return Ok(Step::Deliver(response)),
                Some(kind) => {
                    log::info!("Upstream returned {} ({kind:?})", response.status);
                    if ErrorClassifier::action(kind, already_retried, has_fallback)
                        == RetryAction::PassThrough
                    {
                        return Ok(Step::Deliver(response));
                    }
                    (kind, format!("upstream status {}", response.status))
                }
            },
            Err(error) => {
                log::warn!("Upstream dispatch failed: {error}");
                (ErrorClassifier::classify_dispatch(&error), error.to_string())
            }
        };

        match ErrorClassifier::action(kind, already_retried, has_fallback) {
            RetryAction::Surface => Err(Self::surface(kind, &detail)),
            action => Ok(Step::Retry(action)),
        }
    }

    fn surface(kind: FailureKind, detail: &str) -> ProxyError {
        match kind {
            FailureKind::Transport => {
                ProxyError::Transport(format!("Upstream unreachable: {detail}"))
            }
            FailureKind::SessionInvalid => ProxyError::SessionRejected(
                "Upstream rejected the session after a refresh".to_string(),
            ),
            FailureKind::AcquisitionFailure => {
                ProxyError::SessionUnavailable("No upstream session available".to_string())
            }
            FailureKind::UpstreamHttp => ProxyError::Internal(format!("Unexpected {detail}")),
        }
    }

    /// Sanitize response headers and apply link rewriting
    fn finalize(&self, response: UpstreamResponse) -> UpstreamResponse {
        let mut headers = self.policy.sanitize_response(&response.headers);
        let mut body = response.body;

        if let Some(rewriter) = &self.rewriter {
            for (name, value) in &mut headers {
                if name.eq_ignore_ascii_case("location") {
                    if let Some(rewritten) = rewriter.rewrite_location(value) {
                        *value = rewritten;
                    }
                }
            }
            let is_html = headers.iter().any(|(name, value)| {
                name.eq_ignore_ascii_case("content-type")
                    && value.to_ascii_lowercase().contains("text/html")
            });
            if is_html {
                if let Ok(html) = std::str::from_utf8(&body) {
                    body = Bytes::from(rewriter.rewrite_html(html));
                }
            }
        }

        UpstreamResponse {
            status: response.status,
            headers,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::TestFixtures;
    use crate::testing::mock::{CountingAcquirer, ScriptedDispatcher};
    use crate::utils::headers::find_header;
    use reqwest::Method;

    fn inbound(path: &str, query: Option<&str>, headers: &[(&str, &str)]) -> InboundRequest {
        InboundRequest {
            method: Method::GET,
            path: path.to_string(),
            query: query.map(ToString::to_string),
            headers: headers
                .iter()
                .map(|(n, v)| ((*n).to_string(), (*v).to_string()))
                .collect(),
            body: None,
        }
    }

    struct Harness {
        engine: ForwardingEngine,
        primary: Arc<ScriptedDispatcher>,
        fallback: Arc<ScriptedDispatcher>,
        acquirer: Arc<CountingAcquirer>,
        sessions: SessionManager,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let acquirer = Arc::new(CountingAcquirer::new());
        let sessions = SessionManager::builder(
            Arc::clone(&acquirer) as Arc<dyn crate::session::CookieAcquirer>,
            TestFixtures::session_store(dir.path()),
        )
        .build();
        let primary = Arc::new(ScriptedDispatcher::new());
        let fallback = Arc::new(ScriptedDispatcher::new());
        let engine = ForwardingEngine::new(TestFixtures::upstream_url())
            .with_primary(Arc::clone(&primary) as Arc<dyn Dispatcher>)
            .with_fallback(Arc::clone(&fallback) as Arc<dyn Dispatcher>);
        Harness {
            engine,
            primary,
            fallback,
            acquirer,
            sessions,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_request_building() {
        let h = harness();
        let request = h
            .engine
            .build_request(&inbound(
                "/api/items",
                Some("z=1&a=2"),
                &[
                    ("Host", "gateway"),
                    ("Cookie", "mine=1"),
                    ("X-Forwarded-For", "1.2.3.4"),
                    ("Accept", "text/html"),
                ],
            ))
            .unwrap();

        assert_eq!(request.url.as_str(), "https://app.example.com/api/items?z=1&a=2");
        assert_eq!(find_header(&request.headers, "accept"), Some("text/html"));
        assert!(find_header(&request.headers, "host").is_none());
        assert!(find_header(&request.headers, "cookie").is_none());
        assert!(find_header(&request.headers, "x-forwarded-for").is_none());
    }

    #[tokio::test]
    async fn test_success_strips_set_cookie() {
        let h = harness();
        h.primary.push_response(TestFixtures::response(
            200,
            &[("set-cookie", "sid=upstream"), ("content-type", "text/plain"), ("content-length", "2")],
            "ok",
        ));
        let client = h.sessions.get_client().await.unwrap();

        let response = h.engine.forward(&inbound("/", None, &[]), client, &h.sessions).await.unwrap();
        assert_eq!(response.status, 200);
        assert!(response.header("set-cookie").is_none());
        assert!(response.header("content-length").is_none());
        assert_eq!(response.header("content-type"), Some("text/plain"));
        assert_eq!(h.primary.calls(), 1);
        assert_eq!(h.fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_upstream_http_error_passes_through() {
        let h = harness();
        h.primary.push_response(TestFixtures::response(404, &[], "missing"));
        let client = h.sessions.get_client().await.unwrap();

        let response = h.engine.forward(&inbound("/x", None, &[]), client, &h.sessions).await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.body, Bytes::from_static(b"missing"));
        assert_eq!(h.primary.calls(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_uses_fallback_once() {
        let h = harness();
        h.primary.push_error(DispatchError::Timeout);
        h.fallback.push_response(TestFixtures::response(200, &[], "slow but fine"));
        let client = h.sessions.get_client().await.unwrap();

        let response = h.engine.forward(&inbound("/", None, &[]), client, &h.sessions).await.unwrap();
        assert_eq!(response.body, Bytes::from_static(b"slow but fine"));
        assert_eq!(h.primary.calls(), 1);
        assert_eq!(h.fallback.calls(), 1);
    }

    #[tokio::test]
    async fn test_repeated_transport_failure_surfaces_502() {
        let h = harness();
        h.primary.push_error(DispatchError::Connect("refused".into()));
        h.fallback.push_error(DispatchError::Connect("refused".into()));
        let client = h.sessions.get_client().await.unwrap();

        let err = h.engine.forward(&inbound("/", None, &[]), client, &h.sessions).await.unwrap_err();
        assert!(matches!(err, ProxyError::Transport(_)));
        assert_eq!(h.fallback.calls(), 1);
    }

    #[tokio::test]
    async fn test_challenge_triggers_one_refresh_and_retry() {
        let h = harness();
        h.primary.push_response(TestFixtures::response(
            403,
            &[("content-type", "text/html")],
            "<title>Just a moment...</title> challenge-platform",
        ));
        h.primary.push_response(TestFixtures::response(200, &[], "welcome back"));
        let client = h.sessions.get_client().await.unwrap();
        assert_eq!(h.acquirer.calls(), 1);

        let response = h.engine.forward(&inbound("/", None, &[]), client, &h.sessions).await.unwrap();
        assert_eq!(response.body, Bytes::from_static(b"welcome back"));
        assert_eq!(h.acquirer.calls(), 2);
        assert_eq!(h.primary.calls(), 2);
        assert_eq!(h.primary.generations(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_rejected_after_refresh_surfaces_401() {
        let h = harness();
        h.primary.push_response(TestFixtures::response(401, &[], ""));
        h.primary.push_response(TestFixtures::response(401, &[], ""));
        let client = h.sessions.get_client().await.unwrap();

        let err = h.engine.forward(&inbound("/", None, &[]), client, &h.sessions).await.unwrap_err();
        assert!(matches!(err, ProxyError::SessionRejected(_)));
        assert_eq!(err.kind(), "session_unavailable");
        assert_eq!(h.acquirer.calls(), 2);
        assert_eq!(h.primary.calls(), 2);
    }

    #[tokio::test]
    async fn test_html_and_location_rewriting() {
        let h = harness();
        let engine = ForwardingEngine::new(TestFixtures::upstream_url())
            .with_primary(Arc::clone(&h.primary) as Arc<dyn Dispatcher>)
            .with_rewriter(
                LinkRewriter::new(&TestFixtures::upstream_url(), "https://gateway.internal").unwrap(),
            );
        h.primary.push_response(TestFixtures::response(
            302,
            &[
                ("location", "https://app.example.com/login"),
                ("content-type", "text/html"),
            ],
            r#"<a href="https://app.example.com/login">login</a>"#,
        ));
        let client = h.sessions.get_client().await.unwrap();

        let response = engine.forward(&inbound("/", None, &[]), client, &h.sessions).await.unwrap();
        assert_eq!(response.status, 302);
        assert_eq!(response.header("location"), Some("https://gateway.internal/login"));
        assert_eq!(
            response.body,
            Bytes::from_static(br#"<a href="https://gateway.internal/login">login</a>"#)
        );
    }
}
