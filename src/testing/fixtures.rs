//! Test fixtures providing pre-built test objects

use actix_web::web::Bytes;
use chrono::Duration;
use std::path::Path;
use url::Url;

use super::constants::{
    TEST_ADMIN_KEY, TEST_API_KEY, TEST_SESSION_COOKIE, TEST_UPSTREAM, TEST_UPSTREAM_HOST,
};
use crate::forwarding::UpstreamResponse;
use crate::session::{CookieSet, SessionCookie, SessionStore};
use crate::settings::GatewaySettings;

/// Central fixture provider for all test data
pub struct TestFixtures;

impl TestFixtures {
    /// Upstream base URL used by fixtures
    ///
    /// # Panics
    ///
    /// Never in practice; the constant is a valid URL
    #[must_use]
    pub fn upstream_url() -> Url {
        Url::parse(TEST_UPSTREAM).expect("fixture upstream is a valid URL")
    }

    /// A one-cookie session for the fixture upstream
    #[must_use]
    pub fn cookie_set() -> CookieSet {
        Self::cookie_set_with_value("fixture-session")
    }

    #[must_use]
    pub fn cookie_set_with_value(value: &str) -> CookieSet {
        let mut set = CookieSet::new();
        set.insert(SessionCookie::new(TEST_SESSION_COOKIE, value, TEST_UPSTREAM_HOST));
        set
    }

    /// Cookie file store inside `dir` with a 24 hour max age
    #[must_use]
    pub fn session_store(dir: &Path) -> SessionStore {
        SessionStore::new(
            dir.join("session_cookies.json"),
            Duration::hours(24),
            TEST_UPSTREAM,
        )
    }

    /// Settings pointing at the fixture upstream with both keys configured
    #[must_use]
    pub fn settings() -> GatewaySettings {
        Self::settings_for_upstream(TEST_UPSTREAM)
    }

    /// Settings pointing at `upstream`, e.g. a local fake server
    #[must_use]
    pub fn settings_for_upstream(upstream: &str) -> GatewaySettings {
        let mut settings = GatewaySettings::default();
        settings.proxy.upstream_url = upstream.to_string();
        settings.proxy.request_timeout_seconds = 5;
        settings.security.api_key = TEST_API_KEY.to_string();
        settings.security.admin_key = TEST_ADMIN_KEY.to_string();
        settings
    }

    /// A buffered upstream response
    #[must_use]
    pub fn response(status: u16, headers: &[(&str, &str)], body: &str) -> UpstreamResponse {
        UpstreamResponse {
            status,
            headers: headers
                .iter()
                .map(|(n, v)| ((*n).to_string(), (*v).to_string()))
                .collect(),
            body: Bytes::from(body.to_string()),
        }
    }
}
