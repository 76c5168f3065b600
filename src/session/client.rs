use chrono::{DateTime, Utc};
use reqwest::{redirect, Client};
use std::time::Duration;
use url::Url;

use super::cookies::CookieSet;
use crate::settings::ProxySettings;

/// Transport options shared by every client built for the upstream
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub timeout: Duration,
    pub follow_redirects: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            follow_redirects: false,
        }
    }
}

impl ClientOptions {
    #[must_use]
    pub fn from_settings(proxy: &ProxySettings) -> Self {
        Self {
            timeout: Duration::from_secs(proxy.request_timeout_seconds),
            follow_redirects: proxy.follow_redirects,
        }
    }

    fn redirect_policy(&self) -> redirect::Policy {
        if self.follow_redirects {
            redirect::Policy::limited(10)
        } else {
            redirect::Policy::none()
        }
    }

    /// Build a pooled client for the fast path
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized
    pub fn build_pooled(&self) -> reqwest::Result<Client> {
        Client::builder()
            .timeout(self.timeout)
            .redirect(self.redirect_policy())
            .build()
    }

    /// Build a client that opens a fresh connection for every request
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized
    pub fn build_unpooled(&self, timeout: Duration) -> reqwest::Result<Client> {
        Client::builder()
            .timeout(timeout)
            .redirect(self.redirect_policy())
            .pool_max_idle_per_host(0)
            .build()
    }
}

/// A connection pool bound to one cookie set
///
/// Owned by the `SessionManager` and handed out as `Arc<AuthenticatedClient>`.
/// A refresh builds a new client and swaps it in; an existing client is never
/// mutated, so in-flight forwards keep using the session they started with.
#[derive(Debug)]
pub struct AuthenticatedClient {
    http: Client,
    cookies: CookieSet,
    generation: u64,
    created_at: DateTime<Utc>,
}

impl AuthenticatedClient {
    /// Build a client for `cookies`
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be constructed
    pub fn new(cookies: CookieSet, options: &ClientOptions, generation: u64) -> reqwest::Result<Self> {
        Ok(Self {
            http: options.build_pooled()?,
            cookies,
            generation,
            created_at: Utc::now(),
        })
    }

    #[must_use]
    pub fn http(&self) -> &Client {
        &self.http
    }

    #[must_use]
    pub fn cookies(&self) -> &CookieSet {
        &self.cookies
    }

    /// Monotonic counter identifying which refresh produced this client
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// `Cookie` header value to attach for `url`
    #[must_use]
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        self.cookies.header_value_for(url, Utc::now())
    }
}
