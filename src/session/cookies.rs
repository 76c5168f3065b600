//! Upstream session cookies
//!
//! A [`CookieSet`] is the complete collection of cookies that represents one
//! logged-in upstream session. It is always produced wholesale (by an acquirer,
//! a manual update, or the persisted file) and is never merged into an existing
//! set: a refresh replaces it entirely.

use actix_web::cookie::Cookie;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// `SameSite` attribute, normalized from the spellings browsers export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SameSite {
    #[default]
    Lax,
    Strict,
    None,
}

impl From<String> for SameSite {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "strict" => Self::Strict,
            "none" | "no_restriction" => Self::None,
            // "lax", "unspecified" and anything unknown
            _ => Self::Lax,
        }
    }
}

impl From<SameSite> for String {
    fn from(value: SameSite) -> Self {
        match value {
            SameSite::Lax => "Lax",
            SameSite::Strict => "Strict",
            SameSite::None => "None",
        }
        .to_string()
    }
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn unix_seconds(timestamp: i64) -> f64 {
    timestamp as f64
}

fn default_path() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

/// A single upstream cookie in browser-export format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    /// Empty until bound with `CookieSet::scoped_to`; an unbound cookie is never sent
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_true")]
    pub secure: bool,
    #[serde(default, rename = "httpOnly")]
    pub http_only: bool,
    #[serde(default, rename = "sameSite")]
    pub same_site: SameSite,
    /// Unix timestamp in seconds; absent or non-positive for session cookies
    #[serde(
        default,
        rename = "expirationDate",
        alias = "expires",
        skip_serializing_if = "Option::is_none"
    )]
    pub expiry: Option<f64>,
}

impl SessionCookie {
    /// Create a host-only cookie with path `/` and default attributes
    #[must_use]
    pub fn new(name: &str, value: &str, domain: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
            path: default_path(),
            secure: true,
            http_only: false,
            same_site: SameSite::Lax,
            expiry: None,
        }
    }

    /// Expiry as a timestamp, `None` for session cookies
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expiry
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single())
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }

    /// Whether this cookie should be sent to `host` for a request on `path`
    #[must_use]
    pub fn matches(&self, host: &str, path: &str) -> bool {
        let domain = self.domain.trim_start_matches('.').to_ascii_lowercase();
        if domain.is_empty() {
            return false;
        }
        let host = host.to_ascii_lowercase();
        let domain_ok = host == domain
            || host
                .strip_suffix(domain.as_str())
                .is_some_and(|prefix| prefix.ends_with('.'));

        let cookie_path = if self.path.is_empty() { "/" } else { self.path.as_str() };
        let path_ok = path == cookie_path
            || (path.starts_with(cookie_path)
                && (cookie_path.ends_with('/')
                    || path[cookie_path.len()..].starts_with('/')));

        domain_ok && path_ok
    }

    fn identity(&self) -> (&str, String, &str) {
        (
            self.name.as_str(),
            self.domain.trim_start_matches('.').to_ascii_lowercase(),
            self.path.as_str(),
        )
    }
}

/// Error raised when a raw cookie payload cannot be turned into a `CookieSet`
#[derive(Debug, thiserror::Error)]
pub enum CookieParseError {
    #[error("cookie payload contains no cookies")]
    Empty,
    #[error("malformed cookie pair: {0}")]
    Malformed(String),
    #[error("invalid cookie JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// The full cookie collection for one upstream session, unique by (name, domain, path)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CookieSet {
    cookies: Vec<SessionCookie>,
}

impl CookieSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a cookie, replacing one with the same (name, domain, path)
    pub fn insert(&mut self, cookie: SessionCookie) {
        if let Some(existing) = self
            .cookies
            .iter_mut()
            .find(|c| c.identity() == cookie.identity())
        {
            *existing = cookie;
        } else {
            self.cookies.push(cookie);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionCookie> {
        self.cookies.iter()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SessionCookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    /// Parse a `"a=1; b=2"` cookie string into host-only cookies for `domain`
    ///
    /// # Errors
    ///
    /// Returns an error if a pair has no `=` or an empty name, or if the
    /// string holds no cookies at all.
    pub fn from_cookie_string(raw: &str, domain: &str) -> Result<Self, CookieParseError> {
        let mut set = Self::new();
        for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = part
                .split_once('=')
                .ok_or_else(|| CookieParseError::Malformed(part.to_string()))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(CookieParseError::Malformed(part.to_string()));
            }
            set.insert(SessionCookie::new(name, value.trim(), domain));
        }
        if set.is_empty() {
            return Err(CookieParseError::Empty);
        }
        Ok(set)
    }

    /// Parse a JSON array of browser-export cookies
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or contains no cookies.
    pub fn from_json(raw: &str) -> Result<Self, CookieParseError> {
        let cookies: Vec<SessionCookie> = serde_json::from_str(raw)?;
        Self::from_cookies(cookies)
    }

    /// Build a set from a list of cookies, later duplicates replacing earlier ones
    ///
    /// # Errors
    ///
    /// Returns an error if the list is empty.
    pub fn from_cookies(cookies: Vec<SessionCookie>) -> Result<Self, CookieParseError> {
        let mut set = Self::new();
        for cookie in cookies {
            set.insert(cookie);
        }
        if set.is_empty() {
            return Err(CookieParseError::Empty);
        }
        Ok(set)
    }

    /// Bind cookies that carry no domain to `host`, leaving the others untouched
    ///
    /// Re-inserting keeps the set unique when a bound cookie now collides
    /// with one that already named `host`.
    #[must_use]
    pub fn scoped_to(self, host: &str) -> Self {
        let mut scoped = Self::new();
        for mut cookie in self.cookies {
            if cookie.domain.is_empty() {
                cookie.domain = host.to_string();
            }
            scoped.insert(cookie);
        }
        scoped
    }

    /// Collect cookies from `Set-Cookie` header values returned by a login response
    ///
    /// Unparseable headers are skipped. Cookies without a `Domain` attribute
    /// are scoped to `default_domain`.
    pub fn from_set_cookie_headers<'a>(
        headers: impl IntoIterator<Item = &'a str>,
        default_domain: &str,
    ) -> Self {
        let mut set = Self::new();
        for raw in headers {
            let Ok(parsed) = Cookie::parse(raw.to_string()) else {
                log::debug!("Skipping unparseable Set-Cookie header");
                continue;
            };
            let mut cookie = SessionCookie::new(
                parsed.name(),
                parsed.value(),
                parsed.domain().unwrap_or(default_domain),
            );
            if let Some(path) = parsed.path() {
                cookie.path = path.to_string();
            }
            cookie.secure = parsed.secure().unwrap_or(false);
            cookie.http_only = parsed.http_only().unwrap_or(false);
            cookie.same_site = match parsed.same_site() {
                Some(actix_web::cookie::SameSite::Strict) => SameSite::Strict,
                Some(actix_web::cookie::SameSite::None) => SameSite::None,
                _ => SameSite::Lax,
            };
            cookie.expiry = parsed
                .max_age()
                .map(|age| unix_seconds(Utc::now().timestamp() + age.whole_seconds()))
                .or_else(|| {
                    parsed
                        .expires_datetime()
                        .map(|at| unix_seconds(at.unix_timestamp()))
                });
            set.insert(cookie);
        }
        set
    }

    /// Value of the `Cookie` header to send for `url`, skipping expired cookies
    #[must_use]
    pub fn header_value_for(&self, url: &Url, now: DateTime<Utc>) -> Option<String> {
        let host = url.host_str().unwrap_or_default();
        let path = url.path();
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| !c.is_expired(now) && c.matches(host, path))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Earliest expiry among cookies that carry one
    #[must_use]
    pub fn earliest_expiry(&self) -> Option<DateTime<Utc>> {
        self.cookies.iter().filter_map(SessionCookie::expires_at).min()
    }
}
