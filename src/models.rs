use serde::{Deserialize, Serialize};

use crate::session::{CookieParseError, CookieSet, SessionCookie, SessionStatus};

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
    pub session_loaded: bool,
}

/// Body of `POST /update-cookies`
///
/// Either a browser-export cookie list or a raw `Cookie` header string.
/// When both are present the list wins.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateCookiesRequest {
    #[serde(default)]
    pub cookies: Option<Vec<SessionCookie>>,
    #[serde(default)]
    pub cookie_string: Option<String>,
}

impl UpdateCookiesRequest {
    /// Turn the request into a cookie set scoped to `domain`
    ///
    /// Cookies from the list without a domain are bound to `domain`.
    ///
    /// # Errors
    ///
    /// Returns `CookieParseError::Empty` if neither field carries a cookie
    pub fn into_cookie_set(self, domain: &str) -> Result<CookieSet, CookieParseError> {
        match (self.cookies, self.cookie_string) {
            (Some(cookies), _) if !cookies.is_empty() => {
                CookieSet::from_cookies(cookies).map(|set| set.scoped_to(domain))
            }
            (_, Some(raw)) => CookieSet::from_cookie_string(&raw, domain),
            _ => Err(CookieParseError::Empty),
        }
    }
}

/// Result of an operator action
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionStatus>,
}

#[derive(Debug, Serialize)]
pub struct ClearCacheResponse {
    pub success: bool,
    pub cleared: usize,
}
