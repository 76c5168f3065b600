//! Static shared-key checks for clients and operators

use actix_web::HttpRequest;
use subtle::ConstantTimeEq;

use crate::error::ProxyError;
use crate::settings::SecuritySettings;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Verifies one key header against a configured secret
#[derive(Debug, Clone)]
pub struct KeyGuard {
    header: &'static str,
    expected_key: String,
    /// An empty key means "open" rather than "nobody gets in"
    open_when_unset: bool,
}

impl KeyGuard {
    /// Guard for proxied requests; an empty key disables the check
    #[must_use]
    pub fn client(api_key: &str) -> Self {
        Self {
            header: API_KEY_HEADER,
            expected_key: api_key.to_string(),
            open_when_unset: true,
        }
    }

    /// Guard for operator endpoints; an empty key rejects every request
    #[must_use]
    pub fn admin(admin_key: &str) -> Self {
        Self {
            header: ADMIN_KEY_HEADER,
            expected_key: admin_key.to_string(),
            open_when_unset: false,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open_when_unset && self.expected_key.is_empty()
    }

    /// Verify a provided key value
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Unauthorized` if the key is missing or wrong
    pub fn verify(&self, provided_key: Option<&str>) -> Result<(), ProxyError> {
        if self.is_open() {
            return Ok(());
        }
        if self.expected_key.is_empty() {
            return Err(ProxyError::Unauthorized(
                "Operator endpoints are disabled".to_string(),
            ));
        }
        match provided_key {
            Some(key) if key.as_bytes().ct_eq(self.expected_key.as_bytes()).into() => Ok(()),
            Some(_) => Err(ProxyError::Unauthorized(format!("Invalid {}", self.header))),
            None => Err(ProxyError::Unauthorized(format!("Missing {}", self.header))),
        }
    }

    /// Verify the guarded header of an inbound request
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Unauthorized` if the key is missing or wrong
    pub fn verify_request(&self, req: &HttpRequest) -> Result<(), ProxyError> {
        let provided = req
            .headers()
            .get(self.header)
            .and_then(|value| value.to_str().ok());
        self.verify(provided)
    }
}

/// Both guards, injected into handlers as `web::Data`
#[derive(Debug, Clone)]
pub struct AccessKeys {
    pub client: KeyGuard,
    pub admin: KeyGuard,
}

impl AccessKeys {
    #[must_use]
    pub fn from_settings(security: &SecuritySettings) -> Self {
        Self {
            client: KeyGuard::client(&security.api_key),
            admin: KeyGuard::admin(&security.admin_key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_guard() {
        let guard = KeyGuard::client("client-secret");
        assert!(guard.verify(Some("client-secret")).is_ok());
        assert!(guard.verify(Some("client-secreT")).is_err());
        assert!(guard.verify(None).is_err());

        let open = KeyGuard::client("");
        assert!(open.is_open());
        assert!(open.verify(None).is_ok());
    }

    #[test]
    fn test_admin_guard_without_key_rejects() {
        let guard = KeyGuard::admin("");
        assert!(!guard.is_open());
        assert!(guard.verify(Some("")).is_err());
        assert!(guard.verify(None).is_err());
    }

    #[test]
    fn test_verify_request_header() {
        let guard = KeyGuard::admin("admin-secret");
        let req = actix_web::test::TestRequest::default()
            .insert_header((ADMIN_KEY_HEADER, "admin-secret"))
            .to_http_request();
        assert!(guard.verify_request(&req).is_ok());

        let req = actix_web::test::TestRequest::default()
            .insert_header((API_KEY_HEADER, "admin-secret"))
            .to_http_request();
        assert!(matches!(
            guard.verify_request(&req),
            Err(ProxyError::Unauthorized(_))
        ));
    }
}
