//! Cookie acquisition seam
//!
//! The gateway never performs interactive login itself. A deployment configures
//! exactly one [`CookieAcquirer`]; the `SessionManager` calls it off the serving
//! path whenever a fresh session is needed.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::cookies::{CookieParseError, CookieSet};
use super::store::{PersistedCookies, SessionSource, SessionStore};
use crate::settings::GatewaySettings;

/// Upstream login credentials
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("credentials unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("credentials unavailable: {0}")]
    Credentials(#[from] CredentialsError),
    #[error("cookie acquisition failed: {0}")]
    Failed(String),
    #[error("cookie acquisition timed out after {0:?}")]
    TimedOut(Duration),
    #[error("acquired cookies are unusable: {0}")]
    Parse(#[from] CookieParseError),
}

/// Source of the shared upstream credentials
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Fetch the current credentials
    ///
    /// # Errors
    ///
    /// Returns `CredentialsError::Unavailable` if no credentials can be produced
    async fn get_credentials(&self) -> Result<Credentials, CredentialsError>;
}

/// Performs whatever out-of-band flow yields an authenticated cookie set
#[async_trait]
pub trait CookieAcquirer: Send + Sync {
    /// Produce a complete cookie set
    ///
    /// # Errors
    ///
    /// Returns an `AcquisitionError` if no usable cookie set could be obtained
    async fn acquire(&self, credentials: Option<&Credentials>) -> Result<CookieSet, AcquisitionError>;

    /// Whether `acquire` needs credentials from the `CredentialSource`
    fn requires_credentials(&self) -> bool {
        false
    }

    /// How sessions from this acquirer are labelled; only automated ones are persisted
    fn source(&self) -> SessionSource {
        SessionSource::Automated
    }

    /// Short identifier used in logs
    fn name(&self) -> &'static str;
}

// ===============================
// CREDENTIAL SOURCES
// ===============================

/// Reads credentials from two environment variables
#[derive(Debug, Clone)]
pub struct EnvCredentialSource {
    username_var: String,
    password_var: String,
}

impl EnvCredentialSource {
    #[must_use]
    pub fn new(username_var: &str, password_var: &str) -> Self {
        Self {
            username_var: username_var.to_string(),
            password_var: password_var.to_string(),
        }
    }

    fn read(var: &str) -> Result<String, CredentialsError> {
        match std::env::var(var) {
            Ok(value) if !value.is_empty() => Ok(value),
            _ => Err(CredentialsError::Unavailable(format!("{var} is not set"))),
        }
    }
}

#[async_trait]
impl CredentialSource for EnvCredentialSource {
    async fn get_credentials(&self) -> Result<Credentials, CredentialsError> {
        Ok(Credentials {
            username: Self::read(&self.username_var)?,
            password: Self::read(&self.password_var)?,
        })
    }
}

// ===============================
// ACQUIRERS
// ===============================

/// Returns a cookie string configured by an operator
#[derive(Debug, Clone)]
pub struct ManualCookieAcquirer {
    cookie_string: String,
    domain: String,
}

impl ManualCookieAcquirer {
    #[must_use]
    pub fn new(cookie_string: &str, domain: &str) -> Self {
        Self {
            cookie_string: cookie_string.to_string(),
            domain: domain.to_string(),
        }
    }
}

#[async_trait]
impl CookieAcquirer for ManualCookieAcquirer {
    async fn acquire(&self, _credentials: Option<&Credentials>) -> Result<CookieSet, AcquisitionError> {
        if self.cookie_string.trim().is_empty() {
            return Err(AcquisitionError::Failed(
                "no session cookie string configured".to_string(),
            ));
        }
        Ok(CookieSet::from_cookie_string(&self.cookie_string, &self.domain)?)
    }

    fn source(&self) -> SessionSource {
        SessionSource::Manual
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

/// Reads the persisted cookie file as the primary source
#[derive(Debug, Clone)]
pub struct FileCookieAcquirer {
    store: SessionStore,
}

impl FileCookieAcquirer {
    #[must_use]
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CookieAcquirer for FileCookieAcquirer {
    async fn acquire(&self, _credentials: Option<&Credentials>) -> Result<CookieSet, AcquisitionError> {
        self.store
            .load()
            .await
            .map_err(|e| AcquisitionError::Failed(e.to_string()))
    }

    fn source(&self) -> SessionSource {
        SessionSource::Manual
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Posts the credentials to the upstream login form and keeps the returned cookies
#[derive(Debug, Clone)]
pub struct LoginFormAcquirer {
    client: reqwest::Client,
    login_url: Url,
}

impl LoginFormAcquirer {
    /// # Errors
    ///
    /// Returns an error if the login URL cannot be built or the HTTP client
    /// cannot be constructed
    pub fn new(upstream: &Url, login_path: &str, timeout: Duration) -> Result<Self, AcquisitionError> {
        let login_url = upstream
            .join(login_path.trim_start_matches('/'))
            .map_err(|e| AcquisitionError::Failed(format!("invalid login URL: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AcquisitionError::Failed(e.to_string()))?;
        Ok(Self { client, login_url })
    }
}

#[async_trait]
impl CookieAcquirer for LoginFormAcquirer {
    async fn acquire(&self, credentials: Option<&Credentials>) -> Result<CookieSet, AcquisitionError> {
        let credentials = credentials.ok_or_else(|| {
            CredentialsError::Unavailable("login form requires credentials".to_string())
        })?;

        let response = self
            .client
            .post(self.login_url.clone())
            .form(&[
                ("username", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AcquisitionError::Failed(format!("login request failed: {e}")))?;

        let status = response.status();
        if !(status.is_success() || status.is_redirection()) {
            return Err(AcquisitionError::Failed(format!(
                "login rejected with status {status}"
            )));
        }

        let domain = self.login_url.host_str().unwrap_or_default();
        let cookies = CookieSet::from_set_cookie_headers(
            response
                .headers()
                .get_all(reqwest::header::SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok()),
            domain,
        );
        if cookies.is_empty() {
            return Err(AcquisitionError::Failed(
                "login response set no cookies".to_string(),
            ));
        }
        Ok(cookies)
    }

    fn requires_credentials(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "login_form"
    }
}

/// Runs an external program (typically browser automation) that prints cookies as JSON
///
/// Credentials are passed through `SESSIONGATE_USERNAME` / `SESSIONGATE_PASSWORD`
/// and the upstream through `SESSIONGATE_UPSTREAM`. Stdout may be either a JSON
/// cookie array or a persisted cookie file document.
#[derive(Debug, Clone)]
pub struct CommandCookieAcquirer {
    program: String,
    args: Vec<String>,
    upstream: Url,
    timeout: Duration,
}

impl CommandCookieAcquirer {
    /// # Errors
    ///
    /// Returns an error if `command` is empty
    pub fn new(command: &[String], upstream: &Url, timeout: Duration) -> Result<Self, AcquisitionError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| AcquisitionError::Failed("no acquire command configured".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            upstream: upstream.clone(),
            timeout,
        })
    }

    /// Cookies printed without a domain are bound to `host`
    fn parse_output(stdout: &str, host: &str) -> Result<CookieSet, AcquisitionError> {
        let trimmed = stdout.trim();
        let cookies = match serde_json::from_str::<PersistedCookies>(trimmed) {
            Ok(document) => CookieSet::from_cookies(document.cookies.iter().cloned().collect())?,
            Err(_) => CookieSet::from_json(trimmed)?,
        };
        Ok(cookies.scoped_to(host))
    }
}

#[async_trait]
impl CookieAcquirer for CommandCookieAcquirer {
    async fn acquire(&self, credentials: Option<&Credentials>) -> Result<CookieSet, AcquisitionError> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .env("SESSIONGATE_UPSTREAM", self.upstream.as_str())
            .kill_on_drop(true);
        if let Some(credentials) = credentials {
            command
                .env("SESSIONGATE_USERNAME", &credentials.username)
                .env("SESSIONGATE_PASSWORD", &credentials.password);
        }

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| AcquisitionError::TimedOut(self.timeout))?
            .map_err(|e| AcquisitionError::Failed(format!("failed to run {}: {e}", self.program)))?;

        if !output.status.success() {
            return Err(AcquisitionError::Failed(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }
        Self::parse_output(
            &String::from_utf8_lossy(&output.stdout),
            self.upstream.host_str().unwrap_or_default(),
        )
    }

    fn requires_credentials(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "command"
    }
}

/// Build the single acquirer selected by `session.acquirer`
///
/// # Errors
///
/// Returns an error if the selected acquirer cannot be constructed
pub fn build_acquirer(
    settings: &GatewaySettings,
    store: &SessionStore,
) -> Result<Arc<dyn CookieAcquirer>, AcquisitionError> {
    let session = &settings.session;
    let upstream = settings
        .upstream_base()
        .map_err(|e| AcquisitionError::Failed(e.to_string()))?;
    let timeout = Duration::from_secs(session.acquire_timeout_seconds);

    let acquirer: Arc<dyn CookieAcquirer> = match session.acquirer.as_str() {
        "login_form" => Arc::new(LoginFormAcquirer::new(&upstream, &session.login_path, timeout)?),
        "command" => Arc::new(CommandCookieAcquirer::new(
            &session.acquire_command,
            &upstream,
            timeout,
        )?),
        "file" => Arc::new(FileCookieAcquirer::new(store.clone())),
        _ => Arc::new(ManualCookieAcquirer::new(
            &session.cookie_string,
            &settings.upstream_host(),
        )),
    };
    log::info!("🔧 Using '{}' cookie acquirer", acquirer.name());
    Ok(acquirer)
}
