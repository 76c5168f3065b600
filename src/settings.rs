use serde::{Deserialize, Serialize};
use std::fs;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GatewaySettings {
    pub application: ApplicationSettings,
    pub proxy: ProxySettings,
    pub session: SessionSettings,
    pub cache: CacheSettings,
    pub security: SecuritySettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
    /// Public URL clients use to reach the gateway, used for link rewriting
    pub public_base_url: String,
    pub cors_origins: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub upstream_url: String,
    pub request_timeout_seconds: u64,
    pub follow_redirects: bool,
    pub user_agent: String,
    /// Path forwarded when a client requests the bare root
    pub root_path: String,
    /// Fallback dispatcher used after a transport failure: "slow" or "none"
    pub fallback: String,
    /// Additional request headers never forwarded upstream
    pub extra_blocked_headers: Vec<String>,
    /// Case-insensitive body markers of an anti-bot interstitial
    pub challenge_signatures: Vec<String>,
    pub rewrite_html: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Lifetime of an acquired session before it is lazily refreshed
    pub ttl_seconds: u64,
    /// One of "manual", "login_form", "command" or "file"
    pub acquirer: String,
    /// Persisted last-known-good cookie file
    pub cookie_file: String,
    pub cookie_file_max_age_hours: u64,
    /// Raw `a=1; b=2` cookie string for the manual acquirer
    pub cookie_string: String,
    /// Program run by the command acquirer; it prints cookies as JSON on stdout
    pub acquire_command: Vec<String>,
    pub acquire_timeout_seconds: u64,
    /// Login form path for the `login_form` acquirer
    pub login_path: String,
    /// Environment variables holding the upstream credentials
    pub username_env: String,
    pub password_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecuritySettings {
    /// Key required in `x-admin-key` for operator endpoints; empty disables them
    pub admin_key: String,
    /// Key required in `x-api-key` for proxied requests; empty disables the check
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

/// Startup configuration errors; the only failures that stop the process
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: String,
        source: basic_toml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            public_base_url: String::new(),
            cors_origins: String::new(),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            upstream_url: String::new(),
            request_timeout_seconds: 30,
            follow_redirects: false,
            user_agent: format!("sessiongate/{}", crate::VERSION),
            root_path: "/".to_string(),
            fallback: "slow".to_string(),
            extra_blocked_headers: Vec::new(),
            challenge_signatures: vec![
                "challenge-platform".to_string(),
                "checking your browser".to_string(),
            ],
            rewrite_html: false,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            acquirer: "manual".to_string(),
            cookie_file: "session_cookies.json".to_string(),
            cookie_file_max_age_hours: 24,
            cookie_string: String::new(),
            acquire_command: Vec::new(),
            acquire_timeout_seconds: 180,
            login_path: "/login".to_string(),
            username_env: "UPSTREAM_USERNAME".to_string(),
            password_env: "UPSTREAM_PASSWORD".to_string(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 600,
            capacity: 100,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl GatewaySettings {
    /// Load settings from configuration files and environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A settings file cannot be read or parsed
    /// - The resulting configuration fails validation
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_env_file();

        let mut settings = Self::load_base_settings()?;
        Self::apply_env_overrides(&mut settings);

        Self::initialize_logging(&settings.logging);
        settings.validate()?;

        Ok(settings)
    }

    /// Initialize `env_logger`, with `RUST_LOG` taking precedence over the configured level
    fn initialize_logging(logging: &LoggingSettings) {
        let env = env_logger::Env::default().default_filter_or(logging.level.clone());
        if env_logger::Builder::from_env(env).try_init().is_err() {
            log::debug!("Logger already initialized");
        }
    }

    /// Load base settings from TOML file(s) or use defaults
    /// Settings are loaded with the following priority (highest to lowest):
    /// 1. Environment variables (applied separately after loading base settings)
    /// 2. Settings.toml in `SESSIONGATE_SECRETS_DIR` (if specified and exists)
    /// 3. Settings.toml in current directory (if exists)
    /// 4. Default settings
    ///
    /// # Errors
    ///
    /// Returns an error if a settings file cannot be read or parsed
    fn load_base_settings() -> Result<Self, SettingsError> {
        let mut settings = Self::default();

        let default_config_path = std::path::PathBuf::from("Settings.toml");
        if default_config_path.exists() {
            settings = Self::from_toml_file(&default_config_path)?;
            println!(
                "✓ Loaded base settings from {}",
                default_config_path.display()
            );
        }

        if let Ok(secrets_dir) = std::env::var("SESSIONGATE_SECRETS_DIR") {
            let secrets_path = std::path::Path::new(&secrets_dir).join("Settings.toml");
            if secrets_path.exists() {
                settings = Self::from_toml_file(&secrets_path)?;
                println!("✓ Overriding settings from {}", secrets_path.display());
            } else {
                println!(
                    "ℹ SESSIONGATE_SECRETS_DIR set but no Settings.toml found at: {}",
                    secrets_path.display()
                );
            }
        }

        Ok(settings)
    }

    /// Parse a single TOML settings file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        basic_toml::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply environment variable overrides to settings
    pub fn apply_env_overrides(settings: &mut Self) {
        Self::apply_application_env_overrides(&mut settings.application);
        Self::apply_proxy_env_overrides(&mut settings.proxy);
        Self::apply_session_env_overrides(&mut settings.session);
        Self::apply_cache_env_overrides(&mut settings.cache);
        Self::apply_security_env_overrides(&mut settings.security);
        Self::apply_logging_env_overrides(&mut settings.logging);
    }

    fn apply_application_env_overrides(app_settings: &mut ApplicationSettings) {
        Self::apply_string_env_override("HOST", &mut app_settings.host);
        if let Some(port) = Self::parsed_env::<u16>("PORT") {
            app_settings.port = port;
        }
        Self::apply_string_env_override("PROXY_BASE_URL", &mut app_settings.public_base_url);
        Self::apply_string_env_override("CORS_ORIGINS", &mut app_settings.cors_origins);
    }

    fn apply_proxy_env_overrides(proxy_settings: &mut ProxySettings) {
        Self::apply_string_env_override("UPSTREAM_URL", &mut proxy_settings.upstream_url);
        Self::apply_string_env_override("TARGET_BASE_URL", &mut proxy_settings.upstream_url);
        Self::apply_numeric_env_override(
            "REQUEST_TIMEOUT_SECONDS",
            &mut proxy_settings.request_timeout_seconds,
        );
        if let Some(follow) = Self::parsed_env::<bool>("FOLLOW_REDIRECTS") {
            proxy_settings.follow_redirects = follow;
        }
        Self::apply_string_env_override("PROXY_FALLBACK", &mut proxy_settings.fallback);
        if let Some(rewrite) = Self::parsed_env::<bool>("REWRITE_HTML") {
            proxy_settings.rewrite_html = rewrite;
        }
    }

    /// Apply environment overrides for session settings
    pub fn apply_session_env_overrides(session_settings: &mut SessionSettings) {
        Self::apply_numeric_env_override("SESSION_TTL_SECONDS", &mut session_settings.ttl_seconds);
        Self::apply_numeric_env_override(
            "COOKIE_FILE_MAX_AGE_HOURS",
            &mut session_settings.cookie_file_max_age_hours,
        );
        Self::apply_string_env_override("SESSION_ACQUIRER", &mut session_settings.acquirer);
        Self::apply_string_env_override("COOKIE_FILE", &mut session_settings.cookie_file);
        Self::apply_string_env_override(
            "SESSION_COOKIE_STRING",
            &mut session_settings.cookie_string,
        );
    }

    fn apply_cache_env_overrides(cache_settings: &mut CacheSettings) {
        if let Some(enabled) = Self::parsed_env::<bool>("CACHE_ENABLED") {
            cache_settings.enabled = enabled;
        }
        Self::apply_numeric_env_override("CACHE_TTL_SECONDS", &mut cache_settings.ttl_seconds);
        if let Some(capacity) = Self::parsed_env::<usize>("CACHE_CAPACITY") {
            cache_settings.capacity = capacity;
        }
    }

    fn apply_security_env_overrides(security_settings: &mut SecuritySettings) {
        Self::apply_string_env_override("ADMIN_API_KEY", &mut security_settings.admin_key);
        Self::apply_string_env_override("API_KEY", &mut security_settings.api_key);
    }

    fn apply_logging_env_overrides(logging_settings: &mut LoggingSettings) {
        Self::apply_string_env_override("RUST_LOG", &mut logging_settings.level);
    }

    /// Helper function to apply numeric environment variable overrides
    fn apply_numeric_env_override(env_var: &str, target: &mut u64) {
        if let Some(value) = Self::parsed_env::<u64>(env_var) {
            *target = value;
        }
    }

    /// Non-empty environment values replace the current setting
    fn apply_string_env_override(env_var: &str, target: &mut String) {
        if let Ok(value) = std::env::var(env_var) {
            if !value.is_empty() {
                *target = value;
            }
        }
    }

    fn parsed_env<T: std::str::FromStr>(env_var: &str) -> Option<T> {
        std::env::var(env_var).ok()?.trim().parse::<T>().ok()
    }

    /// Load environment variables from .env file
    fn load_env_file() {
        if let Ok(contents) = std::fs::read_to_string(".env") {
            for line in contents.lines() {
                let line = line.trim();
                if line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    std::env::set_var(key.trim(), value.trim());
                }
            }
        }
    }

    /// Check the settings that the gateway cannot run without
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream URL is missing or invalid, or if the
    /// acquirer or fallback kind is unknown
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.proxy.upstream_url.trim().is_empty() {
            return Err(SettingsError::Invalid(
                "proxy.upstream_url (UPSTREAM_URL) is required".to_string(),
            ));
        }
        let upstream = self.upstream_base()?;
        if upstream.host_str().is_none() {
            return Err(SettingsError::Invalid(format!(
                "upstream URL has no host: {upstream}"
            )));
        }
        if !matches!(
            self.session.acquirer.as_str(),
            "manual" | "login_form" | "command" | "file"
        ) {
            return Err(SettingsError::Invalid(format!(
                "unknown session.acquirer '{}'",
                self.session.acquirer
            )));
        }
        if self.session.acquirer == "command" && self.session.acquire_command.is_empty() {
            return Err(SettingsError::Invalid(
                "session.acquire_command is required for the command acquirer".to_string(),
            ));
        }
        if !matches!(self.proxy.fallback.as_str(), "slow" | "none") {
            return Err(SettingsError::Invalid(format!(
                "unknown proxy.fallback '{}'",
                self.proxy.fallback
            )));
        }
        if !self.application.public_base_url.is_empty() {
            Url::parse(&self.application.public_base_url).map_err(|e| {
                SettingsError::Invalid(format!("invalid public_base_url: {e}"))
            })?;
        }
        Ok(())
    }

    /// Parsed upstream base URL
    ///
    /// # Errors
    ///
    /// Returns an error if `proxy.upstream_url` is not an absolute URL
    pub fn upstream_base(&self) -> Result<Url, SettingsError> {
        let mut url = Url::parse(self.proxy.upstream_url.trim())
            .map_err(|e| SettingsError::Invalid(format!("invalid upstream URL: {e}")))?;
        // Joined paths must land below the base path, not replace its last segment
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    /// Host name of the upstream, used to scope manually supplied cookies
    #[must_use]
    pub fn upstream_host(&self) -> String {
        self.upstream_base()
            .ok()
            .and_then(|url| url.host_str().map(ToString::to_string))
            .unwrap_or_default()
    }

    /// Get the bind address for the server
    #[must_use]
    pub fn get_bind_address(&self) -> String {
        format!("{}:{}", self.application.host, self.application.port)
    }

    /// Get CORS origins as a vector of strings
    #[must_use]
    pub fn get_cors_origins(&self) -> Vec<String> {
        self.application
            .cors_origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}
