//! Session metadata and the persisted last-known-good cookie file

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::cookies::CookieSet;

/// Where the current cookie set came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    /// Produced by the configured `CookieAcquirer`
    Automated,
    /// Supplied by an operator or loaded from the persisted file
    Manual,
}

/// Metadata describing the current session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    pub acquired_at: DateTime<Utc>,
    pub ttl: Duration,
    pub source: SessionSource,
    /// Set while a refresh for this session is running
    pub refreshing: bool,
}

impl SessionMetadata {
    #[must_use]
    pub fn new(source: SessionSource, ttl: Duration) -> Self {
        Self {
            acquired_at: Utc::now(),
            ttl,
            source,
            refreshing: false,
        }
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.acquired_at + self.ttl
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired_at).max(Duration::zero())
    }

    #[must_use]
    pub fn ttl_remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at() - now).max(Duration::zero())
    }
}

/// On-disk format of the persisted cookie file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedCookies {
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub cookies: CookieSet,
}

/// Reads and writes the last-known-good cookie file
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    max_age: Duration,
    upstream_url: String,
    upstream_host: String,
}

impl SessionStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, max_age: Duration, upstream_url: &str) -> Self {
        let upstream_host = url::Url::parse(upstream_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            path: path.into(),
            max_age,
            upstream_url: upstream_url.to_string(),
            upstream_host,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted cookie set if it exists, is non-empty and is younger than the max age
    ///
    /// Cookies without a domain are bound to the upstream host.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, unreadable, malformed, empty or too old
    pub async fn load(&self) -> Result<CookieSet> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("cookie file {} not readable", self.path.display()))?;
        let persisted: PersistedCookies = serde_json::from_str(&raw)
            .with_context(|| format!("cookie file {} is malformed", self.path.display()))?;

        let age = Utc::now() - persisted.timestamp;
        if age > self.max_age {
            return Err(anyhow!(
                "cookie file is {} hours old, limit is {} hours",
                age.num_hours(),
                self.max_age.num_hours()
            ));
        }
        if persisted.cookies.is_empty() {
            return Err(anyhow!("cookie file contains no cookies"));
        }
        Ok(persisted.cookies.scoped_to(&self.upstream_host))
    }

    /// Persist a cookie set, replacing the previous file atomically
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be serialized or written
    pub async fn save(&self, cookies: &CookieSet) -> Result<()> {
        let persisted = PersistedCookies {
            timestamp: Utc::now(),
            url: self.upstream_url.clone(),
            cookies: cookies.clone(),
        };
        let json = serde_json::to_string_pretty(&persisted)?;

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json)
            .await
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
