//! Session Manager - single owner of the shared upstream session
//!
//! The `SessionManager` is the only place an [`AuthenticatedClient`] is created
//! or replaced. It is constructed once at startup and injected into handlers.
//!
//! ## Refresh model
//!
//! - Expiry is checked lazily on `get_client()`; there is no background timer.
//! - At most one refresh runs at a time. The first caller that needs one spawns
//!   the refresh task and every other caller subscribes to the same `watch`
//!   channel, so N concurrent callers cause exactly one acquisition.
//! - The refresh runs as a detached task: a caller that goes away does not
//!   cancel it and the result still serves the remaining waiters.
//! - The session lock is released while the acquirer runs and re-taken for the
//!   swap, which also flushes the `ResponseCache`.
//! - A refresh that finishes after an operator installed cookies keeps the
//!   operator's session instead of swapping its own in.
//! - A [`ClientLease`] pairs a client with the cache epoch read under the
//!   session lock, so responses fetched with a replaced client are never cached.
//!
//! ## Organization
//!
//! 1. **Types** - status values and shared state
//! 2. **Construction** - builder and accessors
//! 3. **Client Access** - `get_client`, `force_refresh`, `update_cookies`
//! 4. **Refresh** - the detached refresh task
//! 5. **Status** - side-effect free status reporting
//! 6. **Tests**

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use super::acquirer::{build_acquirer, CookieAcquirer, CredentialSource, EnvCredentialSource};
use super::client::{AuthenticatedClient, ClientOptions};
use super::cookies::CookieSet;
use super::store::{SessionMetadata, SessionSource, SessionStore};
use crate::cache::ResponseCache;
use crate::error::ProxyError;
use crate::settings::GatewaySettings;

// =============================================================================
// Types
// =============================================================================

/// Result published by a refresh task; `None` until it completes
type RefreshOutcome = Option<Result<ClientLease, ProxyError>>;

/// A client together with the cache epoch that was current when it was handed out
#[derive(Clone)]
pub struct ClientLease {
    pub client: Arc<AuthenticatedClient>,
    /// Pass to `ResponseCache::insert`; a later session swap invalidates it
    pub cache_epoch: u64,
}

/// Coarse session state reported by `status()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NoSession,
    Active,
    Expired,
}

/// Snapshot returned by `SessionManager::status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub age_seconds: Option<i64>,
    pub ttl_remaining_seconds: Option<i64>,
    pub cookie_count: usize,
    pub source: Option<SessionSource>,
    pub refreshing: bool,
}

/// Everything guarded by the session lock
#[derive(Default)]
struct ManagerState {
    current: Option<Arc<AuthenticatedClient>>,
    metadata: Option<SessionMetadata>,
    in_flight: Option<watch::Receiver<RefreshOutcome>>,
    generation: u64,
}

struct Inner {
    acquirer: Arc<dyn CookieAcquirer>,
    credentials: Arc<dyn CredentialSource>,
    store: SessionStore,
    cache: Arc<ResponseCache>,
    client_options: ClientOptions,
    ttl: chrono::Duration,
    state: Mutex<ManagerState>,
}

/// Owner of the one current `AuthenticatedClient`
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

// =============================================================================
// 1. Construction
// =============================================================================

/// Builder for `SessionManager`
pub struct SessionManagerBuilder {
    acquirer: Arc<dyn CookieAcquirer>,
    store: SessionStore,
    credentials: Option<Arc<dyn CredentialSource>>,
    cache: Option<Arc<ResponseCache>>,
    client_options: ClientOptions,
    ttl: chrono::Duration,
}

impl SessionManagerBuilder {
    /// Credential source used by acquirers that need one
    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Cache flushed on every successful refresh
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_client_options(mut self, options: ClientOptions) -> Self {
        self.client_options = options;
        self
    }

    /// Session lifetime before a lazy refresh
    #[must_use]
    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn build(self) -> SessionManager {
        let credentials = self.credentials.unwrap_or_else(|| {
            Arc::new(EnvCredentialSource::new("UPSTREAM_USERNAME", "UPSTREAM_PASSWORD"))
        });
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(ResponseCache::disabled()));

        log::info!(
            "✅ Session manager ready (acquirer: {}, ttl: {}s)",
            self.acquirer.name(),
            self.ttl.num_seconds()
        );

        SessionManager {
            inner: Arc::new(Inner {
                acquirer: self.acquirer,
                credentials,
                store: self.store,
                cache,
                client_options: self.client_options,
                ttl: self.ttl,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }
}

impl SessionManager {
    /// Wire a manager exactly as the settings describe, sharing `cache` with the handlers
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream URL is invalid or the configured
    /// acquirer cannot be constructed
    pub fn from_settings(
        settings: &GatewaySettings,
        cache: Arc<ResponseCache>,
    ) -> anyhow::Result<Self> {
        let session = &settings.session;
        let store = SessionStore::new(
            &session.cookie_file,
            chrono::Duration::hours(i64::try_from(session.cookie_file_max_age_hours)?),
            settings.upstream_base()?.as_str(),
        );
        let acquirer = build_acquirer(settings, &store)?;
        let credentials = Arc::new(EnvCredentialSource::new(
            &session.username_env,
            &session.password_env,
        ));

        Ok(Self::builder(acquirer, store)
            .with_credentials(credentials)
            .with_cache(cache)
            .with_client_options(ClientOptions::from_settings(&settings.proxy))
            .with_ttl(chrono::Duration::seconds(i64::try_from(session.ttl_seconds)?))
            .build())
    }

    /// Start building a manager around the configured acquirer and cookie file
    #[must_use]
    pub fn builder(acquirer: Arc<dyn CookieAcquirer>, store: SessionStore) -> SessionManagerBuilder {
        SessionManagerBuilder {
            acquirer,
            store,
            credentials: None,
            cache: None,
            client_options: ClientOptions::default(),
            ttl: chrono::Duration::hours(1),
        }
    }

    /// The response cache this manager flushes on refresh
    #[must_use]
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.inner.cache
    }

    #[must_use]
    pub fn client_options(&self) -> &ClientOptions {
        &self.inner.client_options
    }

    // =============================================================================
    // 2. Client Access
    // =============================================================================

    /// Return the current client, refreshing first if there is none or it has expired
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::SessionUnavailable` if both acquisition and the
    /// persisted cookie file fail
    pub async fn get_client(&self) -> Result<Arc<AuthenticatedClient>, ProxyError> {
        self.checkout().await.map(|lease| lease.client)
    }

    /// Like `get_client`, also returning the cache epoch the client belongs to
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::SessionUnavailable` if both acquisition and the
    /// persisted cookie file fail
    pub async fn checkout(&self) -> Result<ClientLease, ProxyError> {
        let rx = {
            let mut state = self.inner.state.lock().await;
            if let (Some(client), Some(metadata)) = (&state.current, &state.metadata) {
                if !metadata.is_expired(Utc::now()) {
                    return Ok(self.lease(client));
                }
                log::info!("⏰ Upstream session expired, refreshing");
            }
            self.join_or_start_refresh(&mut state)
        };
        Self::await_refresh(rx).await
    }

    /// Invalidate the current client and refresh, joining a refresh already in flight
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::SessionUnavailable` if the refresh fails
    pub async fn force_refresh(&self) -> Result<Arc<AuthenticatedClient>, ProxyError> {
        let rx = {
            let mut state = self.inner.state.lock().await;
            state.current = None;
            self.join_or_start_refresh(&mut state)
        };
        Self::await_refresh(rx).await.map(|lease| lease.client)
    }

    /// Refresh because the upstream rejected the client of `generation`
    ///
    /// When several requests observe the same dead session, only the first
    /// triggers a refresh; the others get the client that replaced it.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::SessionUnavailable` if the refresh fails
    pub async fn force_refresh_stale(
        &self,
        generation: u64,
    ) -> Result<Arc<AuthenticatedClient>, ProxyError> {
        let rx = {
            let mut state = self.inner.state.lock().await;
            if let Some(current) = &state.current {
                if current.generation() > generation {
                    return Ok(Arc::clone(current));
                }
            }
            state.current = None;
            self.join_or_start_refresh(&mut state)
        };
        Self::await_refresh(rx).await.map(|lease| lease.client)
    }

    /// Persist an operator-supplied cookie set and install it as the session
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Internal` if a client cannot be built for the cookies
    pub async fn update_cookies(&self, cookies: CookieSet) -> Result<SessionStatus, ProxyError> {
        if let Err(e) = self.inner.store.save(&cookies).await {
            log::warn!("⚠️ Failed to persist manual cookies: {e:#}");
        }

        let mut state = self.inner.state.lock().await;
        self.install(&mut state, cookies, SessionSource::Manual)?;
        log::info!("🍪 Installed manually supplied session cookies");
        Ok(Self::snapshot(&state))
    }

    /// Whether a client is currently installed
    pub async fn has_session(&self) -> bool {
        self.inner.state.lock().await.current.is_some()
    }

    fn join_or_start_refresh(&self, state: &mut ManagerState) -> watch::Receiver<RefreshOutcome> {
        if let Some(rx) = &state.in_flight {
            // A closed channel means the task died without publishing
            if rx.has_changed().is_ok() {
                log::debug!("Joining in-flight session refresh");
                return rx.clone();
            }
        }

        let (tx, rx) = watch::channel(None);
        state.in_flight = Some(rx.clone());
        if let Some(metadata) = state.metadata.as_mut() {
            metadata.refreshing = true;
        }

        let manager = self.clone();
        let started = state.generation;
        tokio::spawn(async move { manager.run_refresh(tx, started).await });
        rx
    }

    async fn await_refresh(mut rx: watch::Receiver<RefreshOutcome>) -> Result<ClientLease, ProxyError> {
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|published| (*published).clone());
        match outcome {
            Ok(Some(result)) => result,
            _ => Err(ProxyError::SessionUnavailable(
                "Session refresh was abandoned".to_string(),
            )),
        }
    }

    // =============================================================================
    // 3. Refresh
    // =============================================================================

    /// `started` is the generation that was current when the refresh began
    async fn run_refresh(self, tx: watch::Sender<RefreshOutcome>, started: u64) {
        log::info!("🔄 Refreshing upstream session via '{}'", self.inner.acquirer.name());
        let acquired = self.acquire_cookies().await;

        let (outcome, persist) = {
            let mut state = self.inner.state.lock().await;
            state.in_flight = None;
            if let Some(metadata) = state.metadata.as_mut() {
                metadata.refreshing = false;
            }
            let superseded = state.generation != started;
            match state.current.clone().filter(|_| superseded) {
                Some(current) => {
                    log::info!(
                        "Session replaced during refresh, keeping generation {}",
                        current.generation()
                    );
                    (Ok(self.lease(&current)), None)
                }
                None => {
                    let (outcome, persist) = match acquired {
                        Ok((cookies, source)) => {
                            let persist =
                                (source == SessionSource::Automated).then(|| cookies.clone());
                            (self.install(&mut state, cookies, source), persist)
                        }
                        Err(e) => (Err(e), None),
                    };
                    if outcome.is_err() {
                        state.current = None;
                        state.metadata = None;
                    }
                    (outcome, persist)
                }
            }
        };

        match &outcome {
            Ok(lease) => log::info!(
                "✅ Upstream session ready (generation {}, {} cookies)",
                lease.client.generation(),
                lease.client.cookies().len()
            ),
            Err(e) => log::error!("❌ Session refresh failed: {e}"),
        }
        if let (Some(cookies), Ok(_)) = (persist, &outcome) {
            if let Err(e) = self.inner.store.save(&cookies).await {
                log::warn!("⚠️ Failed to persist acquired cookies: {e:#}");
            }
        }
        if tx.send(Some(outcome)).is_err() {
            log::debug!("Session refresh finished with no waiters left");
        }
    }

    /// Run the acquirer, falling back to the persisted cookie file
    async fn acquire_cookies(&self) -> Result<(CookieSet, SessionSource), ProxyError> {
        let acquirer = &self.inner.acquirer;

        let primary = if acquirer.requires_credentials() {
            match self.inner.credentials.get_credentials().await {
                Ok(credentials) => acquirer.acquire(Some(&credentials)).await,
                Err(e) => Err(e.into()),
            }
        } else {
            acquirer.acquire(None).await
        };

        match primary {
            Ok(cookies) => Ok((cookies, acquirer.source())),
            Err(acquire_error) => {
                log::warn!("⚠️ Cookie acquisition failed: {acquire_error}");
                match self.inner.store.load().await {
                    Ok(cookies) => {
                        log::info!(
                            "📂 Using persisted cookies from {}",
                            self.inner.store.path().display()
                        );
                        Ok((cookies, SessionSource::Manual))
                    }
                    Err(file_error) => {
                        log::warn!("⚠️ No usable fallback cookie file: {file_error:#}");
                        Err(ProxyError::SessionUnavailable(
                            "Cookie acquisition failed and no usable fallback cookie file exists"
                                .to_string(),
                        ))
                    }
                }
            }
        }
    }

    /// Pair `client` with the current cache epoch; the caller holds the session lock
    fn lease(&self, client: &Arc<AuthenticatedClient>) -> ClientLease {
        ClientLease {
            client: Arc::clone(client),
            cache_epoch: self.inner.cache.epoch(),
        }
    }

    /// Build a client for `cookies` and swap it in; the caller holds the session lock
    fn install(
        &self,
        state: &mut ManagerState,
        cookies: CookieSet,
        source: SessionSource,
    ) -> Result<ClientLease, ProxyError> {
        let generation = state.generation + 1;
        let client = AuthenticatedClient::new(cookies, &self.inner.client_options, generation)
            .map_err(|e| ProxyError::Internal(format!("Failed to build upstream client: {e}")))?;
        let client = Arc::new(client);

        state.generation = generation;
        state.current = Some(Arc::clone(&client));
        let ttl = Self::effective_ttl(self.inner.ttl, client.cookies(), Utc::now());
        state.metadata = Some(SessionMetadata::new(source, ttl));

        let flushed = self.inner.cache.clear();
        if flushed > 0 {
            log::info!("🧹 Flushed {flushed} cached responses after session change");
        }
        Ok(self.lease(&client))
    }

    /// The configured TTL, shortened when a cookie expires before it
    fn effective_ttl(
        ttl: chrono::Duration,
        cookies: &CookieSet,
        now: chrono::DateTime<Utc>,
    ) -> chrono::Duration {
        match cookies.earliest_expiry() {
            Some(expiry) if expiry - now < ttl => (expiry - now).max(chrono::Duration::zero()),
            _ => ttl,
        }
    }

    // =============================================================================
    // 4. Status
    // =============================================================================

    /// Current session status; never triggers a refresh
    pub async fn status(&self) -> SessionStatus {
        let state = self.inner.state.lock().await;
        Self::snapshot(&state)
    }

    fn snapshot(state: &ManagerState) -> SessionStatus {
        let now = Utc::now();
        // Before the first session there is no metadata to carry the flag
        let refreshing = state
            .metadata
            .as_ref()
            .map_or(state.in_flight.is_some(), |metadata| metadata.refreshing);
        match (&state.current, &state.metadata) {
            (Some(client), Some(metadata)) => SessionStatus {
                state: if metadata.is_expired(now) {
                    SessionState::Expired
                } else {
                    SessionState::Active
                },
                age_seconds: Some(metadata.age(now).num_seconds()),
                ttl_remaining_seconds: Some(metadata.ttl_remaining(now).num_seconds()),
                cookie_count: client.cookies().len(),
                source: Some(metadata.source),
                refreshing,
            },
            _ => SessionStatus {
                state: SessionState::NoSession,
                age_seconds: None,
                ttl_remaining_seconds: None,
                cookie_count: 0,
                source: None,
                refreshing,
            },
        }
    }
}
