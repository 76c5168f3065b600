//! Fake acquirers and dispatchers for isolated tests

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::fixtures::TestFixtures;
use crate::forwarding::{DispatchError, Dispatcher, UpstreamRequest, UpstreamResponse};
use crate::session::{AcquisitionError, AuthenticatedClient, CookieAcquirer, CookieSet, Credentials};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ===============================
// ACQUIRER
// ===============================

/// Acquirer that counts calls and can be slowed down or made to fail
///
/// The n-th successful call returns a `sid` cookie with value `session-n`.
#[derive(Debug, Default)]
pub struct CountingAcquirer {
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Option<Duration>,
}

impl CountingAcquirer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An acquirer whose every call fails
    #[must_use]
    pub fn failing() -> Self {
        let acquirer = Self::default();
        acquirer.set_failing(true);
        acquirer
    }

    /// Sleep this long inside every call
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `acquire` calls so far
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CookieAcquirer for CountingAcquirer {
    async fn acquire(&self, _credentials: Option<&Credentials>) -> Result<CookieSet, AcquisitionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AcquisitionError::Failed("scripted acquisition failure".to_string()));
        }
        Ok(TestFixtures::cookie_set_with_value(&format!("session-{call}")))
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

// ===============================
// DISPATCHER
// ===============================

/// What a `ScriptedDispatcher` saw for one call
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request: UpstreamRequest,
    pub cookie_header: Option<String>,
    pub generation: u64,
}

/// Dispatcher that replays queued outcomes and records every request
///
/// With an empty script it answers `200 ok`.
#[derive(Debug, Default)]
pub struct ScriptedDispatcher {
    script: Mutex<VecDeque<Result<UpstreamResponse, DispatchError>>>,
    recorded: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: UpstreamResponse) {
        lock(&self.script).push_back(Ok(response));
    }

    pub fn push_error(&self, error: DispatchError) {
        lock(&self.script).push_back(Err(error));
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        lock(&self.recorded).len()
    }

    /// Session generation used for each call, in order
    #[must_use]
    pub fn generations(&self) -> Vec<u64> {
        lock(&self.recorded).iter().map(|r| r.generation).collect()
    }

    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.recorded).clone()
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn dispatch(
        &self,
        client: &AuthenticatedClient,
        request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, DispatchError> {
        lock(&self.recorded).push(RecordedRequest {
            request: request.clone(),
            cookie_header: client.cookie_header(&request.url),
            generation: client.generation(),
        });
        let scripted = lock(&self.script).pop_front();
        scripted.unwrap_or_else(|| {
            Ok(TestFixtures::response(200, &[("content-type", "text/plain")], "ok"))
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
