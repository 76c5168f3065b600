//! Short-TTL response cache for idempotent upstream fetches
//!
//! Entries are keyed by `(method, normalized URL)`. The cache is flushed
//! wholesale whenever the upstream session is replaced. Every flush advances
//! an epoch; a fetch records the epoch before it starts and its insert is
//! dropped if a flush happened meanwhile, so a response fetched under an old
//! session can never be stored after the refresh that replaced it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use actix_web::web::Bytes;
use reqwest::Method;
use url::Url;

use crate::settings::CacheSettings;

/// Cache key: method plus normalized absolute URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: Method,
    url: String,
}

impl CacheKey {
    /// Build a key, normalizing the URL (scheme/host case, default port, fragment)
    #[must_use]
    pub fn new(method: Method, url: &Url) -> Self {
        let mut normalized = url.clone();
        normalized.set_fragment(None);
        Self {
            method,
            url: normalized.to_string(),
        }
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Only GET and HEAD responses may be cached
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }
}

/// A cached upstream response, headers already sanitized
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub created_at: Instant,
}

impl CacheEntry {
    #[must_use]
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            created_at: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    epoch: u64,
}

/// Response cache guarded by its own lock, independent of the session lock
#[derive(Debug)]
pub struct ResponseCache {
    enabled: bool,
    ttl: Duration,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl ResponseCache {
    #[must_use]
    pub fn new(enabled: bool, ttl: Duration, capacity: usize) -> Self {
        Self {
            enabled: enabled && capacity > 0 && !ttl.is_zero(),
            ttl,
            capacity,
            state: Mutex::new(CacheState::default()),
        }
    }

    #[must_use]
    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(
            settings.enabled,
            Duration::from_secs(settings.ttl_seconds),
            settings.capacity,
        )
    }

    /// A cache that stores nothing
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(false, Duration::ZERO, 0)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    // The lock is never held across an await, so a poisoned state is still consistent
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return a live entry for `key`, dropping it if it has expired
    #[must_use]
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        if !self.enabled || !key.is_cacheable() {
            return None;
        }
        let mut state = self.lock();
        let expired = match state.entries.get(key) {
            Some(entry) if entry.created_at.elapsed() < self.ttl => {
                log::debug!("📋 Cache hit: {} {}", key.method, key.url);
                return Some(entry.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.entries.remove(key);
        }
        None
    }

    /// Store a response fetched while the cache was at `epoch`
    ///
    /// Returns whether the entry was stored. Non-cacheable methods, non-2xx
    /// statuses and inserts from before the latest flush are dropped.
    pub fn insert(&self, key: CacheKey, entry: CacheEntry, epoch: u64) -> bool {
        if !self.enabled || !key.is_cacheable() || !(200..300).contains(&entry.status) {
            return false;
        }
        let mut state = self.lock();
        if state.epoch != epoch {
            log::debug!("Dropping cache insert for {} from a previous session", key.url);
            return false;
        }

        if !state.entries.contains_key(&key) && state.entries.len() >= self.capacity {
            Self::evict_oldest(&mut state);
        }
        state.entries.insert(key, entry);
        true
    }

    fn evict_oldest(state: &mut CacheState) {
        let oldest = state
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.created_at)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            state.entries.remove(&key);
        }
    }

    /// Drop every entry and advance the epoch; returns how many entries were removed
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let removed = state.entries.len();
        state.entries.clear();
        state.epoch += 1;
        removed
    }

    /// Current flush epoch, captured before a fetch starts
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(method: Method, url: &str) -> CacheKey {
        CacheKey::new(method, &Url::parse(url).unwrap())
    }

    fn entry(status: u16, body: &'static str) -> CacheEntry {
        CacheEntry::new(
            status,
            vec![("content-type".to_string(), "text/plain".to_string())],
            Bytes::from_static(body.as_bytes()),
        )
    }

    #[test]
    fn test_lookup_returns_identical_entry() {
        let cache = ResponseCache::new(true, Duration::from_secs(60), 10);
        let k = key(Method::GET, "https://app.example.com/items?page=2");
        assert!(cache.insert(k.clone(), entry(200, "items"), cache.epoch()));

        let hit = cache.lookup(&k).expect("cache hit");
        assert_eq!(hit.status, 200);
        assert_eq!(hit.body, Bytes::from_static(b"items"));
        assert_eq!(hit.headers, entry(200, "items").headers);
    }

    #[test]
    fn test_entries_expire() {
        let cache = ResponseCache::new(true, Duration::from_millis(30), 10);
        let k = key(Method::GET, "https://app.example.com/");
        cache.insert(k.clone(), entry(200, "home"), cache.epoch());
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.lookup(&k).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_only_successful_idempotent_responses_stored() {
        let cache = ResponseCache::new(true, Duration::from_secs(60), 10);
        let epoch = cache.epoch();
        assert!(!cache.insert(key(Method::POST, "https://a.test/x"), entry(200, "x"), epoch));
        assert!(!cache.insert(key(Method::GET, "https://a.test/y"), entry(404, "y"), epoch));
        assert!(!cache.insert(key(Method::GET, "https://a.test/z"), entry(302, "z"), epoch));
        assert!(cache.insert(key(Method::HEAD, "https://a.test/h"), entry(204, ""), epoch));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_oldest_entry_evicted_at_capacity() {
        let cache = ResponseCache::new(true, Duration::from_secs(60), 2);
        let epoch = cache.epoch();
        cache.insert(key(Method::GET, "https://a.test/1"), entry(200, "1"), epoch);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(key(Method::GET, "https://a.test/2"), entry(200, "2"), epoch);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(key(Method::GET, "https://a.test/3"), entry(200, "3"), epoch);

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&key(Method::GET, "https://a.test/1")).is_none());
        assert!(cache.lookup(&key(Method::GET, "https://a.test/3")).is_some());
    }

    #[test]
    fn test_clear_drops_entries_and_stale_inserts() {
        let cache = ResponseCache::new(true, Duration::from_secs(60), 10);
        let before = cache.epoch();
        cache.insert(key(Method::GET, "https://a.test/a"), entry(200, "a"), before);

        assert_eq!(cache.clear(), 1);
        assert!(cache.lookup(&key(Method::GET, "https://a.test/a")).is_none());

        // A fetch that started before the flush must not repopulate the cache
        assert!(!cache.insert(key(Method::GET, "https://a.test/b"), entry(200, "b"), before));
        assert!(cache.insert(key(Method::GET, "https://a.test/b"), entry(200, "b"), cache.epoch()));
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let cache = ResponseCache::disabled();
        let k = key(Method::GET, "https://a.test/");
        assert!(!cache.insert(k.clone(), entry(200, "x"), cache.epoch()));
        assert!(cache.lookup(&k).is_none());
    }

    #[test]
    fn test_key_normalization() {
        assert_eq!(
            key(Method::GET, "HTTPS://App.Example.com:443/a?b=1#frag"),
            key(Method::GET, "https://app.example.com/a?b=1")
        );
        assert_ne!(
            key(Method::GET, "https://app.example.com/a?b=1"),
            key(Method::GET, "https://app.example.com/a?b=2")
        );
    }
}
