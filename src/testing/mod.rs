//! Testing utilities for sessiongate
//!
//! Compiled for unit tests and, with the `testing` feature, for the
//! integration tests under `tests/`.
//!
//! ## Organization
//!
//! - [`fixtures`] - Pre-built cookies, settings, stores and upstream responses
//! - [`mock`] - Fake acquirers and dispatchers that record how they were used
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sessiongate::testing::{fixtures::TestFixtures, mock::CountingAcquirer};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let acquirer = Arc::new(CountingAcquirer::new().with_delay(Duration::from_millis(50)));
//! let sessions = SessionManager::builder(acquirer.clone(), TestFixtures::session_store(dir.path()))
//!     .build();
//! ```

pub mod fixtures;
pub mod mock;

pub use fixtures::TestFixtures;
pub use mock::{CountingAcquirer, ScriptedDispatcher};

/// Common test constants
pub mod constants {
    /// Upstream used by fixtures
    pub const TEST_UPSTREAM: &str = "https://app.example.com/";

    /// Host the fixture cookies are scoped to
    pub const TEST_UPSTREAM_HOST: &str = "app.example.com";

    /// Client key configured by `TestFixtures::settings`
    pub const TEST_API_KEY: &str = "test-client-key";

    /// Operator key configured by `TestFixtures::settings`
    pub const TEST_ADMIN_KEY: &str = "test-admin-key";

    /// Session cookie handed out by `CountingAcquirer`
    pub const TEST_SESSION_COOKIE: &str = "sid";
}
