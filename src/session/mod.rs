//! Shared upstream session
//!
//! # Modules
//!
//! - [`cookies`] - cookie set model and parsing
//! - [`store`] - session metadata and the persisted cookie file
//! - [`client`] - connection pool bound to one cookie set
//! - [`acquirer`] - credential and cookie acquisition seams
//! - [`manager`] - single-flight owner of the current client

pub mod acquirer;
pub mod client;
pub mod cookies;
pub mod manager;
pub mod store;

pub use acquirer::{
    build_acquirer, AcquisitionError, CookieAcquirer, CredentialSource, Credentials,
    CredentialsError, EnvCredentialSource,
};
pub use client::{AuthenticatedClient, ClientOptions};
pub use cookies::{CookieParseError, CookieSet, SameSite, SessionCookie};
pub use manager::{ClientLease, SessionManager, SessionState, SessionStatus};
pub use store::{PersistedCookies, SessionMetadata, SessionSource, SessionStore};
