#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

/// Version of the sessiongate application
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cache;
pub mod error;
pub mod forwarding;
pub mod handlers;
pub mod models;
pub mod session;
pub mod settings;
pub mod utils;

// Testing utilities - available for unit tests and integration tests
#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Re-export commonly used items
pub use cache::ResponseCache;
pub use error::ProxyError;
pub use forwarding::ForwardingEngine;
pub use handlers::configure_services;
pub use session::SessionManager;
pub use settings::GatewaySettings;
