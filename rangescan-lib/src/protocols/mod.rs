//! Network-facing pieces of the scanner.
//!
//! This module contains everything that talks to the outside world: the
//! upstream users API, proxy reachability probes and the proxy suppliers
//! used to fill the pool.

/// Proxy endpoint reachability probe
pub mod probe;

/// Proxy list suppliers (static lists and public scrapers)
pub mod sources;

/// Upstream batch users API client
pub mod users;

// Re-export commonly used functions and types
pub use probe::probe_endpoint;
#[cfg(feature = "scrape")]
pub use sources::{extract_proxy_tokens, ScrapeSupplier};
pub use sources::{ProxySupplier, StaticSupplier};
pub use users::{parse_users_response, UsersApi};
