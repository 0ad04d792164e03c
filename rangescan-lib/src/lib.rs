//! # Rangescan Library
//!
//! Verifies contiguous identifier ranges against a rate-limited batch users
//! API by spreading the work over many public proxies.
//!
//! The library provides a lock-bounded shared list, a self-refilling proxy
//! pool, a per-batch retry state machine and a range engine that ties them
//! together with explicit cancellation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rangescan_lib::{
//!     ClientConfig, PoolConfig, ProxiedClientFactory, ProxyPool, RangeScanner, RefillConfig,
//!     ScanConfig, StaticSupplier,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let supplier = Arc::new(StaticSupplier::from_file("proxies.txt")?);
//!     let pool = ProxyPool::from_endpoints(supplier.endpoints().to_vec(), PoolConfig::default());
//!     let factory = Arc::new(ProxiedClientFactory::new(
//!         pool,
//!         supplier,
//!         ClientConfig::default(),
//!         RefillConfig::default(),
//!     ));
//!
//!     let scanner = RangeScanner::new(factory, ScanConfig::default());
//!     let records = scanner.verify(1, 601, 4, true).await?;
//!     println!("{} users found", records.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Bounded waits**: every shared-state operation gives up after a timeout
//! - **Proxy rotation**: rate limits escalate, then rotate to a fresh proxy
//! - **Self-refilling pool**: one refill at a time, other callers wait for it
//! - **Cancellation**: every blocking point observes a `CancellationToken`
//! - **Partial results**: failed batches are reported, never dropped

// Re-export main public API types and functions
// This makes them available as rangescan_lib::TypeName
pub use batch::{BatchOutcome, BatchVerifier, RateLimitAction, RateLimitTracker};
pub use concurrent::{BoundedConcurrentList, DEFAULT_LOCK_TIMEOUT};
pub use config::{
    load_env_config, validate_workers, ConfigManager, EnvConfig, FileConfig, ProxiesSection,
    RetrySection, ScanSection, MAX_WORKERS,
};
pub use engine::{ProgressSnapshot, RangeScanner, ScanProgress};
pub use error::ScanError;
pub use factory::{ProxiedClient, ProxiedClientFactory};
pub use partition::{PartitionPlan, Shard};
pub use pool::{ProxyPool, VerifySummary};
pub use protocols::{probe_endpoint, parse_users_response, ProxySupplier, StaticSupplier, UsersApi};
#[cfg(feature = "scrape")]
pub use protocols::{extract_proxy_tokens, ScrapeSupplier};
pub use types::{
    BatchFailure, BatchStats, ClientConfig, IdentifierBatch, MinimalUserRecord, PoolConfig,
    ProxyEndpoint, RefillConfig, RetryPolicy, ScanConfig, ScanReport, ScanRequest, ScanStats,
    VerificationResult, DEFAULT_UNIT_SIZE, DEFAULT_USERS_ENDPOINT, MAX_BATCH_SIZE,
    MAX_PROXY_TOKEN_LEN, MAX_RANGE_SPAN,
};
pub use utils::{
    parse_duration_string, parse_proxy_list, parse_proxy_token, validate_default_range,
    validate_range,
};

// Public modules
pub mod protocols;

// Internal modules - these are not part of the public API
mod batch;
mod concurrent;
mod config;
mod engine;
mod error;
mod factory;
mod partition;
mod pool;
mod types;
mod utils;

// Type alias for convenience
pub type Result<T> = std::result::Result<T, ScanError>;

// Library version and metadata
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AUTHOR: &str = env!("CARGO_PKG_AUTHORS");

/// Get library information for debugging or display purposes.
pub fn info() -> LibraryInfo {
    LibraryInfo {
        version: VERSION,
        author: AUTHOR,
        features: get_enabled_features(),
    }
}

/// Information about the library build and features
#[derive(Debug, Clone)]
pub struct LibraryInfo {
    pub version: &'static str,
    pub author: &'static str,
    pub features: Vec<&'static str>,
}

/// Get list of enabled features at compile time
#[allow(clippy::vec_init_then_push)]
fn get_enabled_features() -> Vec<&'static str> {
    let mut features = Vec::new();

    #[cfg(feature = "scrape")]
    features.push("scrape");

    features
}
