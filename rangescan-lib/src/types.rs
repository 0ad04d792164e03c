//! Core data types for range scanning.
//!
//! This module defines the data model shared by every component: proxy
//! endpoints, upstream request/response records, run configuration and the
//! aggregated report handed back to callers.

use crate::error::ScanError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Hard ceiling on identifiers per upstream call.
pub const MAX_BATCH_SIZE: usize = 60;

/// Default coarse-unit size used only to balance shards across workers.
pub const DEFAULT_UNIT_SIZE: usize = 75;

/// Widest range the command layer accepts (`high - low`).
pub const MAX_RANGE_SPAN: i64 = 30_000;

/// Longest `host:port` token worth parsing (`255.255.255.255:65535`).
pub const MAX_PROXY_TOKEN_LEN: usize = 21;

/// Batch users endpoint of the upstream API.
pub const DEFAULT_USERS_ENDPOINT: &str = "https://users.roblox.com/v1/users";

/// A proxy endpoint drawn from the pool.
///
/// Endpoints are consumed, never returned: once drawn they leave the pool
/// whether or not the request made through them succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    /// Create a new endpoint.
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// URL form understood by `reqwest::Proxy`.
    pub fn proxy_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for ProxyEndpoint {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        crate::utils::parse_proxy_token(s)
            .ok_or_else(|| ScanError::config(format!("'{}' is not a valid host:port proxy", s)))
    }
}

/// Outcome of probing one endpoint during bulk verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub host: String,
    pub port: u16,
    pub success: bool,
}

impl VerificationResult {
    pub fn endpoint(&self) -> ProxyEndpoint {
        ProxyEndpoint::new(self.host.clone(), self.port)
    }
}

/// Request body for one upstream call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierBatch {
    #[serde(rename = "userIds")]
    pub ids: Vec<i64>,

    #[serde(rename = "excludeBannedUsers")]
    pub exclude_banned: bool,
}

impl IdentifierBatch {
    /// Build a batch, refusing anything over [`MAX_BATCH_SIZE`].
    pub fn new(ids: Vec<i64>, exclude_banned: bool) -> Result<Self, ScanError> {
        if ids.is_empty() || ids.len() > MAX_BATCH_SIZE {
            return Err(ScanError::internal(format!(
                "batch must hold 1..={} identifiers, got {}",
                MAX_BATCH_SIZE,
                ids.len()
            )));
        }
        Ok(Self {
            ids,
            exclude_banned,
        })
    }

    pub fn first_id(&self) -> i64 {
        self.ids.first().copied().unwrap_or_default()
    }

    pub fn last_id(&self) -> i64 {
        self.ids.last().copied().unwrap_or_default()
    }
}

/// One user confirmed by the upstream API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimalUserRecord {
    #[serde(rename = "displayName", default)]
    pub display_name: String,

    #[serde(rename = "name", default)]
    pub username: String,

    pub id: i64,

    #[serde(rename = "hasVerifiedBadge", default)]
    pub has_verified_badge: bool,
}

/// Proxy pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How long every list operation waits for its lock
    /// Default: 5 seconds
    pub lock_timeout: Duration,

    /// First delay when a draw loses the lock race; doubles up to `draw_backoff_max`
    /// Default: 100ms
    pub draw_backoff: Duration,

    /// Upper bound for the draw backoff
    /// Default: 1 second
    pub draw_backoff_max: Duration,

    /// Budget for connect + handshake when probing an endpoint
    /// Default: 2 seconds
    pub probe_timeout: Duration,

    /// Probes in flight during bulk verification
    /// Default: 256
    pub probe_concurrency: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            draw_backoff: Duration::from_millis(100),
            draw_backoff_max: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(2),
            probe_concurrency: 256,
        }
    }
}

impl PoolConfig {
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the first and the largest delay between contended draws.
    pub fn with_draw_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.draw_backoff = initial;
        self.draw_backoff_max = max.max(initial);
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_probe_concurrency(mut self, concurrency: usize) -> Self {
        self.probe_concurrency = concurrency.max(1);
        self
    }
}

/// Settings for every proxied HTTP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Whole-request timeout (send + receive)
    /// Default: 6 seconds
    pub request_timeout: Duration,

    /// Skip TLS certificate validation.
    ///
    /// Public proxies are low quality and some tamper with TLS; turning this
    /// on trades trust for throughput. Never reuse such a client for trusted
    /// endpoints. Default: false
    pub accept_invalid_certs: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(6),
            accept_invalid_certs: false,
        }
    }
}

impl ClientConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_accept_invalid_certs(mut self, enabled: bool) -> Self {
        self.accept_invalid_certs = enabled;
        self
    }
}

/// How the factory refills an exhausted pool.
#[derive(Debug, Clone)]
pub struct RefillConfig {
    /// Random delay before a caller queues for the refill lock
    /// Default: up to 1.5 seconds
    pub jitter: Duration,

    /// Supplier calls before giving up with `PoolExhausted`
    /// Default: 10
    pub max_attempts: u32,

    /// Pause between supplier calls that yielded nothing
    /// Default: 2 seconds
    pub retry_delay: Duration,

    /// Probe freshly scraped endpoints before publishing them
    /// Default: false
    pub verify: bool,
}

impl Default for RefillConfig {
    fn default() -> Self {
        Self {
            jitter: Duration::from_millis(1500),
            max_attempts: 10,
            retry_delay: Duration::from_secs(2),
            verify: false,
        }
    }
}

impl RefillConfig {
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_verify(mut self, enabled: bool) -> Self {
        self.verify = enabled;
        self
    }
}

/// Retry budget and backoff rules for one batch call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per batch before it is reported as failed (`None` = unbounded)
    /// Default: 40
    pub max_attempts: Option<u32>,

    /// Wall-clock budget per batch (`None` = unbounded)
    /// Default: 10 minutes
    pub max_elapsed: Option<Duration>,

    /// Delay unit for consecutive 429s: the n-th hit waits `n * base`
    /// Default: 5 seconds
    pub rate_limit_base_delay: Duration,

    /// Consecutive 429s on one proxy before it is rotated away
    /// Default: 3
    pub rotate_after: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(40),
            max_elapsed: Some(Duration::from_secs(600)),
            rate_limit_base_delay: Duration::from_secs(5),
            rotate_after: 3,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_attempts = attempts.map(|a| a.max(1));
        self
    }

    pub fn with_max_elapsed(mut self, elapsed: Option<Duration>) -> Self {
        self.max_elapsed = elapsed;
        self
    }

    pub fn with_rate_limit_base_delay(mut self, delay: Duration) -> Self {
        self.rate_limit_base_delay = delay;
        self
    }

    pub fn with_rotate_after(mut self, hits: u32) -> Self {
        self.rotate_after = hits.max(1);
        self
    }
}

/// Configuration for a [`crate::RangeScanner`].
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Upstream batch endpoint
    pub users_endpoint: String,

    /// Coarse unit size for shard balancing
    /// Default: 75
    pub unit_size: usize,

    /// Identifiers per upstream call, clamped to 1..=60
    /// Default: 60
    pub batch_size: usize,

    /// Ask the upstream to leave banned users out
    /// Default: false
    pub exclude_banned: bool,

    /// Random stagger between worker launches
    /// Default: up to 100ms
    pub launch_jitter: Duration,

    /// Pause before retrying an append that hit lock contention
    /// Default: 1 second
    pub append_retry_delay: Duration,

    /// Per-batch retry rules
    pub retry: RetryPolicy,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            users_endpoint: DEFAULT_USERS_ENDPOINT.to_string(),
            unit_size: DEFAULT_UNIT_SIZE,
            batch_size: MAX_BATCH_SIZE,
            exclude_banned: false,
            launch_jitter: Duration::from_millis(100),
            append_retry_delay: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

impl ScanConfig {
    pub fn with_users_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.users_endpoint = endpoint.into();
        self
    }

    pub fn with_unit_size(mut self, unit_size: usize) -> Self {
        self.unit_size = unit_size.max(1);
        self
    }

    /// Set identifiers per call. Capped at the upstream's hard limit of 60.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn with_exclude_banned(mut self, enabled: bool) -> Self {
        self.exclude_banned = enabled;
        self
    }

    pub fn with_launch_jitter(mut self, jitter: Duration) -> Self {
        self.launch_jitter = jitter;
        self
    }

    pub fn with_append_retry_delay(mut self, delay: Duration) -> Self {
        self.append_retry_delay = delay;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// One verification run as requested by the command layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    /// Inclusive lower bound
    pub low: i64,
    /// Exclusive upper bound
    pub high: i64,
    /// Worker count hint
    pub workers: usize,
    /// Shrink the worker count when the range is too small for it
    pub auto_adjust: bool,
}

impl ScanRequest {
    pub fn new(low: i64, high: i64, workers: usize) -> Self {
        Self {
            low,
            high,
            workers,
            auto_adjust: true,
        }
    }

    pub fn with_auto_adjust(mut self, enabled: bool) -> Self {
        self.auto_adjust = enabled;
        self
    }

    pub fn len(&self) -> usize {
        (self.high - self.low).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.high <= self.low
    }

    pub fn identifiers(&self) -> Vec<i64> {
        (self.low..self.high).collect()
    }
}

/// Counters for one batch call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub attempts: u32,
    pub rate_limited: u32,
    pub rotations: u32,
}

/// Counters aggregated across a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub batches_ok: usize,
    pub batches_failed: usize,
    pub attempts: u64,
    pub rate_limited: u64,
    pub rotations: u64,
}

impl ScanStats {
    pub fn record_batch(&mut self, stats: &BatchStats, ok: bool) {
        if ok {
            self.batches_ok += 1;
        } else {
            self.batches_failed += 1;
        }
        self.attempts += u64::from(stats.attempts);
        self.rate_limited += u64::from(stats.rate_limited);
        self.rotations += u64::from(stats.rotations);
    }

    pub fn merge(&mut self, other: &ScanStats) {
        self.batches_ok += other.batches_ok;
        self.batches_failed += other.batches_failed;
        self.attempts += other.attempts;
        self.rate_limited += other.rate_limited;
        self.rotations += other.rotations;
    }
}

/// A batch that never produced a usable response.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub first_id: i64,
    pub last_id: i64,
    pub size: usize,
    pub error: ScanError,
}

/// Everything a run produced, including what it could not finish.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Confirmed records, one per identifier, in completion order
    pub records: Vec<MinimalUserRecord>,
    /// Batches that exhausted their retry budget or were cancelled
    pub failures: Vec<BatchFailure>,
    pub stats: ScanStats,
    /// Worker count actually used after auto-adjustment
    pub workers: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl ScanReport {
    /// True when every batch returned a response.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    /// Identifiers covered by failed batches.
    pub fn failed_identifiers(&self) -> usize {
        self.failures.iter().map(|f| f.size).sum()
    }

    /// Records ordered by identifier, the way results are exported.
    pub fn sorted_by_id(&self) -> Vec<MinimalUserRecord> {
        let mut records = self.records.clone();
        records.sort_by_key(|r| r.id);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_serializes_to_upstream_shape() {
        let batch = IdentifierBatch::new(vec![1, 2, 3], true).unwrap();
        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"userIds": [1, 2, 3], "excludeBannedUsers": true})
        );
    }

    #[test]
    fn test_batch_rejects_oversized() {
        let ids: Vec<i64> = (0..61).collect();
        assert!(IdentifierBatch::new(ids, false).is_err());
        assert!(IdentifierBatch::new(Vec::new(), false).is_err());
        assert!(IdentifierBatch::new((0..60).collect(), false).is_ok());
    }

    #[test]
    fn test_record_field_names() {
        let record: MinimalUserRecord = serde_json::from_str(
            r#"{"displayName":"Builder","name":"builderman","id":156,"hasVerifiedBadge":true}"#,
        )
        .unwrap();
        assert_eq!(record.username, "builderman");
        assert_eq!(record.display_name, "Builder");
        assert_eq!(record.id, 156);
        assert!(record.has_verified_badge);
    }

    #[test]
    fn test_endpoint_display_and_parse() {
        let endpoint: ProxyEndpoint = "10.0.0.1:8080".parse().unwrap();
        assert_eq!(endpoint, ProxyEndpoint::new("10.0.0.1", 8080));
        assert_eq!(endpoint.to_string(), "10.0.0.1:8080");
        assert_eq!(endpoint.proxy_url(), "http://10.0.0.1:8080");
        assert!("nonsense".parse::<ProxyEndpoint>().is_err());
    }

    #[test]
    fn test_batch_size_is_capped() {
        assert_eq!(ScanConfig::default().with_batch_size(500).batch_size, 60);
        assert_eq!(ScanConfig::default().with_batch_size(0).batch_size, 1);
    }

    #[test]
    fn test_report_sorting_and_completeness() {
        let record = |id| MinimalUserRecord {
            display_name: String::new(),
            username: format!("u{}", id),
            id,
            has_verified_badge: false,
        };
        let report = ScanReport {
            records: vec![record(3), record(1), record(2)],
            ..Default::default()
        };
        let ids: Vec<i64> = report.sorted_by_id().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(report.is_complete());
    }

    #[test]
    fn test_request_identifiers_are_half_open() {
        let request = ScanRequest::new(1000, 1010, 2);
        assert_eq!(request.len(), 10);
        assert_eq!(request.identifiers().first(), Some(&1000));
        assert_eq!(request.identifiers().last(), Some(&1009));
    }
}
