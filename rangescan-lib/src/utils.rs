//! Utility functions shared across the library.
//!
//! Proxy token parsing, range validation, duration strings, jittered
//! backoff and cancellation-aware sleeping.

use crate::error::ScanError;
use crate::types::{ProxyEndpoint, MAX_PROXY_TOKEN_LEN, MAX_RANGE_SPAN};
use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Parse one `host:port` token.
///
/// Malformed tokens are not errors, they are simply skipped: empty strings,
/// anything longer than 21 characters, tokens without a colon, an empty
/// host or a port that does not fit in a `u16`.
pub fn parse_proxy_token(token: &str) -> Option<ProxyEndpoint> {
    let token = token.trim();
    if token.is_empty() || token.len() > MAX_PROXY_TOKEN_LEN {
        return None;
    }

    let (host, port) = token.split_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    if port == 0 {
        return None;
    }

    Some(ProxyEndpoint::new(host, port))
}

/// Parse a newline separated proxy list, dropping bad lines and duplicates.
///
/// Both `\n` and `\r\n` line endings are accepted. First occurrence wins, so
/// the output keeps the input order.
pub fn parse_proxy_list(text: &str) -> Vec<ProxyEndpoint> {
    dedup_endpoints(text.lines().filter_map(parse_proxy_token))
}

/// Drop repeated endpoints while keeping first-seen order.
pub fn dedup_endpoints<I>(endpoints: I) -> Vec<ProxyEndpoint>
where
    I: IntoIterator<Item = ProxyEndpoint>,
{
    let mut seen = HashSet::new();
    endpoints
        .into_iter()
        .filter(|endpoint| seen.insert(endpoint.clone()))
        .collect()
}

/// Validate a half-open identifier range `[low, high)`.
///
/// The library itself accepts any non-empty range; this is the guard the
/// command layer applies before starting a scan.
pub fn validate_range(low: i64, high: i64, max_span: i64) -> Result<(), ScanError> {
    if low < 0 {
        return Err(ScanError::invalid_range(
            low,
            high,
            "identifiers cannot be negative",
        ));
    }

    if high <= low {
        return Err(ScanError::invalid_range(
            low,
            high,
            "the upper bound must be greater than the lower bound",
        ));
    }

    let span = high - low;
    if span > max_span {
        return Err(ScanError::invalid_range(
            low,
            high,
            format!("{} identifiers requested, at most {} allowed", span, max_span),
        ));
    }

    Ok(())
}

/// [`validate_range`] with the default span limit of 30000.
pub fn validate_default_range(low: i64, high: i64) -> Result<(), ScanError> {
    validate_range(low, high, MAX_RANGE_SPAN)
}

/// Parse a duration string like "500ms", "5s", "2m" or a bare number of seconds.
pub fn parse_duration_string(value: &str) -> Option<Duration> {
    let value = value.trim().to_lowercase();

    if let Some(ms) = value.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = value.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = value.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60))
    } else {
        // Assume seconds if no unit
        value.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Uniformly random duration in `[0, max]`.
pub fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

/// Exponential backoff with full jitter.
///
/// Each call to [`next_delay`](Backoff::next_delay) doubles the ceiling up to
/// `max` and returns a random delay below it.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Current ceiling, before jitter.
    pub fn ceiling(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        random_jitter(ceiling).max(Duration::from_millis(1))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Sleep for `duration` unless `cancel` fires first.
pub async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), ScanError> {
    if duration.is_zero() {
        return if cancel.is_cancelled() {
            Err(ScanError::Cancelled)
        } else {
            Ok(())
        };
    }

    tokio::select! {
        _ = cancel.cancelled() => Err(ScanError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proxy_token() {
        assert_eq!(
            parse_proxy_token("1.2.3.4:8080"),
            Some(ProxyEndpoint::new("1.2.3.4", 8080))
        );
        assert_eq!(
            parse_proxy_token("  255.255.255.255:65535 "),
            Some(ProxyEndpoint::new("255.255.255.255", 65535))
        );

        assert_eq!(parse_proxy_token(""), None);
        assert_eq!(parse_proxy_token("1.2.3.4"), None);
        assert_eq!(parse_proxy_token(":8080"), None);
        assert_eq!(parse_proxy_token("1.2.3.4:http"), None);
        assert_eq!(parse_proxy_token("1.2.3.4:70000"), None);
        assert_eq!(parse_proxy_token("1.2.3.4:0"), None);
        // 22 characters: longer than any IPv4 host:port
        assert_eq!(parse_proxy_token("1255.255.255.255:65535"), None);
    }

    #[test]
    fn test_parse_proxy_list_dedups_and_skips_garbage() {
        let text = "1.1.1.1:80\r\n2.2.2.2:8080\r\n\r\nnot a proxy\r\n1.1.1.1:80\r\n3.3.3.3:3128";
        let parsed = parse_proxy_list(text);
        assert_eq!(
            parsed,
            vec![
                ProxyEndpoint::new("1.1.1.1", 80),
                ProxyEndpoint::new("2.2.2.2", 8080),
                ProxyEndpoint::new("3.3.3.3", 3128),
            ]
        );
    }

    #[test]
    fn test_validate_range() {
        assert!(validate_default_range(1000, 1010).is_ok());
        assert!(validate_default_range(0, 30_000).is_ok());

        assert!(validate_default_range(10, 10).is_err());
        assert!(validate_default_range(10, 5).is_err());
        assert!(validate_default_range(0, 30_001).is_err());
        assert!(validate_default_range(-5, 5).is_err());
    }

    #[test]
    fn test_parse_duration_string() {
        assert_eq!(parse_duration_string("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration_string("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration_string("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration_string("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration_string("soon"), None);
    }

    #[test]
    fn test_backoff_ceiling_grows_then_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let mut ceilings = Vec::new();
        for _ in 0..6 {
            ceilings.push(backoff.ceiling());
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(500));
        }
        assert_eq!(ceilings[0], Duration::from_millis(100));
        assert_eq!(ceilings[1], Duration::from_millis(200));
        assert_eq!(ceilings[2], Duration::from_millis(400));
        assert_eq!(ceilings[5], Duration::from_millis(500));

        backoff.reset();
        assert_eq!(backoff.ceiling(), Duration::from_millis(100));
    }

    #[test]
    fn test_large_attempt_counts_do_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..10_000 {
            backoff.next_delay();
        }
        assert_eq!(backoff.ceiling(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_sleep_or_cancel() {
        let token = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_millis(1), &token).await.is_ok());

        token.cancel();
        assert!(matches!(
            sleep_or_cancel(Duration::from_secs(60), &token).await,
            Err(ScanError::Cancelled)
        ));
        assert!(sleep_or_cancel(Duration::ZERO, &token).await.is_err());
    }
}
