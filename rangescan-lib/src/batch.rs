//! Per-batch retry state machine.
//!
//! One [`BatchVerifier::verify_batch`] call drives a single identifier batch
//! through `AwaitClient -> Sending -> outcome` until it succeeds, runs out of
//! budget or is cancelled:
//!
//! - success returns the records;
//! - a 429 waits `n * base` for the n-th consecutive hit and rotates the
//!   proxy once the hit count reaches the configured threshold;
//! - any other upstream error, a malformed body or a transport failure
//!   rotates the proxy immediately;
//! - pool exhaustion and cancellation end the batch at once.

use crate::error::ScanError;
use crate::factory::{ProxiedClient, ProxiedClientFactory};
use crate::protocols::UsersApi;
use crate::types::{BatchStats, IdentifierBatch, MinimalUserRecord, RetryPolicy};
use crate::utils::sleep_or_cancel;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// What to do after a 429.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAction {
    /// Keep the proxy and wait this long before the next attempt.
    Wait(Duration),
    /// Drop the proxy and draw a new one right away.
    Rotate,
}

/// Escalation rule for consecutive rate-limit responses.
#[derive(Debug, Clone)]
pub struct RateLimitTracker {
    base: Duration,
    rotate_after: u32,
    consecutive: u32,
}

impl RateLimitTracker {
    pub fn new(base: Duration, rotate_after: u32) -> Self {
        Self {
            base,
            rotate_after: rotate_after.max(1),
            consecutive: 0,
        }
    }

    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self::new(policy.rate_limit_base_delay, policy.rotate_after)
    }

    /// Record one 429 and decide the reaction.
    pub fn on_rate_limited(&mut self) -> RateLimitAction {
        self.consecutive += 1;
        if self.consecutive >= self.rotate_after {
            self.consecutive = 0;
            RateLimitAction::Rotate
        } else {
            RateLimitAction::Wait(self.base.saturating_mul(self.consecutive))
        }
    }

    /// Forget the current streak, e.g. after any non-429 outcome.
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Result of one batch plus what it cost.
#[derive(Debug)]
pub struct BatchOutcome {
    pub result: Result<Vec<MinimalUserRecord>, ScanError>,
    pub stats: BatchStats,
}

/// Sends batches through rotating proxies under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct BatchVerifier {
    factory: Arc<ProxiedClientFactory>,
    api: UsersApi,
    policy: RetryPolicy,
}

impl BatchVerifier {
    pub fn new(factory: Arc<ProxiedClientFactory>, api: UsersApi, policy: RetryPolicy) -> Self {
        Self {
            factory,
            api,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn budget_spent(&self, attempts: u32, started: Instant) -> bool {
        let attempts_spent = self.policy.max_attempts.is_some_and(|max| attempts >= max);
        let time_spent = self
            .policy
            .max_elapsed
            .is_some_and(|max| started.elapsed() >= max);
        attempts_spent || time_spent
    }

    /// Verify one batch, retrying transient failures.
    pub async fn verify_batch(
        &self,
        batch: &IdentifierBatch,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let started = Instant::now();
        let mut stats = BatchStats::default();
        let mut tracker = RateLimitTracker::from_policy(&self.policy);
        let mut client: Option<ProxiedClient> = None;
        let mut last_error: Option<ScanError> = None;
        let batch_start = batch.first_id();

        let result = loop {
            if cancel.is_cancelled() {
                break Err(ScanError::Cancelled);
            }

            if self.budget_spent(stats.attempts, started) {
                let last_error = last_error.take().unwrap_or_else(|| {
                    ScanError::internal("retry budget spent before any attempt")
                });
                tracing::warn!(
                    batch_start,
                    attempts = stats.attempts,
                    error = %last_error,
                    "giving up on batch"
                );
                break Err(ScanError::RetriesExhausted {
                    attempts: stats.attempts,
                    elapsed: started.elapsed(),
                    last_error: Box::new(last_error),
                });
            }

            // AwaitClient
            let current = match client.take() {
                Some(current) => current,
                None => match self.factory.create_client(cancel).await {
                    Ok(fresh) => fresh,
                    Err(e) => break Err(e),
                },
            };

            // Sending
            stats.attempts += 1;
            let proxy = current.endpoint().to_string();
            tracing::debug!(batch_start, attempt = stats.attempts, proxy = %proxy, "sending batch");

            let sent = tokio::select! {
                _ = cancel.cancelled() => break Err(ScanError::Cancelled),
                sent = self.api.send_batch(current.http(), &proxy, batch) => sent,
            };

            match sent {
                Ok(records) => {
                    tracing::debug!(
                        batch_start,
                        attempt = stats.attempts,
                        records = records.len(),
                        "batch verified"
                    );
                    break Ok(records);
                }
                Err(e @ ScanError::RateLimited { .. }) => {
                    stats.rate_limited += 1;
                    match tracker.on_rate_limited() {
                        RateLimitAction::Wait(delay) => {
                            tracing::debug!(
                                batch_start,
                                proxy = %proxy,
                                ?delay,
                                "rate limited, backing off"
                            );
                            client = Some(current);
                            last_error = Some(e);
                            if let Err(cancelled) = sleep_or_cancel(delay, cancel).await {
                                break Err(cancelled);
                            }
                        }
                        RateLimitAction::Rotate => {
                            tracing::warn!(
                                batch_start,
                                proxy = %proxy,
                                "rate limited repeatedly, rotating proxy"
                            );
                            stats.rotations += 1;
                            last_error = Some(e);
                        }
                    }
                }
                Err(e) if e.forces_rotation() => {
                    tracker.reset();
                    stats.rotations += 1;
                    match &e {
                        ScanError::Upstream { status, .. } => tracing::warn!(
                            batch_start,
                            proxy = %proxy,
                            status,
                            error = %e,
                            "upstream error, rotating proxy"
                        ),
                        _ => tracing::debug!(
                            batch_start,
                            proxy = %proxy,
                            error = %e,
                            "attempt failed, rotating proxy"
                        ),
                    }
                    last_error = Some(e);
                }
                Err(e) => break Err(e),
            }
        };

        BatchOutcome { result, stats }
    }
}
