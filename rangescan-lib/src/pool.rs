//! Single-use pool of proxy endpoints.
//!
//! Endpoints are drawn uniformly at random and removed on draw. The pool
//! never refills itself: detecting exhaustion and publishing a fresh pool is
//! the job of [`crate::ProxiedClientFactory`].

use crate::concurrent::BoundedConcurrentList;
use crate::error::ScanError;
use crate::protocols::probe_endpoint;
use crate::types::{PoolConfig, ProxyEndpoint};
use crate::utils::{dedup_endpoints, sleep_or_cancel, Backoff};
use futures::stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// Attempts at removing one dead endpoint during bulk verification.
const REMOVE_ATTEMPTS: u32 = 5;

/// Outcome of [`ProxyPool::verify_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifySummary {
    pub probed: usize,
    pub kept: usize,
    pub removed: usize,
}

/// A consumable set of proxy endpoints.
#[derive(Debug)]
pub struct ProxyPool {
    endpoints: BoundedConcurrentList<ProxyEndpoint>,
    config: PoolConfig,
}

impl ProxyPool {
    /// Build a pool from `endpoints`, dropping duplicates.
    pub fn from_endpoints(endpoints: Vec<ProxyEndpoint>, config: PoolConfig) -> Self {
        let endpoints = dedup_endpoints(endpoints);
        Self {
            endpoints: BoundedConcurrentList::from_vec(endpoints).timeout(config.lock_timeout),
            config,
        }
    }

    /// An empty pool with default settings.
    pub fn empty() -> Self {
        Self::from_endpoints(Vec::new(), PoolConfig::default())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Approximate size; see [`BoundedConcurrentList::len`].
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Copy of the remaining endpoints.
    pub async fn snapshot(&self) -> Result<Vec<ProxyEndpoint>, ScanError> {
        self.endpoints.try_snapshot().await
    }

    /// Remove and return one endpoint chosen uniformly at random.
    ///
    /// `Ok(None)` when the pool is empty. Lock timeouts are retried with
    /// jittered backoff until the list answers or the pool is observably
    /// empty; only cancellation ends the wait early.
    pub async fn draw_one(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<ProxyEndpoint>, ScanError> {
        let mut backoff = Backoff::new(self.config.draw_backoff, self.config.draw_backoff_max);

        loop {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }

            match self.endpoints.try_draw_random(true).await {
                Ok(drawn) => {
                    if let Some(endpoint) = &drawn {
                        tracing::debug!(proxy = %endpoint, remaining = self.len(), "drew proxy");
                    }
                    return Ok(drawn);
                }
                Err(ScanError::LockTimeout { .. }) => {
                    if self.is_empty() {
                        return Ok(None);
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!(?delay, "proxy pool lock contended, retrying draw");
                    sleep_or_cancel(delay, cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Probe every endpoint and remove the ones that fail.
    ///
    /// Probes run concurrently and failures are pruned as each probe
    /// completes, so other tasks drawing in the meantime already see a
    /// cleaner pool. Best effort: an endpoint that cannot be removed after a
    /// few lock timeouts is left in place. Cancellation stops the sweep and
    /// leaves the endpoints not yet probed untouched.
    pub async fn verify_all(&self, cancel: &CancellationToken) -> Result<VerifySummary, ScanError> {
        let snapshot = self.snapshot().await?;
        let timeout = self.config.probe_timeout;

        tracing::info!(
            endpoints = snapshot.len(),
            concurrency = self.config.probe_concurrency,
            "verifying proxy pool"
        );

        let mut probes = futures::stream::iter(snapshot)
            .map(|endpoint| async move { probe_endpoint(&endpoint, timeout).await })
            .buffer_unordered(self.config.probe_concurrency.max(1));

        let mut summary = VerifySummary::default();
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ScanError::Cancelled),
                next = probes.next() => match next {
                    Some(result) => result,
                    None => break,
                },
            };

            summary.probed += 1;
            if result.success {
                summary.kept += 1;
                continue;
            }
            if self.remove_dead(&result.endpoint(), cancel).await? {
                summary.removed += 1;
            } else {
                summary.kept += 1;
            }
        }

        tracing::info!(
            kept = summary.kept,
            removed = summary.removed,
            "proxy pool verified"
        );
        Ok(summary)
    }

    async fn remove_dead(
        &self,
        endpoint: &ProxyEndpoint,
        cancel: &CancellationToken,
    ) -> Result<bool, ScanError> {
        let mut backoff = Backoff::new(self.config.draw_backoff, self.config.draw_backoff_max);

        for _ in 0..REMOVE_ATTEMPTS {
            match self.endpoints.try_remove(endpoint).await {
                Ok(removed) => return Ok(removed),
                Err(ScanError::LockTimeout { .. }) => {
                    sleep_or_cancel(backoff.next_delay(), cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(proxy = %endpoint, "could not remove dead proxy, leaving it in the pool");
        Ok(false)
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn endpoints(count: u16) -> Vec<ProxyEndpoint> {
        (1..=count).map(|p| ProxyEndpoint::new("10.0.0.1", p)).collect()
    }

    #[tokio::test]
    async fn test_draw_decreases_size_by_one_and_never_repeats() {
        let pool = ProxyPool::from_endpoints(endpoints(20), PoolConfig::default());
        let cancel = CancellationToken::new();
        let mut seen = HashSet::new();

        for expected_left in (0..20).rev() {
            let endpoint = pool.draw_one(&cancel).await.unwrap().unwrap();
            assert!(seen.insert(endpoint));
            assert_eq!(pool.len(), expected_left);
        }

        assert_eq!(pool.draw_one(&cancel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicates_are_dropped_on_construction() {
        let mut list = endpoints(3);
        list.extend(endpoints(3));
        let pool = ProxyPool::from_endpoints(list, PoolConfig::default());
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test]
    async fn test_draw_honours_cancellation() {
        let pool = ProxyPool::from_endpoints(endpoints(2), PoolConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            pool.draw_one(&cancel).await,
            Err(ScanError::Cancelled)
        ));
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_draws_hand_out_each_endpoint_once() {
        let pool = std::sync::Arc::new(ProxyPool::from_endpoints(
            endpoints(200),
            PoolConfig::default(),
        ));
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let mut drawn = Vec::new();
                while let Some(endpoint) = pool.draw_one(&cancel).await.unwrap() {
                    drawn.push(endpoint);
                }
                drawn
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for endpoint in handle.await.unwrap() {
                assert!(all.insert(endpoint));
            }
        }
        assert_eq!(all.len(), 200);
    }

    #[tokio::test]
    async fn test_verify_all_prunes_dead_endpoints() {
        let alive = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let alive_port = alive.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = alive.accept().await {
                let mut buf = [0u8; 256];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await;
            }
        });

        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let config = PoolConfig::default().with_probe_timeout(Duration::from_secs(1));
        let pool = ProxyPool::from_endpoints(
            vec![
                ProxyEndpoint::new("127.0.0.1", alive_port),
                ProxyEndpoint::new("127.0.0.1", dead_port),
            ],
            config,
        );

        let summary = pool.verify_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.probed, 2);
        assert_eq!(summary.kept, 1);
        assert_eq!(summary.removed, 1);
        assert_eq!(
            pool.snapshot().await.unwrap(),
            vec![ProxyEndpoint::new("127.0.0.1", alive_port)]
        );

        // Running it again changes nothing.
        let again = pool.verify_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(again.removed, 0);
        assert_eq!(pool.len(), 1);
    }

    fn contended_config() -> PoolConfig {
        PoolConfig::default()
            .with_lock_timeout(Duration::from_millis(1))
            .with_draw_backoff(Duration::from_millis(1), Duration::from_millis(5))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_draws_back_off_until_the_lock_frees_up() {
        let pool = std::sync::Arc::new(ProxyPool::from_endpoints(
            endpoints(60),
            contended_config(),
        ));
        let cancel = CancellationToken::new();

        let guard = pool.endpoints.hold_lock().await;
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let mut drawn = Vec::new();
                while let Some(endpoint) = pool.draw_one(&cancel).await.unwrap() {
                    drawn.push(endpoint);
                }
                drawn
            }));
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(guard);

        let mut all = HashSet::new();
        for handle in handles {
            for endpoint in handle.await.unwrap() {
                assert!(all.insert(endpoint));
            }
        }
        assert_eq!(all.len(), 60);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_contended_draw_stops_on_cancellation() {
        let pool = ProxyPool::from_endpoints(endpoints(3), contended_config());
        let cancel = CancellationToken::new();
        let _guard = pool.endpoints.hold_lock().await;

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let drawn = tokio::time::timeout(Duration::from_secs(1), pool.draw_one(&cancel))
            .await
            .expect("draw kept retrying after cancellation");
        assert!(matches!(drawn, Err(ScanError::Cancelled)));
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test]
    async fn test_remove_dead_stops_on_cancellation() {
        let config = contended_config()
            .with_draw_backoff(Duration::from_secs(10), Duration::from_secs(10));
        let pool = ProxyPool::from_endpoints(endpoints(2), config);
        let cancel = CancellationToken::new();
        let _guard = pool.endpoints.hold_lock().await;

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let removed = tokio::time::timeout(
            Duration::from_secs(1),
            pool.remove_dead(&ProxyEndpoint::new("10.0.0.1", 1), &cancel),
        )
        .await
        .expect("removal kept retrying after cancellation");
        assert!(matches!(removed, Err(ScanError::Cancelled)));
    }
}
