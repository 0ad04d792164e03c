//! Proxied HTTP client factory.
//!
//! The factory owns the current [`ProxyPool`] handle and keeps callers
//! supplied with clients that egress through a freshly drawn endpoint. When
//! the pool runs dry it refills it from a [`ProxySupplier`]; only one refill
//! runs at a time and concurrent callers queue behind it, then reuse its
//! outcome instead of starting another.

use crate::error::ScanError;
use crate::pool::ProxyPool;
use crate::protocols::ProxySupplier;
use crate::types::{ClientConfig, PoolConfig, ProxyEndpoint, RefillConfig};
use crate::utils::{random_jitter, sleep_or_cancel};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// An HTTP client bound to one proxy endpoint.
#[derive(Debug, Clone)]
pub struct ProxiedClient {
    endpoint: ProxyEndpoint,
    http: reqwest::Client,
}

impl ProxiedClient {
    pub fn endpoint(&self) -> &ProxyEndpoint {
        &self.endpoint
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

/// Pool handle plus the number of times it has been replaced.
#[derive(Debug, Clone)]
struct PoolSlot {
    pool: Arc<ProxyPool>,
    generation: u64,
}

/// Produces proxied clients and refills the pool when it runs dry.
pub struct ProxiedClientFactory {
    slot: RwLock<PoolSlot>,
    supplier: Arc<dyn ProxySupplier>,
    pool_config: PoolConfig,
    client_config: ClientConfig,
    refill_config: RefillConfig,
    refill_lock: Mutex<()>,
    refill_rounds: AtomicU64,
}

impl ProxiedClientFactory {
    /// Create a factory over an initial pool.
    ///
    /// Pools published by later refills reuse the initial pool's settings.
    pub fn new(
        pool: ProxyPool,
        supplier: Arc<dyn ProxySupplier>,
        client_config: ClientConfig,
        refill_config: RefillConfig,
    ) -> Self {
        let pool_config = pool.config().clone();
        Self {
            slot: RwLock::new(PoolSlot {
                pool: Arc::new(pool),
                generation: 0,
            }),
            supplier,
            pool_config,
            client_config,
            refill_config,
            refill_lock: Mutex::new(()),
            refill_rounds: AtomicU64::new(0),
        }
    }

    pub fn client_config(&self) -> &ClientConfig {
        &self.client_config
    }

    fn current(&self) -> PoolSlot {
        match self.slot.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// The pool handle currently in use.
    pub fn pool(&self) -> Arc<ProxyPool> {
        self.current().pool
    }

    /// How many times the pool has been replaced.
    pub fn generation(&self) -> u64 {
        self.current().generation
    }

    /// Replace the pool in one visible swap.
    pub fn set_pool(&self, pool: ProxyPool) -> Arc<ProxyPool> {
        let pool = Arc::new(pool);
        let mut slot = match self.slot.write() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.pool = pool.clone();
        slot.generation += 1;
        pool
    }

    /// Refill the pool from the supplier and return the new handle.
    ///
    /// If a refill is already running this waits for it instead of
    /// starting another one.
    pub async fn refill(&self, cancel: &CancellationToken) -> Result<Arc<ProxyPool>, ScanError> {
        let seen = self.generation();
        self.refill_after(seen, cancel).await
    }

    async fn refill_after(
        &self,
        seen: u64,
        cancel: &CancellationToken,
    ) -> Result<Arc<ProxyPool>, ScanError> {
        sleep_or_cancel(random_jitter(self.refill_config.jitter), cancel).await?;

        let rounds = self.refill_rounds.load(Ordering::Acquire);
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return Err(ScanError::Cancelled),
            guard = self.refill_lock.lock() => guard,
        };

        let slot = self.current();
        if slot.generation != seen && !slot.pool.is_empty() {
            return Ok(slot.pool);
        }
        if self.refill_rounds.load(Ordering::Acquire) != rounds {
            // A refill finished while this caller queued behind it.
            tracing::debug!("refill finished while waiting, reusing its outcome");
            return if slot.pool.is_empty() {
                Err(ScanError::PoolExhausted {
                    attempts: self.refill_config.max_attempts.max(1),
                })
            } else {
                Ok(slot.pool)
            };
        }

        let result = self.run_refill(cancel).await;
        if !matches!(result, Err(ScanError::Cancelled)) {
            self.refill_rounds.fetch_add(1, Ordering::Release);
        }
        result
    }

    async fn run_refill(&self, cancel: &CancellationToken) -> Result<Arc<ProxyPool>, ScanError> {
        let max_attempts = self.refill_config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            tracing::info!(attempt, supplier = self.supplier.name(), "refilling proxy pool");

            let endpoints = tokio::select! {
                _ = cancel.cancelled() => return Err(ScanError::Cancelled),
                endpoints = self.supplier.scrape() => endpoints,
            };

            let pool = ProxyPool::from_endpoints(endpoints, self.pool_config.clone());
            if self.refill_config.verify && !pool.is_empty() {
                match pool.verify_all(cancel).await {
                    Ok(_) => {}
                    Err(ScanError::Cancelled) => return Err(ScanError::Cancelled),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "verification after refill failed, keeping unverified pool"
                        );
                    }
                }
            }

            if !pool.is_empty() {
                tracing::info!(endpoints = pool.len(), "proxy pool refilled");
                return Ok(self.set_pool(pool));
            }

            tracing::warn!(attempt, max_attempts, "supplier returned no usable proxies");
            if attempt < max_attempts {
                sleep_or_cancel(self.refill_config.retry_delay, cancel).await?;
            }
        }

        Err(ScanError::PoolExhausted {
            attempts: max_attempts,
        })
    }

    /// Draw an endpoint from the pool and build a client bound to it.
    ///
    /// An empty pool triggers a refill. Fails only on cancellation, when the
    /// refill gives up, or when the client cannot be built.
    pub async fn create_client(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ProxiedClient, ScanError> {
        loop {
            let slot = self.current();

            if !slot.pool.is_empty() {
                if let Some(endpoint) = slot.pool.draw_one(cancel).await? {
                    return self.client_for(endpoint);
                }
                // Lost the race for the last endpoint.
            }

            self.refill_after(slot.generation, cancel).await?;
        }
    }

    /// Build a client bound to `endpoint` without touching the pool.
    pub fn client_for(&self, endpoint: ProxyEndpoint) -> Result<ProxiedClient, ScanError> {
        let proxy = reqwest::Proxy::all(endpoint.proxy_url()).map_err(|e| {
            ScanError::transport_with_source(format!("Invalid proxy {}", endpoint), e.to_string())
        })?;

        let http = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.client_config.request_timeout)
            .danger_accept_invalid_certs(self.client_config.accept_invalid_certs)
            .http1_only()
            .build()
            .map_err(|e| {
                ScanError::transport_with_source(
                    "Failed to create proxied HTTP client",
                    e.to_string(),
                )
            })?;

        Ok(ProxiedClient { endpoint, http })
    }
}

impl std::fmt::Debug for ProxiedClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.current();
        f.debug_struct("ProxiedClientFactory")
            .field("pool_len", &slot.pool.len())
            .field("generation", &slot.generation)
            .field("supplier", &self.supplier.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::StaticSupplier;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingSupplier {
        calls: AtomicUsize,
        endpoints: Vec<ProxyEndpoint>,
    }

    impl ProxySupplier for CountingSupplier {
        fn scrape(&self) -> BoxFuture<'_, Vec<ProxyEndpoint>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.endpoints.clone()
            })
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn fast_refill() -> RefillConfig {
        RefillConfig::default()
            .with_jitter(Duration::ZERO)
            .with_retry_delay(Duration::from_millis(1))
            .with_max_attempts(2)
    }

    fn endpoints(count: u16) -> Vec<ProxyEndpoint> {
        (1..=count).map(|p| ProxyEndpoint::new("10.9.9.9", p)).collect()
    }

    #[tokio::test]
    async fn test_create_client_consumes_one_endpoint() {
        let factory = ProxiedClientFactory::new(
            ProxyPool::from_endpoints(endpoints(3), PoolConfig::default()),
            Arc::new(StaticSupplier::default()),
            ClientConfig::default(),
            fast_refill(),
        );
        let cancel = CancellationToken::new();

        let client = factory.create_client(&cancel).await.unwrap();
        assert_eq!(client.endpoint().host, "10.9.9.9");
        assert_eq!(factory.pool().len(), 2);
        assert_eq!(factory.generation(), 0);
    }

    #[tokio::test]
    async fn test_empty_pool_is_refilled_from_supplier() {
        let factory = ProxiedClientFactory::new(
            ProxyPool::empty(),
            Arc::new(StaticSupplier::new(endpoints(5))),
            ClientConfig::default(),
            fast_refill(),
        );
        let cancel = CancellationToken::new();

        factory.create_client(&cancel).await.unwrap();
        assert_eq!(factory.generation(), 1);
        assert_eq!(factory.pool().len(), 4);
    }

    #[tokio::test]
    async fn test_refill_gives_up_when_supplier_stays_empty() {
        let factory = ProxiedClientFactory::new(
            ProxyPool::empty(),
            Arc::new(StaticSupplier::default()),
            ClientConfig::default(),
            fast_refill(),
        );
        let cancel = CancellationToken::new();

        match factory.create_client(&cancel).await {
            Err(ScanError::PoolExhausted { attempts }) => assert_eq!(attempts, 2),
            other => panic!(
                "expected PoolExhausted, got {:?}",
                other.map(|c| c.endpoint().clone())
            ),
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refill() {
        let supplier = Arc::new(CountingSupplier {
            calls: AtomicUsize::new(0),
            endpoints: endpoints(50),
        });
        let factory = Arc::new(ProxiedClientFactory::new(
            ProxyPool::empty(),
            supplier.clone(),
            ClientConfig::default(),
            fast_refill(),
        ));
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let factory = factory.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                factory.create_client(&cancel).await.map(|c| c.endpoint().clone())
            }));
        }

        let mut drawn = std::collections::HashSet::new();
        for handle in handles {
            assert!(drawn.insert(handle.await.unwrap().unwrap()));
        }
        assert_eq!(supplier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(factory.pool().len(), 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_queued_callers_never_miss_a_failed_refill() {
        let refill = fast_refill().with_max_attempts(1);

        for round in 0..200 {
            let factory = Arc::new(ProxiedClientFactory::new(
                ProxyPool::empty(),
                Arc::new(StaticSupplier::default()),
                ClientConfig::default(),
                refill.clone(),
            ));
            let cancel = CancellationToken::new();

            let calls = (0..16).map(|_| {
                let factory = factory.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { factory.create_client(&cancel).await.map(|_| ()) })
            });
            let results = tokio::time::timeout(
                Duration::from_secs(2),
                futures::future::join_all(calls),
            )
            .await
            .unwrap_or_else(|_| panic!("refill callers hung in round {}", round));

            for result in results {
                assert!(matches!(
                    result.unwrap(),
                    Err(ScanError::PoolExhausted { attempts: 1 })
                ));
            }
        }
    }

    #[tokio::test]
    async fn test_refill_observes_cancellation() {
        let factory = ProxiedClientFactory::new(
            ProxyPool::empty(),
            Arc::new(StaticSupplier::new(endpoints(1))),
            ClientConfig::default(),
            fast_refill().with_jitter(Duration::from_secs(30)),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            factory.refill(&cancel).await,
            Err(ScanError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_set_pool_swaps_handle() {
        let factory = ProxiedClientFactory::new(
            ProxyPool::from_endpoints(endpoints(1), PoolConfig::default()),
            Arc::new(StaticSupplier::default()),
            ClientConfig::default(),
            fast_refill(),
        );
        let old = factory.pool();
        let new = factory.set_pool(ProxyPool::from_endpoints(endpoints(7), PoolConfig::default()));

        assert_eq!(old.len(), 1);
        assert_eq!(new.len(), 7);
        assert!(Arc::ptr_eq(&new, &factory.pool()));
        assert_eq!(factory.generation(), 1);
    }

    #[test]
    fn test_client_for_does_not_touch_pool() {
        let factory = ProxiedClientFactory::new(
            ProxyPool::from_endpoints(endpoints(2), PoolConfig::default()),
            Arc::new(StaticSupplier::default()),
            ClientConfig::default().with_accept_invalid_certs(true),
            fast_refill(),
        );
        let client = factory.client_for(ProxyEndpoint::new("127.0.0.1", 3128)).unwrap();
        assert_eq!(client.endpoint().port, 3128);
        assert_eq!(factory.pool().len(), 2);
    }
}
