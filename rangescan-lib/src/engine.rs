//! Range verification engine.
//!
//! This module provides [`RangeScanner`], which splits an identifier range
//! across worker tasks, drives every batch through the retry state machine
//! and gathers what the upstream confirms into one shared list.

use crate::batch::BatchVerifier;
use crate::concurrent::BoundedConcurrentList;
use crate::error::ScanError;
use crate::factory::ProxiedClientFactory;
use crate::partition::PartitionPlan;
use crate::protocols::UsersApi;
use crate::types::{
    BatchFailure, IdentifierBatch, MinimalUserRecord, ScanConfig, ScanReport, ScanRequest,
    ScanStats,
};
use crate::utils::{random_jitter, sleep_or_cancel};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Live counters for a running scan.
///
/// Workers bump these as batches finish; a progress display can poll
/// [`ScanProgress::snapshot`] from any task.
#[derive(Debug, Default)]
pub struct ScanProgress {
    batches_total: AtomicUsize,
    batches_done: AtomicUsize,
    batches_failed: AtomicUsize,
    records: AtomicUsize,
    workers_running: AtomicUsize,
}

/// Point-in-time copy of [`ScanProgress`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub batches_total: usize,
    pub batches_done: usize,
    pub batches_failed: usize,
    pub records: usize,
    pub workers_running: usize,
}

impl ProgressSnapshot {
    /// Batches that reached a final state, successful or not.
    pub fn batches_finished(&self) -> usize {
        self.batches_done + self.batches_failed
    }
}

impl ScanProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            batches_total: self.batches_total.load(Ordering::Relaxed),
            batches_done: self.batches_done.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            workers_running: self.workers_running.load(Ordering::Relaxed),
        }
    }

    fn batch_done(&self, records: usize) {
        self.records.fetch_add(records, Ordering::Relaxed);
        self.batches_done.fetch_add(1, Ordering::Relaxed);
    }

    fn batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// What one worker hands back when it finishes.
#[derive(Debug, Default)]
struct WorkerReport {
    stats: ScanStats,
    failures: Vec<BatchFailure>,
}

/// Everything a worker task needs, cloned per task.
#[derive(Clone)]
struct WorkerContext {
    verifier: Arc<BatchVerifier>,
    results: Arc<BoundedConcurrentList<MinimalUserRecord>>,
    progress: Arc<ScanProgress>,
    cancel: CancellationToken,
    append_retry_delay: Duration,
}

/// Verifies identifier ranges against the upstream users API.
///
/// # Example
///
/// ```rust,no_run
/// use rangescan_lib::{
///     ClientConfig, PoolConfig, ProxiedClientFactory, ProxyPool, RangeScanner, RefillConfig,
///     ScanConfig, StaticSupplier,
/// };
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let supplier = StaticSupplier::from_file("proxies.txt")?;
///     let pool = ProxyPool::from_endpoints(supplier.endpoints().to_vec(), PoolConfig::default());
///     let factory = ProxiedClientFactory::new(
///         pool,
///         Arc::new(supplier),
///         ClientConfig::default(),
///         RefillConfig::default(),
///     );
///
///     let scanner = RangeScanner::new(Arc::new(factory), ScanConfig::default());
///     let records = scanner.verify(1_000, 2_000, 8, true).await?;
///     println!("{} users found", records.len());
///     Ok(())
/// }
/// ```
pub struct RangeScanner {
    factory: Arc<ProxiedClientFactory>,
    config: ScanConfig,
}

impl RangeScanner {
    pub fn new(factory: Arc<ProxiedClientFactory>, config: ScanConfig) -> Self {
        Self { factory, config }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn factory(&self) -> &Arc<ProxiedClientFactory> {
        &self.factory
    }

    /// Verify `[low, high)` and return the confirmed records.
    ///
    /// All-or-nothing: if any batch fails, the first failure is returned as
    /// the error. Use [`run`](Self::run) to keep partial results.
    pub async fn verify(
        &self,
        low: i64,
        high: i64,
        workers: usize,
        auto_adjust: bool,
    ) -> Result<Vec<MinimalUserRecord>, ScanError> {
        let request = ScanRequest::new(low, high, workers).with_auto_adjust(auto_adjust);
        let report = self
            .run(request, CancellationToken::new(), Arc::new(ScanProgress::new()))
            .await?;

        match report.failures.into_iter().next() {
            Some(failure) => Err(failure.error),
            None => Ok(report.records),
        }
    }

    /// Run a scan to completion or cancellation.
    ///
    /// Fails only on usage errors (empty range, impossible partition).
    /// Everything that goes wrong after workers start ends up in the report.
    pub async fn run(
        &self,
        request: ScanRequest,
        cancel: CancellationToken,
        progress: Arc<ScanProgress>,
    ) -> Result<ScanReport, ScanError> {
        let started = Instant::now();

        if request.is_empty() {
            return Err(ScanError::invalid_range(
                request.low,
                request.high,
                "the range contains no identifiers",
            ));
        }

        let ids = request.identifiers();
        let plan = PartitionPlan::compute(
            &ids,
            request.workers,
            self.config.unit_size,
            request.auto_adjust,
        )?;

        let mut shard_batches = Vec::with_capacity(plan.shards.len());
        for shard in &plan.shards {
            shard_batches.push(shard.batches(self.config.batch_size, self.config.exclude_banned)?);
        }
        let total_batches: usize = shard_batches.iter().map(Vec::len).sum();
        progress.batches_total.store(total_batches, Ordering::Relaxed);

        tracing::info!(
            low = request.low,
            high = request.high,
            identifiers = ids.len(),
            workers = plan.worker_count,
            batches = total_batches,
            "starting range scan"
        );

        let ctx = WorkerContext {
            verifier: Arc::new(BatchVerifier::new(
                self.factory.clone(),
                UsersApi::new(self.config.users_endpoint.clone()),
                self.config.retry.clone(),
            )),
            results: Arc::new(BoundedConcurrentList::with_capacity(ids.len())),
            progress: progress.clone(),
            cancel: cancel.clone(),
            append_retry_delay: self.config.append_retry_delay,
        };

        let mut report = ScanReport {
            workers: plan.worker_count,
            ..Default::default()
        };

        let mut workers = JoinSet::new();
        let mut pending = shard_batches.into_iter().enumerate();
        for (worker, batches) in pending.by_ref() {
            let jitter = random_jitter(self.config.launch_jitter);
            if worker > 0 && sleep_or_cancel(jitter, &cancel).await.is_err() {
                report.failures.extend(cancelled_failures(&batches));
                progress.batches_failed.fetch_add(batches.len(), Ordering::Relaxed);
                report.stats.batches_failed += batches.len();
                break;
            }
            let ctx = ctx.clone();
            ctx.progress.workers_running.fetch_add(1, Ordering::Relaxed);
            workers.spawn(run_worker(worker, batches, ctx));
        }

        // Shards never launched because the run was cancelled.
        for (_, batches) in pending {
            report.failures.extend(cancelled_failures(&batches));
            progress.batches_failed.fetch_add(batches.len(), Ordering::Relaxed);
            report.stats.batches_failed += batches.len();
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(worker_report) => {
                    report.stats.merge(&worker_report.stats);
                    report.failures.extend(worker_report.failures);
                }
                Err(e) => {
                    return Err(ScanError::internal(format!("worker task failed: {}", e)));
                }
            }
        }

        let records = ctx.results.try_drain().await?;
        report.records = dedup_by_id(records);
        report.cancelled = cancel.is_cancelled();
        report.elapsed = started.elapsed();

        tracing::info!(
            records = report.records.len(),
            failed_batches = report.failures.len(),
            attempts = report.stats.attempts,
            cancelled = report.cancelled,
            elapsed = ?report.elapsed,
            "range scan finished"
        );

        Ok(report)
    }
}

impl std::fmt::Debug for RangeScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeScanner")
            .field("factory", &self.factory)
            .field("config", &self.config)
            .finish()
    }
}

async fn run_worker(
    worker: usize,
    batches: Vec<IdentifierBatch>,
    ctx: WorkerContext,
) -> WorkerReport {
    let mut report = WorkerReport::default();
    tracing::debug!(worker, batches = batches.len(), "worker started");

    for batch in &batches {
        if ctx.cancel.is_cancelled() {
            report.stats.batches_failed += 1;
            report.failures.push(failure_for(batch, ScanError::Cancelled));
            ctx.progress.batch_failed();
            continue;
        }

        let outcome = ctx.verifier.verify_batch(batch, &ctx.cancel).await;
        match outcome.result {
            Ok(records) => match append_with_retry(&ctx, worker, &records).await {
                Ok(()) => {
                    report.stats.record_batch(&outcome.stats, true);
                    ctx.progress.batch_done(records.len());
                }
                Err(error) => {
                    tracing::warn!(
                        worker,
                        batch_start = batch.first_id(),
                        records = records.len(),
                        error = %error,
                        "verified batch could not be stored"
                    );
                    report.stats.record_batch(&outcome.stats, false);
                    report.failures.push(failure_for(batch, error));
                    ctx.progress.batch_failed();
                }
            },
            Err(error) => {
                if !error.is_cancelled() {
                    tracing::warn!(
                        worker,
                        batch_start = batch.first_id(),
                        error = %error,
                        "batch failed"
                    );
                }
                report.stats.record_batch(&outcome.stats, false);
                report.failures.push(failure_for(batch, error));
                ctx.progress.batch_failed();
            }
        }
    }

    ctx.progress.workers_running.fetch_sub(1, Ordering::Relaxed);
    tracing::debug!(worker, "worker finished");
    report
}

/// Append a batch's records, retrying lock timeouts until the list accepts
/// them or the run is cancelled.
async fn append_with_retry(
    ctx: &WorkerContext,
    worker: usize,
    records: &[MinimalUserRecord],
) -> Result<(), ScanError> {
    loop {
        match ctx.results.try_add_range(records.iter().cloned()).await {
            Ok(()) => return Ok(()),
            Err(ScanError::LockTimeout { .. }) => {
                tracing::warn!(
                    worker,
                    records = records.len(),
                    "result append contended, retrying"
                );
                sleep_or_cancel(ctx.append_retry_delay, &ctx.cancel).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

fn failure_for(batch: &IdentifierBatch, error: ScanError) -> BatchFailure {
    BatchFailure {
        first_id: batch.first_id(),
        last_id: batch.last_id(),
        size: batch.ids.len(),
        error,
    }
}

fn cancelled_failures(batches: &[IdentifierBatch]) -> impl Iterator<Item = BatchFailure> + '_ {
    batches.iter().map(|batch| failure_for(batch, ScanError::Cancelled))
}

/// Keep the first record seen for every id, preserving arrival order.
fn dedup_by_id(records: Vec<MinimalUserRecord>) -> Vec<MinimalUserRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    records.into_iter().filter(|r| seen.insert(r.id)).collect()
}
