//! Splitting an identifier range across workers.
//!
//! Identifiers are counted in coarse units of `unit_size` to decide how many
//! workers the range can keep busy, then spread over those workers by
//! quotient and remainder. Each worker's share is later cut into upstream
//! batches of at most 60 identifiers. Units only size the split; batches are
//! what goes over the wire.

use crate::error::ScanError;
use crate::types::{IdentifierBatch, MAX_BATCH_SIZE};

/// The identifiers assigned to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub worker: usize,
    pub ids: Vec<i64>,
}

impl Shard {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Cut the shard into request batches.
    ///
    /// `batch_size` is clamped to `1..=60` so no batch can exceed the
    /// upstream ceiling.
    pub fn batches(
        &self,
        batch_size: usize,
        exclude_banned: bool,
    ) -> Result<Vec<IdentifierBatch>, ScanError> {
        let batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self.ids
            .chunks(batch_size)
            .map(|chunk| IdentifierBatch::new(chunk.to_vec(), exclude_banned))
            .collect()
    }
}

/// How a range is split across workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    pub worker_count: usize,
    pub unit_size: usize,
    pub shards: Vec<Shard>,
}

impl PartitionPlan {
    /// Compute the split for `ids`.
    ///
    /// With fewer units than `requested_workers`, the worker count shrinks to
    /// the unit count when `auto_adjust` is set and the call fails otherwise.
    /// The shards, concatenated in order, are exactly `ids`.
    pub fn compute(
        ids: &[i64],
        requested_workers: usize,
        unit_size: usize,
        auto_adjust: bool,
    ) -> Result<Self, ScanError> {
        if ids.is_empty() {
            return Err(ScanError::partition(0, requested_workers, "no identifiers to split"));
        }
        if requested_workers == 0 {
            return Err(ScanError::partition(ids.len(), 0, "at least one worker is required"));
        }

        let unit_size = unit_size.max(1);
        let unit_count = ids.len().div_ceil(unit_size);

        let worker_count = if unit_count >= requested_workers {
            requested_workers
        } else if auto_adjust {
            tracing::debug!(
                requested_workers,
                unit_count,
                "fewer units than workers, reducing worker count"
            );
            unit_count
        } else {
            return Err(ScanError::partition(
                ids.len(),
                requested_workers,
                format!(
                    "only {} units of {} identifiers, enable auto-adjust or request fewer workers",
                    unit_count, unit_size
                ),
            ));
        };

        // Exact quotient/remainder split: shard sizes differ by at most one.
        let base = ids.len() / worker_count;
        let remainder = ids.len() % worker_count;

        let mut shards = Vec::with_capacity(worker_count);
        let mut start = 0;
        for worker in 0..worker_count {
            let end = start + base + usize::from(worker < remainder);
            shards.push(Shard {
                worker,
                ids: ids[start..end].to_vec(),
            });
            start = end;
        }

        Ok(Self {
            worker_count,
            unit_size,
            shards,
        })
    }

    /// Total number of batches across all shards.
    pub fn batch_count(&self, batch_size: usize) -> usize {
        let batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self.shards
            .iter()
            .map(|shard| shard.len().div_ceil(batch_size))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZES: [usize; 6] = [1, 59, 60, 61, 150, 30_000];

    fn ids(n: usize) -> Vec<i64> {
        (1_000..1_000 + n as i64).collect()
    }

    fn check_plan(ids: &[i64], plan: &PartitionPlan, requested: usize) {
        assert!(plan.worker_count >= 1);
        assert!(plan.worker_count <= requested);
        assert_eq!(plan.shards.len(), plan.worker_count);

        let flattened: Vec<i64> = plan.shards.iter().flat_map(|s| s.ids.iter().copied()).collect();
        assert_eq!(flattened, ids, "shards must cover every id exactly once");

        assert!(plan.shards.iter().all(|s| !s.is_empty()));
        let max = plan.shards.iter().map(Shard::len).max().unwrap_or(0);
        let min = plan.shards.iter().map(Shard::len).min().unwrap_or(0);
        assert!(max - min <= 1, "unbalanced: {} vs {}", max, min);

        for shard in &plan.shards {
            for batch in shard.batches(MAX_BATCH_SIZE, false).unwrap() {
                assert!(batch.ids.len() <= MAX_BATCH_SIZE);
            }
        }
    }

    #[test]
    fn test_partition_covers_every_identifier_once() {
        let workers: Vec<usize> = (1..=64).chain([100, 256, 1_000]).collect();
        for n in SIZES {
            let ids = ids(n);
            for &w in &workers {
                let plan = PartitionPlan::compute(&ids, w, 75, true).unwrap();
                check_plan(&ids, &plan, w);
            }
        }
    }

    #[test]
    fn test_unit_size_does_not_affect_coverage() {
        for unit_size in [1, 7, 60, 75, 1_000, 50_000] {
            for n in SIZES {
                let ids = ids(n);
                let plan = PartitionPlan::compute(&ids, 12, unit_size, true).unwrap();
                check_plan(&ids, &plan, 12);
            }
        }
    }

    #[test]
    fn test_auto_adjust_shrinks_worker_count() {
        let ids = ids(150);
        let plan = PartitionPlan::compute(&ids, 10, 75, true).unwrap();
        assert_eq!(plan.worker_count, 2);
        assert_eq!(plan.shards[0].len(), 75);
        assert_eq!(plan.shards[1].len(), 75);
    }

    #[test]
    fn test_insufficient_units_without_auto_adjust_fails() {
        let ids = ids(150);
        assert!(matches!(
            PartitionPlan::compute(&ids, 10, 75, false),
            Err(ScanError::Partition { identifiers: 150, workers: 10, .. })
        ));
        assert!(PartitionPlan::compute(&ids, 2, 75, false).is_ok());
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(PartitionPlan::compute(&[], 4, 75, true).is_err());
        assert!(PartitionPlan::compute(&ids(10), 0, 75, true).is_err());
    }

    #[test]
    fn test_batches_respect_ceiling_and_flag() {
        let shard = Shard {
            worker: 0,
            ids: ids(130),
        };
        let batches = shard.batches(500, true).unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.ids.len()).collect();
        assert_eq!(sizes, vec![60, 60, 10]);
        assert!(batches.iter().all(|b| b.exclude_banned));

        let plan = PartitionPlan::compute(&ids(130), 1, 75, true).unwrap();
        assert_eq!(plan.batch_count(60), 3);
        assert_eq!(plan.batch_count(25), 6);
    }

    #[test]
    fn test_ten_ids_two_workers_with_small_units() {
        let ids = ids(10);
        let plan = PartitionPlan::compute(&ids, 2, 5, true).unwrap();
        assert_eq!(plan.worker_count, 2);
        assert_eq!(plan.shards[0].ids, (1_000..1_005).collect::<Vec<_>>());
        assert_eq!(plan.shards[1].ids, (1_005..1_010).collect::<Vec<_>>());
    }
}
