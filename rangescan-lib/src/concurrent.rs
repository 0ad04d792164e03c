//! Concurrent collection used as the only shared mutable state of a scan.
//!
//! [`BoundedConcurrentList`] is a growable sequence behind a single async
//! mutex. Every mutating or snapshot-reading operation waits for the lock at
//! most `timeout` and reports [`ScanError::LockTimeout`] instead of blocking
//! forever. The list never retries internally: on failure the caller decides
//! whether to back off and try again.

use crate::error::ScanError;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Default wait for the list lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Thread-safe growable list with timeout-bounded locking.
pub struct BoundedConcurrentList<T> {
    items: Mutex<Vec<T>>,
    // Mirrors of the vector's len/capacity, refreshed under the lock so that
    // reads never have to take it.
    len: AtomicUsize,
    capacity: AtomicUsize,
    timeout: Duration,
}

impl<T> BoundedConcurrentList<T> {
    /// Create an empty list with the default 5 second lock timeout.
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Create an empty list with a custom lock timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::from_vec(Vec::new()).timeout(timeout)
    }

    /// Create an empty list with room for `capacity` items.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_vec(Vec::with_capacity(capacity))
    }

    /// Wrap an existing vector.
    pub fn from_vec(items: Vec<T>) -> Self {
        let len = items.len();
        let capacity = items.capacity();
        Self {
            items: Mutex::new(items),
            len: AtomicUsize::new(len),
            capacity: AtomicUsize::new(capacity),
            timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Replace the lock timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The configured lock timeout.
    pub fn lock_timeout(&self) -> Duration {
        self.timeout
    }

    /// Item count without taking the lock.
    ///
    /// Racy by nature: treat it as a hint, never as the basis of a
    /// concurrency decision.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Lock-free emptiness hint. Same caveats as [`len`](Self::len).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocated capacity without taking the lock.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    async fn acquire(&self, operation: &str) -> Result<MutexGuard<'_, Vec<T>>, ScanError> {
        tokio::time::timeout(self.timeout, self.items.lock())
            .await
            .map_err(|_| ScanError::lock_timeout(operation, self.timeout))
    }

    /// Take the lock directly so tests can stall other callers.
    #[cfg(test)]
    pub(crate) async fn hold_lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.items.lock().await
    }

    fn publish(&self, items: &[T], capacity: usize) {
        self.len.store(items.len(), Ordering::Release);
        self.capacity.store(capacity, Ordering::Release);
    }

    /// Append one item.
    pub async fn try_add(&self, item: T) -> Result<(), ScanError> {
        let mut items = self.acquire("list add").await?;
        items.push(item);
        let capacity = items.capacity();
        self.publish(&items, capacity);
        Ok(())
    }

    /// Append every item of `iter` under a single lock acquisition.
    pub async fn try_add_range<I>(&self, iter: I) -> Result<(), ScanError>
    where
        I: IntoIterator<Item = T>,
    {
        let mut items = self.acquire("list add range").await?;
        items.extend(iter);
        let capacity = items.capacity();
        self.publish(&items, capacity);
        Ok(())
    }

    /// Remove the item at `index`. `Ok(None)` when the index is out of range.
    pub async fn try_remove_at(&self, index: usize) -> Result<Option<T>, ScanError> {
        let mut items = self.acquire("list remove at").await?;
        if index >= items.len() {
            return Ok(None);
        }
        let removed = items.remove(index);
        let capacity = items.capacity();
        self.publish(&items, capacity);
        Ok(Some(removed))
    }

    /// Pick an index uniformly at random, optionally removing the item.
    ///
    /// `Ok(None)` when the list is empty.
    pub async fn try_draw_random(&self, remove: bool) -> Result<Option<T>, ScanError>
    where
        T: Clone,
    {
        let mut items = self.acquire("list draw random").await?;
        if items.is_empty() {
            return Ok(None);
        }
        let index = rand::rng().random_range(0..items.len());
        let item = if remove {
            // Order carries no meaning in a draw pool, so swap_remove is fine.
            items.swap_remove(index)
        } else {
            items[index].clone()
        };
        let capacity = items.capacity();
        self.publish(&items, capacity);
        Ok(Some(item))
    }

    /// Clone the item at `index`.
    pub async fn try_get(&self, index: usize) -> Result<Option<T>, ScanError>
    where
        T: Clone,
    {
        let items = self.acquire("list get").await?;
        Ok(items.get(index).cloned())
    }

    /// Copy the whole list.
    pub async fn try_snapshot(&self) -> Result<Vec<T>, ScanError>
    where
        T: Clone,
    {
        let items = self.acquire("list snapshot").await?;
        Ok(items.clone())
    }

    /// Take every item out, leaving the list empty.
    pub async fn try_drain(&self) -> Result<Vec<T>, ScanError> {
        let mut items = self.acquire("list drain").await?;
        let drained = std::mem::take(&mut *items);
        self.publish(&items, 0);
        Ok(drained)
    }

    /// Read by index, waiting for the lock without any bound.
    ///
    /// Not part of the retry-safe surface: under concurrent removals the
    /// index may point at a different item than the caller expects.
    pub async fn get(&self, index: usize) -> Option<T>
    where
        T: Clone,
    {
        self.items.lock().await.get(index).cloned()
    }

    /// Overwrite by index, waiting for the lock without any bound.
    ///
    /// Same caveats as [`get`](Self::get). Returns false when out of range.
    pub async fn set(&self, index: usize, value: T) -> bool {
        let mut items = self.items.lock().await;
        match items.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

impl<T: PartialEq> BoundedConcurrentList<T> {
    /// Remove the first item equal to `item`. `Ok(false)` when absent.
    pub async fn try_remove(&self, item: &T) -> Result<bool, ScanError> {
        let mut items = self.acquire("list remove").await?;
        match items.iter().position(|x| x == item) {
            Some(index) => {
                items.remove(index);
                let capacity = items.capacity();
                self.publish(&items, capacity);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Membership test under the lock.
    pub async fn try_contains(&self, item: &T) -> Result<bool, ScanError> {
        let items = self.acquire("list contains").await?;
        Ok(items.contains(item))
    }

    /// Index of the first item equal to `item`.
    pub async fn try_index_of(&self, item: &T) -> Result<Option<usize>, ScanError> {
        let items = self.acquire("list index of").await?;
        Ok(items.iter().position(|x| x == item))
    }
}

impl<T> Default for BoundedConcurrentList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> From<Vec<T>> for BoundedConcurrentList<T> {
    fn from(items: Vec<T>) -> Self {
        Self::from_vec(items)
    }
}

impl<T> std::fmt::Debug for BoundedConcurrentList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedConcurrentList")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("timeout", &self.timeout)
            .finish()
    }
}
