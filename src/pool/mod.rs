//! Round-robin pool of usage-capped workers.
//!
//! The pool hands out [`RunLease`]s in FIFO order. Every lease is returned
//! exactly once (on drop or through [`RunLease::release`]), and each return
//! counts as one run against the item's `max_runs` budget. Items that run out
//! of budget, or that were removed while leased, are retired on return
//! instead of going back into rotation.
//!
//! Bookkeeping is guarded by a single mutex that is never held across an
//! await point. A semaphore tracks how many items are sitting in the queue
//! and is the only place a caller can suspend.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Semaphore, TryAcquireError};

/// Usage accounting for items managed by a [`RoundRobinPool`].
///
/// Identity (`Eq` + `Hash`) decides deduplication and removal, so two
/// distinct values describing the same endpoint must compare equal.
pub trait HasMaxRuns: Eq + Hash {
    /// Maximum number of runs before retirement. `0` means unlimited.
    fn max_runs(&self) -> u32;

    /// Number of completed runs so far.
    fn current_runs(&self) -> u32;

    /// Record one completed run and return the new total.
    ///
    /// Only called by the pool while its lock is held.
    fn record_run(&self) -> u32;

    /// Whether the item has used up its run budget.
    fn is_exhausted(&self) -> bool {
        self.max_runs() != 0 && self.current_runs() >= self.max_runs()
    }
}

/// Errors returned when acquiring a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// No item was available for a fail-fast acquire.
    Empty,
    /// The pool was closed while waiting, or before the call.
    Closed,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Pool is empty"),
            Self::Closed => write!(f, "Pool is closed"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Point-in-time view of one alive pool member.
#[derive(Debug, Clone)]
pub struct PoolMember<T> {
    pub item: Arc<T>,
    /// Currently handed out through a lease.
    pub leased: bool,
    /// Removed while leased; retires when its lease comes back.
    pub retiring: bool,
}

struct PoolState<T> {
    alive: HashSet<Arc<T>>,
    queue: VecDeque<Arc<T>>,
    to_be_dropped: HashSet<Arc<T>>,
}

struct PoolInner<T> {
    state: Mutex<PoolState<T>>,
    permits: Semaphore,
}

/// Thread-safe round-robin registry with lease/return semantics.
///
/// Cloning is cheap and yields a handle to the same pool.
pub struct RoundRobinPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for RoundRobinPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: HasMaxRuns> Default for RoundRobinPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: HasMaxRuns> RoundRobinPool<T> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    alive: HashSet::new(),
                    queue: VecDeque::new(),
                    to_be_dropped: HashSet::new(),
                }),
                permits: Semaphore::new(0),
            }),
        }
    }

    /// Create a pool pre-populated with `items`, in order.
    pub fn with_items(items: impl IntoIterator<Item = T>) -> Self {
        let pool = Self::new();
        for item in items {
            pool.add(item);
        }
        pool
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        // The state is consistent after every statement, so a panic elsewhere
        // never leaves it half-updated.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of alive items, including the ones currently leased out.
    pub fn count(&self) -> usize {
        self.lock().alive.len()
    }

    /// Number of items waiting in the queue.
    pub fn available(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn contains(&self, item: &T) -> bool {
        self.lock().alive.contains(item)
    }

    /// Admit `item` at the back of the rotation.
    ///
    /// Returns `false` if an equal item is already alive.
    pub fn add(&self, item: T) -> bool {
        let mut state = self.lock();
        let item = Arc::new(item);
        if !state.alive.insert(item.clone()) {
            return false;
        }
        state.queue.push_back(item);
        self.inner.permits.add_permits(1);
        true
    }

    /// Remove `item` from the pool.
    ///
    /// A queued item leaves immediately. A leased item is marked and retires
    /// when its lease is returned, so the in-flight run is not disturbed.
    /// Returns `false` if the item is not alive.
    pub fn remove(&self, item: &T) -> bool {
        let mut state = self.lock();
        if !state.alive.contains(item) {
            return false;
        }

        if let Some(pos) = state.queue.iter().position(|queued| queued.as_ref() == item) {
            state.queue.remove(pos);
            state.alive.remove(item);
            // Take back the permit that was issued when it was queued. If an
            // acquirer already holds it, that acquirer finds the queue short
            // and waits for the next permit instead.
            if let Ok(permit) = self.inner.permits.try_acquire() {
                permit.forget();
            }
            return true;
        }

        if let Some(leased) = state.alive.get(item).cloned() {
            state.to_be_dropped.insert(leased);
        }
        true
    }

    /// Snapshot of every alive item.
    pub fn members(&self) -> Vec<PoolMember<T>> {
        let state = self.lock();
        let queued: HashSet<&Arc<T>> = state.queue.iter().collect();
        state
            .alive
            .iter()
            .map(|item| PoolMember {
                item: item.clone(),
                leased: !queued.contains(item),
                retiring: state.to_be_dropped.contains(item),
            })
            .collect()
    }

    /// Lease the next item without waiting.
    pub fn try_acquire(&self) -> Result<RunLease<T>, PoolError> {
        match self.inner.permits.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(TryAcquireError::NoPermits) => return Err(PoolError::Empty),
            Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
        }
        self.dequeue_for_lease().ok_or(PoolError::Empty)
    }

    /// Lease the next item, waiting until one is available.
    ///
    /// Cancel-safe: dropping the future before it resolves never takes an
    /// item out of the queue.
    pub async fn acquire(&self) -> Result<RunLease<T>, PoolError> {
        loop {
            self.inner
                .permits
                .acquire()
                .await
                .map_err(|_| PoolError::Closed)?
                .forget();
            if let Some(lease) = self.dequeue_for_lease() {
                return Ok(lease);
            }
        }
    }

    /// Lease the next item, blocking the current thread until one is available.
    ///
    /// Intended for plain threads; calling it from inside an async task
    /// stalls that task's runtime worker.
    pub fn acquire_blocking(&self) -> Result<RunLease<T>, PoolError> {
        futures::executor::block_on(self.acquire())
    }

    /// Close the pool. Waiting and future acquires fail with
    /// [`PoolError::Closed`]; outstanding leases can still be returned.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    fn dequeue_for_lease(&self) -> Option<RunLease<T>> {
        let item = self.lock().queue.pop_front()?;
        Some(RunLease {
            pool: self.clone(),
            value: item,
            returned: AtomicBool::new(false),
        })
    }

    // Only called from `RunLease::release`.
    fn give_back(&self, item: &Arc<T>) {
        let mut state = self.lock();
        item.record_run();

        let exhausted = item.is_exhausted();
        let manually_removed = state.to_be_dropped.remove(item);

        if exhausted || manually_removed {
            state.alive.remove(item);
            return;
        }

        state.queue.push_back(item.clone());
        self.inner.permits.add_permits(1);
    }
}

/// Exclusive handle to one pooled item.
///
/// The item goes back to the pool exactly once: on the first call to
/// [`release`](Self::release) or when the lease is dropped.
pub struct RunLease<T: HasMaxRuns> {
    pool: RoundRobinPool<T>,
    value: Arc<T>,
    returned: AtomicBool,
}

impl<T: HasMaxRuns> RunLease<T> {
    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    /// Return the item to the pool. Later calls are no-ops.
    pub fn release(&self) {
        if !self.returned.swap(true, Ordering::AcqRel) {
            self.pool.give_back(&self.value);
        }
    }

    pub fn is_released(&self) -> bool {
        self.returned.load(Ordering::Acquire)
    }
}

impl<T: HasMaxRuns> Deref for RunLease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: HasMaxRuns> Drop for RunLease<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: HasMaxRuns + fmt::Debug> fmt::Debug for RunLease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLease")
            .field("value", &self.value)
            .field("returned", &self.is_released())
            .finish()
    }
}
