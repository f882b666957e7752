use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, SystemTime};

use log::debug;

use crate::types::TransactionId;

/// Lock compatibility: shared/shared only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn compatible_with(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

/// One granted lock on a resource.
#[derive(Debug, Clone)]
pub struct LockEntry {
    pub txn_id: TransactionId,
    pub mode: LockMode,
    pub acquired_at: SystemTime,
}

/// Counters for lock behavior, mirrored by [`LockMetricsSnapshot`].
#[derive(Default)]
pub struct LockMetrics {
    pub acquisitions: AtomicU64,
    pub conflicts: AtomicU64,
    pub deadlocks_detected: AtomicU64,
    pub timeouts: AtomicU64,
    pub waits: AtomicU64,
    pub total_wait_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct LockMetricsSnapshot {
    pub acquisitions: u64,
    pub conflicts: u64,
    pub deadlocks_detected: u64,
    pub timeouts: u64,
    pub total_wait_time: Duration,
    pub avg_wait_time: Duration,
}

impl LockMetrics {
    pub fn snapshot(&self) -> LockMetricsSnapshot {
        let waits = self.waits.load(Ordering::Relaxed);
        let total_micros = self.total_wait_micros.load(Ordering::Relaxed);
        LockMetricsSnapshot {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            deadlocks_detected: self.deadlocks_detected.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            total_wait_time: Duration::from_micros(total_micros),
            avg_wait_time: if waits == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(total_micros / waits)
            },
        }
    }

    pub fn reset(&self) {
        self.acquisitions.store(0, Ordering::Relaxed);
        self.conflicts.store(0, Ordering::Relaxed);
        self.deadlocks_detected.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.waits.store(0, Ordering::Relaxed);
        self.total_wait_micros.store(0, Ordering::Relaxed);
    }
}

struct Stripe {
    // resource name -> granted locks
    table: Mutex<HashMap<String, Vec<LockEntry>>>,
    released: Condvar,
}

/// The outcome of a non-blocking acquisition attempt.
pub enum TryAcquire {
    Granted,
    /// Conflicting holders the requester would wait on.
    Conflict(Vec<TransactionId>),
}

/// Lock table partitioned into power-of-two stripes hashed by resource
/// name, each stripe behind its own mutex with a condvar for waiters.
/// The manager layers waiting, deadlock detection and transaction
/// bookkeeping on top.
pub struct StripeLockManager {
    stripes: Vec<Stripe>,
    stripe_mask: usize,
    metrics: LockMetrics,
}

impl StripeLockManager {
    /// `stripe_count` must be a power of two.
    pub fn new(stripe_count: usize) -> Self {
        assert!(
            stripe_count.is_power_of_two(),
            "stripe_count must be a power of two"
        );
        Self {
            stripes: (0..stripe_count)
                .map(|_| Stripe {
                    table: Mutex::new(HashMap::new()),
                    released: Condvar::new(),
                })
                .collect(),
            stripe_mask: stripe_count - 1,
            metrics: LockMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &LockMetrics {
        &self.metrics
    }

    fn stripe_for(&self, resource: &str) -> &Stripe {
        let mut hasher = DefaultHasher::new();
        resource.hash(&mut hasher);
        &self.stripes[hasher.finish() as usize & self.stripe_mask]
    }

    /// Try to grant `mode` on `resource` without blocking.
    ///
    /// Re-acquisition by a holder is idempotent; a sole shared holder
    /// upgrades in place to exclusive.
    pub fn try_acquire(
        &self,
        txn_id: TransactionId,
        resource: &str,
        mode: LockMode,
    ) -> TryAcquire {
        let stripe = self.stripe_for(resource);
        let mut table = stripe.table.lock().unwrap();
        let entries = table.entry(resource.to_string()).or_default();

        if let Some(own) = entries.iter().position(|e| e.txn_id == txn_id) {
            match (entries[own].mode, mode) {
                // already covered
                (LockMode::Exclusive, _) | (LockMode::Shared, LockMode::Shared) => {
                    return TryAcquire::Granted;
                }
                (LockMode::Shared, LockMode::Exclusive) => {
                    // upgrade allowed only for the sole holder
                    if entries.len() == 1 {
                        entries[own].mode = LockMode::Exclusive;
                        self.metrics.acquisitions.fetch_add(1, Ordering::Relaxed);
                        return TryAcquire::Granted;
                    }
                    let holders = entries
                        .iter()
                        .filter(|e| e.txn_id != txn_id)
                        .map(|e| e.txn_id)
                        .collect();
                    return TryAcquire::Conflict(holders);
                }
            }
        }

        let conflicting: Vec<TransactionId> = entries
            .iter()
            .filter(|e| !mode.compatible_with(&e.mode))
            .map(|e| e.txn_id)
            .collect();
        if !conflicting.is_empty() {
            return TryAcquire::Conflict(conflicting);
        }

        entries.push(LockEntry {
            txn_id,
            mode,
            acquired_at: SystemTime::now(),
        });
        self.metrics.acquisitions.fetch_add(1, Ordering::Relaxed);
        debug!("txn {} granted {:?} on '{}'", txn_id, mode, resource);
        TryAcquire::Granted
    }

    /// Remove the transaction's lock on `resource` and wake waiters.
    /// Returns whether a lock was held.
    pub fn release(&self, txn_id: TransactionId, resource: &str) -> bool {
        let stripe = self.stripe_for(resource);
        let mut table = stripe.table.lock().unwrap();
        let mut released = false;
        if let Some(entries) = table.get_mut(resource) {
            let before = entries.len();
            entries.retain(|e| e.txn_id != txn_id);
            released = entries.len() < before;
            if entries.is_empty() {
                table.remove(resource);
            }
        }
        if released {
            debug!("txn {} released lock on '{}'", txn_id, resource);
            stripe.released.notify_all();
        }
        released
    }

    /// Block on the stripe's condvar for up to `slice`; spurious
    /// wakeups are fine, the caller retries acquisition in a loop.
    pub fn wait_for_release(&self, resource: &str, slice: Duration) {
        let stripe = self.stripe_for(resource);
        let table = stripe.table.lock().unwrap();
        let _ = stripe.released.wait_timeout(table, slice).unwrap();
    }

    /// Whether any transaction holds a lock on `resource`.
    pub fn is_locked(&self, resource: &str) -> bool {
        let stripe = self.stripe_for(resource);
        stripe
            .table
            .lock()
            .unwrap()
            .get(resource)
            .map_or(false, |entries| !entries.is_empty())
    }

    /// Current holders of `resource`.
    pub fn holders(&self, resource: &str) -> Vec<LockEntry> {
        let stripe = self.stripe_for(resource);
        stripe
            .table
            .lock()
            .unwrap()
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }
}
