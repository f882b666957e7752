use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, warn};

use crate::error::{DbError, DbResult};
use crate::transaction::lock_manager::{
    LockMetricsSnapshot, LockMode, StripeLockManager, TryAcquire,
};
use crate::transaction::transaction::{
    IsolationLevel, Transaction, TransactionState, UndoEntry,
};
use crate::transaction::wait_for_graph::WaitForGraph;
use crate::types::TransactionId;

/// Poll interval for blocked lock waits; doomed deadlock victims also
/// notice their fate at this cadence.
const WAIT_SLICE: Duration = Duration::from_millis(10);

struct ManagerState {
    txns: HashMap<TransactionId, Transaction>,
    wait_for: WaitForGraph,
}

/// Strict two-phase-locking coordinator.
///
/// The transaction table and wait-for graph sit behind one coarse
/// mutex; the lock table is striped separately. The two are never held
/// together in the stripe-then-coarse direction, so the manager cannot
/// deadlock against itself.
pub struct TransactionManager {
    state: Mutex<ManagerState>,
    lock_manager: StripeLockManager,
    next_txn_id: AtomicI64,
    default_timeout: Duration,
}

impl TransactionManager {
    pub fn new(stripe_count: usize, default_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                txns: HashMap::new(),
                wait_for: WaitForGraph::new(),
            }),
            lock_manager: StripeLockManager::new(stripe_count),
            next_txn_id: AtomicI64::new(1),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn lock_metrics(&self) -> LockMetricsSnapshot {
        self.lock_manager.metrics().snapshot()
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Allocate a fresh id (never reused) and register the transaction
    /// as ACTIVE.
    pub fn begin_transaction(&self, isolation: IsolationLevel) -> TransactionId {
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        state.txns.insert(id, Transaction::new(id, isolation));
        debug!("txn {} began ({:?})", id, isolation);
        id
    }

    /// Commit: release every lock, clear wait edges, COMMITTED.
    pub fn commit_transaction(&self, txn_id: TransactionId) -> DbResult<()> {
        let locks = {
            let mut state = self.state.lock().unwrap();
            let txn = state
                .txns
                .get_mut(&txn_id)
                .ok_or(DbError::TransactionNotFound(txn_id))?;
            if txn.has_ended() {
                return Err(DbError::TransactionAlreadyEnded(txn_id));
            }
            if !txn.is_active() {
                return Err(DbError::TransactionNotActive(txn_id));
            }
            txn.state = TransactionState::Committed;
            txn.end_time = Some(SystemTime::now());
            let locks = std::mem::take(&mut txn.locks);
            state.wait_for.remove_transaction(txn_id);
            locks
        };

        for resource in &locks {
            self.lock_manager.release(txn_id, resource);
        }
        debug!("txn {} committed, {} locks released", txn_id, locks.len());
        Ok(())
    }

    /// Roll back: the undo entries are handed back newest-first for
    /// the caller to reverse (this manager never mutates table data),
    /// locks are released, and the transaction ends ABORTED.
    pub fn rollback_transaction(&self, txn_id: TransactionId) -> DbResult<Vec<UndoEntry>> {
        let (entries, locks) = {
            let mut state = self.state.lock().unwrap();
            let txn = state
                .txns
                .get_mut(&txn_id)
                .ok_or(DbError::TransactionNotFound(txn_id))?;
            if txn.has_ended() {
                return Err(DbError::TransactionAlreadyEnded(txn_id));
            }
            if !txn.is_active() {
                return Err(DbError::TransactionNotActive(txn_id));
            }
            txn.state = TransactionState::RollingBack;
            let mut entries = std::mem::take(&mut txn.undo_log);
            entries.reverse();
            let locks = std::mem::take(&mut txn.locks);
            state.wait_for.remove_transaction(txn_id);
            (entries, locks)
        };

        for resource in &locks {
            self.lock_manager.release(txn_id, resource);
        }

        let mut state = self.state.lock().unwrap();
        if let Some(txn) = state.txns.get_mut(&txn_id) {
            txn.state = TransactionState::Aborted;
            txn.end_time = Some(SystemTime::now());
        }
        debug!("txn {} rolled back ({} undo entries)", txn_id, entries.len());
        Ok(entries)
    }

    // ------------------------------------------------------------------
    // savepoints & undo log
    // ------------------------------------------------------------------

    /// Mark the current undo position under `name`.
    pub fn create_savepoint(&self, txn_id: TransactionId, name: &str) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        let txn = self.active_txn(&mut state, txn_id)?;
        txn.set_savepoint(name);
        Ok(())
    }

    /// Hand back the undo entries recorded after the savepoint,
    /// newest-first; the transaction stays ACTIVE.
    pub fn rollback_to_savepoint(
        &self,
        txn_id: TransactionId,
        name: &str,
    ) -> DbResult<Vec<UndoEntry>> {
        let mut state = self.state.lock().unwrap();
        let txn = self.active_txn(&mut state, txn_id)?;
        let position = txn.savepoint_position(name).ok_or_else(|| {
            DbError::invalid(format!("savepoint '{}' not found in txn {}", name, txn_id))
        })?;
        let mut entries = txn.undo_log.split_off(position);
        entries.reverse();
        txn.truncate_savepoints(position);
        Ok(entries)
    }

    /// Append a reversible effect to the transaction's undo log.
    pub fn log_operation(&self, txn_id: TransactionId, entry: UndoEntry) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        let txn = self.active_txn(&mut state, txn_id)?;
        txn.undo_log.push(entry);
        Ok(())
    }

    fn active_txn<'a>(
        &self,
        state: &'a mut ManagerState,
        txn_id: TransactionId,
    ) -> DbResult<&'a mut Transaction> {
        let txn = state
            .txns
            .get_mut(&txn_id)
            .ok_or(DbError::TransactionNotFound(txn_id))?;
        if !txn.is_active() {
            return Err(DbError::TransactionNotActive(txn_id));
        }
        Ok(txn)
    }

    // ------------------------------------------------------------------
    // locking
    // ------------------------------------------------------------------

    /// Acquire `mode` on `resource` with the default timeout.
    pub fn acquire_lock(
        &self,
        txn_id: TransactionId,
        resource: &str,
        mode: LockMode,
        wait: bool,
    ) -> DbResult<()> {
        self.acquire_lock_with_timeout(txn_id, resource, mode, wait, self.default_timeout)
    }

    /// Acquire `mode` on `resource`.
    ///
    /// With `wait`, blocks until granted, the timeout expires
    /// (`LockTimeout`), or deadlock detection picks this transaction
    /// as the victim (`Deadlock` — the caller is expected to roll it
    /// back and retry from a fresh transaction). Without `wait`, a
    /// conflict returns `LockConflict` immediately.
    pub fn acquire_lock_with_timeout(
        &self,
        txn_id: TransactionId,
        resource: &str,
        mode: LockMode,
        wait: bool,
        timeout: Duration,
    ) -> DbResult<()> {
        let start = Instant::now();
        let metrics = self.lock_manager.metrics();
        let mut waited = false;

        loop {
            // phase 1: transaction must still be live (coarse mutex)
            {
                let mut state = self.state.lock().unwrap();
                let txn = state
                    .txns
                    .get_mut(&txn_id)
                    .ok_or(DbError::TransactionNotFound(txn_id))?;
                if !txn.is_active() {
                    return Err(DbError::TransactionNotActive(txn_id));
                }
                if txn.doomed {
                    txn.doomed = false;
                    state.wait_for.remove_waiter(txn_id);
                    return Err(DbError::Deadlock(txn_id));
                }
            }

            // phase 2: attempt the grant (stripe mutex only)
            match self.lock_manager.try_acquire(txn_id, resource, mode) {
                TryAcquire::Granted => {
                    let mut state = self.state.lock().unwrap();
                    match state.txns.get_mut(&txn_id) {
                        Some(txn) if txn.is_active() => {
                            txn.locks.insert(resource.to_string());
                            txn.doomed = false;
                            state.wait_for.remove_waiter(txn_id);
                        }
                        _ => {
                            // rolled back while we were acquiring
                            drop(state);
                            self.lock_manager.release(txn_id, resource);
                            return Err(DbError::TransactionNotActive(txn_id));
                        }
                    }
                    if waited {
                        metrics.waits.fetch_add(1, Ordering::Relaxed);
                        metrics
                            .total_wait_micros
                            .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                TryAcquire::Conflict(holders) => {
                    if !waited {
                        metrics.conflicts.fetch_add(1, Ordering::Relaxed);
                    }
                    if !wait {
                        return Err(DbError::LockConflict(resource.to_string()));
                    }

                    // phase 3: record waits and look for a cycle
                    {
                        let mut state = self.state.lock().unwrap();
                        for holder in holders {
                            if state.txns.contains_key(&holder) {
                                state.wait_for.add_edge(txn_id, holder);
                            }
                        }
                        if let Some(cycle) = state.wait_for.find_cycle_from(txn_id) {
                            metrics.deadlocks_detected.fetch_add(1, Ordering::Relaxed);
                            // youngest transaction in the cycle dies
                            let victim = *cycle.iter().max().unwrap();
                            warn!(
                                "deadlock cycle {:?} on '{}', victim txn {}",
                                cycle, resource, victim
                            );
                            if victim == txn_id {
                                state.wait_for.remove_waiter(txn_id);
                                return Err(DbError::Deadlock(txn_id));
                            }
                            if let Some(victim_txn) = state.txns.get_mut(&victim) {
                                victim_txn.doomed = true;
                            }
                        }
                    }

                    waited = true;
                    if start.elapsed() >= timeout {
                        let mut state = self.state.lock().unwrap();
                        state.wait_for.remove_waiter(txn_id);
                        metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                        metrics
                            .total_wait_micros
                            .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
                        return Err(DbError::LockTimeout(resource.to_string()));
                    }
                    self.lock_manager.wait_for_release(resource, WAIT_SLICE);
                }
            }
        }
    }

    /// Release one lock early (lower isolation levels do this for read
    /// locks).
    pub fn release_lock(&self, txn_id: TransactionId, resource: &str) -> DbResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            let txn = state
                .txns
                .get_mut(&txn_id)
                .ok_or(DbError::TransactionNotFound(txn_id))?;
            txn.locks.remove(resource);
        }
        self.lock_manager.release(txn_id, resource);
        Ok(())
    }

    /// DFS over the wait-for graph: is `txn_id` part of a cycle?
    pub fn detect_deadlock(&self, txn_id: TransactionId) -> bool {
        self.state
            .lock()
            .unwrap()
            .wait_for
            .find_cycle_from(txn_id)
            .is_some()
    }

    // ------------------------------------------------------------------
    // introspection
    // ------------------------------------------------------------------

    pub fn transaction_state(&self, txn_id: TransactionId) -> DbResult<TransactionState> {
        self.state
            .lock()
            .unwrap()
            .txns
            .get(&txn_id)
            .map(|t| t.state)
            .ok_or(DbError::TransactionNotFound(txn_id))
    }

    pub fn isolation_level(&self, txn_id: TransactionId) -> DbResult<IsolationLevel> {
        self.state
            .lock()
            .unwrap()
            .txns
            .get(&txn_id)
            .map(|t| t.isolation)
            .ok_or(DbError::TransactionNotFound(txn_id))
    }

    pub fn active_transactions(&self) -> Vec<TransactionId> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<TransactionId> = state
            .txns
            .values()
            .filter(|t| t.is_active())
            .map(|t| t.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Resources currently locked by `txn_id`.
    pub fn held_locks(&self, txn_id: TransactionId) -> DbResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        let txn = state
            .txns
            .get(&txn_id)
            .ok_or(DbError::TransactionNotFound(txn_id))?;
        let mut locks: Vec<String> = txn.locks.iter().cloned().collect();
        locks.sort();
        Ok(locks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn manager() -> TransactionManager {
        TransactionManager::new(16, Duration::from_millis(500))
    }

    #[test]
    fn test_ids_monotonic() {
        let tm = manager();
        let a = tm.begin_transaction(IsolationLevel::ReadCommitted);
        let b = tm.begin_transaction(IsolationLevel::ReadCommitted);
        assert!(b > a);
    }

    #[test]
    fn test_commit_releases_locks() {
        let tm = manager();
        let a = tm.begin_transaction(IsolationLevel::ReadCommitted);
        tm.acquire_lock(a, "row:1", LockMode::Exclusive, false).unwrap();
        assert_eq!(tm.held_locks(a).unwrap(), vec!["row:1".to_string()]);

        tm.commit_transaction(a).unwrap();
        assert_eq!(
            tm.transaction_state(a).unwrap(),
            TransactionState::Committed
        );

        // another transaction can lock immediately
        let b = tm.begin_transaction(IsolationLevel::ReadCommitted);
        tm.acquire_lock(b, "row:1", LockMode::Exclusive, false).unwrap();
    }

    #[test]
    fn test_double_commit_fails() {
        let tm = manager();
        let a = tm.begin_transaction(IsolationLevel::ReadCommitted);
        tm.commit_transaction(a).unwrap();
        assert!(matches!(
            tm.commit_transaction(a),
            Err(DbError::TransactionAlreadyEnded(_))
        ));
        assert!(matches!(
            tm.rollback_transaction(a),
            Err(DbError::TransactionAlreadyEnded(_))
        ));
    }

    #[test]
    fn test_no_wait_conflict() {
        let tm = manager();
        let a = tm.begin_transaction(IsolationLevel::ReadCommitted);
        let b = tm.begin_transaction(IsolationLevel::ReadCommitted);

        tm.acquire_lock(a, "row:1", LockMode::Exclusive, false).unwrap();
        assert!(matches!(
            tm.acquire_lock(b, "row:1", LockMode::Shared, false),
            Err(DbError::LockConflict(_))
        ));

        tm.commit_transaction(a).unwrap();
        tm.acquire_lock(b, "row:1", LockMode::Shared, true).unwrap();
        tm.commit_transaction(b).unwrap();
    }

    #[test]
    fn test_lock_timeout() {
        let tm = manager();
        let a = tm.begin_transaction(IsolationLevel::ReadCommitted);
        let b = tm.begin_transaction(IsolationLevel::ReadCommitted);

        tm.acquire_lock(a, "row:1", LockMode::Exclusive, false).unwrap();
        let result = tm.acquire_lock_with_timeout(
            b,
            "row:1",
            LockMode::Exclusive,
            true,
            Duration::from_millis(50),
        );
        assert!(matches!(result, Err(DbError::LockTimeout(_))));
        assert!(tm.lock_metrics().timeouts >= 1);
    }

    #[test]
    fn test_blocking_wait_succeeds_after_release() {
        let tm = Arc::new(manager());
        let a = tm.begin_transaction(IsolationLevel::ReadCommitted);
        let b = tm.begin_transaction(IsolationLevel::ReadCommitted);
        tm.acquire_lock(a, "row:9", LockMode::Exclusive, false).unwrap();

        let tm2 = Arc::clone(&tm);
        let waiter = thread::spawn(move || {
            tm2.acquire_lock(b, "row:9", LockMode::Exclusive, true)
        });

        thread::sleep(Duration::from_millis(50));
        tm.commit_transaction(a).unwrap();
        waiter.join().unwrap().unwrap();
        assert_eq!(tm.held_locks(b).unwrap(), vec!["row:9".to_string()]);
    }

    #[test]
    fn test_deadlock_detection_aborts_one() {
        let tm = Arc::new(manager());
        let a = tm.begin_transaction(IsolationLevel::ReadCommitted);
        let b = tm.begin_transaction(IsolationLevel::ReadCommitted);

        tm.acquire_lock(a, "X", LockMode::Exclusive, false).unwrap();
        tm.acquire_lock(b, "Y", LockMode::Exclusive, false).unwrap();

        // a real caller rolls its transaction back on deadlock so the
        // other waiter can proceed
        let contend = |tm: Arc<TransactionManager>, txn, resource: &'static str| {
            let result = tm.acquire_lock(txn, resource, LockMode::Exclusive, true);
            if matches!(result, Err(DbError::Deadlock(_))) {
                tm.rollback_transaction(txn).unwrap();
            }
            result
        };

        let tm_a = Arc::clone(&tm);
        let ha = thread::spawn(move || contend(tm_a, a, "Y"));
        let tm_b = Arc::clone(&tm);
        let hb = thread::spawn(move || contend(tm_b, b, "X"));

        let ra = ha.join().unwrap();
        let rb = hb.join().unwrap();

        // exactly one of the two dies as the deadlock victim
        let deadlocks = [&ra, &rb]
            .iter()
            .filter(|r| matches!(r, Err(DbError::Deadlock(_))))
            .count();
        assert_eq!(deadlocks, 1, "got {:?} / {:?}", ra, rb);
        assert!(tm.lock_metrics().deadlocks_detected >= 1);

        let (victim, survivor) = if ra.is_err() { (a, b) } else { (b, a) };
        assert_eq!(
            tm.transaction_state(victim).unwrap(),
            TransactionState::Aborted
        );
        assert!(tm.held_locks(victim).unwrap().is_empty());
        tm.commit_transaction(survivor).unwrap();
    }

    #[test]
    fn test_savepoint_rollback_keeps_txn_active() {
        let tm = manager();
        let a = tm.begin_transaction(IsolationLevel::RepeatableRead);
        tm.log_operation(
            a,
            UndoEntry::Insert {
                table: "t".into(),
                locator: (1, 24),
            },
        )
        .unwrap();
        tm.create_savepoint(a, "sp").unwrap();
        tm.log_operation(
            a,
            UndoEntry::Insert {
                table: "t".into(),
                locator: (1, 60),
            },
        )
        .unwrap();
        tm.log_operation(
            a,
            UndoEntry::Insert {
                table: "t".into(),
                locator: (1, 96),
            },
        )
        .unwrap();

        let undone = tm.rollback_to_savepoint(a, "sp").unwrap();
        assert_eq!(undone.len(), 2);
        // newest first
        assert!(matches!(
            &undone[0],
            UndoEntry::Insert { locator: (1, 96), .. }
        ));
        assert_eq!(
            tm.transaction_state(a).unwrap(),
            TransactionState::Active
        );

        // a full rollback still returns the remaining entry
        let rest = tm.rollback_transaction(a).unwrap();
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn test_unknown_savepoint() {
        let tm = manager();
        let a = tm.begin_transaction(IsolationLevel::ReadCommitted);
        assert!(tm.rollback_to_savepoint(a, "nope").is_err());
    }

    #[test]
    fn test_active_transactions_listing() {
        let tm = manager();
        let a = tm.begin_transaction(IsolationLevel::ReadCommitted);
        let b = tm.begin_transaction(IsolationLevel::Snapshot);
        tm.commit_transaction(a).unwrap();
        assert_eq!(tm.active_transactions(), vec![b]);
        assert_eq!(
            tm.isolation_level(b).unwrap(),
            IsolationLevel::Snapshot
        );
    }
}
