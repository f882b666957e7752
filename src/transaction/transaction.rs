use std::collections::HashSet;
use std::time::SystemTime;

use crate::table::table_storage::RecordLocator;
use crate::table::value::Value;
use crate::types::TransactionId;

/// Isolation level tag carried by a transaction. Locking behaves the
/// same under all of them in this engine; the tag is for callers that
/// vary their read protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RollingBack,
    Aborted,
}

/// One reversible effect, recorded by the database layer as it mutates
/// tables. Rollback replays these newest-first; the transaction
/// manager itself never touches table data.
#[derive(Debug, Clone)]
pub enum UndoEntry {
    Insert {
        table: String,
        locator: RecordLocator,
    },
    Update {
        table: String,
        old_locator: RecordLocator,
        new_locator: RecordLocator,
        old_values: Vec<Value>,
    },
    Delete {
        table: String,
        locator: RecordLocator,
        old_values: Vec<Value>,
    },
}

/// Bookkeeping for one transaction: lifecycle timestamps, the
/// in-memory undo log with savepoint markers, and the held lock set.
pub struct Transaction {
    pub id: TransactionId,
    pub isolation: IsolationLevel,
    pub state: TransactionState,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub undo_log: Vec<UndoEntry>,
    // savepoint name -> undo log position at creation
    savepoints: Vec<(String, usize)>,
    pub locks: HashSet<String>,
    /// Set when deadlock detection picked this transaction as victim;
    /// its blocked lock wait notices and bails out.
    pub doomed: bool,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation: IsolationLevel) -> Self {
        Self {
            id,
            isolation,
            state: TransactionState::Active,
            start_time: SystemTime::now(),
            end_time: None,
            undo_log: Vec::new(),
            savepoints: Vec::new(),
            locks: HashSet::new(),
            doomed: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    pub fn has_ended(&self) -> bool {
        matches!(
            self.state,
            TransactionState::Committed | TransactionState::Aborted
        )
    }

    /// Record a savepoint at the current undo position. Re-using a
    /// name moves the marker.
    pub fn set_savepoint(&mut self, name: &str) {
        let position = self.undo_log.len();
        if let Some(existing) = self.savepoints.iter_mut().find(|(n, _)| n == name) {
            existing.1 = position;
        } else {
            self.savepoints.push((name.to_string(), position));
        }
    }

    pub fn savepoint_position(&self, name: &str) -> Option<usize> {
        self.savepoints
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, pos)| *pos)
    }

    /// Drop savepoints that point past `position` (they no longer
    /// exist after a partial rollback). The savepoint rolled back to
    /// stays valid.
    pub fn truncate_savepoints(&mut self, position: usize) {
        self.savepoints.retain(|(_, pos)| *pos <= position);
    }
}
