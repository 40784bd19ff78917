//! Per-transaction state: identity, lifecycle, held locks, and the undo
//! log replayed on abort.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::core::bson::{Document, Value};
use crate::core::transaction::lock_manager::Lock;

/// Isolation level requested at `begin`. The locking protocol is the
/// same for all levels; the level is recorded for diagnostics and future
/// read-path differentiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Lifecycle of a transaction. `Committed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is currently active and ongoing.
    Active,
    /// Transaction has been successfully committed.
    Committed,
    /// Transaction has been aborted and its changes rolled back.
    Aborted,
}

/// A compensating record; the undo log is replayed in reverse on abort.
#[derive(Debug, Clone, PartialEq)]
pub enum UndoRecord {
    /// Reverted by deleting the inserted document.
    Insert { collection: String, doc_id: Value },
    /// Reverted by restoring the pre-image.
    Update { collection: String, doc_id: Value, old_doc: Document },
    /// Reverted by re-inserting the pre-image.
    Delete { collection: String, doc_id: Value, old_doc: Document },
}

/// A transaction owned by the transaction manager.
#[derive(Debug)]
pub struct Transaction {
    pub id: u64,
    pub state: TransactionState,
    pub isolation: IsolationLevel,
    pub start_time: Instant,
    /// Budget for each blocking lock acquisition within the transaction.
    pub timeout: Duration,
    pub held_locks: HashMap<String, Lock>,
    pub undo_log: Vec<UndoRecord>,
}

impl Transaction {
    /// Creates a new transaction in the `Active` state.
    #[must_use]
    pub fn new(id: u64, isolation: IsolationLevel, timeout: Duration) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            isolation,
            start_time: Instant::now(),
            timeout,
            held_locks: HashMap::new(),
            undo_log: Vec::new(),
        }
    }

    /// Whether the transaction performed any write.
    #[must_use]
    pub fn has_writes(&self) -> bool {
        !self.undo_log.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transaction_is_active() {
        let txn = Transaction::new(1, IsolationLevel::default(), Duration::from_secs(30));
        assert_eq!(txn.state, TransactionState::Active);
        assert_eq!(txn.isolation, IsolationLevel::ReadCommitted);
        assert!(txn.held_locks.is_empty());
        assert!(!txn.has_writes());
    }
}
