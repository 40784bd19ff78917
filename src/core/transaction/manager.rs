//! The transaction manager: id issuance, commit and abort, lock
//! acquisition on behalf of transactions, and lock upgrade.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::catalog::Catalog;
use crate::core::common::DbError;
use crate::core::storage::Pager;
use crate::core::transaction::lock_manager::{LockManager, LockMode};
use crate::core::transaction::transaction::{
    IsolationLevel, Transaction, TransactionState, UndoRecord,
};

struct TmState {
    next_txn_id: u64,
    active: HashMap<u64, Transaction>,
    /// Terminal states of finished transactions, kept so repeated
    /// commit/abort can report the precise violation.
    finished: HashMap<u64, TransactionState>,
}

/// Issues transaction ids and drives the transaction lifecycle.
pub struct TransactionManager {
    pager: Arc<Mutex<Pager>>,
    locks: LockManager,
    state: Mutex<TmState>,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionManager")
            .field("next_txn_id", &state.next_txn_id)
            .field("active", &state.active.len())
            .finish()
    }
}

impl TransactionManager {
    #[must_use]
    pub fn new(pager: Arc<Mutex<Pager>>) -> Self {
        Self {
            pager,
            locks: LockManager::new(),
            state: Mutex::new(TmState {
                next_txn_id: 1,
                active: HashMap::new(),
                finished: HashMap::new(),
            }),
        }
    }

    /// The hosted lock manager.
    #[must_use]
    pub const fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    /// Starts a new transaction and returns its id. Ids increase
    /// monotonically from 1.
    pub fn begin(&self, isolation: IsolationLevel, timeout: Duration) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_txn_id;
        state.next_txn_id += 1;
        state.active.insert(id, Transaction::new(id, isolation, timeout));
        debug!(txn_id = id, ?isolation, "transaction started");
        id
    }

    /// Current state of a transaction, active or finished.
    #[must_use]
    pub fn transaction_state(&self, txn_id: u64) -> Option<TransactionState> {
        let state = self.state.lock();
        if state.active.contains_key(&txn_id) {
            return Some(TransactionState::Active);
        }
        state.finished.get(&txn_id).copied()
    }

    /// Number of transactions in the active set.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Appends an undo record to an active transaction.
    ///
    /// # Errors
    /// `NoSuchTransaction` when the transaction is not active.
    pub fn record_undo(&self, txn_id: u64, record: UndoRecord) -> Result<(), DbError> {
        let mut state = self.state.lock();
        let txn = state
            .active
            .get_mut(&txn_id)
            .ok_or_else(|| no_such_transaction(txn_id))?;
        txn.undo_log.push(record);
        Ok(())
    }

    /// Acquires a lock for a transaction, with re-entry and upgrade
    /// semantics:
    /// - a request covered by a held lock is a no-op;
    /// - Shared -> Exclusive releases the shared lock, acquires
    ///   exclusive, and on failure best-effort re-acquires shared before
    ///   surfacing the failure. Another transaction's exclusive request
    ///   may interpose during the window; callers must tolerate deadlock
    ///   and lock-failure outcomes.
    ///
    /// # Errors
    /// `NoSuchTransaction` for inactive transactions plus the lock
    /// manager's `TransactionAborted`/`OperationFailed` outcomes.
    pub async fn acquire_lock(
        &self,
        txn_id: u64,
        resource: &str,
        mode: LockMode,
    ) -> Result<(), DbError> {
        let (timeout, held) = {
            let state = self.state.lock();
            let txn = state
                .active
                .get(&txn_id)
                .ok_or_else(|| no_such_transaction(txn_id))?;
            (txn.timeout, txn.held_locks.get(resource).map(|l| l.mode))
        };

        match held {
            Some(held_mode) if held_mode.covers(mode) => Ok(()),
            Some(LockMode::Shared) => {
                // Upgrade path.
                {
                    let mut state = self.state.lock();
                    if let Some(txn) = state.active.get_mut(&txn_id) {
                        txn.held_locks.remove(resource);
                    }
                }
                self.locks.release(resource, txn_id);
                match self.locks.acquire(resource, txn_id, LockMode::Exclusive, timeout).await {
                    Ok(lock) => {
                        self.remember_lock(txn_id, resource, lock.mode);
                        Ok(())
                    }
                    Err(upgrade_err) => {
                        match self
                            .locks
                            .acquire(resource, txn_id, LockMode::Shared, timeout)
                            .await
                        {
                            Ok(_) => self.remember_lock(txn_id, resource, LockMode::Shared),
                            Err(reacquire_err) => warn!(
                                txn_id,
                                resource,
                                error = %reacquire_err,
                                "could not restore shared lock after failed upgrade"
                            ),
                        }
                        Err(upgrade_err)
                    }
                }
            }
            _ => {
                let lock = self.locks.acquire(resource, txn_id, mode, timeout).await?;
                self.remember_lock(txn_id, resource, lock.mode);
                Ok(())
            }
        }
    }

    fn remember_lock(&self, txn_id: u64, resource: &str, mode: LockMode) {
        let mut state = self.state.lock();
        if let Some(txn) = state.active.get_mut(&txn_id) {
            txn.held_locks.insert(
                resource.to_string(),
                crate::core::transaction::lock_manager::Lock {
                    resource: resource.to_string(),
                    mode,
                    txn_id,
                    acquired_at: std::time::Instant::now(),
                },
            );
        } else {
            // The transaction finished while the acquire was parked;
            // nothing will release this grant, so do it here.
            self.locks.release(resource, txn_id);
        }
    }

    /// Commits an active transaction: marks it committed, releases its
    /// locks, drops the undo log, and requests a durability flush when
    /// it wrote anything.
    ///
    /// # Errors
    /// `TransactionCommitted` on double commit, `TransactionAborted`
    /// when the transaction was aborted, `NoSuchTransaction` for unknown
    /// ids.
    pub fn commit(&self, txn_id: u64) -> Result<(), DbError> {
        let mut txn = {
            let mut state = self.state.lock();
            if let Some(finished) = state.finished.get(&txn_id) {
                return Err(terminal_state_error(txn_id, *finished));
            }
            let txn = state
                .active
                .remove(&txn_id)
                .ok_or_else(|| no_such_transaction(txn_id))?;
            state.finished.insert(txn_id, TransactionState::Committed);
            txn
        };
        txn.state = TransactionState::Committed;
        self.locks.release_all(txn_id);
        let wrote = txn.has_writes();
        txn.undo_log.clear();
        if wrote {
            self.pager.lock().flush()?;
        }
        debug!(txn_id, "transaction committed");
        Ok(())
    }

    /// Aborts an active transaction: replays its undo log in reverse
    /// against the catalog, then releases its locks. Rollback errors are
    /// logged and never prevent the transition to `Aborted`.
    ///
    /// # Errors
    /// `TransactionAborted` on double abort, `TransactionCommitted` when
    /// the transaction already committed, `NoSuchTransaction` for
    /// unknown ids.
    pub fn abort(&self, txn_id: u64, catalog: &Catalog) -> Result<(), DbError> {
        let mut txn = {
            let mut state = self.state.lock();
            if let Some(finished) = state.finished.get(&txn_id) {
                return Err(terminal_state_error(txn_id, *finished));
            }
            let txn = state
                .active
                .remove(&txn_id)
                .ok_or_else(|| no_such_transaction(txn_id))?;
            state.finished.insert(txn_id, TransactionState::Aborted);
            txn
        };
        txn.state = TransactionState::Aborted;

        let mut touched: HashSet<String> = HashSet::new();
        for record in txn.undo_log.iter().rev() {
            let (collection_name, result) = match record {
                UndoRecord::Insert { collection, doc_id } => (
                    collection,
                    catalog
                        .require_collection(collection)
                        .and_then(|c| c.rollback_insert(doc_id)),
                ),
                UndoRecord::Update { collection, doc_id, old_doc } => (
                    collection,
                    catalog
                        .require_collection(collection)
                        .and_then(|c| c.rollback_update(doc_id, old_doc)),
                ),
                UndoRecord::Delete { collection, old_doc, .. } => (
                    collection,
                    catalog
                        .require_collection(collection)
                        .and_then(|c| c.rollback_delete(old_doc)),
                ),
            };
            match result {
                Ok(()) => {
                    touched.insert(collection_name.clone());
                }
                Err(e) => warn!(txn_id, collection = %collection_name, error = %e,
                    "undo record failed during abort"),
            }
        }
        // Rolled-back collections changed counts and possibly roots.
        for name in touched {
            if let Err(e) = catalog.save_collection(&name) {
                warn!(txn_id, collection = %name, error = %e,
                    "failed to rewrite catalog entry after rollback");
            }
        }

        self.locks.release_all(txn_id);
        debug!(txn_id, "transaction aborted");
        Ok(())
    }
}

fn no_such_transaction(txn_id: u64) -> DbError {
    DbError::NoSuchTransaction(format!("no active transaction {txn_id}"))
}

fn terminal_state_error(txn_id: u64, state: TransactionState) -> DbError {
    match state {
        TransactionState::Committed => DbError::TransactionCommitted(format!(
            "transaction {txn_id} has already been committed"
        )),
        TransactionState::Aborted => DbError::TransactionAborted(format!(
            "transaction {txn_id} has already been aborted"
        )),
        TransactionState::Active => {
            DbError::Internal(format!("transaction {txn_id} recorded as finished while active"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bson::Value;
    use crate::doc;
    use tempfile::tempdir;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn setup() -> (tempfile::TempDir, Arc<Mutex<Pager>>, Arc<Catalog>, TransactionManager) {
        let dir = tempdir().unwrap();
        let pager = Arc::new(Mutex::new(
            Pager::open(dir.path().join("test.db"), 1024).unwrap(),
        ));
        let catalog = Arc::new(Catalog::open(Arc::clone(&pager)).unwrap());
        let tm = TransactionManager::new(Arc::clone(&pager));
        (dir, pager, catalog, tm)
    }

    #[test]
    fn test_ids_are_monotonic_from_one() {
        let (_dir, _pager, _catalog, tm) = setup();
        let first = tm.begin(IsolationLevel::default(), TIMEOUT);
        let second = tm.begin(IsolationLevel::default(), TIMEOUT);
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn test_commit_lifecycle_and_double_commit() {
        let (_dir, _pager, _catalog, tm) = setup();
        let txn = tm.begin(IsolationLevel::default(), TIMEOUT);
        assert_eq!(tm.transaction_state(txn), Some(TransactionState::Active));
        tm.commit(txn).unwrap();
        assert_eq!(tm.transaction_state(txn), Some(TransactionState::Committed));
        assert!(matches!(
            tm.commit(txn),
            Err(DbError::TransactionCommitted(_))
        ));
        assert_eq!(tm.active_count(), 0);
    }

    #[test]
    fn test_abort_then_commit_rejected() {
        let (_dir, _pager, catalog, tm) = setup();
        let txn = tm.begin(IsolationLevel::default(), TIMEOUT);
        tm.abort(txn, &catalog).unwrap();
        assert_eq!(tm.transaction_state(txn), Some(TransactionState::Aborted));
        assert!(matches!(tm.commit(txn), Err(DbError::TransactionAborted(_))));
        assert!(matches!(
            tm.abort(txn, &catalog),
            Err(DbError::TransactionAborted(_))
        ));
    }

    #[test]
    fn test_abort_replays_undo_in_reverse() {
        let (_dir, _pager, catalog, tm) = setup();
        let users = catalog.create_collection("users").unwrap();
        users.insert_document(doc! { "_id": 1, "v": 1 }).unwrap();

        let txn = tm.begin(IsolationLevel::default(), TIMEOUT);
        // Update then delete the same document inside the transaction.
        let old = users
            .replace_document(&Value::Int32(1), doc! { "_id": 1, "v": 2 })
            .unwrap()
            .unwrap();
        tm.record_undo(
            txn,
            UndoRecord::Update {
                collection: "users".into(),
                doc_id: Value::Int32(1),
                old_doc: old,
            },
        )
        .unwrap();
        let deleted = users.delete_document(&Value::Int32(1)).unwrap().unwrap();
        tm.record_undo(
            txn,
            UndoRecord::Delete {
                collection: "users".into(),
                doc_id: Value::Int32(1),
                old_doc: deleted,
            },
        )
        .unwrap();

        tm.abort(txn, &catalog).unwrap();
        // Reverse replay restores the delete first, then the update's
        // pre-image wins.
        let restored = users.find_by_id(&Value::Int32(1)).unwrap().unwrap();
        assert_eq!(restored.get("v"), Some(&Value::Int32(1)));
        assert_eq!(users.document_count(), 1);
    }

    #[test]
    fn test_abort_reverts_insert() {
        let (_dir, _pager, catalog, tm) = setup();
        let users = catalog.create_collection("users").unwrap();
        let txn = tm.begin(IsolationLevel::default(), TIMEOUT);
        users.insert_document(doc! { "_id": 7 }).unwrap();
        tm.record_undo(
            txn,
            UndoRecord::Insert { collection: "users".into(), doc_id: Value::Int32(7) },
        )
        .unwrap();
        tm.abort(txn, &catalog).unwrap();
        assert_eq!(users.find_by_id(&Value::Int32(7)).unwrap(), None);
        assert_eq!(users.document_count(), 0);
    }

    #[tokio::test]
    async fn test_commit_releases_locks() {
        let (_dir, _pager, _catalog, tm) = setup();
        let txn = tm.begin(IsolationLevel::default(), TIMEOUT);
        tm.acquire_lock(txn, "col:users", LockMode::Exclusive)
            .await
            .unwrap();
        assert!(tm.lock_manager().holds("col:users", txn, LockMode::Exclusive));
        tm.commit(txn).unwrap();
        assert!(!tm.lock_manager().holds("col:users", txn, LockMode::Shared));
    }

    #[tokio::test]
    async fn test_lock_reentry_is_noop() {
        let (_dir, _pager, _catalog, tm) = setup();
        let txn = tm.begin(IsolationLevel::default(), TIMEOUT);
        tm.acquire_lock(txn, "col:x", LockMode::Exclusive).await.unwrap();
        tm.acquire_lock(txn, "col:x", LockMode::Exclusive).await.unwrap();
        tm.acquire_lock(txn, "col:x", LockMode::Shared).await.unwrap();
        assert!(tm.lock_manager().holds("col:x", txn, LockMode::Exclusive));
    }

    #[tokio::test]
    async fn test_lock_upgrade_succeeds_as_sole_holder() {
        let (_dir, _pager, _catalog, tm) = setup();
        let txn = tm.begin(IsolationLevel::default(), TIMEOUT);
        tm.acquire_lock(txn, "col:x", LockMode::Shared).await.unwrap();
        tm.acquire_lock(txn, "col:x", LockMode::Exclusive).await.unwrap();
        assert!(tm.lock_manager().holds("col:x", txn, LockMode::Exclusive));
    }

    #[tokio::test]
    async fn test_lock_upgrade_failure_restores_shared() {
        let (_dir, _pager, _catalog, tm) = setup();
        let t1 = tm.begin(IsolationLevel::ReadCommitted, Duration::from_millis(80));
        let t2 = tm.begin(IsolationLevel::ReadCommitted, TIMEOUT);
        tm.acquire_lock(t1, "col:x", LockMode::Shared).await.unwrap();
        tm.acquire_lock(t2, "col:x", LockMode::Shared).await.unwrap();

        // T1 cannot upgrade while T2 also reads; it must end up holding
        // either nothing or its restored shared lock, never a silent
        // downgrade of the error.
        let err = tm
            .acquire_lock(t1, "col:x", LockMode::Exclusive)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::OperationFailed(_)));
        assert!(tm.lock_manager().holds("col:x", t1, LockMode::Shared));
        assert!(tm.lock_manager().holds("col:x", t2, LockMode::Shared));
    }

    #[test]
    fn test_record_undo_requires_active_txn() {
        let (_dir, _pager, _catalog, tm) = setup();
        let result = tm.record_undo(
            99,
            UndoRecord::Insert { collection: "c".into(), doc_id: Value::Int32(1) },
        );
        assert!(matches!(result, Err(DbError::NoSuchTransaction(_))));
    }
}
