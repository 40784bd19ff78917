//! The lock manager: shared/exclusive locks with wait queues and
//! deadlock detection.
//!
//! Resources are opaque strings (`"col:<name>"`, `"doc:<name>:<id>"` by
//! convention; the manager never interprets them). A request that cannot
//! be granted parks on a oneshot channel in the resource's FIFO wait
//! queue and is resolved by `release`. Blocked requests register edges
//! in a wait-for graph; a cycle found at block time aborts the newly
//! blocked transaction (LIFO victim). Each blocked request carries a
//! timeout.
//!
//! Wake-up scans the queue in arrival order and grants every request
//! the rule admits, so shared requests that arrived before a blocked
//! exclusive may overtake it. Writers are therefore not guaranteed
//! progress against a continuous stream of readers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::core::common::DbError;

/// The lock mode of a request or grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared (read) access; compatible with other shared holders.
    Shared,
    /// Exclusive (write) access; compatible with nothing else.
    Exclusive,
}

impl LockMode {
    /// Whether a grant at `self` already satisfies a request for
    /// `requested`.
    #[must_use]
    pub const fn covers(self, requested: Self) -> bool {
        matches!(
            (self, requested),
            (Self::Exclusive, _) | (Self::Shared, Self::Shared)
        )
    }
}

/// A granted lock.
#[derive(Debug, Clone)]
pub struct Lock {
    pub resource: String,
    pub mode: LockMode,
    pub txn_id: u64,
    pub acquired_at: Instant,
}

struct Waiter {
    txn_id: u64,
    mode: LockMode,
    grant: oneshot::Sender<Lock>,
}

#[derive(Default)]
struct LockEntry {
    exclusive: Option<u64>,
    shared: HashSet<u64>,
    queue: VecDeque<Waiter>,
}

impl LockEntry {
    // Shared: grantable unless a different txn holds exclusive.
    // Exclusive: grantable when every holder (of either mode) is the
    // requester itself.
    fn grantable(&self, txn_id: u64, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.exclusive.map_or(true, |holder| holder == txn_id),
            LockMode::Exclusive => {
                self.exclusive.map_or(true, |holder| holder == txn_id)
                    && self.shared.iter().all(|&holder| holder == txn_id)
            }
        }
    }

    fn grant(&mut self, txn_id: u64, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                self.shared.insert(txn_id);
            }
            LockMode::Exclusive => self.exclusive = Some(txn_id),
        }
    }

    fn revoke(&mut self, txn_id: u64, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                self.shared.remove(&txn_id);
            }
            LockMode::Exclusive => {
                if self.exclusive == Some(txn_id) {
                    self.exclusive = None;
                }
            }
        }
    }

    fn holds_covering(&self, txn_id: u64, mode: LockMode) -> bool {
        if self.exclusive == Some(txn_id) {
            return true;
        }
        mode == LockMode::Shared && self.shared.contains(&txn_id)
    }

    fn holders(&self) -> impl Iterator<Item = u64> + '_ {
        self.exclusive.into_iter().chain(self.shared.iter().copied())
    }

    fn is_idle(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty() && self.queue.is_empty()
    }
}

#[derive(Default)]
struct LockState {
    resources: HashMap<String, LockEntry>,
    /// txn id -> set of txn ids it waits on.
    wait_for: HashMap<u64, HashSet<u64>>,
}

impl LockState {
    // DFS from `start` over the wait-for edges; reaching `start` again
    // closes a cycle. Stale edges only delay detection, never invent
    // cycles, as long as release paths clear a finished txn's edges.
    fn detect_cycle(&self, start: u64) -> bool {
        let mut stack: Vec<u64> = self
            .wait_for
            .get(&start)
            .map(|edges| edges.iter().copied().collect())
            .unwrap_or_default();
        let mut visited = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == start {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(edges) = self.wait_for.get(&node) {
                stack.extend(edges.iter().copied());
            }
        }
        false
    }

    fn remove_waiter(&mut self, resource: &str, txn_id: u64) {
        if let Some(entry) = self.resources.get_mut(resource) {
            entry.queue.retain(|waiter| waiter.txn_id != txn_id);
        }
    }

    fn cleanup(&mut self, resource: &str) {
        if self
            .resources
            .get(resource)
            .is_some_and(LockEntry::is_idle)
        {
            self.resources.remove(resource);
        }
    }

    // One FIFO pass over the queue: grant what the rule now admits,
    // keep the rest in order.
    fn release_and_wake(&mut self, resource: &str, txn_id: u64) {
        let Self { resources, wait_for } = self;
        let Some(entry) = resources.get_mut(resource) else {
            return;
        };
        entry.shared.remove(&txn_id);
        if entry.exclusive == Some(txn_id) {
            entry.exclusive = None;
        }
        entry.queue.retain(|waiter| waiter.txn_id != txn_id);

        let mut remaining = VecDeque::with_capacity(entry.queue.len());
        while let Some(waiter) = entry.queue.pop_front() {
            if entry.grantable(waiter.txn_id, waiter.mode) {
                entry.grant(waiter.txn_id, waiter.mode);
                wait_for.remove(&waiter.txn_id);
                let lock = Lock {
                    resource: resource.to_string(),
                    mode: waiter.mode,
                    txn_id: waiter.txn_id,
                    acquired_at: Instant::now(),
                };
                debug!(resource, txn_id = waiter.txn_id, mode = ?waiter.mode, "lock granted from queue");
                if waiter.grant.send(lock).is_err() {
                    // The acquirer timed out between the timer firing and
                    // us granting; take the grant back.
                    entry.revoke(waiter.txn_id, waiter.mode);
                }
            } else {
                remaining.push_back(waiter);
            }
        }
        entry.queue = remaining;
        self.cleanup(resource);
    }
}

/// Per-resource lock table with wait queues and a global wait-for graph.
#[derive(Default)]
pub struct LockManager {
    state: Mutex<LockState>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LockManager")
            .field("resources", &state.resources.len())
            .field("waiting", &state.wait_for.len())
            .finish()
    }
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `mode` on `resource` for `txn_id`, waiting up to
    /// `timeout` behind current holders.
    ///
    /// # Errors
    /// `TransactionAborted` when the wait would close a deadlock cycle
    /// (the requester is the victim), `OperationFailed` when the timeout
    /// expires first.
    pub async fn acquire(
        &self,
        resource: &str,
        txn_id: u64,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Lock, DbError> {
        let receiver = {
            let mut state = self.state.lock();
            let entry = state.resources.entry(resource.to_string()).or_default();
            if entry.grantable(txn_id, mode) {
                entry.grant(txn_id, mode);
                debug!(resource, txn_id, ?mode, "lock granted");
                return Ok(Lock {
                    resource: resource.to_string(),
                    mode,
                    txn_id,
                    acquired_at: Instant::now(),
                });
            }

            let holders: Vec<u64> = entry.holders().filter(|&h| h != txn_id).collect();
            let (sender, receiver) = oneshot::channel();
            entry.queue.push_back(Waiter { txn_id, mode, grant: sender });
            state.wait_for.entry(txn_id).or_default().extend(holders);

            if state.detect_cycle(txn_id) {
                // LIFO victim policy: abort the transaction that just
                // blocked rather than any established holder.
                state.remove_waiter(resource, txn_id);
                state.wait_for.remove(&txn_id);
                state.cleanup(resource);
                debug!(resource, txn_id, "deadlock detected, aborting requester");
                return Err(DbError::TransactionAborted(format!(
                    "deadlock detected: transaction {txn_id} would wait on {resource}"
                )));
            }
            debug!(resource, txn_id, ?mode, "lock request queued");
            receiver
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(lock)) => Ok(lock),
            Ok(Err(_)) => Err(DbError::Internal(
                "lock waiter channel closed without a grant".into(),
            )),
            Err(_elapsed) => {
                let mut state = self.state.lock();
                // A grant may have raced the timer.
                if state
                    .resources
                    .get(resource)
                    .is_some_and(|entry| entry.holds_covering(txn_id, mode))
                {
                    return Ok(Lock {
                        resource: resource.to_string(),
                        mode,
                        txn_id,
                        acquired_at: Instant::now(),
                    });
                }
                state.remove_waiter(resource, txn_id);
                state.wait_for.remove(&txn_id);
                state.cleanup(resource);
                Err(DbError::OperationFailed(format!(
                    "lock acquisition timeout on {resource}"
                )))
            }
        }
    }

    /// Releases `txn_id`'s hold on `resource` and wakes eligible
    /// waiters.
    pub fn release(&self, resource: &str, txn_id: u64) {
        let mut state = self.state.lock();
        state.release_and_wake(resource, txn_id);
        state.wait_for.remove(&txn_id);
    }

    /// Releases every hold and pending request of `txn_id`, waking
    /// eligible waiters on each touched resource.
    pub fn release_all(&self, txn_id: u64) {
        let mut state = self.state.lock();
        let resources: Vec<String> = state
            .resources
            .iter()
            .filter(|(_, entry)| {
                entry.exclusive == Some(txn_id)
                    || entry.shared.contains(&txn_id)
                    || entry.queue.iter().any(|w| w.txn_id == txn_id)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for resource in resources {
            state.release_and_wake(&resource, txn_id);
        }
        state.wait_for.remove(&txn_id);
    }

    /// Whether `txn_id` currently holds a lock covering `mode` on
    /// `resource`.
    #[must_use]
    pub fn holds(&self, resource: &str, txn_id: u64, mode: LockMode) -> bool {
        self.state
            .lock()
            .resources
            .get(resource)
            .is_some_and(|entry| entry.holds_covering(txn_id, mode))
    }

    /// Number of resources with live entries; idle entries are removed
    /// eagerly.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.state.lock().resources.len()
    }
}
