//! Server-side cursors for batched reads.
//!
//! A find that fits in its first batch returns a synthetic cursor with
//! id 0 which is never registered; anything longer is stored under a
//! monotonically increasing id starting at 1 and drained by `getMore`.
//! Cursors die by exhaustion, explicit kill, TTL sweep, or shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::bson::Document;
use crate::core::common::limits::{DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE};
use crate::core::common::DbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Active,
    Exhausted,
    Killed,
}

#[derive(Debug)]
struct Cursor {
    id: u64,
    ns: String,
    documents: Vec<Document>,
    position: usize,
    batch_size: usize,
    state: CursorState,
    created_at: Instant,
    last_used: Instant,
}

/// One batch of results plus the id to continue with; id 0 means the
/// cursor is finished.
#[derive(Debug, Clone)]
pub struct CursorBatch {
    pub cursor_id: u64,
    pub ns: String,
    pub documents: Vec<Document>,
}

/// Outcome of a `killCursors` command. `alive` and `unknown` are
/// reserved for future use and stay empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillResult {
    pub killed: Vec<u64>,
    pub not_found: Vec<u64>,
    pub alive: Vec<u64>,
    pub unknown: Vec<u64>,
}

struct CursorTables {
    cursors: HashMap<u64, Cursor>,
    next_id: u64,
}

/// Registry of open cursors.
pub struct CursorManager {
    state: Mutex<CursorTables>,
    cursor_ttl: Duration,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CursorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorManager")
            .field("open", &self.state.lock().cursors.len())
            .field("cursor_ttl", &self.cursor_ttl)
            .finish()
    }
}

impl CursorManager {
    #[must_use]
    pub fn new(cursor_ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            state: Mutex::new(CursorTables { cursors: HashMap::new(), next_id: 1 }),
            cursor_ttl,
            sweep_interval,
            sweeper: Mutex::new(None),
        }
    }

    /// Creates a cursor over `documents` and returns the first batch.
    /// When the batch exhausts the documents the returned id is 0 and
    /// nothing is registered.
    #[must_use]
    pub fn create(
        &self,
        ns: &str,
        documents: Vec<Document>,
        batch_size: Option<usize>,
    ) -> CursorBatch {
        let batch_size = clamp_batch_size(batch_size);
        if documents.len() <= batch_size {
            return CursorBatch { cursor_id: 0, ns: ns.to_string(), documents };
        }
        let first: Vec<Document> = documents[..batch_size].to_vec();
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let now = Instant::now();
        state.cursors.insert(
            id,
            Cursor {
                id,
                ns: ns.to_string(),
                documents,
                position: batch_size,
                batch_size,
                state: CursorState::Active,
                created_at: now,
                last_used: now,
            },
        );
        debug!(cursor_id = id, ns, "cursor created");
        CursorBatch { cursor_id: id, ns: ns.to_string(), documents: first }
    }

    /// Returns the next batch of a cursor. A finished cursor reports id
    /// 0 and is removed.
    ///
    /// # Errors
    /// `CursorNotFound` for id 0, unknown ids, or cursors that are
    /// killed or exhausted (which are removed on the way out).
    pub fn get_more(
        &self,
        cursor_id: u64,
        batch_size: Option<usize>,
    ) -> Result<CursorBatch, DbError> {
        if cursor_id == 0 {
            return Err(DbError::CursorNotFound(0));
        }
        let mut state = self.state.lock();
        let Some(cursor) = state.cursors.get_mut(&cursor_id) else {
            return Err(DbError::CursorNotFound(cursor_id));
        };
        if cursor.state != CursorState::Active {
            state.cursors.remove(&cursor_id);
            return Err(DbError::CursorNotFound(cursor_id));
        }

        let batch_size = batch_size.map_or(cursor.batch_size, |requested| {
            clamp_batch_size(Some(requested))
        });
        let end = (cursor.position + batch_size).min(cursor.documents.len());
        let documents: Vec<Document> = cursor.documents[cursor.position..end].to_vec();
        cursor.position = end;
        cursor.last_used = Instant::now();
        let ns = cursor.ns.clone();

        if cursor.position >= cursor.documents.len() {
            cursor.state = CursorState::Exhausted;
            state.cursors.remove(&cursor_id);
            return Ok(CursorBatch { cursor_id: 0, ns, documents });
        }
        Ok(CursorBatch { cursor_id, ns, documents })
    }

    /// Kills the given cursors. Present ids are marked killed, dropped,
    /// and reported in `killed`; the rest land in `not_found`.
    #[must_use]
    pub fn kill(&self, cursor_ids: &[u64]) -> KillResult {
        let mut result = KillResult::default();
        let mut state = self.state.lock();
        for &id in cursor_ids {
            match state.cursors.remove(&id) {
                Some(mut cursor) => {
                    cursor.state = CursorState::Killed;
                    debug!(cursor_id = id, ns = %cursor.ns, "cursor killed");
                    result.killed.push(id);
                }
                None => result.not_found.push(id),
            }
        }
        result
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.state.lock().cursors.len()
    }

    /// Kills cursors idle past the TTL; returns how many were removed.
    pub fn sweep_idle_cursors(&self) -> usize {
        let mut state = self.state.lock();
        let expired: Vec<u64> = state
            .cursors
            .iter()
            .filter(|(_, cursor)| cursor.last_used.elapsed() >= self.cursor_ttl)
            .map(|(&id, _)| id)
            .collect();
        for id in &expired {
            if let Some(mut cursor) = state.cursors.remove(id) {
                cursor.state = CursorState::Killed;
                debug!(cursor_id = cursor.id,
                    age_secs = cursor.created_at.elapsed().as_secs(),
                    "idle cursor killed");
            }
        }
        expired.len()
    }

    /// Spawns the periodic TTL sweep; the task holds a weak reference
    /// and exits on drop or `shutdown`.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                manager.sweep_idle_cursors();
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    /// Kills every cursor and stops the sweeper.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.state.lock().cursors.clear();
    }
}

fn clamp_batch_size(requested: Option<usize>) -> usize {
    match requested {
        None | Some(0) => DEFAULT_BATCH_SIZE,
        Some(n) => n.min(MAX_BATCH_SIZE),
    }
}
