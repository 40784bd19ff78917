//! Logical sessions: per-session transaction lifecycle, monotonic
//! transaction numbering, TTL expiry, and command-context extraction.
//!
//! Sessions are keyed by the hex encoding of the 16-byte `lsid.id`
//! binary. Each session records the highest transaction number it has
//! seen; `startTransaction` must present a strictly greater number.
//! Idle sessions are removed by a periodic sweep that aborts their
//! active transactions with errors swallowed.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::bson::{Document, Value};
use crate::core::catalog::Catalog;
use crate::core::common::DbError;
use crate::core::transaction::{IsolationLevel, TransactionManager, TransactionState};

/// Resolved session information attached to a command.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub session_key: Option<String>,
    pub txn_number: Option<i64>,
    /// The engine transaction commands should record undo entries
    /// against; set when `autocommit: false`.
    pub txn_id: Option<u64>,
    pub autocommit: bool,
}

impl SessionContext {
    /// A context for a command outside any session.
    #[must_use]
    pub fn none() -> Self {
        Self { autocommit: true, ..Self::default() }
    }

    /// Whether the command runs inside an explicit transaction.
    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        self.txn_id.is_some()
    }
}

/// The transaction a session currently owns.
#[derive(Debug, Clone)]
pub struct SessionTransaction {
    pub txn_number: i64,
    pub txn_id: u64,
    pub state: TransactionState,
    pub start_time: Instant,
    pub autocommit: bool,
    /// Commands executed under this transaction.
    pub operations: u64,
    pub read_concern: Option<String>,
    pub write_concern: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Ended,
}

#[derive(Debug)]
struct Session {
    id: [u8; 16],
    last_used: Instant,
    state: SessionState,
    /// Highest transaction number used; starts below any valid number.
    txn_number_used: i64,
    current: Option<SessionTransaction>,
}

impl Session {
    fn new(id: [u8; 16]) -> Self {
        Self {
            id,
            last_used: Instant::now(),
            state: SessionState::Active,
            txn_number_used: -1,
            current: None,
        }
    }
}

/// Registry of logical sessions.
pub struct SessionManager {
    transactions: Arc<TransactionManager>,
    catalog: Arc<Catalog>,
    sessions: Mutex<HashMap<String, Session>>,
    session_ttl: Duration,
    sweep_interval: Duration,
    txn_timeout: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.lock().len())
            .field("session_ttl", &self.session_ttl)
            .finish()
    }
}

impl SessionManager {
    #[must_use]
    pub fn new(
        transactions: Arc<TransactionManager>,
        catalog: Arc<Catalog>,
        session_ttl: Duration,
        sweep_interval: Duration,
        txn_timeout: Duration,
    ) -> Self {
        Self {
            transactions,
            catalog,
            sessions: Mutex::new(HashMap::new()),
            session_ttl,
            sweep_interval,
            txn_timeout,
            sweeper: Mutex::new(None),
        }
    }

    /// The registry key for an lsid.
    #[must_use]
    pub fn session_key(lsid: &[u8; 16]) -> String {
        hex::encode(lsid)
    }

    /// Resolves the session for `lsid`, creating it on first use, and
    /// returns its key.
    pub fn get_or_create_session(&self, lsid: &[u8; 16]) -> String {
        let key = Self::session_key(lsid);
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(key.clone()).or_insert_with(|| {
            debug!(session = %key, "session created");
            Session::new(*lsid)
        });
        session.last_used = Instant::now();
        key
    }

    /// Bumps a session's idle clock.
    ///
    /// # Errors
    /// `NoSuchSession` when the key is unknown.
    pub fn refresh_session(&self, key: &str) -> Result<(), DbError> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(key).ok_or(DbError::NoSuchSession)?;
        session.last_used = Instant::now();
        Ok(())
    }

    /// Ends a session, aborting its active transaction best-effort.
    /// Ending an unknown session is a no-op.
    pub fn end_session(&self, key: &str) {
        let removed = self.sessions.lock().remove(key);
        if let Some(mut session) = removed {
            session.state = SessionState::Ended;
            self.abort_session_txn_quietly(key, &mut session);
        }
    }

    /// Starts a transaction with `txn_number` on the session, aborting a
    /// still-active predecessor first, and returns the engine
    /// transaction id.
    ///
    /// # Errors
    /// `NoSuchSession` for unknown keys, `TransactionTooOld` when the
    /// number does not advance.
    pub fn start_transaction(
        &self,
        key: &str,
        txn_number: i64,
        read_concern: Option<String>,
        write_concern: Option<String>,
    ) -> Result<u64, DbError> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(key).ok_or(DbError::NoSuchSession)?;
        if session.state == SessionState::Ended {
            return Err(DbError::NoSuchSession);
        }
        if txn_number <= session.txn_number_used {
            return Err(DbError::TransactionTooOld(format!(
                "txnNumber {txn_number} is not greater than the last used number {} on this session",
                session.txn_number_used
            )));
        }
        if let Some(previous) = session.current.take() {
            if previous.state == TransactionState::Active {
                if let Err(e) = self.transactions.abort(previous.txn_id, &self.catalog) {
                    warn!(session = %key, txn_id = previous.txn_id, error = %e,
                        "failed to abort superseded transaction");
                }
            }
        }
        let txn_id = self.transactions.begin(IsolationLevel::default(), self.txn_timeout);
        session.current = Some(SessionTransaction {
            txn_number,
            txn_id,
            state: TransactionState::Active,
            start_time: Instant::now(),
            autocommit: false,
            operations: 0,
            read_concern,
            write_concern,
        });
        session.txn_number_used = txn_number;
        session.last_used = Instant::now();
        debug!(session = %key, txn_number, txn_id, "session transaction started");
        Ok(txn_id)
    }

    /// Commits the session's transaction `txn_number`. Repeating the
    /// commit of an already committed number succeeds silently.
    ///
    /// # Errors
    /// `NoSuchSession`/`NoSuchTransaction` on resolution failures,
    /// `TransactionAborted` when the transaction was aborted.
    pub fn commit_transaction(&self, key: &str, txn_number: i64) -> Result<(), DbError> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(key).ok_or(DbError::NoSuchSession)?;
        session.last_used = Instant::now();
        let current = session
            .current
            .as_mut()
            .filter(|txn| txn.txn_number == txn_number)
            .ok_or_else(|| no_session_txn(txn_number))?;
        match current.state {
            TransactionState::Committed => Ok(()),
            TransactionState::Aborted => Err(DbError::TransactionAborted(format!(
                "transaction {txn_number} has been aborted"
            ))),
            TransactionState::Active => {
                self.transactions.commit(current.txn_id)?;
                current.state = TransactionState::Committed;
                Ok(())
            }
        }
    }

    /// Aborts the session's transaction `txn_number`. Repeating the
    /// abort of an already aborted number succeeds silently.
    ///
    /// # Errors
    /// `NoSuchSession`/`NoSuchTransaction` on resolution failures,
    /// `TransactionCommitted` when the transaction already committed.
    pub fn abort_transaction(&self, key: &str, txn_number: i64) -> Result<(), DbError> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(key).ok_or(DbError::NoSuchSession)?;
        session.last_used = Instant::now();
        let current = session
            .current
            .as_mut()
            .filter(|txn| txn.txn_number == txn_number)
            .ok_or_else(|| no_session_txn(txn_number))?;
        match current.state {
            TransactionState::Aborted => Ok(()),
            TransactionState::Committed => Err(DbError::TransactionCommitted(format!(
                "transaction {txn_number} has already been committed"
            ))),
            TransactionState::Active => {
                self.transactions.abort(current.txn_id, &self.catalog)?;
                current.state = TransactionState::Aborted;
                Ok(())
            }
        }
    }

    /// Resolves the active transaction `txn_number` on a session.
    ///
    /// # Errors
    /// `NoSuchSession` for unknown keys, `NoSuchTransaction` when no
    /// active transaction carries that number.
    pub fn get_active_transaction(&self, key: &str, txn_number: i64) -> Result<u64, DbError> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(key).ok_or(DbError::NoSuchSession)?;
        session.last_used = Instant::now();
        let current = session
            .current
            .as_mut()
            .filter(|txn| txn.txn_number == txn_number && txn.state == TransactionState::Active)
            .ok_or_else(|| no_session_txn(txn_number))?;
        current.operations += 1;
        Ok(current.txn_id)
    }

    /// Snapshot of a session's current transaction, for diagnostics and
    /// tests.
    #[must_use]
    pub fn current_transaction(&self, key: &str) -> Option<SessionTransaction> {
        self.sessions.lock().get(key).and_then(|s| s.current.clone())
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Removes sessions idle longer than the TTL, aborting their active
    /// transactions. Errors are swallowed to keep the sweep alive.
    /// Returns the number of sessions removed.
    pub fn sweep_idle_sessions(&self) -> usize {
        let expired: Vec<(String, Session)> = {
            let mut sessions = self.sessions.lock();
            let keys: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| session.last_used.elapsed() >= self.session_ttl)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| sessions.remove(&key).map(|session| (key, session)))
                .collect()
        };
        let count = expired.len();
        for (key, mut session) in expired {
            session.state = SessionState::Ended;
            self.abort_session_txn_quietly(&key, &mut session);
            debug!(lsid = %hex::encode(session.id), "idle session removed");
        }
        count
    }

    /// Spawns the periodic TTL sweep. Requires a running tokio runtime;
    /// the task holds only a weak reference and exits when the manager
    /// is dropped or `shutdown` is called.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                manager.sweep_idle_sessions();
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    /// Ends every session, aborting active transactions, and stops the
    /// sweeper.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        let drained: Vec<(String, Session)> = self.sessions.lock().drain().collect();
        for (key, mut session) in drained {
            session.state = SessionState::Ended;
            self.abort_session_txn_quietly(&key, &mut session);
        }
    }

    fn abort_session_txn_quietly(&self, key: &str, session: &mut Session) {
        if let Some(current) = session.current.as_mut() {
            if current.state == TransactionState::Active {
                if let Err(e) = self.transactions.abort(current.txn_id, &self.catalog) {
                    warn!(session = %key, txn_id = current.txn_id, error = %e,
                        "failed to abort transaction while ending session");
                }
                current.state = TransactionState::Aborted;
            }
        }
    }

    /// Resolves the session pieces of a command document: `lsid`,
    /// `txnNumber`, `startTransaction`, `autocommit`,
    /// `readConcern.level`, and `writeConcern.w`.
    ///
    /// # Errors
    /// `FailedToParse` for malformed fields, `BadValue` for
    /// `startTransaction` without `autocommit: false` or a transaction
    /// number outside a session, plus the errors of
    /// [`Self::start_transaction`] and [`Self::get_active_transaction`].
    pub fn extract_context(&self, command: &Document) -> Result<SessionContext, DbError> {
        let lsid = match command.get("lsid") {
            None => {
                if command.contains_key("txnNumber") {
                    return Err(DbError::BadValue(
                        "txnNumber requires a session (lsid)".into(),
                    ));
                }
                return Ok(SessionContext::none());
            }
            Some(Value::Document(doc)) => {
                let bytes = doc.get("id").and_then(Value::as_binary).ok_or_else(|| {
                    DbError::FailedToParse("lsid.id must be a binary field".into())
                })?;
                <[u8; 16]>::try_from(bytes).map_err(|_| {
                    DbError::FailedToParse(format!(
                        "lsid.id must be 16 bytes, got {}",
                        bytes.len()
                    ))
                })?
            }
            Some(_) => {
                return Err(DbError::FailedToParse("lsid must be a document".into()));
            }
        };
        let key = self.get_or_create_session(&lsid);

        let txn_number = match command.get("txnNumber") {
            None => None,
            Some(value) => Some(value.as_i64().ok_or_else(|| {
                DbError::FailedToParse("txnNumber must be an integer".into())
            })?),
        };
        let start_transaction = match command.get("startTransaction") {
            None => false,
            Some(value) => value.as_bool().ok_or_else(|| {
                DbError::FailedToParse("startTransaction must be a boolean".into())
            })?,
        };
        let autocommit = match command.get("autocommit") {
            None => None,
            Some(value) => Some(value.as_bool().ok_or_else(|| {
                DbError::FailedToParse("autocommit must be a boolean".into())
            })?),
        };

        if start_transaction {
            if autocommit != Some(false) {
                return Err(DbError::BadValue(
                    "startTransaction requires autocommit: false".into(),
                ));
            }
            let txn_number = txn_number.ok_or_else(|| {
                DbError::BadValue("startTransaction requires a txnNumber".into())
            })?;
            let read_concern = command
                .get_path("readConcern.level")
                .and_then(Value::as_str)
                .map(str::to_string);
            let write_concern = command.get_path("writeConcern.w").map(|w| match w {
                Value::String(s) => s.clone(),
                other => format!("{other:?}"),
            });
            let txn_id = self.start_transaction(&key, txn_number, read_concern, write_concern)?;
            return Ok(SessionContext {
                session_key: Some(key),
                txn_number: Some(txn_number),
                txn_id: Some(txn_id),
                autocommit: false,
            });
        }

        if autocommit == Some(false) {
            let txn_number = txn_number.ok_or_else(|| {
                DbError::BadValue("autocommit: false requires a txnNumber".into())
            })?;
            let txn_id = self.get_active_transaction(&key, txn_number)?;
            return Ok(SessionContext {
                session_key: Some(key),
                txn_number: Some(txn_number),
                txn_id: Some(txn_id),
                autocommit: false,
            });
        }

        Ok(SessionContext {
            session_key: Some(key),
            txn_number,
            txn_id: None,
            autocommit: true,
        })
    }
}

fn no_session_txn(txn_number: i64) -> DbError {
    DbError::NoSuchTransaction(format!(
        "no transaction with number {txn_number} in progress on this session"
    ))
}
