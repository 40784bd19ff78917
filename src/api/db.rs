//! `Database` is the primary structure providing the public API of the
//! engine.
//!
//! Every command resolves an optional session context, runs inside an
//! explicit session transaction or an implicit per-command one, acquires
//! collection/document locks through the transaction manager, mutates
//! the collection, records undo entries, and finally commits or yields a
//! cursor. Implicit transactions commit on success and abort on error;
//! errors inside an explicit transaction are surfaced to the caller, who
//! decides whether to abort the transaction.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::core::bson::{compare_values, Document, Value};
use crate::core::catalog::Catalog;
use crate::core::common::DbError;
use crate::core::config::Config;
use crate::core::cursor::{CursorBatch, CursorManager, KillResult};
use crate::core::index::{key_string, IndexMeta};
use crate::core::session::{SessionContext, SessionManager};
use crate::core::storage::Pager;
use crate::core::transaction::{
    IsolationLevel, LockMode, TransactionManager, TransactionState, UndoRecord,
};

/// An embeddable, single-file document database.
#[derive(Debug)]
pub struct Database {
    config: Config,
    pager: Arc<Mutex<Pager>>,
    catalog: Arc<Catalog>,
    transactions: Arc<TransactionManager>,
    sessions: Arc<SessionManager>,
    cursors: Arc<CursorManager>,
}

/// How a command is attached to a transaction.
enum OpTxn {
    /// Session-owned; outlives the command.
    Explicit(u64),
    /// Began for this command alone; committed or aborted with it.
    Implicit(u64),
}

impl OpTxn {
    const fn id(&self) -> u64 {
        match self {
            Self::Explicit(id) | Self::Implicit(id) => *id,
        }
    }
}

impl Database {
    /// Opens (or creates) the database file and starts the TTL sweeps
    /// when called inside a tokio runtime.
    ///
    /// # Errors
    /// Returns storage errors for unreadable or foreign files.
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self, DbError> {
        let pager = Arc::new(Mutex::new(Pager::open(
            path.as_ref(),
            config.page_cache_pages,
        )?));
        let catalog = Arc::new(Catalog::open(Arc::clone(&pager))?);
        let transactions = Arc::new(TransactionManager::new(Arc::clone(&pager)));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&transactions),
            Arc::clone(&catalog),
            config.session_ttl(),
            config.session_sweep_interval(),
            config.lock_timeout(),
        ));
        let cursors = Arc::new(CursorManager::new(
            config.cursor_ttl(),
            config.cursor_sweep_interval(),
        ));
        if tokio::runtime::Handle::try_current().is_ok() {
            sessions.spawn_sweeper();
            cursors.spawn_sweeper();
        }
        info!(path = %path.as_ref().display(), "database opened");
        Ok(Self { config, pager, catalog, transactions, sessions, cursors })
    }

    /// Ends all sessions, kills all cursors, and flushes the file.
    ///
    /// # Errors
    /// Returns I/O errors from the final flush.
    pub fn close(&self) -> Result<(), DbError> {
        self.sessions.shutdown();
        self.cursors.shutdown();
        self.pager.lock().close()?;
        info!("database closed");
        Ok(())
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    #[must_use]
    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    #[must_use]
    pub fn cursors(&self) -> &Arc<CursorManager> {
        &self.cursors
    }

    /// Resolves the session pieces of a decoded command document.
    ///
    /// # Errors
    /// See [`SessionManager::extract_context`].
    pub fn extract_session_context(&self, command: &Document) -> Result<SessionContext, DbError> {
        self.sessions.extract_context(command)
    }

    // --- collection DDL ---

    /// Explicitly creates a collection.
    ///
    /// # Errors
    /// `InvalidNamespace` / `IllegalOperation` from the catalog, lock
    /// failures from the transaction manager.
    pub async fn create_collection(
        &self,
        ns: &str,
        ctx: &SessionContext,
    ) -> Result<(), DbError> {
        let txn = self.begin_op(ctx)?;
        let result = async {
            self.transactions
                .acquire_lock(txn.id(), &collection_resource(ns), LockMode::Exclusive)
                .await?;
            self.catalog.create_collection(ns)?;
            self.pager.lock().flush()
        }
        .await;
        self.finish_op(txn, result)
    }

    /// Drops a collection and its catalog entry.
    ///
    /// # Errors
    /// `NamespaceNotFound` when it does not exist.
    pub async fn drop_collection(&self, ns: &str, ctx: &SessionContext) -> Result<(), DbError> {
        let txn = self.begin_op(ctx)?;
        let result = async {
            self.transactions
                .acquire_lock(txn.id(), &collection_resource(ns), LockMode::Exclusive)
                .await?;
            self.catalog.drop_collection(ns)?;
            self.pager.lock().flush()
        }
        .await;
        self.finish_op(txn, result)
    }

    /// Collection names in sorted order.
    #[must_use]
    pub fn list_collections(&self) -> Vec<String> {
        self.catalog.list_collection_names()
    }

    // --- index DDL ---

    /// Creates an index, backfilling existing documents under the
    /// collection exclusive lock.
    ///
    /// # Errors
    /// See [`crate::core::index::IndexManager::create_index`].
    pub async fn create_index(
        &self,
        ns: &str,
        key_spec: Vec<(String, i32)>,
        unique: bool,
        name: Option<String>,
        ctx: &SessionContext,
    ) -> Result<String, DbError> {
        let txn = self.begin_op(ctx)?;
        let result = async {
            self.transactions
                .acquire_lock(txn.id(), &collection_resource(ns), LockMode::Exclusive)
                .await?;
            let collection = self.catalog.get_or_create_collection(ns)?;
            let name = collection.create_index(key_spec, unique, name)?;
            self.catalog.save_collection(ns)?;
            self.pager.lock().flush()?;
            Ok(name)
        }
        .await;
        self.finish_op_with(txn, result)
    }

    /// Drops an index by name.
    ///
    /// # Errors
    /// `IllegalOperation` for `_id_`, `IndexNotFound` for unknown names,
    /// `NamespaceNotFound` for unknown collections.
    pub async fn drop_index(
        &self,
        ns: &str,
        index_name: &str,
        ctx: &SessionContext,
    ) -> Result<(), DbError> {
        let txn = self.begin_op(ctx)?;
        let result = async {
            self.transactions
                .acquire_lock(txn.id(), &collection_resource(ns), LockMode::Exclusive)
                .await?;
            let collection = self.catalog.require_collection(ns)?;
            collection.drop_index(index_name)?;
            self.catalog.save_collection(ns)?;
            self.pager.lock().flush()
        }
        .await;
        self.finish_op(txn, result)
    }

    /// Index metas of a collection, the implicit `_id_` index first.
    ///
    /// # Errors
    /// `NamespaceNotFound` for unknown collections.
    pub fn list_indexes(&self, ns: &str) -> Result<Vec<IndexMeta>, DbError> {
        Ok(self.catalog.require_collection(ns)?.list_indexes())
    }

    /// Structural validation of one index.
    ///
    /// # Errors
    /// `NamespaceNotFound` / `IndexNotFound` on resolution failures.
    pub fn validate_index(&self, ns: &str, index_name: &str) -> Result<Vec<String>, DbError> {
        self.catalog.require_collection(ns)?.validate_index(index_name)
    }

    // --- writes ---

    /// Inserts one document, creating the collection on first use, and
    /// returns its `_id`.
    ///
    /// # Errors
    /// `DuplicateKey`, `DocumentTooLarge`, lock and storage failures.
    pub async fn insert_one(
        &self,
        ns: &str,
        doc: Document,
        ctx: &SessionContext,
    ) -> Result<Value, DbError> {
        let txn = self.begin_op(ctx)?;
        let result = async {
            self.transactions
                .acquire_lock(txn.id(), &collection_resource(ns), LockMode::Exclusive)
                .await?;
            let collection = self.catalog.get_or_create_collection(ns)?;
            let (id, _stored) = collection.insert_document(doc)?;
            self.transactions.record_undo(
                txn.id(),
                UndoRecord::Insert { collection: ns.to_string(), doc_id: id.clone() },
            )?;
            self.catalog.save_collection(ns)?;
            Ok(id)
        }
        .await;
        self.finish_op_with(txn, result)
    }

    /// Replaces the document with the given `_id`, returning whether a
    /// document matched.
    ///
    /// # Errors
    /// `BadValue` on `_id` changes, `DuplicateKey` on unique conflicts,
    /// lock and storage failures.
    pub async fn replace_one(
        &self,
        ns: &str,
        id: &Value,
        replacement: Document,
        ctx: &SessionContext,
    ) -> Result<bool, DbError> {
        let txn = self.begin_op(ctx)?;
        let result = async {
            self.transactions
                .acquire_lock(txn.id(), &collection_resource(ns), LockMode::Shared)
                .await?;
            self.transactions
                .acquire_lock(txn.id(), &document_resource(ns, id)?, LockMode::Exclusive)
                .await?;
            let Some(collection) = self.catalog.get_collection(ns) else {
                return Ok(false);
            };
            let Some(old_doc) = collection.replace_document(id, replacement)? else {
                return Ok(false);
            };
            self.transactions.record_undo(
                txn.id(),
                UndoRecord::Update {
                    collection: ns.to_string(),
                    doc_id: id.clone(),
                    old_doc,
                },
            )?;
            self.catalog.save_collection(ns)?;
            Ok(true)
        }
        .await;
        self.finish_op_with(txn, result)
    }

    /// Deletes the document with the given `_id`, returning whether a
    /// document matched.
    ///
    /// # Errors
    /// Lock and storage failures.
    pub async fn delete_one(
        &self,
        ns: &str,
        id: &Value,
        ctx: &SessionContext,
    ) -> Result<bool, DbError> {
        let txn = self.begin_op(ctx)?;
        let result = async {
            self.transactions
                .acquire_lock(txn.id(), &collection_resource(ns), LockMode::Shared)
                .await?;
            self.transactions
                .acquire_lock(txn.id(), &document_resource(ns, id)?, LockMode::Exclusive)
                .await?;
            let Some(collection) = self.catalog.get_collection(ns) else {
                return Ok(false);
            };
            let Some(old_doc) = collection.delete_document(id)? else {
                return Ok(false);
            };
            self.transactions.record_undo(
                txn.id(),
                UndoRecord::Delete {
                    collection: ns.to_string(),
                    doc_id: id.clone(),
                    old_doc,
                },
            )?;
            self.catalog.save_collection(ns)?;
            Ok(true)
        }
        .await;
        self.finish_op_with(txn, result)
    }

    // --- reads ---

    /// Point lookup by `_id` under a collection shared lock.
    ///
    /// # Errors
    /// Lock and storage failures.
    pub async fn find_by_id(
        &self,
        ns: &str,
        id: &Value,
        ctx: &SessionContext,
    ) -> Result<Option<Document>, DbError> {
        let txn = self.begin_op(ctx)?;
        let result = async {
            self.transactions
                .acquire_lock(txn.id(), &collection_resource(ns), LockMode::Shared)
                .await?;
            match self.catalog.get_collection(ns) {
                Some(collection) => collection.find_by_id(id),
                None => Ok(None),
            }
        }
        .await;
        self.finish_op_with(txn, result)
    }

    /// Scans the collection, keeping documents whose top-level fields
    /// equal every field of `filter`, and yields the first batch plus a
    /// cursor for the rest.
    ///
    /// # Errors
    /// Lock and storage failures.
    pub async fn find(
        &self,
        ns: &str,
        filter: Option<&Document>,
        batch_size: Option<usize>,
        ctx: &SessionContext,
    ) -> Result<CursorBatch, DbError> {
        let txn = self.begin_op(ctx)?;
        let result = async {
            self.transactions
                .acquire_lock(txn.id(), &collection_resource(ns), LockMode::Shared)
                .await?;
            let documents = match self.catalog.get_collection(ns) {
                Some(collection) => {
                    let mut documents = collection.all_documents()?;
                    if let Some(filter) = filter {
                        documents.retain(|doc| matches_filter(doc, filter));
                    }
                    documents
                }
                None => Vec::new(),
            };
            Ok(documents)
        }
        .await;
        let documents = self.finish_op_with(txn, result)?;
        Ok(self
            .cursors
            .create(ns, documents, batch_size.or(Some(self.config.default_batch_size))))
    }

    /// Equality lookup through a named index.
    ///
    /// # Errors
    /// `NamespaceNotFound` / `IndexNotFound` on resolution failures,
    /// lock and storage failures.
    pub async fn find_by_index_hint(
        &self,
        ns: &str,
        index_name: &str,
        query: &Document,
        ctx: &SessionContext,
    ) -> Result<Vec<Document>, DbError> {
        let txn = self.begin_op(ctx)?;
        let result = async {
            self.transactions
                .acquire_lock(txn.id(), &collection_resource(ns), LockMode::Shared)
                .await?;
            let collection = self.catalog.require_collection(ns)?;
            collection.find_by_index_hint(index_name, query)
        }
        .await;
        self.finish_op_with(txn, result)
    }

    /// Number of documents in the collection; 0 when it does not exist.
    ///
    /// # Errors
    /// Lock failures.
    pub async fn count(&self, ns: &str, ctx: &SessionContext) -> Result<u64, DbError> {
        let txn = self.begin_op(ctx)?;
        let result = async {
            self.transactions
                .acquire_lock(txn.id(), &collection_resource(ns), LockMode::Shared)
                .await?;
            Ok(self
                .catalog
                .get_collection(ns)
                .map_or(0, |collection| collection.document_count()))
        }
        .await;
        self.finish_op_with(txn, result)
    }

    /// Continues a cursor.
    ///
    /// # Errors
    /// See [`CursorManager::get_more`].
    pub fn get_more(
        &self,
        cursor_id: u64,
        batch_size: Option<usize>,
    ) -> Result<CursorBatch, DbError> {
        self.cursors.get_more(cursor_id, batch_size)
    }

    /// Kills the given cursors.
    #[must_use]
    pub fn kill_cursors(&self, cursor_ids: &[u64]) -> KillResult {
        self.cursors.kill(cursor_ids)
    }

    // --- transaction plumbing ---

    fn begin_op(&self, ctx: &SessionContext) -> Result<OpTxn, DbError> {
        match ctx.txn_id {
            Some(txn_id) => match self.transactions.transaction_state(txn_id) {
                Some(TransactionState::Active) => Ok(OpTxn::Explicit(txn_id)),
                Some(TransactionState::Committed) => Err(DbError::TransactionCommitted(
                    format!("transaction {txn_id} has already been committed"),
                )),
                Some(TransactionState::Aborted) => Err(DbError::TransactionAborted(format!(
                    "transaction {txn_id} has been aborted"
                ))),
                None => Err(DbError::NoSuchTransaction(format!(
                    "no transaction {txn_id} is in progress"
                ))),
            },
            None => Ok(OpTxn::Implicit(self.transactions.begin(
                IsolationLevel::default(),
                self.config.lock_timeout(),
            ))),
        }
    }

    fn finish_op(&self, txn: OpTxn, result: Result<(), DbError>) -> Result<(), DbError> {
        self.finish_op_with(txn, result)
    }

    // Implicit transactions commit with the command and abort on its
    // failure; explicit transactions are left to the session layer.
    fn finish_op_with<T>(&self, txn: OpTxn, result: Result<T, DbError>) -> Result<T, DbError> {
        match (&txn, &result) {
            (OpTxn::Explicit(_), _) => result,
            (OpTxn::Implicit(txn_id), Ok(_)) => {
                self.transactions.commit(*txn_id)?;
                result
            }
            (OpTxn::Implicit(txn_id), Err(_)) => {
                if let Err(abort_err) = self.transactions.abort(*txn_id, &self.catalog) {
                    tracing::warn!(txn_id, error = %abort_err,
                        "failed to abort implicit transaction");
                }
                result
            }
        }
    }
}

fn collection_resource(ns: &str) -> String {
    format!("col:{ns}")
}

fn document_resource(ns: &str, id: &Value) -> Result<String, DbError> {
    Ok(format!(
        "doc:{ns}:{}",
        hex::encode(key_string::from_single(id)?)
    ))
}

fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(field, expected)| {
        doc.get_path(field)
            .is_some_and(|actual| compare_values(actual, expected) == std::cmp::Ordering::Equal)
    })
}
