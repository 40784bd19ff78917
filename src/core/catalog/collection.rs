//! A named collection: its data B+Tree, secondary indexes, and count.
//!
//! The data tree is keyed by the order-preserving encoding of `_id` and
//! stores the BSON document. Methods here assume the caller already
//! holds the appropriate collection or document lock; the rollback
//! primitives are driven by the transaction manager during abort and
//! bypass unique pre-checks since they restore previously valid state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;

use crate::core::bson::{decode_document, encode_document, Document, ObjectId, Value};
use crate::core::common::limits::MAX_DOCUMENT_SIZE;
use crate::core::common::DbError;
use crate::core::index::{key_string, IndexManager, IndexMeta};
use crate::core::storage::{BTree, Pager};

/// Catalog record describing one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionInfo {
    pub name: String,
    pub data_root_page_id: u64,
    /// Reserved for a future shared index directory tree; always 0.
    pub index_root_page_id: u64,
    pub document_count: u64,
    pub indexes: Vec<IndexMeta>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CollectionInfo {
    /// Renders the record as the catalog's BSON value.
    #[must_use]
    pub fn to_document(&self) -> Document {
        #[allow(clippy::cast_possible_wrap)]
        let mut doc = Document::new();
        doc.set("name", Value::String(self.name.clone()));
        doc.set("dataRoot", Value::Int64(self.data_root_page_id as i64));
        doc.set("indexRoot", Value::Int64(self.index_root_page_id as i64));
        doc.set("count", Value::Int64(self.document_count as i64));
        doc.set(
            "indexes",
            Value::Array(
                self.indexes
                    .iter()
                    .map(|meta| Value::Document(meta.to_document()))
                    .collect(),
            ),
        );
        doc.set("createdAt", Value::DateTime(self.created_at));
        doc.set("updatedAt", Value::DateTime(self.updated_at));
        doc
    }

    /// Parses a catalog value back into the record.
    ///
    /// # Errors
    /// Returns `FailedToParse` for missing or mistyped fields.
    pub fn from_document(doc: &Document) -> Result<Self, DbError> {
        let missing = |field: &str| {
            DbError::FailedToParse(format!("collection info missing '{field}'"))
        };
        let name = doc
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| missing("name"))?
            .to_string();
        let data_root = doc
            .get("dataRoot")
            .and_then(Value::as_i64)
            .ok_or_else(|| missing("dataRoot"))?;
        let index_root = doc
            .get("indexRoot")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let count = doc
            .get("count")
            .and_then(Value::as_i64)
            .ok_or_else(|| missing("count"))?;
        let indexes = match doc.get("indexes") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_document()
                        .ok_or_else(|| missing("indexes"))
                        .and_then(IndexMeta::from_document)
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };
        let created_at = match doc.get("createdAt") {
            Some(Value::DateTime(dt)) => *dt,
            _ => Utc::now(),
        };
        let updated_at = match doc.get("updatedAt") {
            Some(Value::DateTime(dt)) => *dt,
            _ => created_at,
        };
        #[allow(clippy::cast_sign_loss)]
        Ok(Self {
            name,
            data_root_page_id: data_root as u64,
            index_root_page_id: index_root as u64,
            document_count: count as u64,
            indexes,
            created_at,
            updated_at,
        })
    }
}

#[derive(Debug)]
struct CollectionState {
    data: BTree,
    indexes: IndexManager,
    document_count: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// A named document container.
#[derive(Debug)]
pub struct Collection {
    name: String,
    inner: Mutex<CollectionState>,
}

impl Collection {
    /// Creates a fresh collection with an empty data tree.
    ///
    /// # Errors
    /// Returns pager errors from tree allocation.
    pub fn create(pager: Arc<Mutex<Pager>>, name: &str) -> Result<Arc<Self>, DbError> {
        let data = BTree::create(Arc::clone(&pager))?;
        let now = Utc::now();
        Ok(Arc::new(Self {
            name: name.to_string(),
            inner: Mutex::new(CollectionState {
                data,
                indexes: IndexManager::new(pager, name),
                document_count: 0,
                created_at: now,
                updated_at: now,
            }),
        }))
    }

    /// Rehydrates a collection from its catalog record.
    #[must_use]
    pub fn from_info(pager: Arc<Mutex<Pager>>, info: &CollectionInfo) -> Arc<Self> {
        let data = BTree::open(Arc::clone(&pager), info.data_root_page_id);
        let mut indexes = IndexManager::new(pager, &info.name);
        indexes.restore_indexes(info.indexes.clone());
        Arc::new(Self {
            name: info.name.clone(),
            inner: Mutex::new(CollectionState {
                data,
                indexes,
                document_count: info.document_count,
                created_at: info.created_at,
                updated_at: info.updated_at,
            }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A catalog snapshot with current tree roots.
    #[must_use]
    pub fn info(&self) -> CollectionInfo {
        let state = self.inner.lock();
        CollectionInfo {
            name: self.name.clone(),
            data_root_page_id: state.data.root_page_id(),
            index_root_page_id: 0,
            document_count: state.document_count,
            indexes: state.indexes.get_index_metas(),
            created_at: state.created_at,
            updated_at: state.updated_at,
        }
    }

    #[must_use]
    pub fn document_count(&self) -> u64 {
        self.inner.lock().document_count
    }

    /// Inserts a document, assigning a fresh ObjectId when `_id` is
    /// absent. Returns the `_id` and the document as stored.
    ///
    /// # Errors
    /// `DocumentTooLarge` over the size limit, `DuplicateKey` on `_id`
    /// or unique-index conflicts; on any index failure the data tree is
    /// restored before the error propagates.
    pub fn insert_document(&self, mut doc: Document) -> Result<(Value, Document), DbError> {
        if doc.id().is_none() {
            doc.set_front("_id", Value::ObjectId(ObjectId::new()));
        }
        let id = doc.id().cloned().unwrap_or(Value::Null);
        let bytes = encode_checked(&doc)?;
        let key = key_string::from_single(&id)?;

        let mut state = self.inner.lock();
        if state.data.search(&key)?.is_some() {
            return Err(DbError::DuplicateKey(format!(
                "collection: {} index: _id_ dup key: {{ _id: 1 }}",
                self.name
            )));
        }
        state.indexes.check_unique_constraints(&doc, None)?;
        state.data.insert(&key, &bytes)?;
        if let Err(e) = state.indexes.insert_document(&doc) {
            if let Err(undo_err) = state.data.delete(&key) {
                warn!(
                    collection = %self.name,
                    error = %undo_err,
                    "failed to undo data insert after index failure"
                );
            }
            return Err(e);
        }
        state.document_count += 1;
        state.updated_at = Utc::now();
        Ok((id, doc))
    }

    /// Point lookup by `_id`.
    ///
    /// # Errors
    /// Returns storage errors from the data tree.
    pub fn find_by_id(&self, id: &Value) -> Result<Option<Document>, DbError> {
        let key = key_string::from_single(id)?;
        let state = self.inner.lock();
        match state.data.search(&key)? {
            Some(bytes) => Ok(Some(decode_document(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Replaces the document stored under `id`, returning the old image,
    /// or `None` when no document matched.
    ///
    /// # Errors
    /// `BadValue` when the replacement carries a different `_id`,
    /// `DuplicateKey` on unique conflicts; on index failure both the
    /// data tree and the indexes are restored to the old image.
    pub fn replace_document(
        &self,
        id: &Value,
        mut new_doc: Document,
    ) -> Result<Option<Document>, DbError> {
        match new_doc.id() {
            None => new_doc.set_front("_id", id.clone()),
            Some(existing) if existing == id => {}
            Some(_) => {
                return Err(DbError::BadValue(
                    "the _id field is immutable and cannot be replaced".into(),
                ))
            }
        }
        let new_bytes = encode_checked(&new_doc)?;
        let key = key_string::from_single(id)?;

        let mut state = self.inner.lock();
        let Some(old_bytes) = state.data.search(&key)? else {
            return Ok(None);
        };
        let old_doc = decode_document(&old_bytes)?;

        state.indexes.check_unique_constraints(&new_doc, Some(id))?;
        state.data.insert(&key, &new_bytes)?;
        let index_result = match state.indexes.delete_document(&old_doc) {
            Ok(()) => state.indexes.insert_document(&new_doc),
            Err(e) => Err(e),
        };
        if let Err(e) = index_result {
            if let Err(undo_err) = state.data.insert(&key, &old_bytes) {
                warn!(collection = %self.name, error = %undo_err,
                    "failed to restore data image after index failure");
            }
            if let Err(undo_err) = state.indexes.insert_document(&old_doc) {
                warn!(collection = %self.name, error = %undo_err,
                    "failed to restore index entries after index failure");
            }
            return Err(e);
        }
        state.updated_at = Utc::now();
        Ok(Some(old_doc))
    }

    /// Deletes the document stored under `id`, returning the old image.
    ///
    /// # Errors
    /// On index failure the data tree is restored before the error
    /// propagates.
    pub fn delete_document(&self, id: &Value) -> Result<Option<Document>, DbError> {
        let key = key_string::from_single(id)?;
        let mut state = self.inner.lock();
        let Some(old_bytes) = state.data.search(&key)? else {
            return Ok(None);
        };
        let old_doc = decode_document(&old_bytes)?;

        state.data.delete(&key)?;
        if let Err(e) = state.indexes.delete_document(&old_doc) {
            if let Err(undo_err) = state.data.insert(&key, &old_bytes) {
                warn!(collection = %self.name, error = %undo_err,
                    "failed to restore data image after index delete failure");
            }
            return Err(e);
        }
        state.document_count = state.document_count.saturating_sub(1);
        state.updated_at = Utc::now();
        Ok(Some(old_doc))
    }

    /// Every document in `_id` order.
    ///
    /// # Errors
    /// Returns storage errors from the scan.
    pub fn all_documents(&self) -> Result<Vec<Document>, DbError> {
        let state = self.inner.lock();
        state
            .data
            .get_all()?
            .into_iter()
            .map(|(_, bytes)| decode_document(&bytes))
            .collect()
    }

    /// Creates an index over the current documents. The caller must hold
    /// the collection exclusive lock for the duration of the build.
    ///
    /// # Errors
    /// See [`IndexManager::create_index`].
    pub fn create_index(
        &self,
        key_spec: Vec<(String, i32)>,
        unique: bool,
        name: Option<String>,
    ) -> Result<String, DbError> {
        let mut state = self.inner.lock();
        let docs = state
            .data
            .get_all()?
            .into_iter()
            .map(|(_, bytes)| decode_document(&bytes))
            .collect::<Result<Vec<_>, _>>()?;
        let name = state
            .indexes
            .create_index(key_spec, unique, name, move || Ok(docs))?;
        state.updated_at = Utc::now();
        Ok(name)
    }

    /// Drops an index by name.
    ///
    /// # Errors
    /// See [`IndexManager::drop_index`].
    pub fn drop_index(&self, name: &str) -> Result<(), DbError> {
        let mut state = self.inner.lock();
        state.indexes.drop_index(name)?;
        state.updated_at = Utc::now();
        Ok(())
    }

    #[must_use]
    pub fn list_indexes(&self) -> Vec<IndexMeta> {
        self.inner.lock().indexes.list_indexes()
    }

    /// Equality lookup through a named index; resolves the matching ids
    /// to documents.
    ///
    /// # Errors
    /// See [`IndexManager::find_by_index_hint`].
    pub fn find_by_index_hint(
        &self,
        index_name: &str,
        query: &Document,
    ) -> Result<Vec<Document>, DbError> {
        let state = self.inner.lock();
        let ids = state.indexes.find_by_index_hint(index_name, query)?;
        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            let key = key_string::from_single(&id)?;
            if let Some(bytes) = state.data.search(&key)? {
                docs.push(decode_document(&bytes)?);
            }
        }
        Ok(docs)
    }

    /// Structural validation of a named index.
    ///
    /// # Errors
    /// See [`IndexManager::validate_index`].
    pub fn validate_index(&self, name: &str) -> Result<Vec<String>, DbError> {
        self.inner.lock().indexes.validate_index(name)
    }

    // --- rollback primitives, driven by transaction abort ---

    /// Reverts an insert: removes the document if it is still present.
    ///
    /// # Errors
    /// Returns storage errors; a missing document is not an error.
    pub fn rollback_insert(&self, id: &Value) -> Result<(), DbError> {
        let key = key_string::from_single(id)?;
        let mut state = self.inner.lock();
        let Some(bytes) = state.data.search(&key)? else {
            return Ok(());
        };
        let doc = decode_document(&bytes)?;
        state.data.delete(&key)?;
        state.indexes.delete_document(&doc)?;
        state.document_count = state.document_count.saturating_sub(1);
        Ok(())
    }

    /// Reverts an update: restores the pre-image, replacing whatever is
    /// currently stored. Unique pre-checks are skipped since the old
    /// image was valid when it was captured.
    ///
    /// # Errors
    /// Returns storage errors from the trees.
    pub fn rollback_update(&self, id: &Value, old_doc: &Document) -> Result<(), DbError> {
        let key = key_string::from_single(id)?;
        let old_bytes = encode_document(old_doc)?;
        let mut state = self.inner.lock();
        if let Some(current_bytes) = state.data.search(&key)? {
            let current = decode_document(&current_bytes)?;
            state.indexes.delete_document(&current)?;
        }
        state.data.insert(&key, &old_bytes)?;
        state.indexes.insert_document(old_doc)?;
        Ok(())
    }

    /// Reverts a delete: re-inserts the pre-image.
    ///
    /// # Errors
    /// Returns storage errors from the trees.
    pub fn rollback_delete(&self, old_doc: &Document) -> Result<(), DbError> {
        let id = old_doc
            .id()
            .ok_or_else(|| DbError::Internal("undo image missing _id".into()))?
            .clone();
        let key = key_string::from_single(&id)?;
        let bytes = encode_document(old_doc)?;
        let mut state = self.inner.lock();
        if state.data.search(&key)?.is_some() {
            return Ok(()); // already restored
        }
        state.data.insert(&key, &bytes)?;
        state.indexes.insert_document(old_doc)?;
        state.document_count += 1;
        Ok(())
    }
}

fn encode_checked(doc: &Document) -> Result<Vec<u8>, DbError> {
    let bytes = encode_document(doc)?;
    if bytes.len() > MAX_DOCUMENT_SIZE {
        return Err(DbError::DocumentTooLarge(bytes.len()));
    }
    Ok(bytes)
}
