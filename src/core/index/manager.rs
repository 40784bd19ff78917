//! Secondary index maintenance for one collection.
//!
//! Every index is a B+Tree whose entry key is the order-preserving
//! encoding of the document's key fields. Non-unique indexes suffix the
//! key with a 0x00 separator and the BSON-encoded `{_id}` so the tree
//! key stays unique while range order is preserved; unique indexes omit
//! the suffix and reject duplicates. The value under every entry key is
//! the BSON-encoded `{_id}` of the indexed document.
//!
//! Multi-index mutations are made atomic without a journal: successful
//! per-index writes are tracked in the call frame and compensated in
//! reverse order when a later index fails.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::core::bson::{decode_document, encode_document, Document, Value};
use crate::core::common::limits::{
    MAX_COMPOUND_INDEX_KEYS, MAX_INDEXES_PER_COLLECTION, MAX_INDEX_KEY_SIZE,
};
use crate::core::common::DbError;
use crate::core::index::key_string;
use crate::core::storage::{BTree, Pager};

/// Reserved name of the implicit primary-key index.
pub const ID_INDEX_NAME: &str = "_id_";

const ENTRY_KEY_SEPARATOR: u8 = 0x00;

/// Persistent description of one secondary index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMeta {
    pub name: String,
    /// Ordered `(field path, direction)` pairs; direction is `1` or `-1`.
    pub key_spec: Vec<(String, i32)>,
    pub unique: bool,
    pub root_page_id: u64,
}

impl IndexMeta {
    /// The generated name for a key spec: `"f1_1_f2_-1"`.
    #[must_use]
    pub fn default_name(key_spec: &[(String, i32)]) -> String {
        key_spec
            .iter()
            .map(|(field, dir)| format!("{field}_{dir}"))
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Renders the meta as a catalog document.
    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut key = Document::new();
        for (field, dir) in &self.key_spec {
            key.set(field.clone(), Value::Int32(*dir));
        }
        let mut doc = Document::new();
        doc.set("name", Value::String(self.name.clone()));
        doc.set("key", Value::Document(key));
        doc.set("unique", Value::Bool(self.unique));
        #[allow(clippy::cast_possible_wrap)]
        doc.set("root", Value::Int64(self.root_page_id as i64));
        doc
    }

    /// Parses a catalog document back into a meta.
    ///
    /// # Errors
    /// Returns `FailedToParse` when required fields are missing or
    /// mistyped.
    pub fn from_document(doc: &Document) -> Result<Self, DbError> {
        let name = doc
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| DbError::FailedToParse("index meta missing 'name'".into()))?
            .to_string();
        let key = doc
            .get("key")
            .and_then(Value::as_document)
            .ok_or_else(|| DbError::FailedToParse("index meta missing 'key'".into()))?;
        let mut key_spec = Vec::with_capacity(key.len());
        for (field, dir) in key.iter() {
            let dir = dir.as_i64().ok_or_else(|| {
                DbError::FailedToParse(format!("index meta direction for '{field}' not numeric"))
            })?;
            #[allow(clippy::cast_possible_truncation)]
            key_spec.push((field.to_string(), dir as i32));
        }
        let unique = doc.get("unique").and_then(Value::as_bool).unwrap_or(false);
        let root = doc
            .get("root")
            .and_then(Value::as_i64)
            .ok_or_else(|| DbError::FailedToParse("index meta missing 'root'".into()))?;
        #[allow(clippy::cast_sign_loss)]
        Ok(Self { name, key_spec, unique, root_page_id: root as u64 })
    }
}

#[derive(Debug)]
struct SecondaryIndex {
    meta: IndexMeta,
    tree: BTree,
}

/// The per-collection set of secondary indexes.
#[derive(Debug)]
pub struct IndexManager {
    pager: Arc<Mutex<Pager>>,
    collection: String,
    indexes: Vec<SecondaryIndex>,
}

impl IndexManager {
    #[must_use]
    pub fn new(pager: Arc<Mutex<Pager>>, collection: impl Into<String>) -> Self {
        Self { pager, collection: collection.into(), indexes: Vec::new() }
    }

    /// Rebuilds the in-memory index set from stored metas, e.g. when a
    /// collection is rehydrated from the catalog.
    pub fn restore_indexes(&mut self, metas: Vec<IndexMeta>) {
        self.indexes = metas
            .into_iter()
            .map(|meta| {
                let tree = BTree::open(Arc::clone(&self.pager), meta.root_page_id);
                SecondaryIndex { meta, tree }
            })
            .collect();
    }

    /// Current metas with up-to-date root page ids.
    #[must_use]
    pub fn get_index_metas(&self) -> Vec<IndexMeta> {
        self.indexes
            .iter()
            .map(|idx| {
                let mut meta = idx.meta.clone();
                meta.root_page_id = idx.tree.root_page_id();
                meta
            })
            .collect()
    }

    /// Metas for `listIndexes`, with the implicit `_id_` index first.
    #[must_use]
    pub fn list_indexes(&self) -> Vec<IndexMeta> {
        let mut out = vec![IndexMeta {
            name: ID_INDEX_NAME.to_string(),
            key_spec: vec![("_id".to_string(), 1)],
            unique: true,
            root_page_id: 0,
        }];
        out.extend(self.get_index_metas());
        out
    }

    /// Creates and backfills a new index. `finder` supplies the current
    /// documents of the collection; the caller must hold the collection
    /// exclusive lock since the build is not atomic against writers.
    ///
    /// # Errors
    /// `CannotCreateIndex` for invalid key patterns, duplicate names, or limit
    /// violations; `DuplicateKey` when a unique build finds conflicting
    /// documents.
    pub fn create_index(
        &mut self,
        key_spec: Vec<(String, i32)>,
        unique: bool,
        name: Option<String>,
        finder: impl FnOnce() -> Result<Vec<Document>, DbError>,
    ) -> Result<String, DbError> {
        if key_spec.is_empty() {
            return Err(DbError::CannotCreateIndex("index key pattern is empty".into()));
        }
        if key_spec.len() > MAX_COMPOUND_INDEX_KEYS {
            return Err(DbError::CannotCreateIndex(format!(
                "compound index has {} keys, limit is {MAX_COMPOUND_INDEX_KEYS}",
                key_spec.len()
            )));
        }
        if let Some((field, dir)) = key_spec.iter().find(|(_, d)| *d != 1 && *d != -1) {
            return Err(DbError::CannotCreateIndex(format!(
                "bad direction {dir} for field '{field}', expected 1 or -1"
            )));
        }
        if self.indexes.len() >= MAX_INDEXES_PER_COLLECTION {
            return Err(DbError::CannotCreateIndex(format!(
                "collection '{}' already has the maximum of {MAX_INDEXES_PER_COLLECTION} indexes",
                self.collection
            )));
        }
        let name = name.unwrap_or_else(|| IndexMeta::default_name(&key_spec));
        if name == ID_INDEX_NAME {
            return Err(DbError::CannotCreateIndex(format!(
                "'{ID_INDEX_NAME}' is reserved for the primary key index"
            )));
        }
        if self.indexes.iter().any(|idx| idx.meta.name == name) {
            return Err(DbError::CannotCreateIndex(format!(
                "an index named '{name}' already exists on '{}'",
                self.collection
            )));
        }

        let tree = BTree::create(Arc::clone(&self.pager))?;
        let meta = IndexMeta { name: name.clone(), key_spec, unique, root_page_id: tree.root_page_id() };
        let mut index = SecondaryIndex { meta, tree };

        for doc in finder()? {
            if let Err(e) = insert_entry(&mut index, &self.collection, &doc) {
                return match e {
                    DbError::DuplicateKey(_) => Err(e),
                    other => Err(DbError::CannotCreateIndex(format!(
                        "building index '{name}' failed: {other}"
                    ))),
                };
            }
        }
        self.indexes.push(index);
        Ok(name)
    }

    /// Removes an index by name. The freed pages are not reclaimed.
    ///
    /// # Errors
    /// `IllegalOperation` for `_id_`, `IndexNotFound` for unknown names.
    pub fn drop_index(&mut self, name: &str) -> Result<(), DbError> {
        if name == ID_INDEX_NAME {
            return Err(DbError::IllegalOperation(format!(
                "cannot drop the {ID_INDEX_NAME} index"
            )));
        }
        let pos = self
            .indexes
            .iter()
            .position(|idx| idx.meta.name == name)
            .ok_or_else(|| DbError::IndexNotFound(name.to_string()))?;
        self.indexes.remove(pos);
        Ok(())
    }

    /// Verifies that inserting `doc` would not violate any unique index,
    /// ignoring an existing entry owned by `excluding_id` (the update
    /// case).
    ///
    /// # Errors
    /// `DuplicateKey` naming the violated index.
    pub fn check_unique_constraints(
        &self,
        doc: &Document,
        excluding_id: Option<&Value>,
    ) -> Result<(), DbError> {
        for index in self.indexes.iter().filter(|idx| idx.meta.unique) {
            let key = entry_key_fields(&index.meta, doc)?;
            if let Some(existing) = index.tree.search(&key)? {
                let existing_id = decode_entry_id(&existing)?;
                if excluding_id != Some(&existing_id) {
                    return Err(self.duplicate_key_error(&index.meta));
                }
            }
        }
        Ok(())
    }

    /// Adds `doc` to every index, undoing partial work on failure.
    ///
    /// # Errors
    /// `DuplicateKey` from a unique index; `InternalError` naming the
    /// failing index otherwise. Either way all indexes are left in their
    /// pre-call state.
    pub fn insert_document(&mut self, doc: &Document) -> Result<(), DbError> {
        let mut applied: Vec<(usize, Vec<u8>)> = Vec::new();
        for pos in 0..self.indexes.len() {
            let collection = self.collection.clone();
            let index = &mut self.indexes[pos];
            match insert_entry(index, &collection, doc) {
                Ok(key) => applied.push((pos, key)),
                Err(e) => {
                    self.compensate_inserts(&applied);
                    let failing = &self.indexes[pos].meta.name;
                    return match e {
                        DbError::DuplicateKey(_) => Err(e),
                        other => Err(DbError::Internal(format!(
                            "updating index '{failing}' failed: {other}"
                        ))),
                    };
                }
            }
        }
        Ok(())
    }

    /// Checks unique constraints and inserts in one step, so callers
    /// cannot interleave a conflicting write between the two.
    ///
    /// # Errors
    /// See [`Self::check_unique_constraints`] and
    /// [`Self::insert_document`].
    pub fn check_and_insert_document(
        &mut self,
        doc: &Document,
        excluding_id: Option<&Value>,
    ) -> Result<(), DbError> {
        self.check_unique_constraints(doc, excluding_id)?;
        self.insert_document(doc)
    }

    /// Removes `doc`'s entries from every index, re-inserting already
    /// removed entries when a later index fails.
    ///
    /// # Errors
    /// `InternalError` naming the failing index.
    pub fn delete_document(&mut self, doc: &Document) -> Result<(), DbError> {
        let value = entry_value(doc)?;
        // Entry keys are precomputed so compensation can re-insert the
        // exact bytes that were removed.
        let keys: Vec<Vec<u8>> = self
            .indexes
            .iter()
            .map(|idx| entry_key_with_id(&idx.meta, doc))
            .collect::<Result<_, _>>()?;

        let mut removed: Vec<usize> = Vec::new();
        for (pos, key) in keys.iter().enumerate() {
            match self.indexes[pos].tree.delete(key) {
                Ok(_) => removed.push(pos),
                Err(e) => {
                    for &undo_pos in removed.iter().rev() {
                        if let Err(redo_err) =
                            self.indexes[undo_pos].tree.insert(&keys[undo_pos], &value)
                        {
                            warn!(
                                collection = %self.collection,
                                index = %self.indexes[undo_pos].meta.name,
                                error = %redo_err,
                                "compensating re-insert failed during index delete rollback"
                            );
                        }
                    }
                    let failing = &self.indexes[pos].meta.name;
                    return Err(DbError::Internal(format!(
                        "updating index '{failing}' failed: {e}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolves an equality query through a named index, returning the
    /// matching `_id` values in index order.
    ///
    /// # Errors
    /// `IndexNotFound` for unknown names, `BadValue` when the query does
    /// not cover the index key fields.
    pub fn find_by_index_hint(
        &self,
        name: &str,
        query: &Document,
    ) -> Result<Vec<Value>, DbError> {
        let index = self
            .indexes
            .iter()
            .find(|idx| idx.meta.name == name)
            .ok_or_else(|| DbError::IndexNotFound(name.to_string()))?;

        let mut values = Vec::with_capacity(index.meta.key_spec.len());
        let mut ascending = Vec::with_capacity(index.meta.key_spec.len());
        for (field, dir) in &index.meta.key_spec {
            let value = query.get_path(field).ok_or_else(|| {
                DbError::BadValue(format!(
                    "hinted query must supply an equality value for '{field}'"
                ))
            })?;
            values.push(value.clone());
            ascending.push(*dir >= 0);
        }
        let prefix = key_string::from_values(&values, &ascending)?;

        if index.meta.unique {
            return match index.tree.search(&prefix)? {
                Some(entry) => Ok(vec![decode_entry_id(&entry)?]),
                None => Ok(Vec::new()),
            };
        }

        let mut ids = Vec::new();
        for (key, value) in index.tree.scan_prefix(&prefix)? {
            // Entries for a different (longer) key share no separator at
            // this offset, so the prefix scan stops matching here.
            if key.get(prefix.len()) != Some(&ENTRY_KEY_SEPARATOR) {
                continue;
            }
            ids.push(decode_entry_id(&value)?);
        }
        Ok(ids)
    }

    /// Structural validation of one index: tree invariants plus
    /// decodable entry values.
    ///
    /// # Errors
    /// `IndexNotFound` for unknown names; storage errors from the scan.
    pub fn validate_index(&self, name: &str) -> Result<Vec<String>, DbError> {
        let index = self
            .indexes
            .iter()
            .find(|idx| idx.meta.name == name)
            .ok_or_else(|| DbError::IndexNotFound(name.to_string()))?;
        let mut errors = index.tree.verify()?;
        for (key, value) in index.tree.get_all()? {
            if let Err(e) = decode_entry_id(&value) {
                errors.push(format!(
                    "entry {} has undecodable value: {e}",
                    hex::encode(&key)
                ));
            }
        }
        Ok(errors)
    }

    /// Number of registered secondary indexes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    fn compensate_inserts(&mut self, applied: &[(usize, Vec<u8>)]) {
        for (pos, key) in applied.iter().rev() {
            if let Err(e) = self.indexes[*pos].tree.delete(key) {
                warn!(
                    collection = %self.collection,
                    index = %self.indexes[*pos].meta.name,
                    error = %e,
                    "compensating delete failed during index insert rollback"
                );
            }
        }
    }

    fn duplicate_key_error(&self, meta: &IndexMeta) -> DbError {
        let pattern = meta
            .key_spec
            .iter()
            .map(|(field, dir)| format!("{field}: {dir}"))
            .collect::<Vec<_>>()
            .join(", ");
        DbError::DuplicateKey(format!(
            "collection: {} index: {} dup key: {{ {pattern} }}",
            self.collection, meta.name
        ))
    }
}

fn insert_entry(
    index: &mut SecondaryIndex,
    collection: &str,
    doc: &Document,
) -> Result<Vec<u8>, DbError> {
    let key = entry_key_with_id(&index.meta, doc)?;
    if index.meta.unique {
        if let Some(existing) = index.tree.search(&key)? {
            let existing_id = decode_entry_id(&existing)?;
            if Some(&existing_id) != doc.id() {
                let pattern = index
                    .meta
                    .key_spec
                    .iter()
                    .map(|(field, dir)| format!("{field}: {dir}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(DbError::DuplicateKey(format!(
                    "collection: {collection} index: {} dup key: {{ {pattern} }}",
                    index.meta.name
                )));
            }
        }
    }
    index.tree.insert(&key, &entry_value(doc)?)?;
    Ok(key)
}

/// The key-fields portion of an entry key, without the `_id` suffix.
fn entry_key_fields(meta: &IndexMeta, doc: &Document) -> Result<Vec<u8>, DbError> {
    let values: Vec<Value> = meta
        .key_spec
        .iter()
        .map(|(field, _)| doc.get_path(field).cloned().unwrap_or(Value::Null))
        .collect();
    let ascending: Vec<bool> = meta.key_spec.iter().map(|(_, dir)| *dir >= 0).collect();
    let key = key_string::from_values(&values, &ascending)?;
    if key.len() > MAX_INDEX_KEY_SIZE {
        return Err(DbError::BadValue(format!(
            "index key for '{}' is {} bytes, limit is {MAX_INDEX_KEY_SIZE}",
            meta.name,
            key.len()
        )));
    }
    Ok(key)
}

/// The full tree key: unique indexes use the fields alone, non-unique
/// indexes append the 0x00 separator and the BSON `{_id}` trailer.
fn entry_key_with_id(meta: &IndexMeta, doc: &Document) -> Result<Vec<u8>, DbError> {
    let mut key = entry_key_fields(meta, doc)?;
    if !meta.unique {
        key.push(ENTRY_KEY_SEPARATOR);
        key.extend_from_slice(&entry_value(doc)?);
    }
    Ok(key)
}

fn entry_value(doc: &Document) -> Result<Vec<u8>, DbError> {
    let id = doc
        .id()
        .ok_or_else(|| DbError::Internal("document reached the index layer without _id".into()))?;
    let mut id_doc = Document::new();
    id_doc.set("_id", id.clone());
    encode_document(&id_doc)
}

fn decode_entry_id(bytes: &[u8]) -> Result<Value, DbError> {
    let doc = decode_document(bytes)?;
    doc.get("_id")
        .cloned()
        .ok_or_else(|| DbError::Internal("index entry value missing _id".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use tempfile::tempdir;

    fn test_manager() -> (tempfile::TempDir, IndexManager) {
        let dir = tempdir().unwrap();
        let pager = Arc::new(Mutex::new(
            Pager::open(dir.path().join("test.db"), 1024).unwrap(),
        ));
        let manager = IndexManager::new(pager, "people");
        (dir, manager)
    }

    fn spec(fields: &[(&str, i32)]) -> Vec<(String, i32)> {
        fields.iter().map(|(f, d)| ((*f).to_string(), *d)).collect()
    }

    #[test]
    fn test_default_name() {
        assert_eq!(
            IndexMeta::default_name(&spec(&[("a", 1), ("b", -1)])),
            "a_1_b_-1"
        );
    }

    #[test]
    fn test_create_index_backfills_existing_docs() {
        let (_dir, mut manager) = test_manager();
        let docs = vec![doc! { "_id": 1, "age": 30 }, doc! { "_id": 2, "age": 20 }];
        let name = manager
            .create_index(spec(&[("age", 1)]), false, None, || Ok(docs))
            .unwrap();
        assert_eq!(name, "age_1");
        let ids = manager
            .find_by_index_hint("age_1", &doc! { "age": 20 })
            .unwrap();
        assert_eq!(ids, vec![Value::Int32(2)]);
    }

    #[test]
    fn test_unique_build_fails_on_conflict() {
        let (_dir, mut manager) = test_manager();
        let docs = vec![
            doc! { "_id": 1, "email": "a@x" },
            doc! { "_id": 2, "email": "a@x" },
        ];
        let result = manager.create_index(spec(&[("email", 1)]), true, None, || Ok(docs));
        assert!(matches!(result, Err(DbError::DuplicateKey(_))));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (_dir, mut manager) = test_manager();
        manager
            .create_index(spec(&[("a", 1)]), false, None, || Ok(vec![]))
            .unwrap();
        let result = manager.create_index(spec(&[("b", 1)]), false, Some("a_1".into()), || Ok(vec![]));
        assert!(matches!(result, Err(DbError::CannotCreateIndex(_))));
    }

    #[test]
    fn test_unique_constraint_check() {
        let (_dir, mut manager) = test_manager();
        manager
            .create_index(spec(&[("email", 1)]), true, None, || Ok(vec![]))
            .unwrap();
        manager
            .insert_document(&doc! { "_id": 1, "email": "a@x" })
            .unwrap();

        let conflicting = doc! { "_id": 2, "email": "a@x" };
        assert!(matches!(
            manager.check_unique_constraints(&conflicting, None),
            Err(DbError::DuplicateKey(_))
        ));
        // The owner of the entry may re-check itself (update path).
        let own = doc! { "_id": 1, "email": "a@x" };
        manager
            .check_unique_constraints(&own, Some(&Value::Int32(1)))
            .unwrap();
    }

    #[test]
    fn test_insert_rolls_back_earlier_indexes_on_conflict() {
        let (_dir, mut manager) = test_manager();
        manager
            .create_index(spec(&[("a", 1)]), false, None, || Ok(vec![]))
            .unwrap();
        manager
            .create_index(spec(&[("b", 1)]), true, None, || Ok(vec![]))
            .unwrap();
        manager
            .insert_document(&doc! { "_id": 1, "a": 1, "b": 7 })
            .unwrap();

        // The second document collides on b_1 after a_1 already applied.
        let result = manager.insert_document(&doc! { "_id": 9, "a": 1, "b": 7 });
        assert!(matches!(result, Err(DbError::DuplicateKey(_))));

        // a_1 must not retain an entry for _id 9.
        let ids = manager.find_by_index_hint("a_1", &doc! { "a": 1 }).unwrap();
        assert_eq!(ids, vec![Value::Int32(1)]);
    }

    #[test]
    fn test_delete_document_removes_all_entries() {
        let (_dir, mut manager) = test_manager();
        manager
            .create_index(spec(&[("a", 1)]), false, None, || Ok(vec![]))
            .unwrap();
        manager
            .create_index(spec(&[("b", -1)]), false, None, || Ok(vec![]))
            .unwrap();
        let doc = doc! { "_id": 5, "a": "x", "b": 3 };
        manager.insert_document(&doc).unwrap();
        manager.delete_document(&doc).unwrap();
        assert!(manager
            .find_by_index_hint("a_1", &doc! { "a": "x" })
            .unwrap()
            .is_empty());
        assert!(manager
            .find_by_index_hint("b_-1", &doc! { "b": 3 })
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_non_unique_allows_duplicate_values() {
        let (_dir, mut manager) = test_manager();
        manager
            .create_index(spec(&[("tag", 1)]), false, None, || Ok(vec![]))
            .unwrap();
        manager.insert_document(&doc! { "_id": 1, "tag": "t" }).unwrap();
        manager.insert_document(&doc! { "_id": 2, "tag": "t" }).unwrap();
        let ids = manager
            .find_by_index_hint("tag_1", &doc! { "tag": "t" })
            .unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_missing_field_indexes_as_null() {
        let (_dir, mut manager) = test_manager();
        manager
            .create_index(spec(&[("opt", 1)]), false, None, || Ok(vec![]))
            .unwrap();
        manager.insert_document(&doc! { "_id": 1 }).unwrap();
        let ids = manager
            .find_by_index_hint("opt_1", &doc! { "opt": Value::Null })
            .unwrap();
        assert_eq!(ids, vec![Value::Int32(1)]);
    }

    #[test]
    fn test_drop_index() {
        let (_dir, mut manager) = test_manager();
        manager
            .create_index(spec(&[("a", 1)]), false, None, || Ok(vec![]))
            .unwrap();
        assert!(matches!(
            manager.drop_index(ID_INDEX_NAME),
            Err(DbError::IllegalOperation(_))
        ));
        assert!(matches!(
            manager.drop_index("nope"),
            Err(DbError::IndexNotFound(_))
        ));
        manager.drop_index("a_1").unwrap();
        assert!(manager.is_empty());
    }

    #[test]
    fn test_list_indexes_includes_implicit_id() {
        let (_dir, mut manager) = test_manager();
        manager
            .create_index(spec(&[("a", 1)]), false, None, || Ok(vec![]))
            .unwrap();
        let listed = manager.list_indexes();
        assert_eq!(listed[0].name, ID_INDEX_NAME);
        assert!(listed[0].unique);
        assert_eq!(listed[1].name, "a_1");
    }

    #[test]
    fn test_meta_document_round_trip() {
        let meta = IndexMeta {
            name: "a_1_b_-1".into(),
            key_spec: spec(&[("a", 1), ("b", -1)]),
            unique: true,
            root_page_id: 42,
        };
        let round = IndexMeta::from_document(&meta.to_document()).unwrap();
        assert_eq!(round, meta);
    }

    #[test]
    fn test_restore_indexes_rehydrates_entries() {
        let dir = tempdir().unwrap();
        let pager = Arc::new(Mutex::new(
            Pager::open(dir.path().join("test.db"), 1024).unwrap(),
        ));
        let mut manager = IndexManager::new(Arc::clone(&pager), "people");
        manager
            .create_index(spec(&[("a", 1)]), false, None, || Ok(vec![]))
            .unwrap();
        manager.insert_document(&doc! { "_id": 1, "a": 10 }).unwrap();
        let metas = manager.get_index_metas();

        let mut restored = IndexManager::new(pager, "people");
        restored.restore_indexes(metas);
        let ids = restored
            .find_by_index_hint("a_1", &doc! { "a": 10 })
            .unwrap();
        assert_eq!(ids, vec![Value::Int32(1)]);
    }

    #[test]
    fn test_validate_index_clean() {
        let (_dir, mut manager) = test_manager();
        manager
            .create_index(spec(&[("a", 1)]), false, None, || Ok(vec![]))
            .unwrap();
        manager.insert_document(&doc! { "_id": 1, "a": 1 }).unwrap();
        assert!(manager.validate_index("a_1").unwrap().is_empty());
    }
}
