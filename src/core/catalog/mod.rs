//! The catalog: a persistent map from collection name to storage
//! metadata.
//!
//! Backed by a dedicated B+Tree whose key is the UTF-8 collection name
//! and whose value is the BSON encoding of a [`CollectionInfo`]. The
//! tree's root page id lives in the file header so the catalog can be
//! found on open. Every schema change rewrites the affected entry
//! synchronously before the operation reports success.

pub mod collection;

pub use collection::{Collection, CollectionInfo};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::core::bson::{decode_document, encode_document};
use crate::core::common::DbError;
use crate::core::storage::{BTree, Pager};

/// Longest accepted collection name.
const MAX_NAMESPACE_LENGTH: usize = 120;

/// The persistent collection registry.
#[derive(Debug)]
pub struct Catalog {
    pager: Arc<Mutex<Pager>>,
    tree: Mutex<BTree>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
}

impl Catalog {
    /// Opens the catalog from the pager's recorded root, creating a
    /// fresh tree when the file is new, and rehydrates every collection.
    ///
    /// # Errors
    /// Returns storage errors and `FailedToParse` for corrupt entries.
    pub fn open(pager: Arc<Mutex<Pager>>) -> Result<Self, DbError> {
        let root = pager.lock().catalog_root();
        let tree = if root == 0 {
            let tree = BTree::create(Arc::clone(&pager))?;
            {
                let mut guard = pager.lock();
                guard.set_catalog_root(tree.root_page_id());
                guard.flush()?;
            }
            tree
        } else {
            BTree::open(Arc::clone(&pager), root)
        };

        let mut collections = HashMap::new();
        for (_, bytes) in tree.get_all()? {
            let info = CollectionInfo::from_document(&decode_document(&bytes)?)?;
            debug!(collection = %info.name, documents = info.document_count, "loaded collection");
            collections.insert(
                info.name.clone(),
                Collection::from_info(Arc::clone(&pager), &info),
            );
        }
        Ok(Self {
            pager,
            tree: Mutex::new(tree),
            collections: RwLock::new(collections),
        })
    }

    /// Looks a collection up by name.
    #[must_use]
    pub fn get_collection(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections.read().get(name).cloned()
    }

    /// Like [`Self::get_collection`] but failing with
    /// `NamespaceNotFound`.
    ///
    /// # Errors
    /// `NamespaceNotFound` when the collection does not exist.
    pub fn require_collection(&self, name: &str) -> Result<Arc<Collection>, DbError> {
        self.get_collection(name)
            .ok_or_else(|| DbError::NamespaceNotFound(name.to_string()))
    }

    /// Explicitly creates a collection.
    ///
    /// # Errors
    /// `InvalidNamespace` for bad names, `IllegalOperation` when it
    /// already exists.
    pub fn create_collection(&self, name: &str) -> Result<Arc<Collection>, DbError> {
        validate_namespace(name)?;
        if self.collections.read().contains_key(name) {
            return Err(DbError::IllegalOperation(format!(
                "collection '{name}' already exists"
            )));
        }
        let collection = Collection::create(Arc::clone(&self.pager), name)?;
        self.collections
            .write()
            .insert(name.to_string(), Arc::clone(&collection));
        self.save_collection(name)?;
        Ok(collection)
    }

    /// Fetches a collection, creating it implicitly on first write the
    /// way inserts do.
    ///
    /// # Errors
    /// `InvalidNamespace` for bad names; storage errors from creation.
    pub fn get_or_create_collection(&self, name: &str) -> Result<Arc<Collection>, DbError> {
        if let Some(collection) = self.get_collection(name) {
            return Ok(collection);
        }
        self.create_collection(name)
    }

    /// Removes a collection and its catalog entry. Data and index pages
    /// are not reclaimed.
    ///
    /// # Errors
    /// `NamespaceNotFound` when the collection does not exist.
    pub fn drop_collection(&self, name: &str) -> Result<(), DbError> {
        let removed = self.collections.write().remove(name);
        if removed.is_none() {
            return Err(DbError::NamespaceNotFound(name.to_string()));
        }
        let mut tree = self.tree.lock();
        tree.delete(name.as_bytes())?;
        self.pager.lock().set_catalog_root(tree.root_page_id());
        Ok(())
    }

    /// Collection names in arbitrary order.
    #[must_use]
    pub fn list_collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Rewrites a collection's catalog entry from its current state.
    /// Called after every successful mutation so persisted roots and
    /// counts stay accurate.
    ///
    /// # Errors
    /// `NamespaceNotFound` when the collection does not exist; storage
    /// errors from the catalog tree.
    pub fn save_collection(&self, name: &str) -> Result<(), DbError> {
        let collection = self.require_collection(name)?;
        let bytes = encode_document(&collection.info().to_document())?;
        let mut tree = self.tree.lock();
        tree.insert(name.as_bytes(), &bytes)?;
        self.pager.lock().set_catalog_root(tree.root_page_id());
        Ok(())
    }
}

fn validate_namespace(name: &str) -> Result<(), DbError> {
    if name.is_empty() {
        return Err(DbError::InvalidNamespace("collection name is empty".into()));
    }
    if name.len() > MAX_NAMESPACE_LENGTH {
        return Err(DbError::InvalidNamespace(format!(
            "collection name exceeds {MAX_NAMESPACE_LENGTH} characters"
        )));
    }
    if name.contains('$') || name.contains('\0') {
        return Err(DbError::InvalidNamespace(format!(
            "collection name '{name}' contains reserved characters"
        )));
    }
    if name.starts_with("system.") {
        return Err(DbError::InvalidNamespace(format!(
            "collection name '{name}' uses the reserved system prefix"
        )));
    }
    Ok(())
}
