//! A paged B+Tree over the [`Pager`].
//!
//! Keys are byte strings ordered bytewise. Leaf nodes hold the entries
//! and are chained left to right for range scans; internal nodes hold
//! separator keys, where the separator is the first key of its right
//! subtree. Values too large to inline in a 16 KiB page spill to
//! overflow page chains so documents up to the engine limit remain
//! storable. Deletion removes entries without merging pages; the slack
//! is reclaimed only by splits reusing in-node space.

use std::io::{Cursor, Read};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;

use crate::core::common::DbError;
use crate::core::storage::pager::{Pager, PAGE_SIZE};

const NODE_LEAF: u8 = 0;
const NODE_INTERNAL: u8 = 1;
const NODE_HEADER_SIZE: usize = 11; // type u8 + count u16 + next u64

/// Values longer than this are stored in overflow chains.
const INLINE_VALUE_LIMIT: usize = PAGE_SIZE / 4;

/// Payload bytes available per overflow page after its next-pointer and
/// length prefix.
const OVERFLOW_CAPACITY: usize = PAGE_SIZE - 12;

/// Longest key the tree accepts; bounded so that a handful of entries
/// always fit in one page.
pub const MAX_KEY_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
enum StoredValue {
    Inline(Vec<u8>),
    Overflow { first_page: u64, total_len: u64 },
}

impl StoredValue {
    fn serialized_size(&self) -> usize {
        match self {
            Self::Inline(bytes) => 1 + 4 + bytes.len(),
            Self::Overflow { .. } => 1 + 8 + 8,
        }
    }
}

#[derive(Debug, Clone)]
struct LeafEntry {
    key: Vec<u8>,
    value: StoredValue,
}

impl LeafEntry {
    fn serialized_size(&self) -> usize {
        2 + self.key.len() + self.value.serialized_size()
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf { entries: Vec<LeafEntry>, next: u64 },
    Internal { keys: Vec<Vec<u8>>, children: Vec<u64> },
}

impl Node {
    fn serialized_size(&self) -> usize {
        match self {
            Self::Leaf { entries, .. } => {
                NODE_HEADER_SIZE + entries.iter().map(LeafEntry::serialized_size).sum::<usize>()
            }
            Self::Internal { keys, .. } => {
                NODE_HEADER_SIZE
                    + 8
                    + keys.iter().map(|k| 2 + k.len() + 8).sum::<usize>()
            }
        }
    }

    fn fits_in_page(&self) -> bool {
        self.serialized_size() <= PAGE_SIZE
    }

    fn serialize(&self) -> Result<Vec<u8>, DbError> {
        let err = |e: std::io::Error| DbError::Storage(e.to_string());
        let mut buf = Vec::with_capacity(PAGE_SIZE);
        match self {
            Self::Leaf { entries, next } => {
                buf.write_u8(NODE_LEAF).map_err(err)?;
                buf.write_u16::<LittleEndian>(entry_count_u16(entries.len())?)
                    .map_err(err)?;
                buf.write_u64::<LittleEndian>(*next).map_err(err)?;
                for entry in entries {
                    buf.write_u16::<LittleEndian>(entry_count_u16(entry.key.len())?)
                        .map_err(err)?;
                    buf.extend_from_slice(&entry.key);
                    match &entry.value {
                        StoredValue::Inline(bytes) => {
                            buf.write_u8(0).map_err(err)?;
                            #[allow(clippy::cast_possible_truncation)]
                            buf.write_u32::<LittleEndian>(bytes.len() as u32)
                                .map_err(err)?;
                            buf.extend_from_slice(bytes);
                        }
                        StoredValue::Overflow { first_page, total_len } => {
                            buf.write_u8(1).map_err(err)?;
                            buf.write_u64::<LittleEndian>(*first_page).map_err(err)?;
                            buf.write_u64::<LittleEndian>(*total_len).map_err(err)?;
                        }
                    }
                }
            }
            Self::Internal { keys, children } => {
                buf.write_u8(NODE_INTERNAL).map_err(err)?;
                buf.write_u16::<LittleEndian>(entry_count_u16(keys.len())?)
                    .map_err(err)?;
                buf.write_u64::<LittleEndian>(0).map_err(err)?;
                let first = children
                    .first()
                    .ok_or_else(|| DbError::Internal("internal node without children".into()))?;
                buf.write_u64::<LittleEndian>(*first).map_err(err)?;
                for (key, child) in keys.iter().zip(children.iter().skip(1)) {
                    buf.write_u16::<LittleEndian>(entry_count_u16(key.len())?)
                        .map_err(err)?;
                    buf.extend_from_slice(key);
                    buf.write_u64::<LittleEndian>(*child).map_err(err)?;
                }
            }
        }
        if buf.len() > PAGE_SIZE {
            return Err(DbError::Internal(format!(
                "serialized node exceeds page size: {} bytes",
                buf.len()
            )));
        }
        buf.resize(PAGE_SIZE, 0);
        Ok(buf)
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, DbError> {
        let err = |e: std::io::Error| DbError::Storage(format!("corrupt node page: {e}"));
        let mut cursor = Cursor::new(bytes);
        let node_type = cursor.read_u8().map_err(err)?;
        let count = cursor.read_u16::<LittleEndian>().map_err(err)? as usize;
        let next = cursor.read_u64::<LittleEndian>().map_err(err)?;
        match node_type {
            NODE_LEAF => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key_len = cursor.read_u16::<LittleEndian>().map_err(err)? as usize;
                    let mut key = vec![0u8; key_len];
                    cursor.read_exact(&mut key).map_err(err)?;
                    let kind = cursor.read_u8().map_err(err)?;
                    let value = match kind {
                        0 => {
                            let len = cursor.read_u32::<LittleEndian>().map_err(err)? as usize;
                            let mut bytes = vec![0u8; len];
                            cursor.read_exact(&mut bytes).map_err(err)?;
                            StoredValue::Inline(bytes)
                        }
                        1 => StoredValue::Overflow {
                            first_page: cursor.read_u64::<LittleEndian>().map_err(err)?,
                            total_len: cursor.read_u64::<LittleEndian>().map_err(err)?,
                        },
                        other => {
                            return Err(DbError::Storage(format!(
                                "corrupt node page: unknown value kind {other}"
                            )))
                        }
                    };
                    entries.push(LeafEntry { key, value });
                }
                Ok(Self::Leaf { entries, next })
            }
            NODE_INTERNAL => {
                let mut children = Vec::with_capacity(count + 1);
                children.push(cursor.read_u64::<LittleEndian>().map_err(err)?);
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    let key_len = cursor.read_u16::<LittleEndian>().map_err(err)? as usize;
                    let mut key = vec![0u8; key_len];
                    cursor.read_exact(&mut key).map_err(err)?;
                    keys.push(key);
                    children.push(cursor.read_u64::<LittleEndian>().map_err(err)?);
                }
                Ok(Self::Internal { keys, children })
            }
            other => Err(DbError::Storage(format!(
                "corrupt node page: unknown node type {other}"
            ))),
        }
    }
}

fn entry_count_u16(n: usize) -> Result<u16, DbError> {
    u16::try_from(n).map_err(|_| DbError::Internal(format!("node field count {n} overflows u16")))
}

/// A B+Tree rooted at a page in the shared pager.
#[derive(Debug)]
pub struct BTree {
    pager: Arc<Mutex<Pager>>,
    root: u64,
}

impl BTree {
    /// Allocates an empty tree and returns it.
    ///
    /// # Errors
    /// Returns pager errors on allocation failure.
    pub fn create(pager: Arc<Mutex<Pager>>) -> Result<Self, DbError> {
        let root = {
            let mut guard = pager.lock();
            let root = guard.allocate_page()?;
            let node = Node::Leaf { entries: Vec::new(), next: 0 };
            guard.write_page(root, node.serialize()?)?;
            root
        };
        Ok(Self { pager, root })
    }

    /// Opens an existing tree rooted at `root`.
    #[must_use]
    pub const fn open(pager: Arc<Mutex<Pager>>, root: u64) -> Self {
        Self { pager, root }
    }

    /// The current root page id. Callers persist this after mutations
    /// since splits move the root.
    #[must_use]
    pub const fn root_page_id(&self) -> u64 {
        self.root
    }

    /// Inserts or replaces the value under `key`, returning the previous
    /// value when one existed.
    ///
    /// # Errors
    /// Returns `BadValue` for oversized keys and storage errors from the
    /// pager.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        if key.len() > MAX_KEY_SIZE {
            return Err(DbError::BadValue(format!(
                "key of {} bytes exceeds maximum key size {MAX_KEY_SIZE}",
                key.len()
            )));
        }
        let pager = Arc::clone(&self.pager);
        let mut pager = pager.lock();
        let stored = store_value(&mut pager, value)?;
        let (old, split) = self.insert_rec(&mut pager, self.root, key, stored)?;
        if let Some((sep, right)) = split {
            let new_root = pager.allocate_page()?;
            let node = Node::Internal { keys: vec![sep], children: vec![self.root, right] };
            pager.write_page(new_root, node.serialize()?)?;
            self.root = new_root;
        }
        Ok(old)
    }

    fn insert_rec(
        &self,
        pager: &mut Pager,
        page_id: u64,
        key: &[u8],
        value: StoredValue,
    ) -> Result<(Option<Vec<u8>>, Option<(Vec<u8>, u64)>), DbError> {
        let node = Node::deserialize(&pager.read_page(page_id)?)?;
        match node {
            Node::Leaf { mut entries, next } => {
                let old = match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
                    Ok(pos) => {
                        let previous = load_value(pager, &entries[pos].value)?;
                        entries[pos].value = value;
                        Some(previous)
                    }
                    Err(pos) => {
                        entries.insert(pos, LeafEntry { key: key.to_vec(), value });
                        None
                    }
                };
                let node = Node::Leaf { entries, next };
                if node.fits_in_page() {
                    pager.write_page(page_id, node.serialize()?)?;
                    return Ok((old, None));
                }
                let Node::Leaf { mut entries, next } = node else { unreachable!() };
                let mid = entries.len() / 2;
                let right_entries = entries.split_off(mid);
                let sep = right_entries[0].key.clone();
                let right_page = pager.allocate_page()?;
                let right = Node::Leaf { entries: right_entries, next };
                let left = Node::Leaf { entries, next: right_page };
                pager.write_page(right_page, right.serialize()?)?;
                pager.write_page(page_id, left.serialize()?)?;
                Ok((old, Some((sep, right_page))))
            }
            Node::Internal { mut keys, mut children } => {
                let idx = keys.partition_point(|k| k.as_slice() <= key);
                let child = children[idx];
                let (old, split) = self.insert_rec(pager, child, key, value)?;
                let Some((sep, right)) = split else {
                    return Ok((old, None));
                };
                keys.insert(idx, sep);
                children.insert(idx + 1, right);
                let node = Node::Internal { keys, children };
                if node.fits_in_page() {
                    pager.write_page(page_id, node.serialize()?)?;
                    return Ok((old, None));
                }
                let Node::Internal { mut keys, mut children } = node else { unreachable!() };
                let mid = keys.len() / 2;
                let up_key = keys[mid].clone();
                let right_keys = keys.split_off(mid + 1);
                keys.pop(); // up_key moves to the parent
                let right_children = children.split_off(mid + 1);
                let right_page = pager.allocate_page()?;
                let right = Node::Internal { keys: right_keys, children: right_children };
                let left = Node::Internal { keys, children };
                pager.write_page(right_page, right.serialize()?)?;
                pager.write_page(page_id, left.serialize()?)?;
                Ok((old, Some((up_key, right_page))))
            }
        }
    }

    /// Looks up the value stored under `key`.
    ///
    /// # Errors
    /// Returns storage errors from the pager.
    pub fn search(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        let pager = Arc::clone(&self.pager);
        let mut pager = pager.lock();
        let mut page_id = self.root;
        loop {
            match Node::deserialize(&pager.read_page(page_id)?)? {
                Node::Internal { keys, children } => {
                    let idx = keys.partition_point(|k| k.as_slice() <= key);
                    page_id = children[idx];
                }
                Node::Leaf { entries, .. } => {
                    return match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
                        Ok(pos) => Ok(Some(load_value(&mut pager, &entries[pos].value)?)),
                        Err(_) => Ok(None),
                    };
                }
            }
        }
    }

    /// Removes the entry under `key`, reporting whether it existed.
    ///
    /// # Errors
    /// Returns storage errors from the pager.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool, DbError> {
        let pager = Arc::clone(&self.pager);
        let mut pager = pager.lock();
        let mut page_id = self.root;
        loop {
            match Node::deserialize(&pager.read_page(page_id)?)? {
                Node::Internal { keys, children } => {
                    let idx = keys.partition_point(|k| k.as_slice() <= key);
                    page_id = children[idx];
                }
                Node::Leaf { mut entries, next } => {
                    let Ok(pos) = entries.binary_search_by(|e| e.key.as_slice().cmp(key)) else {
                        return Ok(false);
                    };
                    entries.remove(pos);
                    let node = Node::Leaf { entries, next };
                    pager.write_page(page_id, node.serialize()?)?;
                    return Ok(true);
                }
            }
        }
    }

    /// Returns all entries whose keys start with `prefix`, in key order.
    ///
    /// # Errors
    /// Returns storage errors from the pager.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
        self.scan(Some(prefix), |key| {
            if key.starts_with(prefix) {
                ScanStep::Take
            } else if key < prefix {
                ScanStep::Skip
            } else {
                ScanStep::Stop
            }
        })
    }

    /// Returns all entries with `start <= key <= end`, treating a missing
    /// bound as unbounded.
    ///
    /// # Errors
    /// Returns storage errors from the pager.
    pub fn search_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
        self.scan(start, |key| {
            if start.is_some_and(|s| key < s) {
                ScanStep::Skip
            } else if end.is_some_and(|e| key > e) {
                ScanStep::Stop
            } else {
                ScanStep::Take
            }
        })
    }

    /// Returns every entry in key order.
    ///
    /// # Errors
    /// Returns storage errors from the pager.
    pub fn get_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
        self.search_range(None, None)
    }

    fn scan(
        &self,
        start: Option<&[u8]>,
        mut classify: impl FnMut(&[u8]) -> ScanStep,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
        let pager = Arc::clone(&self.pager);
        let mut pager = pager.lock();
        let mut page_id = self.root;
        // Descend to the leaf that could contain the start bound.
        loop {
            match Node::deserialize(&pager.read_page(page_id)?)? {
                Node::Internal { keys, children } => {
                    let idx = start.map_or(0, |s| keys.partition_point(|k| k.as_slice() <= s));
                    page_id = children[idx];
                }
                Node::Leaf { .. } => break,
            }
        }
        let mut results = Vec::new();
        loop {
            let Node::Leaf { entries, next } = Node::deserialize(&pager.read_page(page_id)?)?
            else {
                return Err(DbError::Storage("leaf chain points at internal node".into()));
            };
            for entry in &entries {
                match classify(&entry.key) {
                    ScanStep::Skip => {}
                    ScanStep::Take => {
                        let value = load_value(&mut pager, &entry.value)?;
                        results.push((entry.key.clone(), value));
                    }
                    ScanStep::Stop => return Ok(results),
                }
            }
            if next == 0 {
                return Ok(results);
            }
            page_id = next;
        }
    }

    /// Structural checks: key ordering within nodes, fanout arity, and
    /// resolvable values. Returns a description of each violation found.
    ///
    /// # Errors
    /// Returns storage errors from the pager.
    pub fn verify(&self) -> Result<Vec<String>, DbError> {
        let pager = Arc::clone(&self.pager);
        let mut pager = pager.lock();
        let mut errors = Vec::new();
        self.verify_rec(&mut pager, self.root, &mut errors)?;

        // Leaf chain must be globally ordered.
        drop(pager);
        let all = self.get_all()?;
        for pair in all.windows(2) {
            if pair[0].0 >= pair[1].0 {
                errors.push(format!(
                    "leaf chain out of order near key {}",
                    hex::encode(&pair[1].0)
                ));
            }
        }
        Ok(errors)
    }

    fn verify_rec(
        &self,
        pager: &mut Pager,
        page_id: u64,
        errors: &mut Vec<String>,
    ) -> Result<(), DbError> {
        match Node::deserialize(&pager.read_page(page_id)?)? {
            Node::Leaf { entries, .. } => {
                for pair in entries.windows(2) {
                    if pair[0].key >= pair[1].key {
                        errors.push(format!("page {page_id}: leaf keys out of order"));
                    }
                }
                for entry in &entries {
                    if let Err(e) = load_value(pager, &entry.value) {
                        errors.push(format!("page {page_id}: unreadable value: {e}"));
                    }
                }
            }
            Node::Internal { keys, children } => {
                if children.len() != keys.len() + 1 {
                    errors.push(format!(
                        "page {page_id}: internal node has {} keys but {} children",
                        keys.len(),
                        children.len()
                    ));
                }
                for pair in keys.windows(2) {
                    if pair[0] >= pair[1] {
                        errors.push(format!("page {page_id}: separator keys out of order"));
                    }
                }
                for child in children {
                    self.verify_rec(pager, child, errors)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum ScanStep {
    Skip,
    Take,
    Stop,
}

fn store_value(pager: &mut Pager, value: &[u8]) -> Result<StoredValue, DbError> {
    if value.len() <= INLINE_VALUE_LIMIT {
        return Ok(StoredValue::Inline(value.to_vec()));
    }
    // Chunks are written back to front so each page knows its successor.
    let mut next: u64 = 0;
    let chunks: Vec<&[u8]> = value.chunks(OVERFLOW_CAPACITY).collect();
    for chunk in chunks.iter().rev() {
        let page_id = pager.allocate_page()?;
        let mut buf = Vec::with_capacity(PAGE_SIZE);
        buf.write_u64::<LittleEndian>(next)
            .map_err(|e| DbError::Storage(e.to_string()))?;
        #[allow(clippy::cast_possible_truncation)]
        buf.write_u32::<LittleEndian>(chunk.len() as u32)
            .map_err(|e| DbError::Storage(e.to_string()))?;
        buf.extend_from_slice(chunk);
        buf.resize(PAGE_SIZE, 0);
        pager.write_page(page_id, buf)?;
        next = page_id;
    }
    Ok(StoredValue::Overflow { first_page: next, total_len: value.len() as u64 })
}

fn load_value(pager: &mut Pager, stored: &StoredValue) -> Result<Vec<u8>, DbError> {
    match stored {
        StoredValue::Inline(bytes) => Ok(bytes.clone()),
        StoredValue::Overflow { first_page, total_len } => {
            let mut out = Vec::with_capacity(usize::try_from(*total_len).unwrap_or(0));
            let mut page_id = *first_page;
            while page_id != 0 {
                let page = pager.read_page(page_id)?;
                let mut cursor = Cursor::new(page.as_slice());
                let next = cursor
                    .read_u64::<LittleEndian>()
                    .map_err(|e| DbError::Storage(e.to_string()))?;
                let len = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|e| DbError::Storage(e.to_string()))? as usize;
                if 12 + len > PAGE_SIZE {
                    return Err(DbError::Storage("corrupt overflow page length".into()));
                }
                out.extend_from_slice(&page[12..12 + len]);
                page_id = next;
            }
            if out.len() as u64 != *total_len {
                return Err(DbError::Storage(format!(
                    "overflow chain length mismatch: expected {total_len}, got {}",
                    out.len()
                )));
            }
            Ok(out)
        }
    }
}
