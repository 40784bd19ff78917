//! The single-file page store.
//!
//! All storage lives in one file of fixed 16 KiB pages. Page 0 holds the
//! file header: magic, format version, page size, the catalog tree's
//! root page id, and the allocated page count. Pages are cached in
//! memory and written back on `flush`, which is the durability boundary
//! for commits.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::core::common::DbError;

/// Size of every page in the database file.
pub const PAGE_SIZE: usize = 16 * 1024;

const MAGIC: [u8; 8] = *b"DOCLITE\0";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 32;

/// Manages the database file: page allocation, cached reads and writes,
/// and the durable header.
pub struct Pager {
    file: File,
    path: PathBuf,
    page_count: u64,
    catalog_root: u64,
    cache: HashMap<u64, Vec<u8>>,
    dirty: HashSet<u64>,
    cache_capacity: usize,
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("path", &self.path)
            .field("page_count", &self.page_count)
            .field("catalog_root", &self.catalog_root)
            .field("dirty", &self.dirty.len())
            .finish()
    }
}

impl Pager {
    /// Opens the database file, creating and initializing it when absent
    /// or empty.
    ///
    /// # Errors
    /// Returns `Storage` when the header is malformed or from another
    /// format version, and `Io` on file failures.
    pub fn open(path: impl AsRef<Path>, cache_capacity: usize) -> Result<Self, DbError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let mut pager = Self {
            file,
            path,
            page_count: 1,
            catalog_root: 0,
            cache: HashMap::new(),
            dirty: HashSet::new(),
            cache_capacity,
        };

        if len == 0 {
            pager.write_header()?;
            pager.file.sync_all()?;
        } else {
            let mut header = vec![0u8; HEADER_SIZE];
            pager.file.seek(SeekFrom::Start(0))?;
            pager.file.read_exact(&mut header)?;
            pager.read_header(&header)?;
        }
        Ok(pager)
    }

    fn read_header(&mut self, bytes: &[u8]) -> Result<(), DbError> {
        let mut cursor = Cursor::new(bytes);
        let mut magic = [0u8; 8];
        cursor
            .read_exact(&mut magic)
            .map_err(|e| DbError::Storage(e.to_string()))?;
        if magic != MAGIC {
            return Err(DbError::Storage(format!(
                "'{}' is not a doclite database file",
                self.path.display()
            )));
        }
        let version = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| DbError::Storage(e.to_string()))?;
        if version != FORMAT_VERSION {
            return Err(DbError::Storage(format!(
                "unsupported format version {version}, expected {FORMAT_VERSION}"
            )));
        }
        let page_size = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| DbError::Storage(e.to_string()))?;
        if page_size as usize != PAGE_SIZE {
            return Err(DbError::Storage(format!(
                "file page size {page_size} does not match engine page size {PAGE_SIZE}"
            )));
        }
        self.catalog_root = cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| DbError::Storage(e.to_string()))?;
        self.page_count = cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| DbError::Storage(e.to_string()))?;
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), DbError> {
        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.extend_from_slice(&MAGIC);
        header
            .write_u32::<LittleEndian>(FORMAT_VERSION)
            .map_err(|e| DbError::Storage(e.to_string()))?;
        #[allow(clippy::cast_possible_truncation)]
        header
            .write_u32::<LittleEndian>(PAGE_SIZE as u32)
            .map_err(|e| DbError::Storage(e.to_string()))?;
        header
            .write_u64::<LittleEndian>(self.catalog_root)
            .map_err(|e| DbError::Storage(e.to_string()))?;
        header
            .write_u64::<LittleEndian>(self.page_count)
            .map_err(|e| DbError::Storage(e.to_string()))?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        Ok(())
    }

    /// The root page id of the catalog tree, 0 when none exists yet.
    #[must_use]
    pub const fn catalog_root(&self) -> u64 {
        self.catalog_root
    }

    /// Records a new catalog root; persisted on the next `flush`.
    pub fn set_catalog_root(&mut self, page_id: u64) {
        self.catalog_root = page_id;
    }

    /// The number of allocated pages, including the header page.
    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Allocates a fresh zeroed page and returns its id.
    pub fn allocate_page(&mut self) -> Result<u64, DbError> {
        let page_id = self.page_count;
        self.page_count += 1;
        self.cache.insert(page_id, vec![0u8; PAGE_SIZE]);
        self.dirty.insert(page_id);
        self.evict_if_needed();
        Ok(page_id)
    }

    /// Reads a page, from cache when possible.
    ///
    /// # Errors
    /// Returns `Storage` for out-of-bounds ids and `Io` on read failures.
    pub fn read_page(&mut self, page_id: u64) -> Result<Vec<u8>, DbError> {
        if page_id == 0 || page_id >= self.page_count {
            return Err(DbError::Storage(format!(
                "page id {page_id} out of bounds (page count {})",
                self.page_count
            )));
        }
        if let Some(data) = self.cache.get(&page_id) {
            return Ok(data.clone());
        }
        let mut buf = vec![0u8; PAGE_SIZE];
        self.file
            .seek(SeekFrom::Start(page_id * PAGE_SIZE as u64))?;
        self.file.read_exact(&mut buf)?;
        self.cache.insert(page_id, buf.clone());
        self.evict_if_needed();
        Ok(buf)
    }

    /// Writes a page into the cache and marks it dirty.
    ///
    /// # Errors
    /// Returns `Storage` for out-of-bounds ids or wrong-sized buffers.
    pub fn write_page(&mut self, page_id: u64, data: Vec<u8>) -> Result<(), DbError> {
        if page_id == 0 || page_id >= self.page_count {
            return Err(DbError::Storage(format!(
                "page id {page_id} out of bounds (page count {})",
                self.page_count
            )));
        }
        if data.len() != PAGE_SIZE {
            return Err(DbError::Storage(format!(
                "page data length mismatch: expected {PAGE_SIZE}, got {}",
                data.len()
            )));
        }
        self.cache.insert(page_id, data);
        self.dirty.insert(page_id);
        self.evict_if_needed();
        Ok(())
    }

    /// Writes all dirty pages and the header, then syncs the file.
    ///
    /// # Errors
    /// Returns `Io` on write or sync failures.
    pub fn flush(&mut self) -> Result<(), DbError> {
        let mut dirty: Vec<u64> = self.dirty.iter().copied().collect();
        dirty.sort_unstable();
        for page_id in dirty {
            let data = self
                .cache
                .get(&page_id)
                .ok_or_else(|| DbError::Internal(format!("dirty page {page_id} not in cache")))?;
            self.file
                .seek(SeekFrom::Start(page_id * PAGE_SIZE as u64))?;
            self.file.write_all(data)?;
        }
        self.dirty.clear();
        self.write_header()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Flushes and releases the cache.
    pub fn close(&mut self) -> Result<(), DbError> {
        self.flush()?;
        self.cache.clear();
        Ok(())
    }

    // Clean pages are dropped once the cache exceeds its capacity; dirty
    // pages stay resident until the next flush.
    fn evict_if_needed(&mut self) {
        if self.cache.len() <= self.cache_capacity {
            return;
        }
        let evictable: Vec<u64> = self
            .cache
            .keys()
            .filter(|id| !self.dirty.contains(id))
            .copied()
            .take(self.cache.len() - self.cache_capacity)
            .collect();
        for id in evictable {
            self.cache.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_new_file_initializes_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let pager = Pager::open(&path, 64).unwrap();
        assert_eq!(pager.page_count(), 1);
        assert_eq!(pager.catalog_root(), 0);
        assert!(path.exists());
    }

    #[test]
    fn test_allocate_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("test.db"), 64).unwrap();

        let page_id = pager.allocate_page().unwrap();
        assert_eq!(page_id, 1);
        let mut data = vec![0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[PAGE_SIZE - 1] = 0xCD;
        pager.write_page(page_id, data.clone()).unwrap();
        assert_eq!(pager.read_page(page_id).unwrap(), data);
    }

    #[test]
    fn test_header_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let mut pager = Pager::open(&path, 64).unwrap();
            let root = pager.allocate_page().unwrap();
            pager.set_catalog_root(root);
            pager.flush().unwrap();
        }
        let pager = Pager::open(&path, 64).unwrap();
        assert_eq!(pager.catalog_root(), 1);
        assert_eq!(pager.page_count(), 2);
    }

    #[test]
    fn test_pages_survive_reopen_only_after_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut data = vec![0u8; PAGE_SIZE];
        data[7] = 0x77;
        {
            let mut pager = Pager::open(&path, 64).unwrap();
            let page_id = pager.allocate_page().unwrap();
            pager.write_page(page_id, data.clone()).unwrap();
            pager.flush().unwrap();
        }
        let mut pager = Pager::open(&path, 64).unwrap();
        assert_eq!(pager.read_page(1).unwrap(), data);
    }

    #[test]
    fn test_out_of_bounds_read_rejected() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("test.db"), 64).unwrap();
        assert!(matches!(pager.read_page(0), Err(DbError::Storage(_))));
        assert!(matches!(pager.read_page(99), Err(DbError::Storage(_))));
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not_a_db");
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        assert!(matches!(Pager::open(&path, 64), Err(DbError::Storage(_))));
    }
}
