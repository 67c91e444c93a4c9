//! # Open-File Registry
//!
//! The `FileManager` owns every open page file and hands out stable `u32`
//! file ids. The buffer pool addresses pages as `(file_id, page_no)` and
//! reads/writes them through this registry; nothing else touches the mmap
//! layer.
//!
//! ## Logical vs physical pages
//!
//! A heap file starts with zero logical pages, but an mmap must cover at
//! least one. Each slot therefore tracks `logical_pages`, the count the
//! heap file header records, separately from the physical mapping, which
//! grows by doubling. Only logical pages are addressable; the slack beyond
//! them is pre-sized growth room.
//!
//! ## Locking
//!
//! The registry map is behind a `RwLock`; each slot has its own `Mutex` so
//! page I/O on different files does not serialize.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use eyre::{ensure, eyre, Result};
use parking_lot::{Mutex, RwLock};

use super::MmapStorage;

struct FileSlot {
    storage: MmapStorage,
    logical_pages: u32,
}

pub struct FileManager {
    files: RwLock<HashMap<u32, Mutex<FileSlot>>>,
    next_file_id: AtomicU32,
}

impl FileManager {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            next_file_id: AtomicU32::new(0),
        }
    }

    fn register(&self, slot: FileSlot) -> u32 {
        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        self.files.write().insert(file_id, Mutex::new(slot));
        file_id
    }

    fn with_slot<T>(&self, file_id: u32, f: impl FnOnce(&mut FileSlot) -> Result<T>) -> Result<T> {
        let files = self.files.read();
        let slot = files
            .get(&file_id)
            .ok_or_else(|| eyre!("file {} is not open", file_id))?;
        let result = f(&mut slot.lock());
        result
    }

    /// Creates a fresh page file with zero logical pages.
    pub fn create<P: AsRef<Path>>(&self, path: P) -> Result<u32> {
        let storage = MmapStorage::create(path, 1)?;
        Ok(self.register(FileSlot {
            storage,
            logical_pages: 0,
        }))
    }

    /// Opens an existing page file. `logical_pages` comes from the heap
    /// file header the catalog persisted; the physical file may be larger.
    pub fn open<P: AsRef<Path>>(&self, path: P, logical_pages: u32) -> Result<u32> {
        let storage = MmapStorage::open(path)?;
        ensure!(
            storage.page_count() >= logical_pages,
            "file holds {} pages but the header claims {}",
            storage.page_count(),
            logical_pages
        );
        Ok(self.register(FileSlot {
            storage,
            logical_pages,
        }))
    }

    pub fn logical_pages(&self, file_id: u32) -> Result<u32> {
        self.with_slot(file_id, |slot| Ok(slot.logical_pages))
    }

    /// Appends one logical page, growing the physical mapping when the
    /// slack runs out, and returns its page number. The new page is not
    /// zeroed here; the buffer pool initializes it in cache.
    pub fn allocate_page(&self, file_id: u32) -> Result<u32> {
        self.with_slot(file_id, |slot| {
            let page_no = slot.logical_pages;
            slot.logical_pages += 1;
            if slot.logical_pages > slot.storage.page_count() {
                let target = slot.storage.page_count().max(1).saturating_mul(2);
                slot.storage.grow(target.max(slot.logical_pages))?;
            }
            Ok(page_no)
        })
    }

    pub fn read_page(&self, file_id: u32, page_no: u32, buf: &mut [u8]) -> Result<()> {
        self.with_slot(file_id, |slot| {
            ensure!(
                page_no < slot.logical_pages,
                "read of page {} beyond logical end {} of file {}",
                page_no,
                slot.logical_pages,
                file_id
            );
            buf.copy_from_slice(slot.storage.page(page_no)?);
            Ok(())
        })
    }

    pub fn write_page(&self, file_id: u32, page_no: u32, data: &[u8]) -> Result<()> {
        self.with_slot(file_id, |slot| {
            ensure!(
                page_no < slot.logical_pages,
                "write of page {} beyond logical end {} of file {}",
                page_no,
                slot.logical_pages,
                file_id
            );
            slot.storage.page_mut(page_no)?.copy_from_slice(data);
            Ok(())
        })
    }

    pub fn sync(&self, file_id: u32) -> Result<()> {
        self.with_slot(file_id, |slot| slot.storage.sync())
    }

    /// Closes the file and drops its mapping. Cached pages for the id must
    /// already have been purged from the buffer pool.
    pub fn close(&self, file_id: u32) -> Result<()> {
        self.files
            .write()
            .remove(&file_id)
            .map(|_| ())
            .ok_or_else(|| eyre!("file {} is not open", file_id))
    }
}

impl Default for FileManager {
    fn default() -> Self {
        Self::new()
    }
}
