//! # Memory-Mapped Page Storage
//!
//! Low-level page-granular file access built on `memmap2`. A heap file on
//! disk is nothing but an array of `PAGE_SIZE` pages; `MmapStorage` maps the
//! whole file and hands out bounds-checked page slices.
//!
//! ## Safety Model
//!
//! Memory-mapped files can become invalid when the file is grown and
//! remapped. The borrow checker enforces the discipline at compile time:
//!
//! ```text
//! MmapStorage::page(&self) -> &[u8]     // borrows &self immutably
//! MmapStorage::grow(&mut self)          // requires &mut self exclusively
//! ```
//!
//! A page reference therefore cannot be held across a `grow()` call, with
//! zero runtime cost.
//!
//! ## Relationship to the buffer pool
//!
//! The buffer pool copies pages in and out of mapped storage through the
//! `FileManager`; nothing above the storage layer touches `MmapStorage`
//! directly.

use std::fs::OpenOptions;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use crate::config::PAGE_SIZE;

#[derive(Debug)]
pub struct MmapStorage {
    file: std::fs::File,
    mmap: MmapMut,
    page_count: u32,
}

impl MmapStorage {
    /// Opens an existing page file. The file size must be a non-zero
    /// multiple of the page size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open page file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size > 0,
            "cannot open empty page file '{}'",
            path.display()
        );

        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "page file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        let page_count = (file_size / PAGE_SIZE as u64) as u32;

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can
        // be modified externally. This is safe because:
        // 1. The file is opened with exclusive read+write access
        // 2. Page files are not meant to be modified by external processes
        // 3. The mmap lifetime is tied to MmapStorage, preventing use-after-unmap
        // 4. All access goes through page()/page_mut() which bounds-check page_no
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count,
        })
    }

    /// Creates a fresh page file with room for `initial_page_count` pages.
    /// An mmap cannot cover zero bytes, so the count must be at least 1 even
    /// when no page is logically in use yet.
    pub fn create<P: AsRef<Path>>(path: P, initial_page_count: u32) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            initial_page_count > 0,
            "initial page count must be at least 1"
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create page file '{}'", path.display()))?;

        let file_size = initial_page_count as u64 * PAGE_SIZE as u64;

        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to set file size to {} bytes", file_size))?;

        // SAFETY: same argument as in open(); additionally the file was just
        // created with truncate=true, so no other mapping exists.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count: initial_page_count,
        })
    }

    pub fn page(&self, page_no: u32) -> Result<&[u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of range (file has {} pages)",
            page_no,
            self.page_count
        );

        let start = page_no as usize * PAGE_SIZE;
        Ok(&self.mmap[start..start + PAGE_SIZE])
    }

    pub fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of range (file has {} pages)",
            page_no,
            self.page_count
        );

        let start = page_no as usize * PAGE_SIZE;
        Ok(&mut self.mmap[start..start + PAGE_SIZE])
    }

    /// Extends the file to `new_page_count` pages and remaps it. Requires
    /// `&mut self`, so no page reference can survive the remap.
    pub fn grow(&mut self, new_page_count: u32) -> Result<()> {
        ensure!(
            new_page_count > self.page_count,
            "grow target {} does not exceed current page count {}",
            new_page_count,
            self.page_count
        );

        let new_size = new_page_count as u64 * PAGE_SIZE as u64;

        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to grow page file to {} bytes", new_size))?;

        // SAFETY: the previous map is dropped by the assignment before the
        // new one is used; the file remains exclusively owned by this
        // MmapStorage, and the new length is a valid page multiple.
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file).wrap_err("failed to remap grown page file")?
        };

        self.page_count = new_page_count;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync page file")
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn file_size(&self) -> u64 {
        self.page_count as u64 * PAGE_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_write_reopen_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.hpf");

        {
            let mut storage = MmapStorage::create(&path, 2).unwrap();
            storage.page_mut(1).unwrap()[0] = 0xAB;
            storage.sync().unwrap();
        }

        let storage = MmapStorage::open(&path).unwrap();
        assert_eq!(storage.page_count(), 2);
        assert_eq!(storage.page(1).unwrap()[0], 0xAB);
    }

    #[test]
    fn grow_preserves_existing_pages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.hpf");

        let mut storage = MmapStorage::create(&path, 1).unwrap();
        storage.page_mut(0).unwrap()[7] = 42;

        storage.grow(4).unwrap();
        assert_eq!(storage.page_count(), 4);
        assert_eq!(storage.page(0).unwrap()[7], 42);
        assert!(storage.page(3).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn page_out_of_range_errors() {
        let dir = TempDir::new().unwrap();
        let storage = MmapStorage::create(dir.path().join("d.hpf"), 1).unwrap();
        assert!(storage.page(1).is_err());
    }
}
