//! # Heap File Record Store
//!
//! Fixed-length-record storage over a paged file. Pages with spare slot
//! capacity are threaded into a LIFO free list through their headers:
//!
//! ```text
//! HeapFileHeader.first_free_page_no ──► page 4 ──► page 1 ──► NO_FREE_PAGE
//!                                       (next_free_page_no links)
//! ```
//!
//! A page is linked iff it has at least one free slot: the insert that
//! fills a page to capacity unlinks it from the list head, and the delete
//! that first takes a full page below capacity pushes it back at the head.
//! Newly created pages start linked.
//!
//! Every page access pins through the buffer pool and unpins when the
//! guard drops; the store never caches page references across calls.
//!
//! ## Header lifecycle
//!
//! `HeapFileHeader` is not stored inside the data file. The catalog that
//! owns table metadata loads it on open ([`HeapFile::open`]) and persists
//! `header().to_bytes()` on close or checkpoint.

use std::mem::size_of;
use std::path::Path;

use eyre::{ensure, Result};
use log::debug;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::errors::StorageError;
use crate::storage::{BufferPool, PageGuard};

use super::bitmap;
use super::page::{HeapPageHeader, Layout, NO_FREE_PAGE};
use super::scan::HeapScan;
use super::Rid;

pub const HEAP_FILE_HEADER_SIZE: usize = 16;

/// Per-open-file state, persisted by the catalog alongside table metadata.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct HeapFileHeader {
    record_size: U32,
    records_per_page: U32,
    num_pages: U32,
    first_free_page_no: U32,
}

const _: () = assert!(size_of::<HeapFileHeader>() == HEAP_FILE_HEADER_SIZE);

impl HeapFileHeader {
    pub fn new(record_size: u32, records_per_page: u32) -> Self {
        Self {
            record_size: U32::new(record_size),
            records_per_page: U32::new(records_per_page),
            num_pages: U32::new(0),
            first_free_page_no: U32::new(NO_FREE_PAGE),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= size_of::<Self>(),
            "buffer too small for HeapFileHeader: {} < {}",
            bytes.len(),
            size_of::<Self>()
        );

        Self::read_from_bytes(&bytes[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read HeapFileHeader: {:?}", e))
    }

    pub fn to_bytes(&self) -> [u8; HEAP_FILE_HEADER_SIZE] {
        let mut out = [0u8; HEAP_FILE_HEADER_SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }

    pub fn record_size(&self) -> u32 {
        self.record_size.get()
    }

    pub fn records_per_page(&self) -> u32 {
        self.records_per_page.get()
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages.get()
    }

    fn set_num_pages(&mut self, count: u32) {
        self.num_pages = U32::new(count);
    }

    pub fn first_free_page_no(&self) -> u32 {
        self.first_free_page_no.get()
    }

    fn set_first_free_page_no(&mut self, page_no: u32) {
        self.first_free_page_no = U32::new(page_no);
    }
}

pub struct HeapFile {
    pool: BufferPool,
    file_id: u32,
    header: HeapFileHeader,
    layout: Layout,
}

impl HeapFile {
    /// Creates a fresh heap file for `record_size`-byte records.
    pub fn create<P: AsRef<Path>>(
        pool: BufferPool,
        path: P,
        record_size: usize,
    ) -> Result<Self> {
        let layout = Layout::new(record_size)?;
        let file_id = pool.file_manager().create(path)?;
        let header = HeapFileHeader::new(record_size as u32, layout.records_per_page() as u32);

        Ok(Self {
            pool,
            file_id,
            header,
            layout,
        })
    }

    /// Re-attaches to an existing heap file with the header the catalog
    /// persisted for it.
    pub fn open<P: AsRef<Path>>(
        pool: BufferPool,
        path: P,
        header: HeapFileHeader,
    ) -> Result<Self> {
        let layout = Layout::new(header.record_size() as usize)?;
        ensure!(
            layout.records_per_page() == header.records_per_page() as usize,
            "persisted capacity {} disagrees with computed capacity {}",
            header.records_per_page(),
            layout.records_per_page()
        );

        let file_id = pool.file_manager().open(path, header.num_pages())?;

        Ok(Self {
            pool,
            file_id,
            header,
            layout,
        })
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn header(&self) -> &HeapFileHeader {
        &self.header
    }

    pub fn record_size(&self) -> usize {
        self.layout.record_size()
    }

    pub fn records_per_page(&self) -> usize {
        self.layout.records_per_page()
    }

    pub fn num_pages(&self) -> u32 {
        self.header.num_pages()
    }

    pub(crate) fn layout(&self) -> Layout {
        self.layout
    }

    /// Copies out the record at `rid`.
    pub fn get(&self, rid: Rid) -> Result<Vec<u8>> {
        let guard = self.fetch_page(rid.page_no)?;
        let data = guard.data();
        let slot = rid.slot_no as usize;

        if slot >= self.layout.records_per_page()
            || !bitmap::is_set(self.layout.bitmap(data), slot)
        {
            return Err(StorageError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            }
            .into());
        }

        Ok(self.layout.slot(data, slot).to_vec())
    }

    /// Inserts a record into the first page with capacity, returning its
    /// new rid. `record` must be exactly `record_size` bytes.
    pub fn insert(&mut self, record: &[u8]) -> Result<Rid> {
        assert_eq!(
            record.len(),
            self.layout.record_size(),
            "record length must equal the file's record size"
        );

        let layout = self.layout;
        let capacity = layout.records_per_page();
        let (page_no, mut guard) = self.working_page()?;
        let data = guard.data_mut();

        let slot = bitmap::first_clear(layout.bitmap(data), capacity)
            .expect("page on the free list has no free slot"); // INVARIANT: only pages with capacity are linked

        bitmap::set(layout.bitmap_mut(data), slot);
        layout.slot_mut(data, slot).copy_from_slice(record);

        let header = HeapPageHeader::from_bytes_mut(data)?;
        let occupied = header.num_records() + 1;
        header.set_num_records(occupied);
        debug_assert_eq!(
            bitmap::count_set(layout.bitmap(data), capacity),
            occupied as usize
        );

        if occupied as usize == capacity {
            // the page came from the free-list head, so unlinking the head
            // unlinks exactly this page
            let next = HeapPageHeader::from_bytes(data)?.next_free_page_no();
            self.header.set_first_free_page_no(next);
            debug!("heap file {}: page {} is full, unlinked", self.file_id, page_no);
        }

        Ok(Rid {
            page_no,
            slot_no: slot as u32,
        })
    }

    /// Writes a record into a caller-chosen slot. Redo/rebuild path: the
    /// slot's bit must already be set, and a violation is a fatal
    /// precondition failure rather than a recoverable error.
    pub fn insert_at(&mut self, rid: Rid, record: &[u8]) -> Result<()> {
        assert_eq!(
            record.len(),
            self.layout.record_size(),
            "record length must equal the file's record size"
        );

        let layout = self.layout;
        let capacity = layout.records_per_page();
        let mut guard = self.fetch_page(rid.page_no)?;
        let data = guard.data_mut();
        let slot = rid.slot_no as usize;

        assert!(
            slot < capacity && bitmap::is_set(layout.bitmap(data), slot),
            "insert_at requires slot ({}, {}) to be marked live",
            rid.page_no,
            rid.slot_no
        );

        layout.slot_mut(data, slot).copy_from_slice(record);

        // unlink only when this page actually heads the free list; blindly
        // popping the head would corrupt the list for any other target
        let header = HeapPageHeader::from_bytes(data)?;
        if header.num_records() as usize == capacity
            && self.header.first_free_page_no() == rid.page_no
        {
            self.header.set_first_free_page_no(header.next_free_page_no());
        }

        Ok(())
    }

    /// Removes the record at `rid`. The rid is invalid afterwards; the slot
    /// may be reused by later inserts.
    pub fn delete(&mut self, rid: Rid) -> Result<()> {
        let layout = self.layout;
        let capacity = layout.records_per_page();
        let mut guard = self.fetch_page(rid.page_no)?;
        let data = guard.data_mut();
        let slot = rid.slot_no as usize;

        if slot >= capacity || !bitmap::is_set(layout.bitmap(data), slot) {
            return Err(StorageError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            }
            .into());
        }

        bitmap::reset(layout.bitmap_mut(data), slot);

        let header = HeapPageHeader::from_bytes_mut(data)?;
        let was_full = header.num_records() as usize == capacity;
        let remaining = header.num_records() - 1;
        header.set_num_records(remaining);
        debug_assert_eq!(
            bitmap::count_set(layout.bitmap(data), capacity),
            remaining as usize
        );

        if was_full {
            // full -> not-full: the page has capacity again, push it at the
            // free-list head
            let first = self.header.first_free_page_no();
            HeapPageHeader::from_bytes_mut(data)?.set_next_free_page_no(first);
            self.header.set_first_free_page_no(rid.page_no);
            debug!(
                "heap file {}: page {} has capacity again, linked at head",
                self.file_id, rid.page_no
            );
        }

        Ok(())
    }

    /// Overwrites the record at `rid` in place. Occupancy is unchanged, so
    /// the free list is untouched.
    pub fn update(&mut self, rid: Rid, record: &[u8]) -> Result<()> {
        assert_eq!(
            record.len(),
            self.layout.record_size(),
            "record length must equal the file's record size"
        );

        let layout = self.layout;
        let mut guard = self.fetch_page(rid.page_no)?;
        let data = guard.data_mut();
        let slot = rid.slot_no as usize;

        if slot >= layout.records_per_page() || !bitmap::is_set(layout.bitmap(data), slot) {
            return Err(StorageError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            }
            .into());
        }

        layout.slot_mut(data, slot).copy_from_slice(record);
        Ok(())
    }

    /// Cursor over every live rid in ascending (page, slot) order,
    /// positioned at the first record.
    pub fn scan(&self) -> Result<HeapScan<'_>> {
        HeapScan::new(self)
    }

    pub(crate) fn fetch_page(&self, page_no: u32) -> Result<PageGuard> {
        if page_no >= self.header.num_pages() {
            return Err(StorageError::PageNotExist {
                file_id: self.file_id,
                page_no,
            }
            .into());
        }

        self.pool.fetch_page(self.file_id, page_no)
    }

    /// A pinned page with at least one free slot: the free-list head when
    /// the list is non-empty, a freshly created page otherwise.
    fn working_page(&mut self) -> Result<(u32, PageGuard)> {
        let first_free = self.header.first_free_page_no();
        if first_free == NO_FREE_PAGE {
            self.create_page()
        } else {
            Ok((first_free, self.fetch_page(first_free)?))
        }
    }

    /// Appends a new page and links it at the free-list head.
    fn create_page(&mut self) -> Result<(u32, PageGuard)> {
        let (page_no, mut guard) = self.pool.new_page(self.file_id)?;
        debug_assert_eq!(page_no, self.header.num_pages());

        self.layout
            .init_page(guard.data_mut(), self.header.first_free_page_no());
        self.header.set_num_pages(self.header.num_pages() + 1);
        self.header.set_first_free_page_no(page_no);

        debug!("heap file {}: allocated page {}", self.file_id, page_no);
        Ok((page_no, guard))
    }
}
