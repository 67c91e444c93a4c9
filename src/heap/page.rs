//! # Heap Page Layout
//!
//! Every heap page is laid out as:
//!
//! ```text
//! Offset                 Size                  Description
//! ------                 ----                  -----------------------------
//! 0                      8                     HeapPageHeader
//! 8                      ceil(capacity / 8)    occupancy bitmap, 1 bit/slot
//! 8 + bitmap             capacity * record_size  fixed-width record slots
//! ```
//!
//! The header is part of the page's raw bytes; the record store computes
//! offsets with [`Layout`] and never duplicates header state in memory.
//! `zerocopy` transmutes the header in place; all fields are little-endian.

use std::mem::size_of;

use eyre::{ensure, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{HEAP_PAGE_HEADER_SIZE, PAGE_SIZE};

/// Sentinel page number meaning "no page" in free-list links.
pub const NO_FREE_PAGE: u32 = u32::MAX;

/// Header embedded at offset 0 of every heap page.
///
/// `next_free_page_no` is only meaningful while the page is linked into the
/// file's free list.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct HeapPageHeader {
    num_records: U32,
    next_free_page_no: U32,
}

const _: () = assert!(size_of::<HeapPageHeader>() == HEAP_PAGE_HEADER_SIZE);

impl HeapPageHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for HeapPageHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );

        Self::ref_from_bytes(&data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read HeapPageHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for HeapPageHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );

        Self::mut_from_bytes(&mut data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read HeapPageHeader: {:?}", e))
    }

    pub fn num_records(&self) -> u32 {
        self.num_records.get()
    }

    pub fn set_num_records(&mut self, count: u32) {
        self.num_records = U32::new(count);
    }

    pub fn next_free_page_no(&self) -> u32 {
        self.next_free_page_no.get()
    }

    pub fn set_next_free_page_no(&mut self, page_no: u32) {
        self.next_free_page_no = U32::new(page_no);
    }
}

/// Computed geometry of a heap page for one record size. Copy-cheap; the
/// record store derives it once per open file.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    record_size: usize,
    records_per_page: usize,
    bitmap_bytes: usize,
}

impl Layout {
    /// Derives the layout for `record_size`-byte records: the capacity is
    /// the largest `n` with `header + ceil(n/8) + n * record_size` still
    /// inside the page.
    pub fn new(record_size: usize) -> Result<Self> {
        ensure!(record_size > 0, "record size must be non-zero");

        let usable = PAGE_SIZE - HEAP_PAGE_HEADER_SIZE;
        let mut n = usable * 8 / (record_size * 8 + 1);
        while n > 0 && n.div_ceil(8) + n * record_size > usable {
            n -= 1;
        }

        ensure!(
            n > 0,
            "record size {} does not fit in a {}-byte page",
            record_size,
            PAGE_SIZE
        );

        Ok(Self {
            record_size,
            records_per_page: n,
            bitmap_bytes: n.div_ceil(8),
        })
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn records_per_page(&self) -> usize {
        self.records_per_page
    }

    fn bitmap_offset(&self) -> usize {
        HEAP_PAGE_HEADER_SIZE
    }

    fn records_offset(&self) -> usize {
        HEAP_PAGE_HEADER_SIZE + self.bitmap_bytes
    }

    fn slot_offset(&self, slot: usize) -> usize {
        debug_assert!(slot < self.records_per_page);
        self.records_offset() + slot * self.record_size
    }

    pub fn bitmap<'a>(&self, page: &'a [u8]) -> &'a [u8] {
        &page[self.bitmap_offset()..self.bitmap_offset() + self.bitmap_bytes]
    }

    pub fn bitmap_mut<'a>(&self, page: &'a mut [u8]) -> &'a mut [u8] {
        &mut page[self.bitmap_offset()..self.bitmap_offset() + self.bitmap_bytes]
    }

    pub fn slot<'a>(&self, page: &'a [u8], slot: usize) -> &'a [u8] {
        let start = self.slot_offset(slot);
        &page[start..start + self.record_size]
    }

    pub fn slot_mut<'a>(&self, page: &'a mut [u8], slot: usize) -> &'a mut [u8] {
        let start = self.slot_offset(slot);
        &mut page[start..start + self.record_size]
    }

    /// Initializes a freshly allocated page: empty occupancy, linked to
    /// `next_free_page_no` in the free list.
    pub fn init_page(&self, page: &mut [u8], next_free_page_no: u32) {
        page[..self.records_offset()].fill(0);
        let header = HeapPageHeader::from_bytes_mut(page)
            .expect("page buffer shorter than a header"); // INVARIANT: pool pages are PAGE_SIZE
        header.set_num_records(0);
        header.set_next_free_page_no(next_free_page_no);
    }
}
