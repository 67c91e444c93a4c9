//! # Storage Layer
//!
//! The foundation the record store and the executors stand on: page files
//! on disk, an open-file registry, and the pinning buffer pool.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  heap / exec (records, scans, join) │
//! ├─────────────────────────────────────┤
//! │  BufferPool   (frames, pins, SIEVE) │
//! ├─────────────────────────────────────┤
//! │  FileManager  (file_id -> storage)  │
//! ├─────────────────────────────────────┤
//! │  MmapStorage  (memory-mapped pages) │
//! └─────────────────────────────────────┘
//! ```
//!
//! Pages are addressed as `(file_id, page_no)` and only ever touched
//! through a pinned [`PageGuard`]. The pool is the single owner of page
//! bytes in memory; the mmap layer is its backing store, not a cache peer.
//!
//! ## Module Organization
//!
//! - `mmap`: page-granular memory-mapped files (`MmapStorage`)
//! - `file_manager`: open-file registry with logical page accounting
//! - `pool`: sharded pinning buffer pool with SIEVE eviction

mod file_manager;
mod mmap;
mod pool;

pub use file_manager::FileManager;
pub use mmap::MmapStorage;
pub use pool::{BufferPool, PageGuard, PageKey, TEMP_FILE_ID};

pub use crate::config::PAGE_SIZE;
