//! # heapdb: Storage and Execution Core
//!
//! The storage-and-execution heart of a relational engine: a slotted-page
//! heap-file record store and a memory-bounded block nested-loop join,
//! both running over a shared, page-pinning buffer pool.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  exec:  SeqScan │ BlockNestedLoopJoin    │   pull iterators
//! ├──────────────────────────────────────────┤
//! │  heap:  HeapFile │ HeapScan │ bitmaps    │   slotted pages, free list
//! ├──────────────────────────────────────────┤
//! │  storage:  BufferPool (pin/unpin, SIEVE) │   page frames
//! ├──────────────────────────────────────────┤
//! │  storage:  FileManager / MmapStorage     │   pages on disk
//! └──────────────────────────────────────────┘
//! ```
//!
//! The record store addresses records as [`Rid`] = (page, slot) pairs,
//! tracks free space with per-page occupancy bitmaps and a free-page list
//! threaded through page headers, and exposes its contents through the
//! restartable [`HeapScan`] cursor. The join buffers blocks of both inputs
//! in temporary buffer-pool pages and streams the restricted cross product
//! through the same pull protocol the scan speaks, so operators compose.
//!
//! ## Quick Start
//!
//! ```ignore
//! use heapdb::{BufferPool, FileManager, HeapFile};
//!
//! let pool = BufferPool::with_default_capacity(FileManager::new())?;
//! let mut table = HeapFile::create(pool.clone(), "users.hpf", 64)?;
//!
//! let rid = table.insert(&record)?;
//! let bytes = table.get(rid)?;
//!
//! let mut scan = table.scan()?;
//! while let Some(rid) = scan.current() {
//!     // ...
//!     scan.advance()?;
//! }
//! ```
//!
//! ## What this crate is not
//!
//! No SQL, no catalog, no indexes, no transactions: table metadata and the
//! persisted [`HeapFileHeader`] are owned by an external catalog, and the
//! single-writer assumption is delegated to a transaction layer above.

pub mod config;
pub mod errors;
pub mod exec;
pub mod heap;
pub mod storage;
pub mod types;

pub use errors::StorageError;
pub use exec::{BlockNestedLoopJoin, Executor, MaterializedExecutor, SeqScanExecutor};
pub use heap::{HeapFile, HeapFileHeader, HeapScan, Rid};
pub use storage::{BufferPool, FileManager, PageGuard, PAGE_SIZE};
pub use types::{ColumnMeta, ColumnRef, ColumnType, CompareOp, JoinCondition};
