//! Typed error taxonomy for the storage and execution core.
//!
//! [`StorageError`] enumerates the recoverable, caller-distinguishable failure
//! modes of the heap store, buffer pool, and join. It is carried through
//! `eyre::Report` at the call sites (via `.into()`) and recovered with
//! `err.downcast_ref::<StorageError>()` where a caller needs to branch on the
//! specific variant.

use thiserror::Error;

/// Distinguishable failure modes surfaced by the storage and execution layers.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A page number was requested that lies beyond the file's allocated pages.
    #[error("page {page_no} does not exist in file {file_id}")]
    PageNotExist {
        /// Identifier of the file the page was requested from.
        file_id: u32,
        /// The out-of-range page number.
        page_no: u32,
    },

    /// The (page, slot) pair does not address a live record.
    #[error("record ({page_no}, {slot_no}) not found")]
    RecordNotFound {
        /// Page component of the record id.
        page_no: u32,
        /// Slot component of the record id.
        slot_no: u32,
    },

    /// A join condition compared columns of incompatible types.
    #[error("incompatible types in comparison: {left} vs {right}")]
    IncompatibleType {
        /// Textual type of the left-hand column.
        left: String,
        /// Textual type of the right-hand column.
        right: String,
    },

    /// Every frame in the target shard is pinned; no page can be evicted.
    #[error("buffer pool exhausted (capacity {capacity})")]
    PoolExhausted {
        /// Capacity of the shard that could not satisfy the request.
        capacity: usize,
    },
}
