//! # Layout and Tuning Constants
//!
//! Central definitions for page geometry, buffer pool sizing, and join
//! buffering. Everything that two modules must agree on byte-for-byte
//! lives here, guarded by compile-time asserts.

// ============================================================================
// PAGE LAYOUT CONSTANTS
// These define the fundamental page structure used throughout the store
// ============================================================================

/// Size of each page in bytes (16KB).
/// This is the fundamental unit of I/O, caching, and join buffering.
pub const PAGE_SIZE: usize = 16384;

/// Size of the heap page header in bytes.
/// Every heap page begins with this header: occupancy count and the
/// next-free-page link.
pub const HEAP_PAGE_HEADER_SIZE: usize = 8;

const _: () = assert!(
    HEAP_PAGE_HEADER_SIZE < PAGE_SIZE,
    "heap page header must leave room for the bitmap and slots"
);

// ============================================================================
// BUFFER POOL CONFIGURATION
// ============================================================================

/// Default number of page frames held by the buffer pool.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Number of shards for the buffer pool.
/// Higher values reduce lock contention, at one frame minimum per shard.
pub const POOL_SHARD_COUNT: usize = 8;

const _: () = assert!(
    DEFAULT_POOL_CAPACITY >= POOL_SHARD_COUNT,
    "pool capacity must provide at least one frame per shard"
);

// ============================================================================
// JOIN BUFFERING
// ============================================================================

/// Number of buffer-pool pages a block nested-loop join may hold at once,
/// split evenly between the outer and inner side.
pub const JOIN_POOL_SIZE: usize = 8;

const _: () = assert!(
    JOIN_POOL_SIZE >= 2,
    "the join needs at least one buffer page per side"
);
