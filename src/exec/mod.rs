//! # Query Execution Operators
//!
//! Pull-based (Volcano) operators over flat byte tuples. Every operator
//! speaks the same [`Executor`] protocol, so a join's children may be
//! scans, materialized relations, or other joins.
//!
//! - [`executor`]: the protocol and the in-memory relation
//! - [`scan`]: sequential scan over a heap file
//! - [`join`]: memory-bounded block nested-loop join

mod executor;
mod join;
mod scan;

pub use executor::{Executor, MaterializedExecutor};
pub use join::BlockNestedLoopJoin;
pub use scan::SeqScanExecutor;
