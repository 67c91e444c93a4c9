//! # Block Nested-Loop Join
//!
//! Inner join of two child executors under a conjunction of column
//! comparisons, using a bounded number of buffer-pool pages regardless of
//! relation size. Each side buffers a block of tuples in temporary pages
//! (half the join's page budget per side); every buffered left tuple is
//! compared against every buffered right tuple, the right buffer is
//! refilled chunk by chunk until the right child is exhausted, and only
//! then does the left buffer move to its next block, rewinding the right
//! child for a fresh pass:
//!
//! ```text
//! for each left block:                       // refill left pages
//!     for each right chunk of whole right:   // refill right pages
//!         for each buffered left tuple:
//!             for each buffered right tuple:
//!                 emit if all conditions hold
//! ```
//!
//! ## Resumability
//!
//! The operator suspends at every emitted pair, so the five levels of loop
//! state live in named fields rather than on a call stack: block cursors
//! (`left_page`/`left_slot`/`right_page`/`right_slot`) and the two
//! exhaustion flags. `advance()` is a pure state transition that re-enters
//! the loops exactly where the previous call left off. The right slot
//! cursor is bumped *before* the condition check, so a resume continues
//! just past the last yielded pair.
//!
//! ## Resources
//!
//! Block pages are temporary buffer-pool pages, pinned for the operator's
//! lifetime and released on the terminal `done()` transition (dropping the
//! guards unpins them); dropping a half-consumed join releases them just
//! the same. Output order is deterministic but not globally sorted; the
//! contract is all pairs, no duplicates, no omissions.

use eyre::{ensure, eyre, Result};
use log::debug;
use smallvec::SmallVec;

use crate::config::{JOIN_POOL_SIZE, PAGE_SIZE};
use crate::errors::StorageError;
use crate::storage::{BufferPool, PageGuard};
use crate::types::{compare_column_bytes, find_column, ColumnMeta, CompareOp, JoinCondition};

use super::executor::Executor;

/// A temporary page holding a block of child tuples, plus how many of its
/// slots are valid (the last page of a chunk may be partially filled).
struct BlockPage {
    guard: PageGuard,
    count: usize,
}

/// A condition resolved against the concatenated output schema.
struct ResolvedCondition {
    left: ColumnMeta,
    right: ColumnMeta,
    op: CompareOp,
}

pub struct BlockNestedLoopJoin<'a> {
    left: Box<dyn Executor + 'a>,
    right: Box<dyn Executor + 'a>,
    pool: BufferPool,

    columns: Vec<ColumnMeta>,
    conditions: SmallVec<[ResolvedCondition; 4]>,
    left_len: usize,
    right_len: usize,
    left_per_page: usize,
    right_per_page: usize,
    pages_per_side: usize,

    left_pages: Vec<BlockPage>,
    right_pages: Vec<BlockPage>,
    left_active: usize,
    right_active: usize,

    left_page: usize,
    left_slot: usize,
    right_page: usize,
    right_slot: usize,
    left_over: bool,
    right_over: bool,
    ended: bool,

    scratch: Vec<u8>,
    have_tuple: bool,
}

impl std::fmt::Debug for BlockNestedLoopJoin<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockNestedLoopJoin")
            .field("left_len", &self.left_len)
            .field("right_len", &self.right_len)
            .field("pages_per_side", &self.pages_per_side)
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}

impl<'a> BlockNestedLoopJoin<'a> {
    /// Builds the operator with the default page budget.
    pub fn new(
        left: Box<dyn Executor + 'a>,
        right: Box<dyn Executor + 'a>,
        conditions: Vec<JoinCondition>,
        pool: BufferPool,
    ) -> Result<Self> {
        Self::with_pool_pages(left, right, conditions, pool, JOIN_POOL_SIZE)
    }

    /// Builds the operator with an explicit page budget, split evenly
    /// between the sides. Condition columns are resolved and type-checked
    /// here, before any tuple flows.
    pub fn with_pool_pages(
        left: Box<dyn Executor + 'a>,
        right: Box<dyn Executor + 'a>,
        conditions: Vec<JoinCondition>,
        pool: BufferPool,
        pool_pages: usize,
    ) -> Result<Self> {
        let pages_per_side = pool_pages / 2;
        ensure!(
            pages_per_side >= 1,
            "join page budget {} leaves no page per side",
            pool_pages
        );

        let left_len = left.tuple_len();
        let right_len = right.tuple_len();
        ensure!(
            left_len > 0 && right_len > 0,
            "join children must produce non-empty tuples"
        );

        let left_per_page = PAGE_SIZE / left_len;
        let right_per_page = PAGE_SIZE / right_len;
        ensure!(
            left_per_page >= 1 && right_per_page >= 1,
            "join tuple does not fit in a {}-byte page",
            PAGE_SIZE
        );

        // output schema: left columns, then right columns shifted past the
        // left tuple
        let mut columns = left.columns().to_vec();
        for col in right.columns() {
            let mut col = col.clone();
            col.offset += left_len;
            columns.push(col);
        }

        let mut resolved = SmallVec::new();
        for cond in &conditions {
            let lhs = find_column(&columns, &cond.left)
                .ok_or_else(|| {
                    eyre!("unknown column {}.{} in join condition", cond.left.table, cond.left.name)
                })?
                .clone();
            let rhs = find_column(&columns, &cond.right)
                .ok_or_else(|| {
                    eyre!("unknown column {}.{} in join condition", cond.right.table, cond.right.name)
                })?
                .clone();

            if lhs.col_type != rhs.col_type {
                return Err(StorageError::IncompatibleType {
                    left: lhs.col_type.to_string(),
                    right: rhs.col_type.to_string(),
                }
                .into());
            }

            resolved.push(ResolvedCondition {
                left: lhs,
                right: rhs,
                op: cond.op,
            });
        }

        let out_len = left_len + right_len;

        Ok(Self {
            left,
            right,
            pool,
            columns,
            conditions: resolved,
            left_len,
            right_len,
            left_per_page,
            right_per_page,
            pages_per_side,
            left_pages: Vec::new(),
            right_pages: Vec::new(),
            left_active: 0,
            right_active: 0,
            left_page: 0,
            left_slot: 0,
            right_page: 0,
            right_slot: 0,
            left_over: false,
            right_over: false,
            ended: false,
            scratch: vec![0u8; out_len],
            have_tuple: false,
        })
    }

    /// Drains the right child into freshly allocated temporary pages until
    /// the right half of the page budget is full or the child runs dry.
    fn prime_right(&mut self) -> Result<()> {
        self.right.open()?;
        while !self.right.done() && self.right_pages.len() < self.pages_per_side {
            let mut guard = self.pool.new_temporary_page()?;
            let count = fill_block(
                self.right.as_mut(),
                guard.data_mut(),
                self.right_len,
                self.right_per_page,
            )?;
            self.right_pages.push(BlockPage { guard, count });
        }
        self.right_active = self.right_pages.len();
        debug!("join: primed {} right page(s)", self.right_active);
        Ok(())
    }

    fn prime_left(&mut self) -> Result<()> {
        self.left.open()?;
        while !self.left.done() && self.left_pages.len() < self.pages_per_side {
            let mut guard = self.pool.new_temporary_page()?;
            let count = fill_block(
                self.left.as_mut(),
                guard.data_mut(),
                self.left_len,
                self.left_per_page,
            )?;
            self.left_pages.push(BlockPage { guard, count });
        }
        self.left_active = self.left_pages.len();
        debug!("join: primed {} left page(s)", self.left_active);
        Ok(())
    }

    /// Refills the already-pinned right pages with the next chunk of the
    /// right child. Only the first `right_active` pages hold valid tuples
    /// afterwards.
    fn refill_right(&mut self) -> Result<()> {
        let mut filled = 0;
        while !self.right.done() && filled < self.right_pages.len() {
            let count = fill_block(
                self.right.as_mut(),
                self.right_pages[filled].guard.data_mut(),
                self.right_len,
                self.right_per_page,
            )?;
            self.right_pages[filled].count = count;
            filled += 1;
        }
        self.right_active = filled;
        debug!("join: refilled {} right page(s)", filled);
        Ok(())
    }

    fn refill_left(&mut self) -> Result<()> {
        let mut filled = 0;
        while !self.left.done() && filled < self.left_pages.len() {
            let count = fill_block(
                self.left.as_mut(),
                self.left_pages[filled].guard.data_mut(),
                self.left_len,
                self.left_per_page,
            )?;
            self.left_pages[filled].count = count;
            filled += 1;
        }
        self.left_active = filled;
        debug!("join: refilled {} left page(s)", filled);
        Ok(())
    }

    fn load_left_tuple(&mut self) {
        let start = self.left_slot * self.left_len;
        self.scratch[..self.left_len]
            .copy_from_slice(&self.left_pages[self.left_page].guard.data()[start..start + self.left_len]);
    }

    fn load_right_tuple(&mut self) {
        let start = self.right_slot * self.right_len;
        self.scratch[self.left_len..]
            .copy_from_slice(&self.right_pages[self.right_page].guard.data()[start..start + self.right_len]);
    }

    fn conditions_hold(&self) -> bool {
        self.conditions.iter().all(|cond| {
            let lhs = cond.left.value_of(&self.scratch);
            let rhs = cond.right.value_of(&self.scratch);
            cond.op
                .holds(compare_column_bytes(cond.left.col_type, cond.left.len, lhs, rhs))
        })
    }

    /// Unpins every block page. Called on the terminal transition so a
    /// finished (or abandoned) iterator holds no pins; dropping the
    /// operator reaches the same state through the guards' own drops.
    fn release_pages(&mut self) {
        self.left_pages.clear();
        self.right_pages.clear();
        self.left_active = 0;
        self.right_active = 0;
    }
}

/// Copies tuples from `child` into `page` until the page holds `per_page`
/// tuples or the child runs dry. Returns the number of tuples written.
fn fill_block(
    child: &mut (dyn Executor + '_),
    page: &mut [u8],
    tuple_len: usize,
    per_page: usize,
) -> Result<usize> {
    let mut count = 0;
    while !child.done() && count < per_page {
        let tuple = child
            .current()
            .ok_or_else(|| eyre!("child executor has no current tuple before done"))?;
        page[count * tuple_len..(count + 1) * tuple_len].copy_from_slice(tuple);
        count += 1;
        child.advance()?;
    }
    Ok(count)
}

impl Executor for BlockNestedLoopJoin<'_> {
    fn open(&mut self) -> Result<()> {
        self.release_pages();
        self.left_page = 0;
        self.left_slot = 0;
        self.right_page = 0;
        self.right_slot = 0;
        self.left_over = false;
        self.right_over = false;
        self.ended = false;
        self.have_tuple = false;

        self.prime_right()?;
        self.prime_left()?;
        self.advance()
    }

    fn advance(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.have_tuple = false;

        while !self.left_over {
            while !self.right_over {
                // compare the buffered left block against the buffered
                // right chunk, resuming from the stored cursors
                while self.left_page < self.left_active {
                    let left_count = self.left_pages[self.left_page].count;
                    while self.left_slot < left_count {
                        self.load_left_tuple();
                        while self.right_page < self.right_active {
                            let right_count = self.right_pages[self.right_page].count;
                            while self.right_slot < right_count {
                                self.load_right_tuple();
                                // bump before the check: a resume continues
                                // just past the pair being yielded
                                self.right_slot += 1;
                                if self.conditions_hold() {
                                    self.have_tuple = true;
                                    return Ok(());
                                }
                            }
                            self.right_page += 1;
                            self.right_slot = 0;
                        }
                        self.right_page = 0;
                        self.left_slot += 1;
                    }
                    self.left_page += 1;
                    self.left_slot = 0;
                }

                if self.right.done() {
                    self.right_over = true;
                    self.left_page = 0;
                    continue;
                }

                // next right chunk against the same left block
                self.refill_right()?;
                self.right_page = 0;
                self.right_slot = 0;
                self.left_page = 0;
                self.left_slot = 0;
            }

            if self.left.done() {
                self.left_over = true;
                break;
            }

            // next left block: rewind the right child and start its passes
            // over again
            self.refill_left()?;
            self.left_page = 0;
            self.left_slot = 0;

            self.right.open()?;
            self.refill_right()?;
            self.right_page = 0;
            self.right_slot = 0;
            self.right_over = false;
        }

        self.ended = true;
        self.release_pages();
        Ok(())
    }

    fn current(&self) -> Option<&[u8]> {
        if self.have_tuple {
            Some(&self.scratch)
        } else {
            None
        }
    }

    fn done(&self) -> bool {
        self.ended
    }

    fn tuple_len(&self) -> usize {
        self.left_len + self.right_len
    }

    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }
}
