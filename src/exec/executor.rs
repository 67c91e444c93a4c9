//! # Pull-Executor Protocol
//!
//! Volcano-style pull iteration, shared by scans and joins so operators
//! compose freely (a join's child may be a scan, a materialized relation,
//! or another join):
//!
//! - `open()`: (re)prime the operator and position it at its first tuple
//!   (also the rewind operation)
//! - `advance()`: move to the next tuple
//! - `current()`: the tuple's bytes, `None` once done
//! - `done()`: true after the last tuple has been passed
//!
//! Every suspension is cooperative: `advance` returns to the caller and
//! the operator resumes from explicit state on the next call. Errors
//! propagate synchronously out of the call that hit them.

use eyre::{ensure, Result};

use crate::types::ColumnMeta;

pub trait Executor {
    fn open(&mut self) -> Result<()>;

    fn advance(&mut self) -> Result<()>;

    fn current(&self) -> Option<&[u8]>;

    fn done(&self) -> bool;

    /// Byte length of every tuple this operator produces.
    fn tuple_len(&self) -> usize;

    fn columns(&self) -> &[ColumnMeta];
}

/// An in-memory relation of fixed-width tuples. Used for constant inputs
/// and for exercising operators without a heap file underneath.
pub struct MaterializedExecutor {
    columns: Vec<ColumnMeta>,
    tuple_len: usize,
    tuples: Vec<Vec<u8>>,
    pos: usize,
}

impl MaterializedExecutor {
    pub fn new(columns: Vec<ColumnMeta>, tuples: Vec<Vec<u8>>) -> Result<Self> {
        let tuple_len = columns.iter().map(|c| c.offset + c.len).max().unwrap_or(0);
        for (i, tuple) in tuples.iter().enumerate() {
            ensure!(
                tuple.len() == tuple_len,
                "tuple {} is {} bytes, schema says {}",
                i,
                tuple.len(),
                tuple_len
            );
        }

        Ok(Self {
            columns,
            tuple_len,
            tuples,
            pos: 0,
        })
    }
}

impl Executor for MaterializedExecutor {
    fn open(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        if self.pos < self.tuples.len() {
            self.pos += 1;
        }
        Ok(())
    }

    fn current(&self) -> Option<&[u8]> {
        self.tuples.get(self.pos).map(|t| t.as_slice())
    }

    fn done(&self) -> bool {
        self.pos >= self.tuples.len()
    }

    fn tuple_len(&self) -> usize {
        self.tuple_len
    }

    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnMeta;

    fn tuple(id: i32) -> Vec<u8> {
        id.to_le_bytes().to_vec()
    }

    #[test]
    fn materialized_yields_all_tuples_in_order() {
        let cols = vec![ColumnMeta::int("t", "id", 0)];
        let mut exec =
            MaterializedExecutor::new(cols, vec![tuple(1), tuple(2), tuple(3)]).unwrap();

        exec.open().unwrap();
        let mut seen = Vec::new();
        while !exec.done() {
            let bytes = exec.current().unwrap();
            seen.push(i32::from_le_bytes(bytes.try_into().unwrap()));
            exec.advance().unwrap();
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(exec.current().is_none());
    }

    #[test]
    fn open_rewinds() {
        let cols = vec![ColumnMeta::int("t", "id", 0)];
        let mut exec = MaterializedExecutor::new(cols, vec![tuple(7)]).unwrap();

        exec.open().unwrap();
        exec.advance().unwrap();
        assert!(exec.done());

        exec.open().unwrap();
        assert!(!exec.done());
        assert_eq!(exec.current().unwrap(), 7i32.to_le_bytes());
    }

    #[test]
    fn advance_past_end_stays_done() {
        let cols = vec![ColumnMeta::int("t", "id", 0)];
        let mut exec = MaterializedExecutor::new(cols, vec![]).unwrap();

        exec.open().unwrap();
        assert!(exec.done());
        exec.advance().unwrap();
        assert!(exec.done());
        assert!(exec.current().is_none());
    }

    #[test]
    fn mis_sized_tuple_is_rejected() {
        let cols = vec![ColumnMeta::int("t", "id", 0)];
        assert!(MaterializedExecutor::new(cols, vec![vec![0u8; 3]]).is_err());
    }
}
