//! Sequential scan executor: bridges a heap file and its scan cursor into
//! the pull protocol, materializing each record's bytes as the current
//! tuple.

use eyre::{ensure, Result};

use crate::heap::{HeapFile, HeapScan};
use crate::types::ColumnMeta;

use super::executor::Executor;

pub struct SeqScanExecutor<'f> {
    file: &'f HeapFile,
    columns: Vec<ColumnMeta>,
    scan: Option<HeapScan<'f>>,
    current: Option<Vec<u8>>,
}

impl<'f> SeqScanExecutor<'f> {
    /// `columns` is the table's schema as the catalog describes it; every
    /// column must lie inside the file's record.
    pub fn new(file: &'f HeapFile, columns: Vec<ColumnMeta>) -> Result<Self> {
        for col in &columns {
            ensure!(
                col.offset + col.len <= file.record_size(),
                "column {}.{} ({}..{}) lies outside the {}-byte record",
                col.table,
                col.name,
                col.offset,
                col.offset + col.len,
                file.record_size()
            );
        }

        Ok(Self {
            file,
            columns,
            scan: None,
            current: None,
        })
    }

    fn load_current(&mut self) -> Result<()> {
        let rid = self.scan.as_ref().and_then(|s| s.current());
        self.current = match rid {
            Some(rid) => Some(self.file.get(rid)?),
            None => None,
        };
        Ok(())
    }
}

impl Executor for SeqScanExecutor<'_> {
    fn open(&mut self) -> Result<()> {
        self.scan = Some(self.file.scan()?);
        self.load_current()
    }

    fn advance(&mut self) -> Result<()> {
        let scan = self
            .scan
            .as_mut()
            .ok_or_else(|| eyre::eyre!("scan executor advanced before open"))?;
        scan.advance()?;
        self.load_current()
    }

    fn current(&self) -> Option<&[u8]> {
        self.current.as_deref()
    }

    fn done(&self) -> bool {
        self.scan.as_ref().map_or(true, |s| s.done())
    }

    fn tuple_len(&self) -> usize {
        self.file.record_size()
    }

    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }
}
