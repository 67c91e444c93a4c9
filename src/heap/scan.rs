//! Forward-only cursor over the live records of a heap file, in ascending
//! (page, slot) order. Restart is by re-construction; there is no snapshot
//! isolation: each page reflects whatever it holds when the cursor
//! reaches it.

use eyre::Result;

use super::bitmap;
use super::file::HeapFile;
use super::Rid;

pub struct HeapScan<'f> {
    file: &'f HeapFile,
    current: Option<Rid>,
}

impl<'f> HeapScan<'f> {
    /// Positions the cursor at the first live record, or at the end for an
    /// empty file.
    pub(crate) fn new(file: &'f HeapFile) -> Result<Self> {
        let current = find_next_from(file, 0, None)?;
        Ok(Self { file, current })
    }

    /// Moves to the next live record. Past the end this is a no-op: the
    /// cursor stays done.
    pub fn advance(&mut self) -> Result<()> {
        let Some(rid) = self.current else {
            return Ok(());
        };
        self.current = find_next_from(self.file, rid.page_no, Some(rid.slot_no as usize))?;
        Ok(())
    }

    pub fn current(&self) -> Option<Rid> {
        self.current
    }

    pub fn done(&self) -> bool {
        self.current.is_none()
    }
}

/// Finds the first live slot at or after (`page_no`, just past `after`),
/// walking pages in increasing order.
fn find_next_from(file: &HeapFile, mut page_no: u32, mut after: Option<usize>) -> Result<Option<Rid>> {
    let layout = file.layout();
    let capacity = layout.records_per_page();

    while page_no < file.num_pages() {
        let guard = file.fetch_page(page_no)?;
        let data = guard.data();

        if let Some(slot) = bitmap::next_set_from(layout.bitmap(data), capacity, after) {
            return Ok(Some(Rid {
                page_no,
                slot_no: slot as u32,
            }));
        }

        // the slot cursor restarts before slot 0 on every new page;
        // carrying it over would skip that page's low slots
        after = None;
        page_no += 1;
    }

    Ok(None)
}
