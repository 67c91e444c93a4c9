//! # Pinning Buffer Pool
//!
//! A sharded page cache mediating every page access in the system. Callers
//! never see raw file bytes: they receive a pinned [`PageGuard`] and the
//! pool guarantees the frame stays resident until the guard drops.
//!
//! ## Frames and eviction
//!
//! Each shard holds up to `capacity` frames:
//!
//! ```text
//! Frame {
//!     key: PageKey,           // file_id + page_no
//!     visited: AtomicBool,    // second-chance flag
//!     dirty: AtomicBool,      // needs write-back before reuse
//!     pin_count: AtomicU32,   // reference count, 0 = evictable
//!     data: Box<[u8; PAGE_SIZE]>,
//! }
//! ```
//!
//! Eviction is SIEVE-style second chance: a hand walks the shard, clears
//! `visited` flags, skips pinned frames, and reclaims the first unpinned,
//! unvisited frame. A dirty table page is written back through the
//! [`FileManager`] before its frame is reused; temporary pages are simply
//! discarded. If every frame in the shard is pinned the pool reports
//! [`StorageError::PoolExhausted`], a capacity error, never retried.
//!
//! ## Temporary pages
//!
//! Operators that need scratch blocks (the block nested-loop join) ask for
//! pages under the reserved [`TEMP_FILE_ID`]. Temporary pages live only in
//! cache, get pool-local page numbers from a monotonic counter, and are
//! never written back; once unpinned their frames are reclaimable like any
//! other.
//!
//! ## Pin discipline
//!
//! `BufferPool` is a cheap handle around shared state, and every
//! `PageGuard` carries its own clone, so operators may hold pinned pages
//! as struct fields for as long as they need them. Dropping the guard
//! unpins exactly once; `data_mut` marks the frame dirty. Pages are shared
//! only through this reference-count discipline; the pool introduces no
//! other locks above its shards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use log::debug;
use parking_lot::RwLock;

use crate::config::{DEFAULT_POOL_CAPACITY, PAGE_SIZE, POOL_SHARD_COUNT};
use crate::errors::StorageError;

use super::FileManager;

/// File id reserved for temporary, non-file-backed pages.
pub const TEMP_FILE_ID: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub file_id: u32,
    pub page_no: u32,
}

impl PageKey {
    pub fn new(file_id: u32, page_no: u32) -> Self {
        Self { file_id, page_no }
    }

    pub fn is_temporary(&self) -> bool {
        self.file_id == TEMP_FILE_ID
    }
}

struct Frame {
    key: PageKey,
    visited: AtomicBool,
    dirty: AtomicBool,
    pin_count: AtomicU32,
    data: Box<[u8; PAGE_SIZE]>,
}

impl Frame {
    fn new(key: PageKey) -> Self {
        Self {
            key,
            visited: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin called on unpinned page");
    }

    fn mark_visited(&self) {
        self.visited.store(true, Ordering::Release);
    }

    fn clear_visited(&self) -> bool {
        self.visited.swap(false, Ordering::AcqRel)
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}

struct PoolShard {
    frames: Vec<Frame>,
    index: HashMap<PageKey, usize>,
    hand: usize,
    capacity: usize,
}

impl PoolShard {
    fn new(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            hand: 0,
            capacity,
        }
    }

    fn get(&self, key: &PageKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    /// Picks a victim frame with the SIEVE hand, skipping pinned frames and
    /// giving visited frames a second chance. Returns the victim's key and
    /// dirty flag, or `None` when every frame is pinned.
    fn evict(&mut self) -> Option<(PageKey, bool)> {
        if self.frames.is_empty() {
            return None;
        }

        let start = self.hand;
        let mut wrapped_once = false;

        loop {
            let frame = &self.frames[self.hand];

            if frame.is_pinned() {
                self.hand = (self.hand + 1) % self.frames.len();
                if self.hand == start {
                    if wrapped_once {
                        return None;
                    }
                    wrapped_once = true;
                }
                continue;
            }

            if frame.clear_visited() {
                self.hand = (self.hand + 1) % self.frames.len();
                continue;
            }

            return Some((frame.key, frame.is_dirty()));
        }
    }

    fn remove(&mut self, idx: usize) -> Frame {
        let frame = self.frames.swap_remove(idx);
        self.index.remove(&frame.key);

        if idx < self.frames.len() {
            let moved_key = self.frames[idx].key;
            self.index.insert(moved_key, idx);
        }

        if self.hand >= self.frames.len() && !self.frames.is_empty() {
            self.hand = 0;
        }

        frame
    }

    fn insert(&mut self, frame: Frame) {
        let key = frame.key;
        let idx = self.frames.len();
        self.frames.push(frame);
        self.index.insert(key, idx);
    }

    fn is_full(&self) -> bool {
        self.frames.len() >= self.capacity
    }
}

struct PoolInner {
    shards: Vec<RwLock<PoolShard>>,
    files: FileManager,
    next_temp_page_no: AtomicU32,
    capacity_per_shard: usize,
}

/// Handle to the shared pool state. Cloning is cheap (an `Arc` bump);
/// every [`PageGuard`] carries a clone so pins outlive any one call frame.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(files: FileManager, total_capacity: usize) -> Result<Self> {
        ensure!(
            total_capacity >= POOL_SHARD_COUNT,
            "pool capacity {} must be at least {} (one frame per shard)",
            total_capacity,
            POOL_SHARD_COUNT
        );

        let capacity_per_shard = total_capacity / POOL_SHARD_COUNT;
        let remainder = total_capacity % POOL_SHARD_COUNT;

        let shards: Vec<_> = (0..POOL_SHARD_COUNT)
            .map(|i| {
                let cap = if i < remainder {
                    capacity_per_shard + 1
                } else {
                    capacity_per_shard
                };
                RwLock::new(PoolShard::new(cap))
            })
            .collect();

        Ok(Self {
            inner: Arc::new(PoolInner {
                shards,
                files,
                next_temp_page_no: AtomicU32::new(0),
                capacity_per_shard,
            }),
        })
    }

    pub fn with_default_capacity(files: FileManager) -> Result<Self> {
        Self::new(files, DEFAULT_POOL_CAPACITY)
    }

    pub fn file_manager(&self) -> &FileManager {
        &self.inner.files
    }

    fn shard_index(&self, key: &PageKey) -> usize {
        let hash = (key.file_id as usize)
            .wrapping_mul(31)
            .wrapping_add(key.page_no as usize);
        hash % POOL_SHARD_COUNT
    }

    fn shard(&self, key: &PageKey) -> &RwLock<PoolShard> {
        &self.inner.shards[self.shard_index(key)]
    }

    /// Fetches an existing page of an open file, pinned.
    pub fn fetch_page(&self, file_id: u32, page_no: u32) -> Result<PageGuard> {
        if page_no >= self.inner.files.logical_pages(file_id)? {
            return Err(StorageError::PageNotExist { file_id, page_no }.into());
        }

        let key = PageKey::new(file_id, page_no);
        self.acquire(key, |data| self.inner.files.read_page(file_id, page_no, data))
    }

    /// Appends a fresh, zeroed page to the file and returns it pinned and
    /// already marked dirty.
    pub fn new_page(&self, file_id: u32) -> Result<(u32, PageGuard)> {
        let page_no = self.inner.files.allocate_page(file_id)?;
        let key = PageKey::new(file_id, page_no);
        let guard = self.acquire(key, |data| {
            data.fill(0);
            Ok(())
        })?;
        guard.mark_dirty();
        Ok((page_no, guard))
    }

    /// Hands out a pinned scratch page not backed by any file. Its page
    /// number is pool-local and only meaningful as a cache key.
    pub fn new_temporary_page(&self) -> Result<PageGuard> {
        let page_no = self.inner.next_temp_page_no.fetch_add(1, Ordering::Relaxed);
        let key = PageKey::new(TEMP_FILE_ID, page_no);
        self.acquire(key, |data| {
            data.fill(0);
            Ok(())
        })
    }

    /// Loads the page into a frame (or finds it already cached) and returns
    /// it pinned.
    fn acquire(&self, key: PageKey, init: impl FnOnce(&mut [u8]) -> Result<()>) -> Result<PageGuard> {
        {
            let shard = self.shard(&key);
            let guard = shard.read();

            if let Some(idx) = guard.get(&key) {
                guard.frames[idx].pin();
                guard.frames[idx].mark_visited();
                return Ok(PageGuard {
                    pool: self.clone(),
                    key,
                });
            }
        }

        let shard = self.shard(&key);
        let mut guard = shard.write();

        // raced with another loader between the read and write locks
        if let Some(idx) = guard.get(&key) {
            guard.frames[idx].pin();
            guard.frames[idx].mark_visited();
            return Ok(PageGuard {
                pool: self.clone(),
                key,
            });
        }

        if guard.is_full() {
            match guard.evict() {
                Some((victim, was_dirty)) => {
                    if let Some(idx) = guard.get(&victim) {
                        if was_dirty && !victim.is_temporary() {
                            let frame = &guard.frames[idx];
                            self.inner.files.write_page(
                                victim.file_id,
                                victim.page_no,
                                frame.data.as_slice(),
                            )?;
                        }
                        debug!(
                            "pool: evicted page ({}, {}) dirty={}",
                            victim.file_id, victim.page_no, was_dirty
                        );
                        guard.remove(idx);
                    }
                }
                None => {
                    return Err(StorageError::PoolExhausted {
                        capacity: guard.capacity,
                    }
                    .into());
                }
            }
        }

        let mut frame = Frame::new(key);
        init(frame.data.as_mut_slice())?;
        frame.pin();
        frame.mark_visited();
        guard.insert(frame);

        Ok(PageGuard {
            pool: self.clone(),
            key,
        })
    }

    fn data(&self, key: &PageKey) -> Option<&[u8]> {
        let shard = self.shard(key);
        let guard = shard.read();

        guard.get(key).map(|idx| {
            let ptr = guard.frames[idx].data.as_ptr();
            // SAFETY: frame.data is a Box<[u8; PAGE_SIZE]>, always valid for
            // PAGE_SIZE bytes; the box allocation is stable even when the
            // shard vector reorders frames. The caller holds a pin (via
            // PageGuard), so the frame cannot be removed while the slice is
            // live, which is what actually keeps the pointee alive past the
            // read-lock scope.
            unsafe { std::slice::from_raw_parts(ptr, PAGE_SIZE) }
        })
    }

    // SAFETY: returns a mutable slice while only holding a read lock. Sound
    // only because the single caller is PageGuard::data_mut, which takes
    // &mut self on the guard: a pinned frame cannot be evicted, and the
    // exclusive guard borrow rules out a second live reference from the same
    // pin. Distinct guards to the same page are not handed out to concurrent
    // mutators by this crate's single-writer discipline.
    #[allow(clippy::mut_from_ref)]
    unsafe fn data_mut_unchecked(&self, key: &PageKey) -> Option<&mut [u8]> {
        let shard = self.shard(key);
        let guard = shard.read();

        guard.get(key).map(|idx| {
            let frame = &guard.frames[idx];
            frame.mark_dirty();
            let ptr = frame.data.as_ptr() as *mut u8;
            // SAFETY: see function-level contract; validity and alignment
            // follow from the boxed array, liveness from the pin.
            std::slice::from_raw_parts_mut(ptr, PAGE_SIZE)
        })
    }

    fn unpin(&self, key: &PageKey) {
        let shard = self.shard(key);
        let guard = shard.read();

        if let Some(idx) = guard.get(key) {
            guard.frames[idx].unpin();
        }
    }

    fn mark_dirty(&self, key: &PageKey) {
        let shard = self.shard(key);
        let guard = shard.read();

        if let Some(idx) = guard.get(key) {
            guard.frames[idx].mark_dirty();
        }
    }

    /// Drops every cached frame of the file, used when a table or index is
    /// dropped. Pinned frames are left in place (their owners still hold
    /// guards); the caller is expected to have released them first.
    pub fn delete_all_pages(&self, file_id: u32) -> usize {
        let mut purged = 0;

        for shard in &self.inner.shards {
            let mut guard = shard.write();

            let mut doomed: Vec<usize> = guard
                .frames
                .iter()
                .enumerate()
                .filter(|(_, f)| f.key.file_id == file_id && !f.is_pinned())
                .map(|(i, _)| i)
                .collect();

            doomed.sort_unstable_by(|a, b| b.cmp(a));

            for idx in doomed {
                guard.remove(idx);
                purged += 1;
            }
        }

        debug!("pool: purged {} cached pages of file {}", purged, file_id);
        purged
    }

    /// Writes every dirty cached page of the file back to storage.
    pub fn flush_file(&self, file_id: u32) -> Result<usize> {
        let mut flushed = 0;

        for shard in &self.inner.shards {
            let guard = shard.read();

            for frame in &guard.frames {
                if frame.key.file_id == file_id && frame.is_dirty() {
                    self.inner.files.write_page(
                        frame.key.file_id,
                        frame.key.page_no,
                        frame.data.as_slice(),
                    )?;
                    frame.clear_dirty();
                    flushed += 1;
                }
            }
        }

        self.inner.files.sync(file_id)?;
        Ok(flushed)
    }

    /// Writes back every dirty non-temporary page in the pool.
    pub fn flush_all(&self) -> Result<usize> {
        let mut flushed = 0;

        for shard in &self.inner.shards {
            let guard = shard.read();

            for frame in &guard.frames {
                if !frame.key.is_temporary() && frame.is_dirty() {
                    self.inner.files.write_page(
                        frame.key.file_id,
                        frame.key.page_no,
                        frame.data.as_slice(),
                    )?;
                    frame.clear_dirty();
                    flushed += 1;
                }
            }
        }

        Ok(flushed)
    }

    /// Number of frames currently pinned, across all shards. Diagnostic;
    /// lets tests assert that operators released everything they took.
    pub fn pinned_pages(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|s| s.read().frames.iter().filter(|f| f.is_pinned()).count())
            .sum()
    }

    pub fn cached_pages(&self) -> usize {
        self.inner.shards.iter().map(|s| s.read().frames.len()).sum()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity_per_shard * POOL_SHARD_COUNT
    }
}

/// A pinned page. Holding the guard keeps the frame resident; dropping it
/// unpins exactly once. `data_mut` marks the page dirty as a side effect.
pub struct PageGuard {
    pool: BufferPool,
    key: PageKey,
}

impl std::fmt::Debug for PageGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl PageGuard {
    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn page_no(&self) -> u32 {
        self.key.page_no
    }

    pub fn data(&self) -> &[u8] {
        self.pool.data(&self.key).expect("page not in cache") // INVARIANT: a PageGuard exists only while its frame is pinned
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: &mut self gives exclusive access through this pin, and the
        // pin keeps the frame resident; data_mut_unchecked's contract holds.
        unsafe {
            self.pool
                .data_mut_unchecked(&self.key)
                .expect("page not in cache") // INVARIANT: a PageGuard exists only while its frame is pinned
        }
    }

    pub fn mark_dirty(&self) {
        self.pool.mark_dirty(&self.key);
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.pool.unpin(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pool_with_file(capacity: usize) -> (BufferPool, u32, TempDir) {
        let dir = TempDir::new().unwrap();
        let files = FileManager::new();
        let file_id = files.create(dir.path().join("t.hpf")).unwrap();
        let pool = BufferPool::new(files, capacity).unwrap();
        (pool, file_id, dir)
    }

    #[test]
    fn new_page_then_fetch_sees_written_bytes() {
        let (pool, file_id, _dir) = pool_with_file(64);

        let (page_no, mut guard) = pool.new_page(file_id).unwrap();
        guard.data_mut()[0] = 42;
        drop(guard);

        let guard = pool.fetch_page(file_id, page_no).unwrap();
        assert_eq!(guard.data()[0], 42);
    }

    #[test]
    fn fetch_of_missing_page_is_page_not_exist() {
        let (pool, file_id, _dir) = pool_with_file(64);

        let err = pool.fetch_page(file_id, 5).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::PageNotExist { page_no: 5, .. })
        ));
    }

    #[test]
    fn temporary_pages_get_distinct_ids() {
        let (pool, _file_id, _dir) = pool_with_file(64);

        let a = pool.new_temporary_page().unwrap();
        let b = pool.new_temporary_page().unwrap();
        assert_ne!(a.key(), b.key());
        assert!(a.key().is_temporary());
    }

    #[test]
    fn pinned_frames_are_not_evicted() {
        let (pool, _file_id, _dir) = pool_with_file(POOL_SHARD_COUNT);

        // every shard has capacity 1: holding each shard's frame pinned
        // leaves nothing to evict, and the next request must fail
        let mut held = Vec::new();
        let mut exhausted = false;
        for _ in 0..=POOL_SHARD_COUNT {
            match pool.new_temporary_page() {
                Ok(guard) => held.push(guard),
                Err(err) => {
                    assert!(matches!(
                        err.downcast_ref::<StorageError>(),
                        Some(StorageError::PoolExhausted { .. })
                    ));
                    exhausted = true;
                    break;
                }
            }
        }
        assert!(exhausted, "pool never reported exhaustion");

        // releasing the pins makes room again
        held.clear();
        assert!(pool.new_temporary_page().is_ok());
    }

    #[test]
    fn eviction_writes_dirty_pages_back() {
        let (pool, file_id, _dir) = pool_with_file(POOL_SHARD_COUNT);

        let (page_no, mut guard) = pool.new_page(file_id).unwrap();
        guard.data_mut()[100] = 9;
        drop(guard);

        // churn temporary pages through every shard to force the dirty
        // table page out of cache
        for _ in 0..POOL_SHARD_COUNT * 4 {
            let _g = pool.new_temporary_page().unwrap();
        }

        let guard = pool.fetch_page(file_id, page_no).unwrap();
        assert_eq!(guard.data()[100], 9);
    }

    #[test]
    fn flush_file_persists_dirty_pages() {
        let (pool, file_id, _dir) = pool_with_file(64);

        let (page_no, mut guard) = pool.new_page(file_id).unwrap();
        guard.data_mut()[7] = 77;
        drop(guard);

        let flushed = pool.flush_file(file_id).unwrap();
        assert!(flushed >= 1);

        let mut buf = vec![0u8; PAGE_SIZE];
        pool.file_manager()
            .read_page(file_id, page_no, &mut buf)
            .unwrap();
        assert_eq!(buf[7], 77);
    }

    #[test]
    fn delete_all_pages_purges_unpinned_frames() {
        let (pool, file_id, _dir) = pool_with_file(64);

        for _ in 0..4 {
            let (_, guard) = pool.new_page(file_id).unwrap();
            drop(guard);
        }
        assert_eq!(pool.cached_pages(), 4);

        let purged = pool.delete_all_pages(file_id);
        assert_eq!(purged, 4);
        assert_eq!(pool.cached_pages(), 0);
    }

    #[test]
    fn pinned_pages_counts_live_guards() {
        let (pool, _file_id, _dir) = pool_with_file(64);

        assert_eq!(pool.pinned_pages(), 0);
        let a = pool.new_temporary_page().unwrap();
        let b = pool.new_temporary_page().unwrap();
        assert_eq!(pool.pinned_pages(), 2);
        drop(a);
        drop(b);
        assert_eq!(pool.pinned_pages(), 0);
    }
}
