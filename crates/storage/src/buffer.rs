use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::page::Page;
use crate::replacer::{FrameId, LRUReplacer, Replacer};
use crate::{DiskManager, PageId};
use wal::LogManager;

/// Errors returned by the buffer pool manager.
#[derive(Debug, Error)]
pub enum BufferPoolError {
    /// The buffer pool lock was poisoned.
    #[error("buffer pool lock poisoned")]
    LockPoisoned,
    /// The underlying page store failed.
    #[error("page store error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for buffer pool results.
pub type BufferPoolResult<T> = Result<T, BufferPoolError>;

/// Flush mode for buffer pool writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Hand the write to the page store and defer the disk sync.
    Lazy,
    /// Force a disk sync after the write.
    Force,
}

/// Guard over one pinned page. Holds the pool lock for its lifetime, so
/// payload access is race-free; drop the guard before calling back into
/// the pool (for example to unpin).
pub struct PageGuard<'a> {
    state: MutexGuard<'a, BufferPoolState>,
    frame_id: FrameId,
}

impl<'a> PageGuard<'a> {
    /// Returns the frame id backing this guard.
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl Deref for PageGuard<'_> {
    type Target = Page;

    fn deref(&self) -> &Self::Target {
        &self.state.pages[self.frame_id]
    }
}

impl DerefMut for PageGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state.pages[self.frame_id]
    }
}

struct BufferPoolState {
    disk_manager: DiskManager,
    replacer: Box<dyn Replacer + Send>,
    pages: Vec<Page>,
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
}

#[derive(Default)]
struct BufferPoolMetrics {
    fetch_count: AtomicUsize,
    hit_count: AtomicUsize,
    eviction_count: AtomicUsize,
}

/// Buffer pool manager: a bounded cache of pages between the page store
/// and the access methods.
///
/// One mutex serializes all pool state, the replacer included; disk reads
/// and writes happen under it. Pin counts are the residency contract: a
/// frame with a nonzero pin count is never evicted, and a frame becomes
/// evictable exactly when its pin count returns to zero.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<Mutex<BufferPoolState>>,
    metrics: Arc<BufferPoolMetrics>,
    log_manager: Option<Arc<LogManager>>,
}

impl BufferPoolManager {
    /// Creates a pool of `pool_size` frames with the default LRU policy.
    pub fn new(disk_manager: DiskManager, pool_size: usize) -> Self {
        Self::with_parts(
            disk_manager,
            pool_size,
            Box::new(LRUReplacer::new(pool_size)),
            None,
        )
    }

    /// Creates a pool with the default LRU policy and a log manager
    /// handle for higher layers.
    pub fn new_with_log(
        disk_manager: DiskManager,
        pool_size: usize,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        Self::with_parts(
            disk_manager,
            pool_size,
            Box::new(LRUReplacer::new(pool_size)),
            log_manager,
        )
    }

    /// Creates a pool with an explicit replacement policy.
    pub fn with_replacer(
        disk_manager: DiskManager,
        pool_size: usize,
        replacer: Box<dyn Replacer + Send>,
    ) -> Self {
        Self::with_parts(disk_manager, pool_size, replacer, None)
    }

    fn with_parts(
        disk_manager: DiskManager,
        pool_size: usize,
        replacer: Box<dyn Replacer + Send>,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        let state = BufferPoolState {
            disk_manager,
            replacer,
            pages: vec![Page::new(); pool_size],
            page_table: HashMap::new(),
            free_list: (0..pool_size).collect(),
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
            metrics: Arc::new(BufferPoolMetrics::default()),
            log_manager,
        }
    }

    fn lock_state(&self) -> BufferPoolResult<MutexGuard<'_, BufferPoolState>> {
        self.inner.lock().map_err(|_| BufferPoolError::LockPoisoned)
    }

    /// Returns the log manager handle, if the pool was built with one.
    /// The pool itself never calls into it; write-ahead coordination
    /// belongs to the recovery layer.
    pub fn log_manager(&self) -> Option<Arc<LogManager>> {
        self.log_manager.clone()
    }

    /// Number of page fetches since the last reset.
    pub fn fetch_count(&self) -> usize {
        self.metrics.fetch_count.load(Ordering::Relaxed)
    }

    /// Number of fetches served from the page table since the last reset.
    pub fn hit_count(&self) -> usize {
        self.metrics.hit_count.load(Ordering::Relaxed)
    }

    /// Number of frames reclaimed through the replacer since the last
    /// reset. Frames taken from the free list do not count.
    pub fn eviction_count(&self) -> usize {
        self.metrics.eviction_count.load(Ordering::Relaxed)
    }

    /// Resets all counters to zero.
    pub fn reset_metrics(&self) {
        self.metrics.fetch_count.store(0, Ordering::Relaxed);
        self.metrics.hit_count.store(0, Ordering::Relaxed);
        self.metrics.eviction_count.store(0, Ordering::Relaxed);
    }

    /// Produces a frame ready for reuse: free list first, then a replacer
    /// victim whose old page is written back if dirty and unmapped.
    fn pick_victim_frame(
        state: &mut BufferPoolState,
        metrics: &BufferPoolMetrics,
    ) -> BufferPoolResult<Option<FrameId>> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(Some(frame_id));
        }
        let Some(frame_id) = state.replacer.victim() else {
            return Ok(None);
        };
        metrics.eviction_count.fetch_add(1, Ordering::Relaxed);
        let (disk_manager, pages, page_table) = (
            &mut state.disk_manager,
            &mut state.pages,
            &mut state.page_table,
        );
        if let Some(old_page_id) = pages[frame_id].page_id {
            if pages[frame_id].is_dirty {
                disk_manager.write_page(old_page_id, pages[frame_id].data())?;
            }
            page_table.remove(&old_page_id);
        }
        Ok(Some(frame_id))
    }

    /// Writes one resident frame to the page store and clears its dirty
    /// bit. Pin count and evictability are untouched.
    fn write_frame(
        state: &mut BufferPoolState,
        page_id: PageId,
        frame_id: FrameId,
        mode: FlushMode,
    ) -> BufferPoolResult<()> {
        let (disk_manager, pages) = (&mut state.disk_manager, &mut state.pages);
        let page = &mut pages[frame_id];
        disk_manager.write_page(page_id, &page.data)?;
        page.is_dirty = false;
        if mode == FlushMode::Force {
            disk_manager.sync_data()?;
        }
        Ok(())
    }

    /// Allocates a fresh page and pins it, returning a guard over the
    /// zeroed frame. `None` means every frame is pinned.
    pub fn new_page(&self) -> BufferPoolResult<Option<PageGuard<'_>>> {
        let mut state = self.lock_state()?;
        let Some(frame_id) = Self::pick_victim_frame(&mut state, &self.metrics)? else {
            return Ok(None);
        };
        let page_id = state.disk_manager.allocate_page()?;
        {
            let page = &mut state.pages[frame_id];
            page.reset_memory();
            page.page_id = Some(page_id);
            page.pin_count = 1;
        }
        state.page_table.insert(page_id, frame_id);
        state.replacer.pin(frame_id);
        Ok(Some(PageGuard { state, frame_id }))
    }

    /// Fetches a page, reading it in from the page store on a miss, and
    /// pins it. `None` means the page is not resident and every frame is
    /// pinned.
    pub fn fetch_page(&self, page_id: PageId) -> BufferPoolResult<Option<PageGuard<'_>>> {
        self.metrics.fetch_count.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock_state()?;
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            self.metrics.hit_count.fetch_add(1, Ordering::Relaxed);
            state.pages[frame_id].pin_count += 1;
            state.replacer.pin(frame_id);
            return Ok(Some(PageGuard { state, frame_id }));
        }

        let Some(frame_id) = Self::pick_victim_frame(&mut state, &self.metrics)? else {
            return Ok(None);
        };
        {
            let state = &mut *state;
            let (disk_manager, pages) = (&mut state.disk_manager, &mut state.pages);
            let page = &mut pages[frame_id];
            page.reset_memory();
            disk_manager.read_page(page_id, page.data_mut())?;
            page.page_id = Some(page_id);
            page.pin_count = 1;
        }
        state.page_table.insert(page_id, frame_id);
        state.replacer.pin(frame_id);
        Ok(Some(PageGuard { state, frame_id }))
    }

    /// Releases one hold on a page and folds `is_dirty` into the frame's
    /// dirty bit (sticky until flushed). Returns false for a page that is
    /// not resident or whose pin count is already zero; unpinning past
    /// zero is a caller bug, and the count clamps at zero with the call
    /// reporting failure.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> BufferPoolResult<bool> {
        let mut state = self.lock_state()?;
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(false);
        };
        let page = &mut state.pages[frame_id];
        if page.pin_count == 0 {
            return Ok(false);
        }
        if is_dirty {
            page.is_dirty = true;
        }
        page.pin_count -= 1;
        if page.pin_count == 0 {
            state.replacer.unpin(frame_id);
        }
        Ok(true)
    }

    /// Flushes a page to the store, if resident. The write is
    /// unconditional; the dirty bit is cleared.
    pub fn flush_page(&self, page_id: PageId) -> BufferPoolResult<bool> {
        self.flush_page_with_mode(page_id, FlushMode::Lazy)
    }

    /// `flush_page` with control over disk syncing.
    pub fn flush_page_with_mode(&self, page_id: PageId, mode: FlushMode) -> BufferPoolResult<bool> {
        let mut state = self.lock_state()?;
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(false);
        };
        Self::write_frame(&mut state, page_id, frame_id, mode)?;
        Ok(true)
    }

    /// Flushes every resident page, pinned pages included, clearing all
    /// dirty bits.
    pub fn flush_all_pages(&self) -> BufferPoolResult<()> {
        self.flush_all_pages_with_mode(FlushMode::Lazy)
    }

    /// `flush_all_pages` with control over disk syncing. With
    /// `FlushMode::Force` the store is synced once, after all writes.
    pub fn flush_all_pages_with_mode(&self, mode: FlushMode) -> BufferPoolResult<()> {
        let mut state = self.lock_state()?;
        let resident: Vec<(PageId, FrameId)> = state
            .page_table
            .iter()
            .map(|(&page_id, &frame_id)| (page_id, frame_id))
            .collect();
        for (page_id, frame_id) in resident {
            Self::write_frame(&mut state, page_id, frame_id, FlushMode::Lazy)?;
        }
        if mode == FlushMode::Force {
            state.disk_manager.sync_data()?;
        }
        Ok(())
    }

    /// Drops a page from the pool and deallocates it in the page store.
    /// Returns true if the page is gone (deletion of an absent page is
    /// idempotent), false if it is pinned.
    pub fn delete_page(&self, page_id: PageId) -> BufferPoolResult<bool> {
        let mut state = self.lock_state()?;
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(true);
        };
        if state.pages[frame_id].pin_count > 0 {
            return Ok(false);
        }
        state.page_table.remove(&page_id);
        // An unpinned resident sits in the evictable set; take it out
        // before the frame goes back on the free list.
        state.replacer.pin(frame_id);
        state.pages[frame_id].reset_memory();
        state.free_list.push_back(frame_id);
        state.disk_manager.deallocate_page(page_id)?;
        Ok(true)
    }
}
