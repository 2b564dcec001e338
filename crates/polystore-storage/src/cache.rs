//! Interval cache engine
//!
//! Buffers interval data in node-sized DRAM buffers and writes it back to
//! the owning device file under size pressure:
//! - Admission loads an interval on first touch and tracks dirty/present state
//! - A single dispatcher (guarded by the `flushing` flag) moves LRU victims
//!   into per-worker queues once cached bytes cross the high water mark
//! - Flush workers evict their queue in parallel and return buffers to the pool
//!
//! Every touch of an interval's buffer happens under that interval's slot
//! lock, so foreground I/O and background eviction never overlap on one
//! interval. No durability is implied: dirty data lives in memory until
//! evicted, synced, or freed at shutdown.

use crate::buffer::{BufferPool, CacheBuf, PoolUsage};
use crate::index::IntervalEntry;
use crate::inode::Inode;
use crate::lru::{LruList, Walk};
use crate::raw_io::{MappedRegion, read_full_at, write_full_at};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use polystore_common::{
    CacheConfig, CacheGranularity, CachePolicy, Device, Direction, NODE_SIZE, PAGE_SIZE,
    PAGES_PER_NODE, Result,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const PAGE_WORDS: usize = PAGES_PER_NODE / 64;

/// Memory behind a cached interval
#[derive(Debug, Default)]
pub(crate) enum SlotBuffer {
    #[default]
    Empty,
    Buffer(CacheBuf),
    /// Direct mapping of the device file (fast-read-no-admit)
    Mapped(MappedRegion),
}

/// Per-page present/dirty bits for page-granularity caching
#[derive(Clone, Debug, Default)]
pub(crate) struct PageState {
    present: [u64; PAGE_WORDS],
    dirty: [u64; PAGE_WORDS],
}

impl PageState {
    const fn test(bits: &[u64; PAGE_WORDS], page: usize) -> bool {
        bits[page / 64] & (1 << (page % 64)) != 0
    }

    fn is_present(&self, page: usize) -> bool {
        Self::test(&self.present, page)
    }

    fn set_present(&mut self, page: usize) {
        self.present[page / 64] |= 1 << (page % 64);
    }

    fn is_dirty(&self, page: usize) -> bool {
        Self::test(&self.dirty, page)
    }

    fn set_dirty(&mut self, page: usize) {
        self.dirty[page / 64] |= 1 << (page % 64);
    }

    fn any_dirty(&self) -> bool {
        self.dirty.iter().any(|&w| w != 0)
    }

    /// Runs of consecutive dirty pages as `(first_page, page_count)`
    fn dirty_runs(&self) -> Vec<(usize, usize)> {
        let mut runs = Vec::new();
        let mut page = 0;
        while page < PAGES_PER_NODE {
            if self.is_dirty(page) {
                let first = page;
                while page < PAGES_PER_NODE && self.is_dirty(page) {
                    page += 1;
                }
                runs.push((first, page - first));
            } else {
                page += 1;
            }
        }
        runs
    }

    fn clear_dirty(&mut self) {
        self.dirty = [0; PAGE_WORDS];
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Cache state of one interval, guarded by the interval's slot lock
#[derive(Debug, Default)]
pub struct CacheSlot {
    pub(crate) buffer: SlotBuffer,
    dirty: bool,
    present: bool,
    pages: PageState,
}

impl CacheSlot {
    /// Holds modified bytes not yet written back
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Buffer contents reflect the device
    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.present
    }

    #[must_use]
    pub const fn is_cached(&self) -> bool {
        !matches!(self.buffer, SlotBuffer::Empty)
    }

    /// Bytes readable from the slot
    pub(crate) fn data(&self) -> &[u8] {
        match &self.buffer {
            SlotBuffer::Empty => &[],
            SlotBuffer::Buffer(buf) => &buf[..],
            SlotBuffer::Mapped(region) => region.as_slice(),
        }
    }

    /// Writable buffer, if the slot owns one
    pub(crate) fn data_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.buffer {
            SlotBuffer::Buffer(buf) => Some(&mut buf[..]),
            _ => None,
        }
    }

    /// Drop the buffer and forget all state
    pub(crate) fn release(&mut self) {
        self.buffer = SlotBuffer::Empty;
        self.dirty = false;
        self.present = false;
        self.pages.clear();
    }

    /// Zero everything from `from` on (truncate)
    pub(crate) fn zero_tail(&mut self, from: usize) {
        if let Some(data) = self.data_mut()
            && from < data.len()
        {
            data[from..].fill(0);
        }
    }
}

/// Cache counters
#[derive(Debug, Default)]
pub struct CacheStats {
    pub admissions: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub writebacks: AtomicU64,
    pub writeback_bytes: AtomicU64,
    pub dispatches: AtomicU64,
    /// Victims dropped because their inode was removed
    pub skipped_removed: AtomicU64,
    pub mapped_reads: AtomicU64,
}

impl CacheStats {
    #[must_use]
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            admissions: self.admissions.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            writebacks: self.writebacks.load(Ordering::Relaxed),
            writeback_bytes: self.writeback_bytes.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            skipped_removed: self.skipped_removed.load(Ordering::Relaxed),
            mapped_reads: self.mapped_reads.load(Ordering::Relaxed),
        }
    }

    /// Calculate hit ratio (0.0 to 1.0)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// Point-in-time copy of [`CacheStats`]
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CacheStatsSnapshot {
    pub admissions: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
    pub writeback_bytes: u64,
    pub dispatches: u64,
    pub skipped_removed: u64,
    pub mapped_reads: u64,
}

/// Unit of work for the flush pool: drain one queue
#[derive(Clone, Copy, Debug)]
struct FlushJob {
    queue: usize,
}

/// State shared with the flush workers
struct CacheCore {
    config: CacheConfig,
    pool: BufferPool,
    cold: LruList,
    hot: LruList,
    /// Bytes cached across all intervals (approximate after a dispatch)
    cache_size: AtomicU64,
    /// Set while a dispatch is selecting victims
    flushing: AtomicBool,
    round_robin: AtomicUsize,
    queues: Vec<Mutex<Vec<Arc<IntervalEntry>>>>,
    /// Dispatches and queued jobs not yet finished
    pending: Mutex<usize>,
    idle: Condvar,
    stats: CacheStats,
}

impl CacheCore {
    fn add_cached(&self, entry: &IntervalEntry, bytes: u64) {
        entry.add_cached_bytes(bytes);
        self.cache_size.fetch_add(bytes, Ordering::Relaxed);
    }

    fn sub_cached(&self, bytes: u64) {
        let _ = self
            .cache_size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |size| {
                Some(size.saturating_sub(bytes))
            });
    }

    fn begin_work(&self, jobs: usize) {
        *self.pending.lock() += jobs;
    }

    fn finish_work(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    /// Evict every victim queued for `queue`
    fn drain_queue(&self, queue: usize) {
        let victims = std::mem::take(&mut *self.queues[queue].lock());
        if victims.is_empty() {
            return;
        }
        debug!(queue, victims = victims.len(), "draining flush queue");

        for entry in victims {
            let mut slot = entry.lock_slot();
            if entry.is_removed() {
                self.stats.skipped_removed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match evict_slot(&entry, &mut slot, self.config.granularity, &self.stats) {
                Ok(_) => {
                    slot.release();
                    entry.reset_ref_count();
                    entry.take_cached_bytes();
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!(inode = %entry.inode(), node = entry.node(), error = %e, "flush failed; requeueing interval");
                    drop(slot);
                    self.cold.push_back(&entry);
                }
            }
        }
    }
}

/// Write an interval's dirty bytes back to its device file
///
/// Returns the bytes written. A clean slot writes nothing.
fn evict_slot(
    entry: &IntervalEntry,
    slot: &mut CacheSlot,
    granularity: CacheGranularity,
    stats: &CacheStats,
) -> Result<u64> {
    let dirty = match granularity {
        CacheGranularity::Interval => slot.dirty,
        CacheGranularity::Page => slot.dirty || slot.pages.any_dirty(),
    };
    if !dirty {
        return Ok(0);
    }
    let SlotBuffer::Buffer(buf) = &slot.buffer else {
        slot.dirty = false;
        slot.pages.clear_dirty();
        return Ok(0);
    };

    let file = entry.files().handle(entry.device())?;
    let size = usize::try_from(entry.size()).unwrap_or(usize::MAX).min(buf.len());
    let mut written = 0u64;

    match granularity {
        CacheGranularity::Interval => {
            write_full_at(&file, &buf[..size], entry.offset())?;
            written = size as u64;
        }
        CacheGranularity::Page => {
            let page = PAGE_SIZE as usize;
            for (first, count) in slot.pages.dirty_runs() {
                let begin = first * page;
                let end = ((first + count) * page).min(size);
                if begin >= end {
                    continue;
                }
                write_full_at(&file, &buf[begin..end], entry.offset() + begin as u64)?;
                written += (end - begin) as u64;
            }
        }
    }

    slot.dirty = false;
    slot.pages.clear_dirty();
    stats.writebacks.fetch_add(1, Ordering::Relaxed);
    stats.writeback_bytes.fetch_add(written, Ordering::Relaxed);
    debug!(inode = %entry.inode(), node = entry.node(), bytes = written, "interval written back");
    Ok(written)
}

fn flush_worker(core: Arc<CacheCore>, jobs: Receiver<FlushJob>) {
    debug!("flush worker started");
    while let Ok(job) = jobs.recv() {
        core.drain_queue(job.queue);
        core.finish_work();
    }
    debug!("flush worker stopped");
}

/// Shared DRAM cache with background write-back
pub struct CacheEngine {
    core: Arc<CacheCore>,
    sender: Mutex<Option<Sender<FlushJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheEngine {
    /// Create the engine and start its flush workers
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let workers = config.flush_workers.max(1);
        let core = Arc::new(CacheCore {
            config: config.clone(),
            pool: BufferPool::new(config.buffer_shards, config.buffer_slots_per_shard),
            cold: LruList::new("cold"),
            hot: LruList::new("hot"),
            cache_size: AtomicU64::new(0),
            flushing: AtomicBool::new(false),
            round_robin: AtomicUsize::new(0),
            queues: (0..workers).map(|_| Mutex::new(Vec::new())).collect(),
            pending: Mutex::new(0),
            idle: Condvar::new(),
            stats: CacheStats::default(),
        });

        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let core = Arc::clone(&core);
            let jobs = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("polycache-flush-{i}"))
                .spawn(move || flush_worker(core, jobs))?;
            handles.push(handle);
        }

        info!(
            workers,
            high_water = config.flush_high_water,
            low_water = config.flush_low_water,
            capacity = core.pool.capacity(),
            "cache engine started"
        );

        Ok(Self {
            core,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        })
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.core.config
    }

    /// Cached bytes according to the global gauge
    #[must_use]
    pub fn cache_size(&self) -> u64 {
        self.core.cache_size.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.core.stats
    }

    #[must_use]
    pub fn pool_usage(&self) -> PoolUsage {
        self.core.pool.usage()
    }

    /// Intervals waiting on the (cold, hot) lists
    #[must_use]
    pub fn lru_lengths(&self) -> (usize, usize) {
        (self.core.cold.len(), self.core.hot.len())
    }

    /// Make `[rel_start, rel_end]` of an interval accessible in its slot
    ///
    /// Offsets are relative to the interval start. On return the slot holds
    /// either a buffer or (reads under fast-read-no-admit) a mapping that
    /// covers the range.
    pub fn admit(
        &self,
        entry: &Arc<IntervalEntry>,
        slot: &mut CacheSlot,
        rel_start: u64,
        rel_end: u64,
        direction: Direction,
    ) -> Result<()> {
        let core = &self.core;

        if direction == Direction::Read
            && core.config.policy == CachePolicy::FastReadNoAdmit
            && entry.device() == Device::Fast
            && self.try_map(entry, slot, rel_end)?
        {
            return Ok(());
        }
        if direction == Direction::Write && matches!(slot.buffer, SlotBuffer::Mapped(_)) {
            slot.release();
        }

        let fresh = matches!(slot.buffer, SlotBuffer::Empty);
        if fresh {
            slot.buffer = SlotBuffer::Buffer(self.allocate_buffer()?);
            slot.present = false;
            slot.pages.clear();
            core.cold.push_back(entry);
            core.stats.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            core.stats.hits.fetch_add(1, Ordering::Relaxed);
            self.note_reaccess(entry);
        }

        match core.config.granularity {
            CacheGranularity::Interval => self.load_interval(entry, slot, fresh)?,
            CacheGranularity::Page => self.load_pages(entry, slot, rel_start, rel_end)?,
        }

        if direction == Direction::Write {
            slot.dirty = true;
            if core.config.granularity == CacheGranularity::Page {
                let first = (rel_start / PAGE_SIZE) as usize;
                let last = (rel_end / PAGE_SIZE) as usize;
                for page in first..=last.min(PAGES_PER_NODE - 1) {
                    slot.pages.set_dirty(page);
                }
            }
            entry.grow_size(rel_end + 1);
        }
        Ok(())
    }

    fn try_map(&self, entry: &IntervalEntry, slot: &mut CacheSlot, rel_end: u64) -> Result<bool> {
        match &slot.buffer {
            SlotBuffer::Mapped(region) if (region.len() as u64) > rel_end => {
                self.core.stats.mapped_reads.fetch_add(1, Ordering::Relaxed);
                return Ok(true);
            }
            SlotBuffer::Buffer(_) => return Ok(false),
            _ => {}
        }

        let file = entry.files().handle(entry.device())?;
        let len = entry.size().min(NODE_SIZE) as usize;
        match MappedRegion::map(&file, entry.offset(), len)? {
            Some(region) if (region.len() as u64) > rel_end => {
                slot.buffer = SlotBuffer::Mapped(region);
                slot.present = true;
                self.core.stats.mapped_reads.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            _ => {
                slot.release();
                Ok(false)
            }
        }
    }

    fn allocate_buffer(&self) -> Result<CacheBuf> {
        match self.core.pool.allocate() {
            Ok(buf) => Ok(buf),
            Err(e) => {
                warn!(error = %e, "cache pool exhausted; forcing a flush");
                self.force_dispatch();
                self.wait_idle();
                self.core.pool.allocate()
            }
        }
    }

    fn note_reaccess(&self, entry: &Arc<IntervalEntry>) {
        let core = &self.core;
        if core.config.promote_on_reaccess && entry.touch() > 0 {
            if core.cold.remove(entry) {
                core.hot.push_back(entry);
            } else {
                core.hot.touch(entry);
            }
        }
    }

    fn load_interval(&self, entry: &IntervalEntry, slot: &mut CacheSlot, fresh: bool) -> Result<()> {
        if !slot.present {
            let size = usize::try_from(entry.size()).unwrap_or(usize::MAX);
            if size > 0 {
                let file = entry.files().handle(entry.device())?;
                if let Some(buf) = slot.data_mut() {
                    let size = size.min(buf.len());
                    read_full_at(&file, &mut buf[..size], entry.offset())?;
                }
            }
            slot.present = true;
            self.core.stats.admissions.fetch_add(1, Ordering::Relaxed);
        }
        if fresh {
            self.core.add_cached(entry, NODE_SIZE);
        }
        Ok(())
    }

    fn load_pages(
        &self,
        entry: &IntervalEntry,
        slot: &mut CacheSlot,
        rel_start: u64,
        rel_end: u64,
    ) -> Result<()> {
        let page = PAGE_SIZE as usize;
        let size = usize::try_from(entry.size()).unwrap_or(usize::MAX);
        let first = (rel_start / PAGE_SIZE) as usize;
        let last = ((rel_end / PAGE_SIZE) as usize).min(PAGES_PER_NODE - 1);
        let mut file = None;
        let mut loaded = 0u64;

        for index in first..=last {
            if slot.pages.is_present(index) {
                continue;
            }
            let begin = index * page;
            if begin < size {
                if file.is_none() {
                    file = Some(entry.files().handle(entry.device())?);
                }
                let end = (begin + page).min(size);
                if let (Some(file), Some(buf)) = (file.as_ref(), slot.data_mut()) {
                    read_full_at(file, &mut buf[begin..end], entry.offset() + begin as u64)?;
                }
            }
            slot.pages.set_present(index);
            loaded += 1;
        }

        if loaded > 0 {
            slot.present = true;
            self.core.stats.admissions.fetch_add(1, Ordering::Relaxed);
            self.core.add_cached(entry, loaded * PAGE_SIZE);
        }
        Ok(())
    }

    /// Write an interval's dirty data back now; a clean interval is a no-op
    pub fn evict(&self, entry: &IntervalEntry) -> Result<u64> {
        let mut slot = entry.lock_slot();
        evict_slot(entry, &mut slot, self.core.config.granularity, &self.core.stats)
    }

    /// Called after every cached write
    pub fn write_completed(&self) {
        if self.cache_size() > self.core.config.flush_high_water {
            self.try_dispatch();
        }
    }

    /// Select victims and hand them to the flush workers
    ///
    /// Returns `false` without doing anything when another dispatch is in
    /// progress. Never waits for the workers.
    pub fn try_dispatch(&self) -> bool {
        self.dispatch(0)
    }

    /// Dispatch at least one victim even below the low water mark
    fn force_dispatch(&self) -> bool {
        self.dispatch(1)
    }

    fn dispatch(&self, min_victims: usize) -> bool {
        let core = &self.core;
        if core
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        core.begin_work(1);
        core.stats.dispatches.fetch_add(1, Ordering::Relaxed);

        let low = core.config.flush_low_water;
        let snapshot = core.cache_size.load(Ordering::Relaxed);
        let mut remaining = snapshot;
        let mut selected = 0usize;
        let mut skipped = 0u64;
        let queue_mask = core.queues.len() - 1;
        let mut assignments: Vec<Vec<Arc<IntervalEntry>>> = vec![Vec::new(); core.queues.len()];

        for list in [&core.cold, &core.hot] {
            let victims = list.take_front(
                |entry| {
                    if entry.is_removed() {
                        skipped += 1;
                        Walk::Discard
                    } else if remaining > low || selected < min_victims {
                        remaining = remaining.saturating_sub(entry.cached_bytes());
                        selected += 1;
                        Walk::Take
                    } else {
                        Walk::Stop
                    }
                },
                usize::MAX,
            );
            for entry in victims {
                let queue = core.round_robin.fetch_add(1, Ordering::Relaxed) & queue_mask;
                assignments[queue].push(entry);
            }
        }

        // Reset to the low water mark instead of recounting; forced
        // dispatches below the mark subtract what they took
        if snapshot > low {
            core.cache_size.store(remaining.max(low), Ordering::Relaxed);
        } else {
            core.sub_cached(snapshot - remaining);
        }
        core.stats.skipped_removed.fetch_add(skipped, Ordering::Relaxed);

        let mut jobs = Vec::new();
        for (queue, victims) in assignments.into_iter().enumerate() {
            if !victims.is_empty() {
                core.queues[queue].lock().extend(victims);
                jobs.push(FlushJob { queue });
            }
        }
        debug!(
            victims = selected,
            skipped,
            queues = jobs.len(),
            cache_size = snapshot,
            "flush dispatched"
        );

        core.begin_work(jobs.len());
        let sender = self.sender.lock().clone();
        for job in jobs {
            let sent = sender.as_ref().is_some_and(|s| s.send(job).is_ok());
            if !sent {
                core.drain_queue(job.queue);
                core.finish_work();
            }
        }

        core.flushing.store(false, Ordering::Release);
        core.finish_work();
        true
    }

    /// Block until no dispatch or flush job is outstanding
    pub fn wait_idle(&self) {
        let mut pending = self.core.pending.lock();
        while *pending > 0 {
            self.core.idle.wait(&mut pending);
        }
    }

    /// Release every cached interval of an inode without writing back
    ///
    /// Used on final close of an unlinked file.
    pub fn drop_inode(&self, inode: &Inode) {
        let index = inode.index.write();
        for entry in index.iter() {
            self.discard(entry);
        }
        drop(index);
        inode.files().close();
        debug!(inode = %inode.id(), "inode cache dropped");
    }

    /// Write back and release every cached interval of an inode
    ///
    /// Used at shutdown for every inode still known.
    pub fn free_inode(&self, inode: &Inode) -> Result<()> {
        let index = inode.index.write();
        let mut first_error = None;
        for entry in index.iter() {
            if let Err(e) = self.evict(entry) {
                error!(inode = %inode.id(), node = entry.node(), error = %e, "write-back on free failed");
                first_error.get_or_insert(e);
            }
            self.discard(entry);
        }
        drop(index);
        inode.files().close();
        first_error.map_or(Ok(()), Err)
    }

    /// Write back every dirty interval of an inode and sync its device files
    pub fn sync_inode(&self, inode: &Inode) -> Result<()> {
        let index = inode.index.read();
        for entry in index.iter() {
            self.evict(entry)?;
        }
        drop(index);
        inode.files().sync()
    }

    /// Forget one interval's cache state
    pub(crate) fn discard(&self, entry: &IntervalEntry) {
        let mut slot = entry.lock_slot();
        slot.release();
        entry.mark_removed();
        self.core.sub_cached(entry.take_cached_bytes());
        drop(slot);
        self.core.cold.remove(entry);
        self.core.hot.remove(entry);
    }

    /// Wait for outstanding flushes and stop the workers
    pub fn shutdown(&self) {
        self.wait_idle();
        drop(self.sender.lock().take());

        let handles = std::mem::take(&mut *self.workers.lock());
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if handle.join().is_err() {
                error!("flush worker panicked");
            }
        }
        info!(
            cache_size = self.cache_size(),
            dispatches = self.core.stats.dispatches.load(Ordering::Relaxed),
            "cache engine stopped"
        );
    }
}

impl Drop for CacheEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEngine")
            .field("cache_size", &self.cache_size())
            .field("cold", &self.core.cold.len())
            .field("hot", &self.core.hot.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IntervalIndex;
    use crate::inode::DeviceFiles;
    use polystore_common::InodeId;
    use std::fs;
    use std::sync::Barrier;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        files: Arc<DeviceFiles>,
        index: IntervalIndex,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let fast = dir.path().join("fast.dat");
            let slow = dir.path().join("slow.dat");
            fs::write(&fast, b"").unwrap();
            fs::write(&slow, b"").unwrap();
            Self {
                files: Arc::new(DeviceFiles::new(fast, slow)),
                index: IntervalIndex::new(InodeId::from(1), 1024),
                _dir: dir,
            }
        }

        fn entry(&mut self, node: u64, device: Device) -> Arc<IntervalEntry> {
            let entry = self
                .index
                .allocate_entry(node * NODE_SIZE, device, node * NODE_SIZE, Arc::clone(&self.files))
                .unwrap();
            self.index.insert(Arc::clone(&entry)).unwrap();
            entry
        }

        fn device_bytes(&self, device: Device, offset: u64, len: usize) -> Vec<u8> {
            let file = self.files.handle(device).unwrap();
            let mut buf = vec![0u8; len];
            let n = read_full_at(&file, &mut buf, offset).unwrap();
            buf.truncate(n);
            buf
        }
    }

    fn config() -> CacheConfig {
        CacheConfig {
            flush_high_water: 4 * NODE_SIZE,
            flush_low_water: 2 * NODE_SIZE,
            flush_workers: 2,
            buffer_shards: 2,
            buffer_slots_per_shard: 8,
            ..CacheConfig::default()
        }
    }

    fn write(engine: &CacheEngine, entry: &Arc<IntervalEntry>, rel: u64, data: &[u8]) {
        let mut slot = entry.lock_slot();
        let rel_end = rel + data.len() as u64 - 1;
        engine.admit(entry, &mut slot, rel, rel_end, Direction::Write).unwrap();
        let rel = rel as usize;
        slot.data_mut().unwrap()[rel..rel + data.len()].copy_from_slice(data);
    }

    fn read(engine: &CacheEngine, entry: &Arc<IntervalEntry>, rel: u64, len: usize) -> Vec<u8> {
        let mut slot = entry.lock_slot();
        engine
            .admit(entry, &mut slot, rel, rel + len as u64 - 1, Direction::Read)
            .unwrap();
        let rel = rel as usize;
        slot.data()[rel..rel + len].to_vec()
    }

    #[test]
    fn test_write_then_read_hits_cache() {
        let mut fx = Fixture::new();
        let engine = CacheEngine::new(&config()).unwrap();
        let entry = fx.entry(0, Device::Fast);

        write(&engine, &entry, 10, b"cached bytes");
        assert_eq!(entry.size(), 22);
        assert!(entry.lock_slot().is_dirty());
        assert_eq!(engine.cache_size(), NODE_SIZE);
        assert_eq!(entry.cached_bytes(), NODE_SIZE);

        assert_eq!(read(&engine, &entry, 10, 12), b"cached bytes");
        assert_eq!(engine.stats().hits.load(Ordering::Relaxed), 1);
        // Gauge counts the buffer once
        assert_eq!(engine.cache_size(), NODE_SIZE);
        // Nothing reached the device yet
        assert!(fx.device_bytes(Device::Fast, 0, 22).is_empty());
    }

    #[test]
    fn test_round_trip_through_eviction() {
        let mut fx = Fixture::new();
        let engine = CacheEngine::new(&config()).unwrap();
        let entry = fx.entry(1, Device::Slow);

        write(&engine, &entry, 0, b"hello device");
        assert_eq!(engine.evict(&entry).unwrap(), 12);
        assert_eq!(fx.device_bytes(Device::Slow, NODE_SIZE, 12), b"hello device");

        entry.lock_slot().release();
        assert_eq!(read(&engine, &entry, 0, 12), b"hello device");
        assert!(!entry.lock_slot().is_dirty());
    }

    #[test]
    fn test_evict_is_idempotent() {
        let mut fx = Fixture::new();
        let engine = CacheEngine::new(&config()).unwrap();
        let entry = fx.entry(0, Device::Fast);

        write(&engine, &entry, 0, &[0xab; 4096]);
        assert_eq!(engine.evict(&entry).unwrap(), 4096);
        let once = fx.device_bytes(Device::Fast, 0, 8192);
        assert_eq!(engine.evict(&entry).unwrap(), 0);
        assert_eq!(fx.device_bytes(Device::Fast, 0, 8192), once);
        assert_eq!(engine.stats().writebacks.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dispatch_reaches_low_water() {
        let mut fx = Fixture::new();
        let engine = CacheEngine::new(&config()).unwrap();
        let entries: Vec<_> = (0..6).map(|n| fx.entry(n, Device::Fast)).collect();

        for (i, entry) in entries.iter().enumerate() {
            write(&engine, entry, 0, &[i as u8 + 1; 100]);
        }
        assert_eq!(engine.cache_size(), 6 * NODE_SIZE);

        assert!(engine.try_dispatch());
        engine.wait_idle();

        assert!(engine.cache_size() <= config().flush_low_water);
        // Oldest four went out, newest two stay cached
        for (i, entry) in entries.iter().enumerate() {
            let slot = entry.lock_slot();
            assert_eq!(slot.is_cached(), i >= 4, "entry {i}");
        }
        for i in 0..4u64 {
            let bytes = fx.device_bytes(Device::Fast, i * NODE_SIZE, 100);
            assert_eq!(bytes, vec![i as u8 + 1; 100]);
        }
        assert_eq!(engine.stats().evictions.load(Ordering::Relaxed), 4);
        assert_eq!(engine.pool_usage().in_use, 2);
    }

    #[test]
    fn test_removed_victims_are_skipped() {
        let mut fx = Fixture::new();
        let engine = CacheEngine::new(&config()).unwrap();
        let entries: Vec<_> = (0..5).map(|n| fx.entry(n, Device::Slow)).collect();
        for entry in &entries {
            write(&engine, entry, 0, b"x");
        }

        entries[0].mark_removed();
        assert!(engine.try_dispatch());
        engine.wait_idle();

        assert!(engine.stats().skipped_removed.load(Ordering::Relaxed) >= 1);
        assert_ne!(fx.device_bytes(Device::Slow, 0, 1), b"x");
    }

    #[test]
    fn test_at_most_one_dispatcher() {
        let mut fx = Fixture::new();
        let engine = Arc::new(CacheEngine::new(&config()).unwrap());
        for n in 0..8 {
            let entry = fx.entry(n, Device::Fast);
            write(&engine, &entry, 0, b"data");
        }

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    (0..50).filter(|_| engine.try_dispatch()).count() as u64
                })
            })
            .collect();
        let winners: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        engine.wait_idle();
        assert!(winners >= 1);
        assert_eq!(winners, engine.stats().dispatches.load(Ordering::Relaxed));
    }

    #[test]
    fn test_exhausted_pool_forces_flush() {
        let mut fx = Fixture::new();
        let engine = CacheEngine::new(&CacheConfig {
            buffer_shards: 1,
            buffer_slots_per_shard: 2,
            flush_high_water: NODE_SIZE * 64,
            flush_low_water: NODE_SIZE * 32,
            ..config()
        })
        .unwrap();

        for n in 0..4 {
            let entry = fx.entry(n, Device::Fast);
            write(&engine, &entry, 0, &[n as u8 + 1; 10]);
        }
        engine.wait_idle();
        assert!(engine.pool_usage().in_use <= 2);
        assert_eq!(fx.device_bytes(Device::Fast, 0, 10), vec![1u8; 10]);
    }

    #[test]
    fn test_page_granularity_writes_dirty_runs() {
        let mut fx = Fixture::new();
        let engine = CacheEngine::new(&CacheConfig {
            granularity: CacheGranularity::Page,
            ..config()
        })
        .unwrap();
        let entry = fx.entry(0, Device::Fast);

        write(&engine, &entry, 0, &[1u8; 100]);
        write(&engine, &entry, 3 * PAGE_SIZE, &[3u8; 100]);
        // Two pages were touched
        assert_eq!(engine.cache_size(), 2 * PAGE_SIZE);

        let written = engine.evict(&entry).unwrap();
        // Page 0 goes out whole, page 3 only up to the filled size
        assert_eq!(written, PAGE_SIZE + 100);
        let device = fx.device_bytes(Device::Fast, 0, (3 * PAGE_SIZE + 100) as usize);
        assert_eq!(&device[..100], &[1u8; 100]);
        assert_eq!(&device[3 * PAGE_SIZE as usize..], &[3u8; 100]);
    }

    #[test]
    fn test_fast_read_maps_device() {
        let mut fx = Fixture::new();
        let engine = CacheEngine::new(&CacheConfig {
            policy: CachePolicy::FastReadNoAdmit,
            ..config()
        })
        .unwrap();
        let entry = fx.entry(0, Device::Fast);

        write(&engine, &entry, 0, b"mapped");
        engine.evict(&entry).unwrap();
        entry.lock_slot().release();

        assert_eq!(read(&engine, &entry, 0, 6), b"mapped");
        assert!(matches!(entry.lock_slot().buffer, SlotBuffer::Mapped(_)));
        assert_eq!(engine.stats().mapped_reads.load(Ordering::Relaxed), 1);

        // A write replaces the mapping with a buffer
        write(&engine, &entry, 6, b"!");
        assert_eq!(read(&engine, &entry, 0, 7), b"mapped!");
        assert!(matches!(entry.lock_slot().buffer, SlotBuffer::Buffer(_)));
    }

    #[test]
    fn test_promotion_moves_to_hot() {
        let mut fx = Fixture::new();
        let engine = CacheEngine::new(&CacheConfig {
            promote_on_reaccess: true,
            ..config()
        })
        .unwrap();
        let entry = fx.entry(0, Device::Fast);

        write(&engine, &entry, 0, b"a");
        assert_eq!(engine.lru_lengths(), (1, 0));
        read(&engine, &entry, 0, 1);
        assert_eq!(engine.lru_lengths(), (1, 0));
        read(&engine, &entry, 0, 1);
        assert_eq!(engine.lru_lengths(), (0, 1));
    }

    #[test]
    fn test_dirty_runs() {
        let mut pages = PageState::default();
        for page in [0, 1, 2, 5, 63, 64, 511] {
            pages.set_dirty(page);
        }
        assert_eq!(pages.dirty_runs(), vec![(0, 3), (5, 1), (63, 2), (511, 1)]);
        pages.clear_dirty();
        assert!(!pages.any_dirty());
    }
}
