//! Cache buffer pool
//!
//! This module provides the node-sized, page-aligned buffers that back
//! cached intervals:
//! - Per-shard bitmaps track which slots are handed out
//! - Released memory is kept per shard and zeroed again on reuse
//! - Threads start their search at a sticky shard to spread contention
//!
//! A [`CacheBuf`] owns its memory exclusively and returns its slot to the
//! pool when dropped.

use parking_lot::Mutex;
use polystore_common::{Error, NODE_SIZE, PAGE_SIZE, Result};
use serde::Serialize;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::Cell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static NEXT_SHARD_HINT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_HINT: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Shard this thread tries first
fn shard_hint() -> usize {
    SHARD_HINT.with(|hint| {
        hint.get().unwrap_or_else(|| {
            let assigned = NEXT_SHARD_HINT.fetch_add(1, Ordering::Relaxed);
            hint.set(Some(assigned));
            assigned
        })
    })
}

/// Zeroed, page-aligned heap region
struct RawBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is uniquely owned and only reachable through `&`/`&mut self`.
unsafe impl Send for RawBuffer {}
// SAFETY: shared access only hands out `&[u8]`.
unsafe impl Sync for RawBuffer {}

impl RawBuffer {
    fn layout(len: usize) -> Result<Layout> {
        Layout::from_size_align(len, PAGE_SIZE as usize)
            .map_err(|e| Error::allocation(format!("invalid buffer layout: {e}")))
    }

    fn allocate(len: usize) -> Result<Self> {
        let layout = Self::layout(len)?;
        // SAFETY: layout has a non-zero size (callers pass NODE_SIZE or a test size > 0).
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr)
            .map(|ptr| Self { ptr, len })
            .ok_or_else(|| Error::allocation(format!("out of memory allocating {len} bytes")))
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len initialized bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.len) {
            // SAFETY: allocated in `allocate` with this exact layout.
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

/// Slot bookkeeping for one shard
///
/// Uses one bit per slot: 0 = free, 1 = handed out
struct ShardState {
    bitmap: Vec<u64>,
    slots: usize,
    free: usize,
    search_hint: usize,
    /// Memory of released buffers, reused before allocating more
    recycled: Vec<RawBuffer>,
}

impl ShardState {
    fn new(slots: usize) -> Self {
        Self {
            bitmap: vec![0u64; slots.div_ceil(64)],
            slots,
            free: slots,
            search_hint: 0,
            recycled: Vec::new(),
        }
    }

    fn is_set(&self, slot: usize) -> bool {
        self.bitmap[slot / 64] & (1 << (slot % 64)) != 0
    }

    fn find_free_in_range(&self, start: usize, end: usize) -> Option<usize> {
        (start..end.min(self.slots)).find(|&slot| !self.is_set(slot))
    }

    fn take_slot(&mut self) -> Option<usize> {
        if self.free == 0 {
            return None;
        }
        let hint = self.search_hint;
        let slot = self
            .find_free_in_range(hint, self.slots)
            .or_else(|| self.find_free_in_range(0, hint))?;

        self.bitmap[slot / 64] |= 1 << (slot % 64);
        self.free -= 1;
        self.search_hint = slot + 1;
        Some(slot)
    }

    fn release_slot(&mut self, slot: usize) {
        debug_assert!(self.is_set(slot), "slot {slot} released twice");
        self.bitmap[slot / 64] &= !(1 << (slot % 64));
        self.free += 1;
        if slot < self.search_hint {
            self.search_hint = slot;
        }
    }
}

struct Shard {
    index: usize,
    buffer_len: usize,
    state: Mutex<ShardState>,
    stats: Arc<PoolStats>,
}

impl Shard {
    fn try_allocate(self: &Arc<Self>) -> Result<Option<CacheBuf>> {
        let (slot, recycled) = {
            let mut state = self.state.lock();
            let Some(slot) = state.take_slot() else {
                return Ok(None);
            };
            (slot, state.recycled.pop())
        };

        let raw = match recycled {
            Some(mut raw) => {
                raw.as_mut_slice().fill(0);
                raw
            }
            None => match RawBuffer::allocate(self.buffer_len) {
                Ok(raw) => raw,
                Err(e) => {
                    self.state.lock().release_slot(slot);
                    return Err(e);
                }
            },
        };

        Ok(Some(CacheBuf {
            raw: Some(raw),
            slot,
            shard: Arc::clone(self),
        }))
    }

    fn release(&self, slot: usize, raw: RawBuffer) {
        let mut state = self.state.lock();
        state.release_slot(slot);
        state.recycled.push(raw);
        self.stats.releases.fetch_add(1, Ordering::Relaxed);
    }
}

/// Exclusively owned cache buffer; returns to its pool on drop
pub struct CacheBuf {
    raw: Option<RawBuffer>,
    slot: usize,
    shard: Arc<Shard>,
}

impl CacheBuf {
    /// Shard the buffer came from
    #[must_use]
    pub fn shard(&self) -> usize {
        self.shard.index
    }

    /// Slot within the shard
    #[must_use]
    pub const fn slot(&self) -> usize {
        self.slot
    }
}

impl Deref for CacheBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.raw {
            Some(raw) => raw.as_slice(),
            None => &[],
        }
    }
}

impl DerefMut for CacheBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.raw {
            Some(raw) => raw.as_mut_slice(),
            None => &mut [],
        }
    }
}

impl Drop for CacheBuf {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            self.shard.release(self.slot, raw);
        }
    }
}

impl fmt::Debug for CacheBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheBuf")
            .field("shard", &self.shard.index)
            .field("slot", &self.slot)
            .field("len", &self.len())
            .finish()
    }
}

/// Pool counters
#[derive(Debug, Default)]
pub struct PoolStats {
    pub allocations: AtomicU64,
    pub releases: AtomicU64,
    /// Allocations refused because every slot was taken
    pub failures: AtomicU64,
}

/// Point-in-time pool usage
#[derive(Clone, Copy, Debug, Serialize)]
pub struct PoolUsage {
    pub capacity: usize,
    pub in_use: usize,
    pub allocations: u64,
    pub releases: u64,
    pub failures: u64,
}

/// Sharded slab of node-sized cache buffers
pub struct BufferPool {
    shards: Vec<Arc<Shard>>,
    slots_per_shard: usize,
    stats: Arc<PoolStats>,
}

impl BufferPool {
    /// Create a pool of `shards * slots_per_shard` node-sized buffers
    ///
    /// Memory is allocated on first use of a slot.
    #[must_use]
    pub fn new(shards: usize, slots_per_shard: usize) -> Self {
        Self::with_buffer_len(shards, slots_per_shard, NODE_SIZE as usize)
    }

    fn with_buffer_len(shards: usize, slots_per_shard: usize, buffer_len: usize) -> Self {
        let stats = Arc::new(PoolStats::default());
        let shards = (0..shards.max(1))
            .map(|index| {
                Arc::new(Shard {
                    index,
                    buffer_len,
                    state: Mutex::new(ShardState::new(slots_per_shard)),
                    stats: Arc::clone(&stats),
                })
            })
            .collect();

        Self {
            shards,
            slots_per_shard,
            stats,
        }
    }

    /// Take a zeroed buffer
    pub fn allocate(&self) -> Result<CacheBuf> {
        let count = self.shards.len();
        let start = shard_hint() % count;

        for i in 0..count {
            let shard = &self.shards[(start + i) % count];
            if let Some(buf) = shard.try_allocate()? {
                self.stats.allocations.fetch_add(1, Ordering::Relaxed);
                return Ok(buf);
            }
        }

        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        Err(Error::allocation(format!(
            "all {} cache buffers in use",
            self.capacity()
        )))
    }

    /// Total number of buffers
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shards.len() * self.slots_per_shard
    }

    /// Buffers currently handed out
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                let state = s.state.lock();
                state.slots - state.free
            })
            .sum()
    }

    #[must_use]
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Get usage snapshot
    #[must_use]
    pub fn usage(&self) -> PoolUsage {
        PoolUsage {
            capacity: self.capacity(),
            in_use: self.in_use(),
            allocations: self.stats.allocations.load(Ordering::Relaxed),
            releases: self.stats.releases.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
        }
    }
}
