//! Per-file interval index
//!
//! Maps logical byte ranges of one file to a physical device and an offset
//! in that device's mirror file. Intervals never overlap and are always
//! node-aligned, `[k * NODE_SIZE, (k + 1) * NODE_SIZE - 1]`; an interval's
//! filled `size` may be shorter than its range.
//!
//! Entries live in an arena addressed by node number. An ordered map from
//! interval start to node number answers "first interval overlapping
//! `[start, last]`" and "next overlapping interval after this one" in
//! `O(log n)` each, so walking the `k` intervals under a request costs
//! `O(log n + k)`.
//!
//! All mutation happens under the owning inode's index write lock; lookups
//! need at least the read lock.

use crate::cache::CacheSlot;
use crate::inode::DeviceFiles;
use crate::lru::LruLink;
use parking_lot::{Mutex, MutexGuard};
use polystore_common::{Device, Error, InodeId, NODE_SIZE, Result, node_start};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound::{Excluded, Included};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// One interval of a file
pub struct IntervalEntry {
    inode: InodeId,
    node: u32,
    start: u64,
    last: u64,
    device: Device,
    /// Offset of `start` in the device mirror file
    offset: u64,
    /// Bytes filled from `start`
    size: AtomicU64,
    /// Accesses since the entry was last loaded into the cache
    ref_count: AtomicU32,
    /// Bytes this entry contributes to the global cache-size gauge
    cached_bytes: AtomicU64,
    removed: AtomicBool,
    pub(crate) lru: LruLink,
    slot: Mutex<CacheSlot>,
    files: Arc<DeviceFiles>,
}

impl IntervalEntry {
    fn new(
        inode: InodeId,
        node: u32,
        start: u64,
        device: Device,
        offset: u64,
        files: Arc<DeviceFiles>,
    ) -> Self {
        Self {
            inode,
            node,
            start,
            last: start + NODE_SIZE - 1,
            device,
            offset,
            size: AtomicU64::new(0),
            ref_count: AtomicU32::new(0),
            cached_bytes: AtomicU64::new(0),
            removed: AtomicBool::new(false),
            lru: LruLink::new(),
            slot: Mutex::new(CacheSlot::default()),
            files,
        }
    }

    #[must_use]
    pub const fn inode(&self) -> InodeId {
        self.inode
    }

    /// Node number, unique within the live index
    #[must_use]
    pub const fn node(&self) -> u32 {
        self.node
    }

    /// First logical byte
    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// Last logical byte (inclusive)
    #[must_use]
    pub const fn last(&self) -> u64 {
        self.last
    }

    #[must_use]
    pub const fn device(&self) -> Device {
        self.device
    }

    /// Physical offset in the device mirror
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Filled bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Raise the filled size to at least `size`; returns the new size
    pub fn grow_size(&self, size: u64) -> u64 {
        let size = size.min(NODE_SIZE);
        self.size.fetch_max(size, Ordering::AcqRel).max(size)
    }

    /// Lower the filled size (truncate only)
    pub(crate) fn shrink_size(&self, size: u64) {
        self.size.fetch_min(size, Ordering::AcqRel);
    }

    #[must_use]
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset <= self.last
    }

    #[must_use]
    pub const fn overlaps(&self, start: u64, last: u64) -> bool {
        self.start <= last && start <= self.last
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    /// Count an access; returns the previous count
    pub(crate) fn touch(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::Relaxed)
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_ref_count(&self) {
        self.ref_count.store(0, Ordering::Relaxed);
    }

    /// Bytes counted against the cache for this entry
    #[must_use]
    pub fn cached_bytes(&self) -> u64 {
        self.cached_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn add_cached_bytes(&self, bytes: u64) {
        self.cached_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn take_cached_bytes(&self) -> u64 {
        self.cached_bytes.swap(0, Ordering::Relaxed)
    }

    /// Lock the cache state; held only while touching the buffer
    pub(crate) fn lock_slot(&self) -> MutexGuard<'_, CacheSlot> {
        self.slot.lock()
    }

    /// Device files of the owning inode
    #[must_use]
    pub fn files(&self) -> &Arc<DeviceFiles> {
        &self.files
    }
}

impl fmt::Debug for IntervalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntervalEntry")
            .field("inode", &self.inode)
            .field("node", &self.node)
            .field("range", &(self.start..=self.last))
            .field("device", &self.device)
            .field("offset", &self.offset)
            .field("size", &self.size())
            .field("removed", &self.is_removed())
            .finish_non_exhaustive()
    }
}

/// Ordered, non-overlapping intervals of one file
pub struct IntervalIndex {
    inode: InodeId,
    /// Entries by node number; slot 0 is never used
    arena: Vec<Option<Arc<IntervalEntry>>>,
    /// Interval start -> node number
    by_start: BTreeMap<u64, u32>,
    /// Node numbers given back by `remove`
    free_nodes: Vec<u32>,
    next_node: u32,
    max_nodes: u32,
}

impl IntervalIndex {
    /// Create an empty index that allows up to `max_nodes` intervals
    #[must_use]
    pub fn new(inode: InodeId, max_nodes: u32) -> Self {
        Self {
            inode,
            arena: vec![None],
            by_start: BTreeMap::new(),
            free_nodes: Vec::new(),
            next_node: 1,
            max_nodes,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }

    /// Create an entry for the node containing `start`; not yet inserted
    ///
    /// Node numbers of removed entries are reused before fresh ones.
    pub fn allocate_entry(
        &mut self,
        start: u64,
        device: Device,
        offset: u64,
        files: Arc<DeviceFiles>,
    ) -> Result<Arc<IntervalEntry>> {
        let node = match self.free_nodes.pop() {
            Some(node) => node,
            None if self.next_node > self.max_nodes => {
                return Err(Error::IndexExhausted {
                    inode: self.inode,
                    limit: self.max_nodes,
                });
            }
            None => {
                self.next_node += 1;
                self.next_node - 1
            }
        };

        Ok(Arc::new(IntervalEntry::new(
            self.inode,
            node,
            node_start(start),
            device,
            offset,
            files,
        )))
    }

    /// Insert an allocated entry
    pub fn insert(&mut self, entry: Arc<IntervalEntry>) -> Result<()> {
        if let Some(existing) = self.lookup(entry.start(), entry.last()) {
            return Err(Error::internal(format!(
                "interval [{}, {}] of {} overlaps node {}",
                entry.start(),
                entry.last(),
                self.inode,
                existing.node()
            )));
        }

        let node = entry.node() as usize;
        if self.arena.len() <= node {
            self.arena.resize(node + 1, None);
        }
        self.by_start.insert(entry.start(), entry.node());
        self.arena[node] = Some(entry);
        Ok(())
    }

    /// Remove an entry; returns it if it was present
    pub fn remove(&mut self, entry: &IntervalEntry) -> Option<Arc<IntervalEntry>> {
        match self.by_start.get(&entry.start()) {
            Some(&node) if node == entry.node() => {
                self.by_start.remove(&entry.start());
                let removed = self.arena.get_mut(node as usize).and_then(Option::take);
                if removed.is_some() {
                    self.free_nodes.push(node);
                }
                removed
            }
            _ => None,
        }
    }

    /// Entry by node number
    #[must_use]
    pub fn get(&self, node: u32) -> Option<&Arc<IntervalEntry>> {
        self.arena.get(node as usize).and_then(Option::as_ref)
    }

    fn entry_at(&self, node: u32) -> Option<Arc<IntervalEntry>> {
        self.get(node).cloned()
    }

    /// First entry overlapping `[start, last]`
    #[must_use]
    pub fn lookup(&self, start: u64, last: u64) -> Option<Arc<IntervalEntry>> {
        if start > last {
            return None;
        }
        if let Some((_, &node)) = self.by_start.range(..=start).next_back()
            && let Some(entry) = self.get(node)
            && entry.last() >= start
        {
            return Some(Arc::clone(entry));
        }
        self.by_start
            .range(start..=last)
            .next()
            .and_then(|(_, &node)| self.entry_at(node))
    }

    /// Next entry after `prev` overlapping `[start, last]`
    #[must_use]
    pub fn lookup_next(
        &self,
        prev: &IntervalEntry,
        start: u64,
        last: u64,
    ) -> Option<Arc<IntervalEntry>> {
        if start > last || prev.start() >= last {
            return None;
        }
        self.by_start
            .range((Excluded(prev.start()), Included(last)))
            .next()
            .and_then(|(_, &node)| self.entry_at(node))
            .filter(|entry| entry.last() >= start)
    }

    /// Entries in start order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<IntervalEntry>> + '_ {
        self.by_start.values().filter_map(|&node| self.get(node))
    }

    /// Entries overlapping `[start, last]` in start order
    pub fn overlapping(
        &self,
        start: u64,
        last: u64,
    ) -> impl Iterator<Item = Arc<IntervalEntry>> + '_ {
        let mut next = self.lookup(start, last);
        std::iter::from_fn(move || {
            let current = next.take()?;
            next = self.lookup_next(&current, start, last);
            Some(current)
        })
    }

    /// Interval with the highest start
    #[must_use]
    pub fn last_entry(&self) -> Option<Arc<IntervalEntry>> {
        self.by_start
            .last_key_value()
            .and_then(|(_, &node)| self.entry_at(node))
    }

    /// Remove every entry and restart node numbering
    pub fn drain(&mut self) -> Vec<Arc<IntervalEntry>> {
        let entries: Vec<_> = self
            .by_start
            .values()
            .filter_map(|&node| self.arena.get_mut(node as usize).and_then(Option::take))
            .collect();
        self.by_start.clear();
        self.arena.truncate(1);
        self.free_nodes.clear();
        self.next_node = 1;
        entries
    }

    /// Check that no two entries overlap
    #[must_use]
    pub fn is_non_overlapping(&self) -> bool {
        let mut prev_last: Option<u64> = None;
        for entry in self.iter() {
            if prev_last.is_some_and(|last| entry.start() <= last) {
                return false;
            }
            prev_last = Some(entry.last());
        }
        true
    }
}

impl fmt::Debug for IntervalIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntervalIndex")
            .field("inode", &self.inode)
            .field("intervals", &self.len())
            .field("next_node", &self.next_node)
            .field("free_nodes", &self.free_nodes.len())
            .finish()
    }
}
