//! Hot/cold LRU lists of cached intervals
//!
//! Lists are slab-backed doubly linked lists: nodes live in a `Vec`, links
//! are slab indices, and each [`IntervalEntry`] records which list and slot
//! it occupies in its [`LruLink`]. An entry is on at most one list at a
//! time; removal of an entry that is not on the list is a no-op.

use crate::index::IntervalEntry;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const UNLINKED: u64 = u64::MAX;

static NEXT_LIST_ID: AtomicU32 = AtomicU32::new(1);

/// Position of an entry on some list, or unlinked
///
/// Only written while holding the lock of the list named in the value
/// (or, when unlinked, of the list taking the entry).
pub struct LruLink(AtomicU64);

impl LruLink {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(UNLINKED))
    }

    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.0.load(Ordering::Acquire) != UNLINKED
    }

    fn decode(&self) -> Option<(u32, usize)> {
        let raw = self.0.load(Ordering::Acquire);
        (raw != UNLINKED).then(|| ((raw >> 32) as u32, (raw & u64::from(u32::MAX)) as usize))
    }

    const fn encode(list: u32, slot: usize) -> u64 {
        ((list as u64) << 32) | slot as u64
    }
}

impl Default for LruLink {
    fn default() -> Self {
        Self::new()
    }
}

/// Decision for the entry at the head of a list during [`LruList::take_front`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Walk {
    /// Unlink and return the entry
    Take,
    /// Unlink and discard the entry
    Discard,
    /// Leave the entry and stop walking
    Stop,
}

struct LruNode {
    entry: Option<Arc<IntervalEntry>>,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
struct LruInner {
    nodes: Vec<LruNode>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl LruInner {
    fn allocate(&mut self, entry: Arc<IntervalEntry>) -> usize {
        let node = LruNode {
            entry: Some(entry),
            prev: None,
            next: None,
        };
        if let Some(slot) = self.free.pop() {
            self.nodes[slot] = node;
            slot
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    fn attach_back(&mut self, slot: usize) {
        self.nodes[slot].prev = self.tail;
        self.nodes[slot].next = None;
        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[slot].prev = None;
        self.nodes[slot].next = None;
        self.len -= 1;
    }

    fn detach(&mut self, slot: usize) -> Option<Arc<IntervalEntry>> {
        self.unlink(slot);
        self.free.push(slot);
        self.nodes[slot].entry.take()
    }

    fn holds(&self, slot: usize, entry: &IntervalEntry) -> bool {
        self.nodes
            .get(slot)
            .and_then(|n| n.entry.as_ref())
            .is_some_and(|e| std::ptr::eq(Arc::as_ptr(e), entry))
    }
}

/// One LRU list
pub struct LruList {
    id: u32,
    name: &'static str,
    inner: Mutex<LruInner>,
}

impl LruList {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_LIST_ID.fetch_add(1, Ordering::Relaxed),
            name,
            inner: Mutex::new(LruInner::default()),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an unlinked entry; false if it is already on a list
    pub fn push_back(&self, entry: &Arc<IntervalEntry>) -> bool {
        let mut inner = self.inner.lock();
        let slot = inner.allocate(Arc::clone(entry));
        let linked = entry
            .lru
            .0
            .compare_exchange(
                UNLINKED,
                LruLink::encode(self.id, slot),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if linked {
            inner.attach_back(slot);
        } else {
            inner.nodes[slot].entry = None;
            inner.free.push(slot);
        }
        linked
    }

    /// Remove an entry if it is on this list
    pub fn remove(&self, entry: &IntervalEntry) -> bool {
        let mut inner = self.inner.lock();
        let Some(slot) = self.slot_of(&inner, entry) else {
            return false;
        };
        inner.detach(slot);
        entry.lru.0.store(UNLINKED, Ordering::Release);
        true
    }

    /// Move an entry to the back if it is on this list
    pub fn touch(&self, entry: &IntervalEntry) -> bool {
        let mut inner = self.inner.lock();
        let Some(slot) = self.slot_of(&inner, entry) else {
            return false;
        };
        inner.unlink(slot);
        inner.attach_back(slot);
        true
    }

    #[must_use]
    pub fn contains(&self, entry: &IntervalEntry) -> bool {
        let inner = self.inner.lock();
        self.slot_of(&inner, entry).is_some()
    }

    fn slot_of(&self, inner: &LruInner, entry: &IntervalEntry) -> Option<usize> {
        let (list, slot) = entry.lru.decode()?;
        (list == self.id && inner.holds(slot, entry)).then_some(slot)
    }

    /// Remove and return the oldest entry
    pub fn pop_front(&self) -> Option<Arc<IntervalEntry>> {
        let mut taken = self.take_front(|_| Walk::Take, 1);
        taken.pop()
    }

    /// Walk from the oldest entry under a single lock hold
    ///
    /// Stops at the first [`Walk::Stop`], at the end of the list, or once
    /// `limit` entries were taken.
    pub fn take_front<F>(&self, mut decide: F, limit: usize) -> Vec<Arc<IntervalEntry>>
    where
        F: FnMut(&IntervalEntry) -> Walk,
    {
        let mut inner = self.inner.lock();
        let mut taken = Vec::new();

        while taken.len() < limit {
            let Some(head) = inner.head else {
                break;
            };
            let decision = match inner.nodes[head].entry.as_deref() {
                Some(entry) => decide(entry),
                None => Walk::Discard,
            };
            if decision == Walk::Stop {
                break;
            }
            if let Some(entry) = inner.detach(head) {
                entry.lru.0.store(UNLINKED, Ordering::Release);
                if decision == Walk::Take {
                    taken.push(entry);
                }
            }
        }
        taken
    }
}

impl fmt::Debug for LruList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruList")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}
