//! Inodes and the inode table
//!
//! An [`Inode`] is shared by every open of one logical path. It owns the
//! interval index, the logical size, the inode-level placement tag, and
//! the per-device mirror files used by cache write-back.

use crate::index::IntervalIndex;
use crate::raw_io::open_mirror;
use parking_lot::{Mutex, RwLock};
use polystore_common::{
    Device, Error, InodeId, NODE_SIZE, PathHash, Placement, Result, align_up_to_node,
};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use tracing::debug;

/// Lazily opened mirror files of one inode, one per device
///
/// Each handle is opened at most once; the mutex serializes racing openers.
pub struct DeviceFiles {
    paths: RwLock<[PathBuf; 2]>,
    handles: [Mutex<Option<Arc<File>>>; 2],
}

impl DeviceFiles {
    /// Record the mirror paths; nothing is opened yet
    #[must_use]
    pub fn new(fast: PathBuf, slow: PathBuf) -> Self {
        Self {
            paths: RwLock::new([fast, slow]),
            handles: [Mutex::new(None), Mutex::new(None)],
        }
    }

    #[must_use]
    pub fn path(&self, device: Device) -> PathBuf {
        self.paths.read()[device.index()].clone()
    }

    /// Open (once) and return the mirror on `device`
    pub fn handle(&self, device: Device) -> Result<Arc<File>> {
        let mut handle = self.handles[device.index()].lock();
        if let Some(file) = handle.as_ref() {
            return Ok(Arc::clone(file));
        }
        let path = self.path(device);
        let file = Arc::new(open_mirror(&path, false, 0o644)?);
        debug!(path = %path.display(), %device, "device file opened");
        *handle = Some(Arc::clone(&file));
        Ok(file)
    }

    /// Open both mirrors so they outlive an unlink
    pub fn open_all(&self) -> Result<()> {
        for device in Device::ALL {
            self.handle(device)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_open(&self, device: Device) -> bool {
        self.handles[device.index()].lock().is_some()
    }

    /// Close both mirrors; the next access reopens by path
    pub fn close(&self) {
        for handle in &self.handles {
            handle.lock().take();
        }
    }

    /// Point at renamed mirrors; open handles stay valid
    pub fn rename(&self, fast: PathBuf, slow: PathBuf) {
        *self.paths.write() = [fast, slow];
    }

    /// Flush open mirrors to stable storage
    pub fn sync(&self) -> Result<()> {
        for handle in &self.handles {
            let file = handle.lock().clone();
            if let Some(file) = file {
                file.sync_all()?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let paths = self.paths.read();
        f.debug_struct("DeviceFiles")
            .field("fast", &paths[0])
            .field("slow", &paths[1])
            .finish()
    }
}

/// In-memory inode
pub struct Inode {
    id: InodeId,
    path: RwLock<String>,
    /// Logical size in bytes
    size: AtomicU64,
    placement: AtomicU8,
    /// Open file handles referring to this inode
    refs: AtomicU32,
    /// Unlinked while open; reclaimed on last close
    reclaim: AtomicBool,
    pub(crate) index: RwLock<IntervalIndex>,
    files: Arc<DeviceFiles>,
    /// Next free physical offset per device
    next_offset: [AtomicU64; 2],
}

impl Inode {
    fn new(id: InodeId, path: &str, files: DeviceFiles, max_nodes: u32) -> Self {
        Self {
            id,
            path: RwLock::new(path.to_string()),
            size: AtomicU64::new(0),
            placement: AtomicU8::new(Placement::Undetermined.as_u8()),
            refs: AtomicU32::new(0),
            reclaim: AtomicBool::new(false),
            index: RwLock::new(IntervalIndex::new(id, max_nodes)),
            files: Arc::new(files),
            next_offset: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    #[must_use]
    pub const fn id(&self) -> InodeId {
        self.id
    }

    /// Hash of the current path
    #[must_use]
    pub fn hash(&self) -> PathHash {
        PathHash::of(&self.path.read())
    }

    #[must_use]
    pub fn path(&self) -> String {
        self.path.read().clone()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Raise the logical size to at least `size`
    pub fn grow_size(&self, size: u64) {
        self.size.fetch_max(size, Ordering::AcqRel);
    }

    /// Set the logical size (truncate only)
    pub(crate) fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    #[must_use]
    pub fn placement(&self) -> Placement {
        Placement::from_u8(self.placement.load(Ordering::Acquire))
    }

    /// First write to an undetermined inode spreads it across devices
    pub fn mark_written(&self) {
        let _ = self.placement.compare_exchange(
            Placement::Undetermined.as_u8(),
            Placement::Split.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Pin every future interval to one device
    ///
    /// Only possible before the first write.
    pub fn pin(&self, device: Device) -> Result<()> {
        let target = Placement::from(device);
        match self.placement.compare_exchange(
            Placement::Undetermined.as_u8(),
            target.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(current) if current == target.as_u8() => Ok(()),
            Err(current) => Err(Error::invalid_placement(format!(
                "{} is already {:?}",
                self.id,
                Placement::from_u8(current)
            ))),
        }
    }

    /// Device for a new interval written by a task placed on `task_device`
    #[must_use]
    pub fn device_for_new_interval(&self, task_device: Device) -> Device {
        self.placement().device().unwrap_or(task_device)
    }

    /// Reserve one node of physical space on `device`
    ///
    /// The offset is past both every earlier reservation and the node-aligned
    /// end of the mirror (`physical_len`).
    pub fn reserve_device_offset(&self, device: Device, physical_len: u64) -> u64 {
        let floor = align_up_to_node(physical_len);
        let counter = &self.next_offset[device.index()];
        let mut current = counter.load(Ordering::Acquire);
        loop {
            let offset = current.max(floor);
            match counter.compare_exchange_weak(
                current,
                offset + NODE_SIZE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return offset,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn reset_device_offsets(&self) {
        for counter in &self.next_offset {
            counter.store(0, Ordering::Release);
        }
    }

    /// Count a new open; returns the number of opens
    pub fn acquire(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Count a close; returns the opens left
    pub fn release(&self) -> u32 {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .map_or(0, |prev| prev.saturating_sub(1))
    }

    #[must_use]
    pub fn open_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn mark_reclaim(&self) {
        self.reclaim.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn needs_reclaim(&self) -> bool {
        self.reclaim.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn files(&self) -> &Arc<DeviceFiles> {
        &self.files
    }

    /// Any interval holding data that was not written back
    #[must_use]
    pub fn has_dirty_intervals(&self) -> bool {
        self.index.read().iter().any(|entry| entry.lock_slot().is_dirty())
    }

    /// Number of intervals in the index
    #[must_use]
    pub fn interval_count(&self) -> usize {
        self.index.read().len()
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("id", &self.id)
            .field("path", &*self.path.read())
            .field("size", &self.size())
            .field("placement", &self.placement())
            .field("refs", &self.open_count())
            .finish_non_exhaustive()
    }
}

/// Path hash -> inode, shared by all opens
pub struct InodeTable {
    inodes: RwLock<HashMap<PathHash, Arc<Inode>>>,
    next_id: AtomicU64,
    max_inodes: usize,
    max_index_nodes: u32,
}

impl InodeTable {
    #[must_use]
    pub fn new(max_inodes: usize, max_index_nodes: u32) -> Self {
        Self {
            inodes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_inodes,
            max_index_nodes,
        }
    }

    /// Inode for `path`, created with `files` on first use
    pub fn find_or_create<F>(&self, path: &str, files: F) -> Result<Arc<Inode>>
    where
        F: FnOnce() -> DeviceFiles,
    {
        let hash = PathHash::of(path);
        if let Some(inode) = self.inodes.read().get(&hash) {
            return Self::check_path(inode, path).map(|()| Arc::clone(inode));
        }

        let mut inodes = self.inodes.write();
        if let Some(inode) = inodes.get(&hash) {
            return Self::check_path(inode, path).map(|()| Arc::clone(inode));
        }
        if inodes.len() >= self.max_inodes {
            return Err(Error::InodeExhausted {
                limit: self.max_inodes,
            });
        }

        let id = InodeId::from(self.next_id.fetch_add(1, Ordering::Relaxed));
        let inode = Arc::new(Inode::new(id, path, files(), self.max_index_nodes));
        inodes.insert(hash, Arc::clone(&inode));
        debug!(%id, path, %hash, "inode created");
        Ok(inode)
    }

    fn check_path(inode: &Inode, path: &str) -> Result<()> {
        if *inode.path.read() == path {
            Ok(())
        } else {
            Err(Error::internal(format!(
                "path hash collision between {path} and {}",
                inode.path()
            )))
        }
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<Arc<Inode>> {
        self.inodes
            .read()
            .get(&PathHash::of(path))
            .filter(|inode| *inode.path.read() == path)
            .cloned()
    }

    pub fn remove(&self, path: &str) -> Option<Arc<Inode>> {
        let hash = PathHash::of(path);
        let mut inodes = self.inodes.write();
        if inodes.get(&hash).is_some_and(|inode| *inode.path.read() == path) {
            inodes.remove(&hash)
        } else {
            None
        }
    }

    /// Remove `inode` unless another inode took its path meanwhile
    pub fn remove_inode(&self, inode: &Inode) -> bool {
        let hash = inode.hash();
        let mut inodes = self.inodes.write();
        if inodes.get(&hash).is_some_and(|i| i.id() == inode.id()) {
            inodes.remove(&hash);
            true
        } else {
            false
        }
    }

    /// Move an inode to a new path without changing its identity
    ///
    /// An inode already registered under `to` is displaced and returned.
    pub fn rekey(&self, from: &str, to: &str) -> Result<Option<Arc<Inode>>> {
        let mut inodes = self.inodes.write();
        let old_hash = PathHash::of(from);
        let inode = match inodes.get(&old_hash) {
            Some(inode) if *inode.path.read() == from => inodes.remove(&old_hash),
            _ => None,
        };
        let Some(inode) = inode else {
            return Err(Error::InodeNotFound(from.to_string()));
        };

        *inode.path.write() = to.to_string();
        let displaced = inodes.insert(PathHash::of(to), inode);
        debug!(from, to, "inode rekeyed");
        Ok(displaced)
    }

    /// Move every inode below directory `from` to the same place below `to`
    ///
    /// `paths` maps a new logical path to its mirrors, which the moved
    /// inodes' device files follow. Inodes displaced at the new paths are
    /// returned.
    pub fn rekey_under<F>(&self, from: &str, to: &str, paths: F) -> Vec<Arc<Inode>>
    where
        F: Fn(&str) -> [PathBuf; 2],
    {
        let prefix = format!("{from}/");
        let mut inodes = self.inodes.write();
        let hashes: Vec<PathHash> = inodes
            .iter()
            .filter(|(_, inode)| inode.path.read().starts_with(&prefix))
            .map(|(hash, _)| *hash)
            .collect();
        let moved: Vec<_> = hashes.iter().filter_map(|hash| inodes.remove(hash)).collect();

        let mut displaced = Vec::new();
        for inode in moved {
            let path = format!("{to}/{}", &inode.path()[prefix.len()..]);
            let [fast, slow] = paths(&path);
            inode.files.rename(fast, slow);
            debug!(id = %inode.id, from = %inode.path(), to = %path, "inode rekeyed");
            *inode.path.write() = path.clone();
            displaced.extend(inodes.insert(PathHash::of(&path), inode));
        }
        displaced
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<Inode>> {
        self.inodes.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inodes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inodes.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files() -> DeviceFiles {
        DeviceFiles::new(PathBuf::from("/nonexistent/f"), PathBuf::from("/nonexistent/s"))
    }

    #[test]
    fn test_find_or_create_shares_inode() {
        let table = InodeTable::new(8, 16);
        let a = table.find_or_create("a/b", files).unwrap();
        let b = table.find_or_create("a/b", files).unwrap();
        let c = table.find_or_create("a/c", files).unwrap();

        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("a/b").unwrap().id(), a.id());
        assert!(table.get("a/d").is_none());
    }

    #[test]
    fn test_table_limit() {
        let table = InodeTable::new(2, 16);
        table.find_or_create("one", files).unwrap();
        table.find_or_create("two", files).unwrap();
        let err = table.find_or_create("three", files).unwrap_err();
        assert!(err.is_exhausted());
        // Existing paths still resolve at the limit
        assert!(table.find_or_create("one", files).is_ok());
    }

    #[test]
    fn test_rekey_keeps_identity() {
        let table = InodeTable::new(8, 16);
        let inode = table.find_or_create("old", files).unwrap();
        inode.acquire();

        assert!(table.rekey("old", "new").unwrap().is_none());
        assert!(table.get("old").is_none());
        let moved = table.get("new").unwrap();
        assert_eq!(moved.id(), inode.id());
        assert_eq!(moved.open_count(), 1);
        assert_eq!(moved.path(), "new");
        assert_eq!(moved.hash(), PathHash::of("new"));

        assert!(table.rekey("old", "other").unwrap_err().is_not_found());
        assert!(table.remove_inode(&moved));
        assert!(table.is_empty());
    }

    #[test]
    fn test_rekey_under_moves_descendants() {
        let table = InodeTable::new(8, 16);
        let nested = table.find_or_create("d/sub/f", files).unwrap();
        let direct = table.find_or_create("d/g", files).unwrap();
        let sibling = table.find_or_create("dx/h", files).unwrap();
        let stale = table.find_or_create("e/g", files).unwrap();

        let displaced = table.rekey_under("d", "e", |path| {
            [PathBuf::from("/fast").join(path), PathBuf::from("/slow").join(path)]
        });
        assert_eq!(displaced.len(), 1);
        assert_eq!(displaced[0].id(), stale.id());

        assert!(table.get("d/sub/f").is_none());
        assert_eq!(table.get("e/sub/f").unwrap().id(), nested.id());
        assert_eq!(table.get("e/g").unwrap().id(), direct.id());
        assert_eq!(nested.hash(), PathHash::of("e/sub/f"));
        assert_eq!(nested.files().path(Device::Fast), PathBuf::from("/fast/e/sub/f"));
        assert_eq!(direct.files().path(Device::Slow), PathBuf::from("/slow/e/g"));
        // Only whole path components match
        assert_eq!(table.get("dx/h").unwrap().id(), sibling.id());
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_placement_transitions() {
        let table = InodeTable::new(8, 16);
        let pinned = table.find_or_create("pinned", files).unwrap();
        pinned.pin(Device::Slow).unwrap();
        pinned.pin(Device::Slow).unwrap();
        assert!(pinned.pin(Device::Fast).is_err());
        pinned.mark_written();
        assert_eq!(pinned.placement(), Placement::Slow);
        assert_eq!(pinned.device_for_new_interval(Device::Fast), Device::Slow);

        let split = table.find_or_create("split", files).unwrap();
        split.mark_written();
        assert_eq!(split.placement(), Placement::Split);
        assert!(split.pin(Device::Fast).is_err());
        assert_eq!(split.device_for_new_interval(Device::Fast), Device::Fast);
        assert_eq!(split.device_for_new_interval(Device::Slow), Device::Slow);
    }

    #[test]
    fn test_device_offsets_are_node_aligned() {
        let table = InodeTable::new(8, 16);
        let inode = table.find_or_create("f", files).unwrap();

        assert_eq!(inode.reserve_device_offset(Device::Fast, 0), 0);
        assert_eq!(inode.reserve_device_offset(Device::Fast, 100), NODE_SIZE);
        assert_eq!(inode.reserve_device_offset(Device::Slow, 0), 0);
        // A longer mirror pushes the next reservation past its aligned end
        assert_eq!(
            inode.reserve_device_offset(Device::Fast, 5 * NODE_SIZE + 1),
            6 * NODE_SIZE
        );
        inode.reset_device_offsets();
        assert_eq!(inode.reserve_device_offset(Device::Fast, 0), 0);
    }

    #[test]
    fn test_refcount_and_size() {
        let table = InodeTable::new(8, 16);
        let inode = table.find_or_create("f", files).unwrap();
        assert_eq!(inode.acquire(), 1);
        assert_eq!(inode.acquire(), 2);
        assert_eq!(inode.release(), 1);
        assert_eq!(inode.release(), 0);
        assert_eq!(inode.release(), 0);

        inode.grow_size(100);
        inode.grow_size(50);
        assert_eq!(inode.size(), 100);
        inode.set_size(10);
        assert_eq!(inode.size(), 10);
    }

    #[test]
    fn test_device_files_open_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let fast = dir.path().join("f");
        let slow = dir.path().join("s");
        let files = DeviceFiles::new(fast.clone(), slow.clone());
        assert!(files.handle(Device::Fast).unwrap_err().is_not_found());

        std::fs::write(&fast, b"").unwrap();
        std::fs::write(&slow, b"").unwrap();
        let a = files.handle(Device::Fast).unwrap();
        let b = files.handle(Device::Fast).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        files.sync().unwrap();

        assert!(files.is_open(Device::Fast));
        assert!(!files.is_open(Device::Slow));

        files.close();
        assert!(!files.is_open(Device::Fast));
        let c = files.handle(Device::Fast).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
