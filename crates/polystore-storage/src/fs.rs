//! POSIX-shaped entry points
//!
//! [`PolyStore`] ties the pieces together:
//!
//! - the [`HostDirectory`] resolves logical paths to their two mirrors
//! - the [`InodeTable`] shares one [`Inode`] between all opens of a path
//! - the [`FileTable`] maps handles to open files
//! - the [`IoEngine`] walks interval indexes, directly or through the
//!   [`CacheEngine`]
//! - the [`PlacementScheduler`] decides which device new intervals land on
//!
//! Every call returns a [`Result`]; a syscall shim turns errors into
//! negative errno values with [`polystore_common::Error::errno`].

use crate::cache::{CacheEngine, CacheStatsSnapshot};
use crate::host::{HostDirectory, MirrorDirectory};
use crate::inode::{DeviceFiles, Inode, InodeTable};
use crate::io::{CachedIo, DirectIo, IoBackend, IoEngine, IoStatsSnapshot, check_offset};
use crate::raw_io::{preallocate, write_full_at};
use crate::table::{FileTable, OpenFile, OpenFlags};
use polystore_common::{
    CacheMode, Config, Device, Error, FileHandle, MAX_FILE_SIZE, Placement, Result,
};
use polystore_placement::PlacementScheduler;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Zero-fill chunk for growing truncates
const TRUNCATE_CHUNK: usize = 4096;

/// `lseek` origin
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    /// Decode `SEEK_*`
    pub fn from_raw(whence: i32) -> Result<Self> {
        match whence {
            libc::SEEK_SET => Ok(Self::Set),
            libc::SEEK_CUR => Ok(Self::Cur),
            libc::SEEK_END => Ok(Self::End),
            other => Err(Error::invalid_argument(format!("unknown whence {other}"))),
        }
    }
}

/// What `stat`/`fstat` report
#[derive(Clone, Debug, Serialize)]
pub struct FileStat {
    /// In-memory inode number; `None` when the path is not loaded
    pub inode: Option<u64>,
    /// Logical size
    pub size: u64,
    pub placement: Placement,
    pub intervals: usize,
    pub open_count: u32,
}

impl FileStat {
    fn of(inode: &Inode) -> Self {
        Self {
            inode: Some(inode.id().as_u64()),
            size: inode.size(),
            placement: inode.placement(),
            intervals: inode.interval_count(),
            open_count: inode.open_count(),
        }
    }
}

/// `fcntl` commands the store interprets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FcntlCmd {
    /// `F_GETFL`
    GetFlags,
    /// `F_SETFL` with or without `O_APPEND`
    SetAppend(bool),
    GetPlacement,
    /// Pin every new interval of the file to one device
    SetPlacement(Device),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FcntlResult {
    Flags(i32),
    Placement(Placement),
    Done,
}

/// Heterogeneous fast/slow file store
pub struct PolyStore {
    config: Config,
    host: Arc<dyn HostDirectory>,
    scheduler: Arc<PlacementScheduler>,
    cache: Option<Arc<CacheEngine>>,
    io: IoEngine,
    inodes: InodeTable,
    files: FileTable,
    shut_down: AtomicBool,
}

impl PolyStore {
    /// Open a store over the mirror roots named in `config`
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let host = MirrorDirectory::new(&config.mounts);
        host.ensure_roots()?;
        Self::with_host(config, Arc::new(host))
    }

    /// Open a store over a custom host directory
    pub fn with_host(config: Config, host: Arc<dyn HostDirectory>) -> Result<Self> {
        let scheduler = PlacementScheduler::new(&config.placement);
        if config.placement.background_epochs {
            scheduler.start()?;
        }

        let (cache, backend): (Option<Arc<CacheEngine>>, Box<dyn IoBackend>) =
            match config.cache.mode {
                CacheMode::Cached => {
                    let cache = Arc::new(CacheEngine::new(&config.cache)?);
                    (Some(Arc::clone(&cache)), Box::new(CachedIo::new(cache)))
                }
                CacheMode::Direct => (None, Box::new(DirectIo)),
            };
        let io = IoEngine::new(backend, Arc::clone(&scheduler));

        info!(
            mode = ?config.cache.mode,
            policy = ?config.placement.policy,
            split_point = config.placement.split_point,
            "PolyStore opened"
        );

        Ok(Self {
            inodes: InodeTable::new(config.limits.max_inodes, config.limits.max_index_nodes),
            files: FileTable::new(),
            config,
            host,
            scheduler,
            cache,
            io,
            shut_down: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn scheduler(&self) -> &Arc<PlacementScheduler> {
        &self.scheduler
    }

    /// The shared cache, in cached mode
    #[must_use]
    pub const fn cache(&self) -> Option<&Arc<CacheEngine>> {
        self.cache.as_ref()
    }

    #[must_use]
    pub fn io_stats(&self) -> IoStatsSnapshot {
        self.io.stats().snapshot()
    }

    #[must_use]
    pub fn cache_stats(&self) -> Option<CacheStatsSnapshot> {
        self.cache.as_ref().map(|cache| cache.stats().snapshot())
    }

    /// Loaded inode of a path
    pub fn inode(&self, path: impl AsRef<Path>) -> Result<Option<Arc<Inode>>> {
        let logical = self.host.canonicalize(path.as_ref())?;
        Ok(self.inodes.get(&logical))
    }

    #[must_use]
    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    pub fn open(&self, path: impl AsRef<Path>, flags: OpenFlags, mode: u32) -> Result<FileHandle> {
        let logical = self.host.canonicalize(path.as_ref())?;
        let mirrors = self.host.open(&logical, flags, mode)?;
        let inode = self.inodes.find_or_create(&logical, || {
            let [fast, slow] = self.host.device_paths(&logical);
            DeviceFiles::new(fast, slow)
        })?;
        inode.acquire();

        let handle = self.files.next_handle();
        let file = Arc::new(OpenFile::new(
            handle,
            Arc::clone(&inode),
            flags,
            mirrors.fast,
            mirrors.slow,
        ));
        if flags.truncate && flags.write
            && let Err(e) = self.truncate_file(&file, 0)
        {
            inode.release();
            return Err(e);
        }
        self.files.insert(file);
        debug!(path = %logical, %handle, inode = %inode.id(), "open");
        Ok(handle)
    }

    pub fn close(&self, fh: FileHandle) -> Result<()> {
        let file = self.files.remove(fh)?;
        let inode = Arc::clone(file.inode());
        drop(file);

        if inode.release() == 0 {
            self.host.close(&inode.path())?;
            if inode.needs_reclaim() {
                self.reclaim(&inode);
            } else if !inode.has_dirty_intervals() {
                // Write-back reopens by path if the file is dirtied again
                inode.files().close();
            }
        }
        Ok(())
    }

    pub fn read(&self, fh: FileHandle, buf: &mut [u8]) -> Result<usize> {
        let file = self.files.get(fh)?;
        file.check_readable()?;
        self.io.read(&file, buf, None)
    }

    pub fn pread(&self, fh: FileHandle, buf: &mut [u8], offset: u64) -> Result<usize> {
        check_offset(offset)?;
        let file = self.files.get(fh)?;
        file.check_readable()?;
        self.io.read(&file, buf, Some(offset))
    }

    pub fn write(&self, fh: FileHandle, buf: &[u8]) -> Result<usize> {
        let file = self.files.get(fh)?;
        file.check_writable()?;
        self.io.write(&file, buf, None)
    }

    /// Positioned write; append handles still write at the end
    pub fn pwrite(&self, fh: FileHandle, buf: &[u8], offset: u64) -> Result<usize> {
        check_offset(offset)?;
        let file = self.files.get(fh)?;
        file.check_writable()?;
        self.io.write(&file, buf, Some(offset))
    }

    pub fn lseek(&self, fh: FileHandle, offset: i64, whence: Whence) -> Result<u64> {
        let file = self.files.get(fh)?;
        let mut position = file.lock_position();
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => *position,
            Whence::End => file.inode().size(),
        };
        let target = base
            .checked_add_signed(offset)
            .filter(|&target| target <= MAX_FILE_SIZE)
            .ok_or_else(|| {
                Error::invalid_argument(format!("seek to {base} {offset:+} is out of range"))
            })?;
        *position = target;
        Ok(target)
    }

    pub fn fstat(&self, fh: FileHandle) -> Result<FileStat> {
        let file = self.files.get(fh)?;
        Ok(FileStat::of(file.inode()))
    }

    /// Loaded paths report the inode; others the mirrors' combined length
    pub fn stat(&self, path: impl AsRef<Path>) -> Result<FileStat> {
        let logical = self.host.canonicalize(path.as_ref())?;
        if let Some(inode) = self.inodes.get(&logical) {
            return Ok(FileStat::of(&inode));
        }
        Ok(FileStat {
            inode: None,
            size: self.host.mirror_len(&logical)?,
            placement: Placement::Undetermined,
            intervals: 0,
            open_count: 0,
        })
    }

    pub fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
        let from = self.host.canonicalize(from.as_ref())?;
        let to = self.host.canonicalize(to.as_ref())?;
        if from == to {
            return Ok(());
        }

        // The replaced file's mirrors vanish by path; keep them reachable
        if let Some(target) = self.inodes.get(&to)
            && target.open_count() > 0
        {
            target.files().open_all()?;
        }
        self.host.rename(&from, &to)?;

        let displaced = if self.inodes.get(&from).is_some() {
            let displaced = self.inodes.rekey(&from, &to)?;
            if let Some(moved) = self.inodes.get(&to) {
                let [fast, slow] = self.host.device_paths(&to);
                moved.files().rename(fast, slow);
            }
            displaced
        } else {
            self.inodes.remove(&to)
        };

        if let Some(inode) = displaced {
            self.retire(&inode);
        }

        // Renamed directories carry their loaded files along
        for inode in self
            .inodes
            .rekey_under(&from, &to, |path| self.host.device_paths(path))
        {
            self.retire(&inode);
        }
        debug!(from = %from, to = %to, "rename");
        Ok(())
    }

    /// Remove a path; an open file lives on until its last close
    pub fn unlink(&self, path: impl AsRef<Path>) -> Result<()> {
        let logical = self.host.canonicalize(path.as_ref())?;
        if let Some(inode) = self.inodes.get(&logical)
            && inode.open_count() > 0
        {
            inode.files().open_all()?;
        }
        self.host.unlink(&logical)?;

        if let Some(inode) = self.inodes.remove(&logical) {
            self.retire(&inode);
        }
        debug!(path = %logical, "unlink");
        Ok(())
    }

    pub fn mkdir(&self, path: impl AsRef<Path>, mode: u32) -> Result<()> {
        let logical = self.host.canonicalize(path.as_ref())?;
        self.host.mkdir(&logical, mode)
    }

    pub fn rmdir(&self, path: impl AsRef<Path>) -> Result<()> {
        let logical = self.host.canonicalize(path.as_ref())?;
        self.host.rmdir(&logical)
    }

    /// `access(2)` with `R_OK`/`W_OK`/`X_OK`/`F_OK` bits
    pub fn access(&self, path: impl AsRef<Path>, mode: i32) -> Result<()> {
        let logical = self.host.canonicalize(path.as_ref())?;
        self.host.access(&logical, mode)
    }

    pub fn truncate(&self, path: impl AsRef<Path>, len: u64) -> Result<()> {
        let fh = self.open(path, OpenFlags::read_write(), 0o644)?;
        let result = self.ftruncate(fh, len);
        let closed = self.close(fh);
        result.and(closed)
    }

    pub fn ftruncate(&self, fh: FileHandle, len: u64) -> Result<()> {
        check_offset(len)?;
        let file = self.files.get(fh)?;
        file.check_writable()?;
        self.truncate_file(&file, len)
    }

    /// Reserve device space for a pinned file
    ///
    /// Files whose intervals may land on either device accept the call
    /// without doing anything. The logical size is unchanged.
    pub fn fallocate(&self, fh: FileHandle, offset: u64, len: u64) -> Result<()> {
        let file = self.files.get(fh)?;
        file.check_writable()?;
        if len == 0 {
            return Err(Error::invalid_argument("fallocate of zero bytes"));
        }
        check_offset(offset.checked_add(len).unwrap_or(u64::MAX))?;
        match file.inode().placement().device() {
            Some(device) => preallocate(file.device(device), offset, len),
            None => {
                debug!(handle = %fh, offset, len, "fallocate on unpinned file ignored");
                Ok(())
            }
        }
    }

    pub fn fcntl(&self, fh: FileHandle, cmd: FcntlCmd) -> Result<FcntlResult> {
        let file = self.files.get(fh)?;
        match cmd {
            FcntlCmd::GetFlags => Ok(FcntlResult::Flags(file.flags().bits())),
            FcntlCmd::SetAppend(append) => {
                file.set_append(append);
                Ok(FcntlResult::Done)
            }
            FcntlCmd::GetPlacement => Ok(FcntlResult::Placement(file.inode().placement())),
            FcntlCmd::SetPlacement(device) => {
                file.inode().pin(device)?;
                Ok(FcntlResult::Done)
            }
        }
    }

    /// Write back the file's cached data and sync both mirrors
    pub fn fsync(&self, fh: FileHandle) -> Result<()> {
        let file = self.files.get(fh)?;
        if let Some(cache) = &self.cache {
            cache.sync_inode(file.inode())?;
        }
        for device in Device::ALL {
            file.device(device).sync_all()?;
        }
        Ok(())
    }

    pub fn fdatasync(&self, fh: FileHandle) -> Result<()> {
        let file = self.files.get(fh)?;
        if let Some(cache) = &self.cache {
            cache.sync_inode(file.inode())?;
        }
        for device in Device::ALL {
            file.device(device).sync_data()?;
        }
        Ok(())
    }

    pub fn symlink(&self, _target: impl AsRef<Path>, _link: impl AsRef<Path>) -> Result<()> {
        Err(Error::unsupported("symlink"))
    }

    pub fn lstat(&self, _path: impl AsRef<Path>) -> Result<FileStat> {
        Err(Error::unsupported("lstat"))
    }

    /// Write back every dirty interval of every loaded file
    pub fn sync_all(&self) -> Result<()> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        let mut first_error = None;
        for inode in self.inodes.all() {
            if let Err(e) = cache.sync_inode(&inode) {
                error!(inode = %inode.id(), error = %e, "sync failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stop the epoch thread, write everything back and stop the flush workers
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.scheduler.shutdown();

        let open = self.files.drain();
        if !open.is_empty() {
            warn!(handles = open.len(), "closing handles left open at shutdown");
        }
        for file in open {
            file.inode().release();
        }

        if let Some(cache) = &self.cache {
            cache.wait_idle();
        }
        let mut first_error = None;
        for inode in self.inodes.all() {
            let result = match &self.cache {
                Some(cache) => cache.free_inode(&inode),
                None => {
                    let synced = inode.files().sync();
                    inode.files().close();
                    synced
                }
            };
            if let Err(e) = result {
                error!(inode = %inode.id(), error = %e, "failed to release inode");
                first_error.get_or_insert(e);
            }
        }
        if let Some(cache) = &self.cache {
            cache.shutdown();
        }

        info!(io = ?self.io_stats(), "PolyStore stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Truncate or extend through an open handle
    fn truncate_file(&self, file: &OpenFile, len: u64) -> Result<()> {
        let size = file.inode().size();
        if len > size {
            let zeros = [0u8; TRUNCATE_CHUNK];
            let mut offset = size;
            while offset < len {
                let chunk = (len - offset).min(TRUNCATE_CHUNK as u64) as usize;
                let written = self.io.write_at(file, &zeros[..chunk], offset)?;
                if written < chunk {
                    return Err(Error::ShortIo {
                        expected: chunk,
                        actual: written,
                    });
                }
                offset += chunk as u64;
            }
            return Ok(());
        }
        self.shrink(file, len)
    }

    fn shrink(&self, file: &OpenFile, len: u64) -> Result<()> {
        let inode = file.inode();
        let mut index = inode.index.write();

        if len == 0 {
            for entry in index.drain() {
                self.forget(&entry);
            }
            inode.reset_device_offsets();
            for device in Device::ALL {
                file.device(device).set_len(0)?;
            }
            inode.set_size(0);
            debug!(inode = %inode.id(), "truncated to zero");
            return Ok(());
        }

        let doomed: Vec<_> = index
            .iter()
            .filter(|entry| entry.start() >= len)
            .cloned()
            .collect();
        for entry in &doomed {
            index.remove(entry);
            self.forget(entry);
        }

        // The interval holding the new last byte keeps only its head
        if let Some(entry) = index.lookup(len - 1, len - 1) {
            let rel = len - entry.start();
            let filled = entry.size();
            if rel < filled {
                let mut slot = entry.lock_slot();
                entry.shrink_size(rel);
                slot.zero_tail(rel as usize);
                let zeros = vec![0u8; (filled - rel) as usize];
                write_full_at(file.device(entry.device()), &zeros, entry.offset() + rel)?;
            }
        }

        // Give back device space past the surviving intervals
        for device in Device::ALL {
            let end = index
                .iter()
                .filter(|entry| entry.device() == device)
                .map(|entry| entry.offset() + entry.size())
                .max()
                .unwrap_or(0);
            let mirror = file.device(device);
            if mirror.metadata()?.len() > end {
                mirror.set_len(end)?;
            }
        }

        inode.set_size(len);
        debug!(inode = %inode.id(), len, removed = doomed.len(), "truncated");
        Ok(())
    }

    /// Drop one interval's state; its range is gone from the index
    fn forget(&self, entry: &crate::index::IntervalEntry) {
        match &self.cache {
            Some(cache) => cache.discard(entry),
            None => entry.mark_removed(),
        }
    }

    /// Reclaim an inode that left the namespace, now or on its last close
    fn retire(&self, inode: &Inode) {
        inode.mark_reclaim();
        if inode.open_count() == 0 {
            self.reclaim(inode);
        }
    }

    fn reclaim(&self, inode: &Inode) {
        match &self.cache {
            Some(cache) => cache.drop_inode(inode),
            None => {
                let mut index = inode.index.write();
                for entry in index.drain() {
                    entry.mark_removed();
                }
                drop(index);
                inode.files().close();
            }
        }
        debug!(inode = %inode.id(), "inode reclaimed");
    }
}

impl Drop for PolyStore {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, "PolyStore shutdown failed");
        }
    }
}

impl std::fmt::Debug for PolyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolyStore")
            .field("mode", &self.io.mode())
            .field("inodes", &self.inodes.len())
            .field("open_files", &self.files.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polystore_common::{MountConfig, NODE_SIZE};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::path::PathBuf;
    use std::thread;
    use tempfile::TempDir;

    fn config(dir: &TempDir, mode: CacheMode) -> Config {
        let mut config = Config::default();
        config.mounts = MountConfig {
            fast_root: dir.path().join("fast"),
            slow_root: dir.path().join("slow"),
            logical_root: PathBuf::from("/poly"),
        };
        config.placement.background_epochs = false;
        config.cache.mode = mode;
        config.cache.buffer_shards = 2;
        config.cache.buffer_slots_per_shard = 8;
        config.cache.flush_high_water = 8 * NODE_SIZE;
        config.cache.flush_low_water = 4 * NODE_SIZE;
        config.limits.max_inodes = 64;
        config
    }

    fn store(mode: CacheMode) -> (TempDir, PolyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PolyStore::new(config(&dir, mode)).unwrap();
        (dir, store)
    }

    fn create(store: &PolyStore, path: &str) -> FileHandle {
        store
            .open(path, OpenFlags::read_write().create(), 0o644)
            .unwrap()
    }

    fn read_all(store: &PolyStore, fh: FileHandle, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0xEEu8; len];
        let n = store.pread(fh, &mut buf, offset).unwrap();
        buf.truncate(n);
        buf
    }

    fn write_in_chunks(store: &PolyStore, fh: FileHandle, data: &[u8], from: usize, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut offset = from;
        while offset < data.len() {
            let len = rng.gen_range(1..=300_000).min(data.len() - offset);
            let n = store
                .pwrite(fh, &data[offset..offset + len], offset as u64)
                .unwrap();
            assert_eq!(n, len);
            offset += len;
        }
    }

    fn round_trip(mode: CacheMode) {
        let (_dir, store) = store(mode);
        let mut rng = StdRng::seed_from_u64(7);
        let mut data = vec![0u8; 5 * NODE_SIZE as usize + 12_345];
        rng.fill(&mut data[..]);
        let fh = create(&store, "/poly/data");

        // This thread holds the only fast slot; a second thread lands on slow
        let half = 2 * NODE_SIZE as usize + 1000;
        write_in_chunks(&store, fh, &data[..half], 0, 1);
        thread::scope(|s| {
            s.spawn(|| write_in_chunks(&store, fh, &data, half, 2));
        });
        assert_eq!(store.fstat(fh).unwrap().size, data.len() as u64);

        let mut offset = 0usize;
        while offset < data.len() {
            let len = rng.gen_range(1..=500_000).min(data.len() - offset);
            let got = read_all(&store, fh, offset as u64, len);
            assert_eq!(got, &data[offset..offset + len], "mismatch at {offset}");
            offset += len;
        }

        let inode = store.inode("/poly/data").unwrap().unwrap();
        let index = inode.index.read();
        assert!(index.is_non_overlapping());
        let devices: Vec<_> = index.iter().map(|entry| entry.device()).collect();
        assert!(devices.contains(&Device::Fast));
        assert!(devices.contains(&Device::Slow));
        assert_eq!(inode.placement(), Placement::Split);
    }

    #[test]
    fn test_round_trip_direct() {
        round_trip(CacheMode::Direct);
    }

    #[test]
    fn test_round_trip_cached() {
        round_trip(CacheMode::Cached);
    }

    #[test]
    fn test_intervals_are_node_aligned() {
        for mode in [CacheMode::Direct, CacheMode::Cached] {
            let (_dir, store) = store(mode);
            let fh = create(&store, "/poly/f");
            let data = vec![7u8; 3 * 1024 * 1024];
            assert_eq!(store.write(fh, &data).unwrap(), data.len());

            let inode = store.inode("/poly/f").unwrap().unwrap();
            let index = inode.index.read();
            let entries: Vec<_> = index
                .iter()
                .map(|e| (e.start(), e.size(), e.offset()))
                .collect();
            assert_eq!(
                entries,
                vec![(0, NODE_SIZE, 0), (NODE_SIZE, 1024 * 1024, NODE_SIZE)],
                "{mode:?}"
            );
        }
    }

    #[test]
    fn test_holes_read_as_zeros() {
        for mode in [CacheMode::Direct, CacheMode::Cached] {
            let (_dir, store) = store(mode);
            let fh = create(&store, "/poly/sparse");
            store.pwrite(fh, &[1u8; 100], 0).unwrap();
            store.pwrite(fh, &[2u8; 50], 200).unwrap();
            let far = 2 * NODE_SIZE + 10;
            store.pwrite(fh, &[3u8; 10], far).unwrap();

            let got = read_all(&store, fh, 0, 250);
            assert_eq!(&got[..100], &[1u8; 100][..]);
            assert!(got[100..200].iter().all(|&b| b == 0));
            assert_eq!(&got[200..], &[2u8; 50][..]);

            // A whole missing node and the tail of a partial one
            let got = read_all(&store, fh, 250, (far + 10 - 250) as usize);
            assert_eq!(got.len() as u64, far + 10 - 250);
            let (zeros, tail) = got.split_at(got.len() - 10);
            assert!(zeros.iter().all(|&b| b == 0), "{mode:?}");
            assert_eq!(tail, &[3u8; 10][..]);

            // Nothing past the logical size
            assert!(read_all(&store, fh, far + 10, 10).is_empty());
        }
    }

    #[test]
    fn test_concurrent_writers_trigger_write_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir, CacheMode::Cached);
        config.cache.flush_high_water = 4 * NODE_SIZE;
        config.cache.flush_low_water = 2 * NODE_SIZE;
        let store = PolyStore::new(config).unwrap();
        let fh = create(&store, "/poly/shared");

        thread::scope(|s| {
            for i in 0..8u8 {
                let store = &store;
                s.spawn(move || {
                    let data = vec![i + 1; NODE_SIZE as usize];
                    let offset = u64::from(i) * NODE_SIZE;
                    assert_eq!(store.pwrite(fh, &data, offset).unwrap(), data.len());
                });
            }
        });

        let cache = store.cache().unwrap();
        assert!(cache.stats().snapshot().dispatches >= 1);
        for i in 0..8u8 {
            let got = read_all(&store, fh, u64::from(i) * NODE_SIZE, NODE_SIZE as usize);
            assert!(got.iter().all(|&b| b == i + 1), "node {i}");
        }

        store.sync_all().unwrap();
        let inode = store.inode("/poly/shared").unwrap().unwrap();
        for entry in inode.index.read().iter() {
            assert!(!entry.lock_slot().is_dirty());
        }

        cache.wait_idle();
        cache.try_dispatch();
        cache.wait_idle();
        assert!(cache.cache_size() <= 2 * NODE_SIZE);
    }

    #[test]
    fn test_seek_and_sequential_io() {
        let (_dir, store) = store(CacheMode::Direct);
        let fh = create(&store, "/poly/seek");
        assert_eq!(store.write(fh, b"0123456789").unwrap(), 10);
        assert_eq!(store.lseek(fh, 2, Whence::Set).unwrap(), 2);

        let mut buf = [0u8; 3];
        assert_eq!(store.read(fh, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"234");
        assert_eq!(store.lseek(fh, -1, Whence::Cur).unwrap(), 4);
        assert_eq!(store.lseek(fh, 5, Whence::End).unwrap(), 15);
        assert!(matches!(
            store.lseek(fh, -1, Whence::Set),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(Whence::from_raw(libc::SEEK_END).unwrap(), Whence::End);
        assert!(Whence::from_raw(42).is_err());

        // Reads at the end return nothing
        store.lseek(fh, 0, Whence::End).unwrap();
        assert_eq!(store.read(fh, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_append_mode() {
        for mode in [CacheMode::Direct, CacheMode::Cached] {
            let (_dir, store) = store(mode);
            let fh = store
                .open("/poly/log", OpenFlags::read_write().create().append(), 0o644)
                .unwrap();
            store.write(fh, b"abc").unwrap();
            store.pwrite(fh, b"def", 0).unwrap();
            assert_eq!(store.lseek(fh, 0, Whence::Cur).unwrap(), 6);
            assert_eq!(read_all(&store, fh, 0, 16), b"abcdef");

            let flags = store.fcntl(fh, FcntlCmd::GetFlags).unwrap();
            assert_eq!(flags, FcntlResult::Flags(libc::O_RDWR | libc::O_APPEND));

            store.fcntl(fh, FcntlCmd::SetAppend(false)).unwrap();
            store.pwrite(fh, b"X", 0).unwrap();
            assert_eq!(read_all(&store, fh, 0, 16), b"Xbcdef");
        }
    }

    #[test]
    fn test_truncate_shrink_and_grow() {
        for mode in [CacheMode::Direct, CacheMode::Cached] {
            let (dir, store) = store(mode);
            let fh = create(&store, "/poly/t");
            store.write(fh, &vec![0xABu8; 3 * 1024 * 1024]).unwrap();

            let len = 1024 * 1024 + 10;
            store.ftruncate(fh, len).unwrap();
            let stat = store.fstat(fh).unwrap();
            assert_eq!((stat.size, stat.intervals), (len, 1), "{mode:?}");
            assert_eq!(read_all(&store, fh, len - 5, 100), vec![0xABu8; 5]);

            store.ftruncate(fh, len + 5000).unwrap();
            let grown = read_all(&store, fh, len - 5, 5005);
            assert_eq!(&grown[..5], &[0xABu8; 5][..]);
            assert!(grown[5..].iter().all(|&b| b == 0));

            store.truncate("/poly/t", 0).unwrap();
            let stat = store.fstat(fh).unwrap();
            assert_eq!((stat.size, stat.intervals), (0, 0));
            assert!(read_all(&store, fh, 0, 10).is_empty());
            let fast_len = std::fs::metadata(dir.path().join("fast/t")).unwrap().len();
            assert_eq!(fast_len, 0);

            // Data written after a truncate starts over at offset zero
            store.pwrite(fh, b"again", 0).unwrap();
            assert_eq!(read_all(&store, fh, 0, 10), b"again");
        }
    }

    #[test]
    fn test_open_truncate_resets_file() {
        let (_dir, store) = store(CacheMode::Cached);
        let fh = create(&store, "/poly/o");
        store.write(fh, b"old contents").unwrap();
        store.close(fh).unwrap();

        let fh = store
            .open("/poly/o", OpenFlags::read_write().truncate(), 0o644)
            .unwrap();
        assert_eq!(store.fstat(fh).unwrap().size, 0);
        store.write(fh, b"new").unwrap();
        assert_eq!(read_all(&store, fh, 0, 64), b"new");
    }

    #[test]
    fn test_unlink_open_file() {
        for mode in [CacheMode::Direct, CacheMode::Cached] {
            let (_dir, store) = store(mode);
            let fh = create(&store, "/poly/u");
            store.write(fh, b"still here").unwrap();

            store.unlink("/poly/u").unwrap();
            assert!(store.access("/poly/u", libc::F_OK).is_err());
            assert!(store.inode("/poly/u").unwrap().is_none());
            assert_eq!(read_all(&store, fh, 0, 64), b"still here");

            store.close(fh).unwrap();
            let fh = create(&store, "/poly/u");
            assert_eq!(store.fstat(fh).unwrap().size, 0);
        }
    }

    #[test]
    fn test_rename_keeps_inode() {
        let (_dir, store) = store(CacheMode::Cached);
        let fh = create(&store, "/poly/a");
        store.write(fh, b"payload").unwrap();
        let before = store.fstat(fh).unwrap().inode;

        store.rename("/poly/a", "/poly/b").unwrap();
        assert_eq!(store.stat("/poly/b").unwrap().inode, before);
        assert!(store.stat("/poly/a").unwrap_err().is_not_found());

        // Write-back goes to the renamed mirror
        store.fsync(fh).unwrap();
        assert_eq!(read_all(&store, fh, 0, 64), b"payload");
        store.close(fh).unwrap();
        let inode = store.inode("/poly/b").unwrap().unwrap();
        assert!(inode.files().path(Device::Fast).ends_with("b"));
    }

    #[test]
    fn test_rename_over_existing_file() {
        let (_dir, store) = store(CacheMode::Direct);
        let a = create(&store, "/poly/a");
        store.write(a, b"from a").unwrap();
        let b = create(&store, "/poly/b");
        store.write(b, b"from b").unwrap();
        store.close(b).unwrap();

        store.rename("/poly/a", "/poly/b").unwrap();
        let fh = store.open("/poly/b", OpenFlags::read_only(), 0).unwrap();
        assert_eq!(read_all(&store, fh, 0, 64), b"from a");
    }

    #[test]
    fn test_rename_directory_moves_cached_files() {
        let (_dir, store) = store(CacheMode::Cached);
        store.mkdir("/poly/d", 0o755).unwrap();
        store.mkdir("/poly/d/sub", 0o755).unwrap();
        let fh = create(&store, "/poly/d/f");
        store.write(fh, b"payload").unwrap();
        store.close(fh).unwrap();
        let fh = create(&store, "/poly/d/sub/g");
        store.write(fh, b"nested").unwrap();
        store.close(fh).unwrap();
        let before = store.inode("/poly/d/f").unwrap().unwrap().id();

        store.rename("/poly/d", "/poly/e").unwrap();
        assert!(store.inode("/poly/d/f").unwrap().is_none());
        let moved = store.inode("/poly/e/f").unwrap().unwrap();
        assert_eq!(moved.id(), before);
        assert!(moved.files().path(Device::Fast).ends_with("fast/e/f"));

        let fh = store.open("/poly/e/f", OpenFlags::read_only(), 0).unwrap();
        assert_eq!(read_all(&store, fh, 0, 64), b"payload");
        store.close(fh).unwrap();
        let fh = store.open("/poly/e/sub/g", OpenFlags::read_only(), 0).unwrap();
        assert_eq!(read_all(&store, fh, 0, 64), b"nested");
        store.close(fh).unwrap();

        // Dirty data is written back under the new paths
        store.sync_all().unwrap();
        let on_disk: u64 = store
            .host
            .device_paths("e/f")
            .iter()
            .map(|path| std::fs::metadata(path).unwrap().len())
            .sum();
        assert_eq!(on_disk, 7);
    }

    #[test]
    fn test_last_close_releases_clean_device_files() {
        let (_dir, store) = store(CacheMode::Cached);
        let fh = create(&store, "/poly/f");
        store.write(fh, b"first").unwrap();
        store.fsync(fh).unwrap();
        let inode = store.inode("/poly/f").unwrap().unwrap();
        let device = inode.index.read().lookup(0, 0).unwrap().device();
        assert!(inode.files().is_open(device));

        // Still dirty at close: the mirrors stay open for write-back
        store.write(fh, b"second").unwrap();
        store.close(fh).unwrap();
        assert!(inode.has_dirty_intervals());
        assert!(inode.files().is_open(device));

        let fh = store.open("/poly/f", OpenFlags::read_write(), 0).unwrap();
        store.fsync(fh).unwrap();
        store.close(fh).unwrap();
        assert!(!inode.has_dirty_intervals());
        assert!(!inode.files().is_open(device));

        // Write-back reopens by path
        let fh = store.open("/poly/f", OpenFlags::read_write(), 0).unwrap();
        store.pwrite(fh, b"third!", 5).unwrap();
        store.fsync(fh).unwrap();
        assert!(inode.files().is_open(device));
        assert_eq!(read_all(&store, fh, 0, 64), b"firstthird!");
        store.close(fh).unwrap();
    }

    #[test]
    fn test_offsets_past_file_size_limit() {
        let (_dir, store) = store(CacheMode::Cached);
        let fh = create(&store, "/poly/edge");
        let mut buf = [0u8; 2];

        for offset in [u64::MAX - 1, MAX_FILE_SIZE - 1, MAX_FILE_SIZE + 1] {
            let err = store.pwrite(fh, b"ab", offset).unwrap_err();
            assert_eq!(err.errno(), libc::EINVAL, "pwrite at {offset}");
        }
        let err = store.pread(fh, &mut buf, u64::MAX).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        assert_eq!(store.ftruncate(fh, u64::MAX).unwrap_err().errno(), libc::EINVAL);

        assert_eq!(store.lseek(fh, i64::MAX, Whence::Set).unwrap(), MAX_FILE_SIZE);
        assert!(store.lseek(fh, 1, Whence::Cur).is_err());
        assert_eq!(store.write(fh, b"x").unwrap_err().errno(), libc::EINVAL);

        let stat = store.fstat(fh).unwrap();
        assert_eq!(stat.size, 0);
        assert_eq!(stat.intervals, 0);
        store.close(fh).unwrap();
    }

    #[test]
    fn test_pinned_placement() {
        let (_dir, store) = store(CacheMode::Direct);
        let fh = create(&store, "/poly/pinned");
        store.fcntl(fh, FcntlCmd::SetPlacement(Device::Slow)).unwrap();
        store.write(fh, &[9u8; 100]).unwrap();

        assert_eq!(
            store.fcntl(fh, FcntlCmd::GetPlacement).unwrap(),
            FcntlResult::Placement(Placement::Slow)
        );
        let inode = store.inode("/poly/pinned").unwrap().unwrap();
        assert!(inode.index.read().iter().all(|e| e.device() == Device::Slow));
        assert!(matches!(
            store.fcntl(fh, FcntlCmd::SetPlacement(Device::Fast)),
            Err(Error::InvalidPlacement(_))
        ));
        store.fallocate(fh, 0, 4096).unwrap();

        let split = create(&store, "/poly/split");
        store.write(split, b"x").unwrap();
        assert!(store.fcntl(split, FcntlCmd::SetPlacement(Device::Slow)).is_err());
        store.fallocate(split, 0, 4096).unwrap();
        assert!(store.fallocate(split, 0, 0).is_err());
    }

    #[test]
    fn test_stat_of_unloaded_path() {
        let (dir, store) = store(CacheMode::Direct);
        std::fs::write(dir.path().join("fast/host"), b"12345").unwrap();
        std::fs::write(dir.path().join("slow/host"), b"678").unwrap();

        let stat = store.stat("/poly/host").unwrap();
        assert_eq!((stat.inode, stat.size), (None, 8));

        let fh = create(&store, "/poly/loaded");
        store.write(fh, b"abc").unwrap();
        let stat = store.stat("/poly/loaded").unwrap();
        assert_eq!(stat.size, 3);
        assert_eq!(stat.open_count, 1);
    }

    #[test]
    fn test_shutdown_writes_back() {
        let (dir, store) = store(CacheMode::Cached);
        let fh = create(&store, "/poly/persist");
        store.write(fh, b"hello").unwrap();
        assert!(std::fs::read(dir.path().join("fast/persist")).unwrap().is_empty());

        store.shutdown().unwrap();
        store.shutdown().unwrap();
        assert_eq!(store.open_files(), 0);
        let on_disk = std::fs::read(dir.path().join("fast/persist")).unwrap();
        assert_eq!(&on_disk[..5], b"hello");
    }

    #[test]
    fn test_zero_length_io() {
        let (_dir, store) = store(CacheMode::Cached);
        let fh = create(&store, "/poly/empty");
        assert_eq!(store.write(fh, &[]).unwrap(), 0);
        assert_eq!(store.read(fh, &mut []).unwrap(), 0);
        assert_eq!(store.fstat(fh).unwrap().intervals, 0);
    }

    #[test]
    fn test_caller_errors() {
        let (_dir, store) = store(CacheMode::Direct);
        let fh = create(&store, "/poly/f");
        store.close(fh).unwrap();
        assert_eq!(store.close(fh).unwrap_err().errno(), libc::EBADF);

        let ro = store.open("/poly/f", OpenFlags::read_only(), 0).unwrap();
        assert_eq!(store.write(ro, b"x").unwrap_err().errno(), libc::EINVAL);
        assert_eq!(
            store.symlink("/poly/f", "/poly/l").unwrap_err().errno(),
            libc::ENOTSUP
        );
        assert_eq!(store.lstat("/poly/f").unwrap_err().errno(), libc::ENOTSUP);
        assert!(store.open("/poly/missing", OpenFlags::read_only(), 0).unwrap_err().is_not_found());
        assert!(store.open("/elsewhere/f", OpenFlags::read_only(), 0).is_err());
    }

    #[test]
    fn test_directories() {
        let (_dir, store) = store(CacheMode::Direct);
        store.mkdir("/poly/d", 0o755).unwrap();
        let fh = create(&store, "/poly/d/f");
        store.close(fh).unwrap();
        assert!(store.rmdir("/poly/d").is_err());
        store.unlink("/poly/d/f").unwrap();
        store.rmdir("/poly/d").unwrap();
        assert!(store.access("/poly/d", libc::F_OK).is_err());
    }
}
