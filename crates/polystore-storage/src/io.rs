//! Read/write engine
//!
//! Walks a file's interval index to serve arbitrary-offset, arbitrary-length
//! reads and writes. Existing intervals are served under the index read
//! lock; holes in a write are filled with freshly allocated intervals under
//! the write lock. The device operation for each interval is delegated to
//! an [`IoBackend`]: direct positioned I/O on the mirrors, or the DRAM cache.
//!
//! Partial progress is a normal outcome: when an interval fails after some
//! bytes were transferred, the call returns the byte count so far.

use crate::cache::CacheEngine;
use crate::index::IntervalEntry;
use crate::raw_io::{read_full_at, write_full_at};
use crate::table::OpenFile;
use polystore_common::{CacheMode, Direction, Error, MAX_FILE_SIZE, Result};
use polystore_placement::PlacementScheduler;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Reject offsets a file cannot reach
pub(crate) fn check_offset(offset: u64) -> Result<()> {
    if offset > MAX_FILE_SIZE {
        return Err(Error::invalid_argument(format!(
            "offset {offset} is past the file size limit"
        )));
    }
    Ok(())
}

/// End of `len` bytes at `start`, if it stays within the file size limit
fn span_end(start: u64, len: usize) -> Result<u64> {
    start
        .checked_add(len as u64)
        .filter(|&end| end <= MAX_FILE_SIZE)
        .ok_or_else(|| {
            Error::invalid_argument(format!("{len} bytes at {start} exceed the file size limit"))
        })
}

/// Device operation on one interval
///
/// `rel` is relative to the interval start; the caller guarantees the
/// range lies inside the interval (and, for reads, inside its filled size).
pub trait IoBackend: Send + Sync {
    fn mode(&self) -> CacheMode;

    fn read(&self, file: &OpenFile, entry: &Arc<IntervalEntry>, rel: u64, buf: &mut [u8])
    -> Result<usize>;

    fn write(&self, file: &OpenFile, entry: &Arc<IntervalEntry>, rel: u64, buf: &[u8])
    -> Result<usize>;

    /// Called once after every write that transferred bytes
    fn write_completed(&self) {}
}

/// Positioned I/O straight to the handle's mirror files
#[derive(Debug, Default)]
pub struct DirectIo;

impl IoBackend for DirectIo {
    fn mode(&self) -> CacheMode {
        CacheMode::Direct
    }

    fn read(
        &self,
        file: &OpenFile,
        entry: &Arc<IntervalEntry>,
        rel: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let device = file.device(entry.device());
        let n = read_full_at(device, buf, entry.offset() + rel)?;
        // Filled bytes past the mirror's end were never written: zeros
        buf[n..].fill(0);
        Ok(buf.len())
    }

    fn write(
        &self,
        file: &OpenFile,
        entry: &Arc<IntervalEntry>,
        rel: u64,
        buf: &[u8],
    ) -> Result<usize> {
        let device = file.device(entry.device());
        write_full_at(device, buf, entry.offset() + rel)?;
        entry.grow_size(rel + buf.len() as u64);
        Ok(buf.len())
    }
}

/// I/O through the shared cache
pub struct CachedIo {
    cache: Arc<CacheEngine>,
}

impl CachedIo {
    #[must_use]
    pub const fn new(cache: Arc<CacheEngine>) -> Self {
        Self { cache }
    }
}

impl IoBackend for CachedIo {
    fn mode(&self) -> CacheMode {
        CacheMode::Cached
    }

    fn read(
        &self,
        _file: &OpenFile,
        entry: &Arc<IntervalEntry>,
        rel: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let mut slot = entry.lock_slot();
        let rel_end = rel + buf.len() as u64 - 1;
        self.cache.admit(entry, &mut slot, rel, rel_end, Direction::Read)?;

        let begin = rel as usize;
        let src = slot.data().get(begin..begin + buf.len()).ok_or_else(|| {
            Error::internal(format!("cache slot of node {} too short", entry.node()))
        })?;
        buf.copy_from_slice(src);
        Ok(buf.len())
    }

    fn write(
        &self,
        _file: &OpenFile,
        entry: &Arc<IntervalEntry>,
        rel: u64,
        buf: &[u8],
    ) -> Result<usize> {
        let mut slot = entry.lock_slot();
        let rel_end = rel + buf.len() as u64 - 1;
        self.cache.admit(entry, &mut slot, rel, rel_end, Direction::Write)?;

        let begin = rel as usize;
        let dst = slot
            .data_mut()
            .and_then(|data| data.get_mut(begin..begin + buf.len()))
            .ok_or_else(|| Error::internal(format!("no writable buffer for node {}", entry.node())))?;
        dst.copy_from_slice(buf);
        Ok(buf.len())
    }

    fn write_completed(&self) {
        self.cache.write_completed();
    }
}

/// I/O counters
#[derive(Debug, Default)]
pub struct IoStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub intervals_allocated: AtomicU64,
    /// Calls that returned fewer bytes than requested after an error
    pub partial: AtomicU64,
}

impl IoStats {
    #[must_use]
    pub fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            intervals_allocated: self.intervals_allocated.load(Ordering::Relaxed),
            partial: self.partial.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`IoStats`]
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct IoStatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub intervals_allocated: u64,
    pub partial: u64,
}

/// Interval walker shared by both backends
pub struct IoEngine {
    backend: Box<dyn IoBackend>,
    scheduler: Arc<PlacementScheduler>,
    stats: IoStats,
}

impl IoEngine {
    #[must_use]
    pub fn new(backend: Box<dyn IoBackend>, scheduler: Arc<PlacementScheduler>) -> Self {
        Self {
            backend,
            scheduler,
            stats: IoStats::default(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> CacheMode {
        self.backend.mode()
    }

    #[must_use]
    pub const fn stats(&self) -> &IoStats {
        &self.stats
    }

    /// Read at `offset`, or at and past the handle's position when `None`
    pub fn read(&self, file: &OpenFile, buf: &mut [u8], offset: Option<u64>) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut cursor = offset.is_none().then(|| file.lock_position());
        let start = offset.unwrap_or_else(|| cursor.as_deref().copied().unwrap_or(0));
        check_offset(start)?;

        let copied = self.read_span(file, buf, start)?;
        if let Some(position) = cursor.as_deref_mut() {
            *position = start + copied as u64;
        }

        self.scheduler.current_task().record_read(copied as u64);
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_read.fetch_add(copied as u64, Ordering::Relaxed);
        Ok(copied)
    }

    /// Copy `[start, start + buf.len())` clipped to the logical size
    ///
    /// Reads stop only at the logical size, never at an interval's filled
    /// size: a gap before an interval, the unfilled tail of an interval and
    /// a missing node all read as zeros while they lie below the size.
    fn read_span(&self, file: &OpenFile, buf: &mut [u8], start: u64) -> Result<usize> {
        let inode = file.inode();
        let size = inode.size();
        if start >= size {
            return Ok(0);
        }
        let count = (buf.len() as u64).min(size - start) as usize;
        let last = start + count as u64 - 1;

        let index = inode.index.read();
        let mut copied = 0usize;
        let mut next = index.lookup(start, last);

        while copied < count {
            let cursor = start + copied as u64;
            let Some(entry) = next.take() else {
                buf[copied..count].fill(0);
                copied = count;
                break;
            };
            if entry.start() > cursor {
                let gap = (entry.start() - cursor) as usize;
                buf[copied..copied + gap].fill(0);
                copied += gap;
            }

            let cursor = start + copied as u64;
            let rel = cursor - entry.start();
            let entry_last = last.min(entry.last());
            let filled = entry.size();
            if rel < filled {
                let span_last = entry_last.min(entry.start() + filled - 1);
                let len = (span_last - cursor + 1) as usize;
                match self.backend.read(file, &entry, rel, &mut buf[copied..copied + len]) {
                    Ok(n) => {
                        copied += n;
                        if n < len {
                            break;
                        }
                    }
                    Err(e) if copied > 0 => {
                        warn!(inode = %inode.id(), node = entry.node(), error = %e, copied, "partial read");
                        self.stats.partial.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }

            // Past the filled size but below the logical size
            let cursor = start + copied as u64;
            if cursor <= entry_last {
                let tail = (entry_last - cursor + 1) as usize;
                buf[copied..copied + tail].fill(0);
                copied += tail;
            }
            next = index.lookup_next(&entry, start + copied as u64, last);
        }
        Ok(copied)
    }

    /// Write at `offset`, or at and past the handle's position when `None`
    ///
    /// Handles opened for append always write at the end of the file.
    pub fn write(&self, file: &OpenFile, buf: &[u8], offset: Option<u64>) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if file.is_append() {
            return self.append(file, buf);
        }
        let mut cursor = offset.is_none().then(|| file.lock_position());
        let start = offset.unwrap_or_else(|| cursor.as_deref().copied().unwrap_or(0));

        let written = self.write_span(file, buf, Some(start))?;
        if let Some(position) = cursor.as_deref_mut() {
            *position = start + written as u64;
        }
        Ok(written)
    }

    /// Write past the current logical size and move the position there
    pub fn append(&self, file: &OpenFile, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut position = file.lock_position();
        let written = self.write_span(file, buf, None)?;
        *position = file.inode().size();
        Ok(written)
    }

    /// Positioned write that ignores append mode and leaves the cursor alone
    pub(crate) fn write_at(&self, file: &OpenFile, buf: &[u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.write_span(file, buf, Some(offset))
    }

    /// `start` of `None` appends
    fn write_span(&self, file: &OpenFile, buf: &[u8], start: Option<u64>) -> Result<usize> {
        let inode = file.inode();
        span_end(start.unwrap_or_else(|| inode.size()), buf.len())?;
        let task = self.scheduler.current_task();
        let mut copied = 0usize;
        let mut failure = None;

        // Intervals that already exist, under the read lock
        if let Some(start) = start {
            let last = start + buf.len() as u64 - 1;
            let index = inode.index.read();
            let mut next = index.lookup(start, last);
            while let Some(entry) = next {
                let cursor = start + copied as u64;
                if entry.start() > cursor {
                    break;
                }
                match self.write_segment(file, &entry, cursor, &buf[copied..]) {
                    Ok(n) => copied += n,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
                if copied == buf.len() {
                    break;
                }
                next = index.lookup_next(&entry, start + copied as u64, last);
            }
        }

        // Holes, under the write lock
        if failure.is_none() && copied < buf.len() {
            let mut index = inode.index.write();
            let start = match start {
                Some(start) => start,
                // Appenders are serialized here; the size may have moved
                None => {
                    let size = inode.size();
                    span_end(size, buf.len())?;
                    size
                }
            };
            while copied < buf.len() {
                let cursor = start + copied as u64;
                let entry = match index.lookup(cursor, cursor) {
                    Some(entry) => entry,
                    None => {
                        let device = inode.device_for_new_interval(task.device());
                        let allocated = file
                            .device(device)
                            .metadata()
                            .map_err(Error::from)
                            .and_then(|meta| {
                                let offset = inode.reserve_device_offset(device, meta.len());
                                index.allocate_entry(cursor, device, offset, Arc::clone(inode.files()))
                            })
                            .and_then(|entry| index.insert(Arc::clone(&entry)).map(|()| entry));
                        match allocated {
                            Ok(entry) => {
                                self.stats.intervals_allocated.fetch_add(1, Ordering::Relaxed);
                                debug!(
                                    inode = %inode.id(),
                                    node = entry.node(),
                                    start = entry.start(),
                                    %device,
                                    offset = entry.offset(),
                                    "interval allocated"
                                );
                                entry
                            }
                            Err(e) => {
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                };
                match self.write_segment(file, &entry, cursor, &buf[copied..]) {
                    Ok(n) => copied += n,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            if copied > 0 {
                inode.grow_size(start + copied as u64);
            }
        } else if let Some(start) = start
            && copied > 0
        {
            inode.grow_size(start + copied as u64);
        }

        if let Some(e) = failure {
            if copied == 0 {
                return Err(e);
            }
            warn!(inode = %inode.id(), error = %e, copied, "partial write");
            self.stats.partial.fetch_add(1, Ordering::Relaxed);
        }

        inode.mark_written();
        task.record_write(copied as u64);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_written.fetch_add(copied as u64, Ordering::Relaxed);
        self.backend.write_completed();
        Ok(copied)
    }

    /// Write the part of `buf` that falls into `entry`, starting at `cursor`
    fn write_segment(
        &self,
        file: &OpenFile,
        entry: &Arc<IntervalEntry>,
        cursor: u64,
        buf: &[u8],
    ) -> Result<usize> {
        let rel = cursor - entry.start();
        let len = (buf.len() as u64).min(entry.last() - cursor + 1) as usize;
        self.backend.write(file, entry, rel, &buf[..len])
    }
}

impl std::fmt::Debug for IoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoEngine")
            .field("mode", &self.mode())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
