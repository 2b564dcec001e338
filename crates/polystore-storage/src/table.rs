//! Open file handles
//!
//! One [`OpenFile`] per successful `open`: it owns the position cursor,
//! the open flags and the two device mirrors opened for this handle, and
//! refers back to the shared [`Inode`].

use crate::inode::Inode;
use parking_lot::{Mutex, RwLock};
use polystore_common::{Device, Error, FileHandle, Result};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Subset of `open(2)` flags the store interprets
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
    pub exclusive: bool,
}

impl OpenFlags {
    /// Decode `O_*` bits
    #[must_use]
    pub const fn from_bits(bits: i32) -> Self {
        let access = bits & libc::O_ACCMODE;
        Self {
            read: access == libc::O_RDONLY || access == libc::O_RDWR,
            write: access == libc::O_WRONLY || access == libc::O_RDWR,
            create: bits & libc::O_CREAT != 0,
            truncate: bits & libc::O_TRUNC != 0,
            append: bits & libc::O_APPEND != 0,
            exclusive: bits & libc::O_EXCL != 0,
        }
    }

    /// Encode back to `O_*` bits
    #[must_use]
    pub const fn bits(&self) -> i32 {
        let mut bits = match (self.read, self.write) {
            (true, true) => libc::O_RDWR,
            (false, true) => libc::O_WRONLY,
            _ => libc::O_RDONLY,
        };
        if self.create {
            bits |= libc::O_CREAT;
        }
        if self.truncate {
            bits |= libc::O_TRUNC;
        }
        if self.append {
            bits |= libc::O_APPEND;
        }
        if self.exclusive {
            bits |= libc::O_EXCL;
        }
        bits
    }

    #[must_use]
    pub const fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            create: false,
            truncate: false,
            append: false,
            exclusive: false,
        }
    }

    #[must_use]
    pub const fn read_write() -> Self {
        Self {
            write: true,
            ..Self::read_only()
        }
    }

    #[must_use]
    pub const fn create(mut self) -> Self {
        self.create = true;
        self
    }

    #[must_use]
    pub const fn truncate(mut self) -> Self {
        self.truncate = true;
        self
    }

    #[must_use]
    pub const fn append(mut self) -> Self {
        self.append = true;
        self
    }

    #[must_use]
    pub const fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }
}

/// State of one open handle
pub struct OpenFile {
    handle: FileHandle,
    inode: Arc<Inode>,
    read: bool,
    write: bool,
    append: AtomicBool,
    devices: [File; 2],
    position: Mutex<u64>,
}

impl OpenFile {
    #[must_use]
    pub fn new(handle: FileHandle, inode: Arc<Inode>, flags: OpenFlags, fast: File, slow: File) -> Self {
        Self {
            handle,
            inode,
            read: flags.read,
            write: flags.write,
            append: AtomicBool::new(flags.append),
            devices: [fast, slow],
            position: Mutex::new(0),
        }
    }

    #[must_use]
    pub const fn handle(&self) -> FileHandle {
        self.handle
    }

    #[must_use]
    pub const fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Mirror opened for this handle on `device`
    #[must_use]
    pub const fn device(&self, device: Device) -> &File {
        &self.devices[device.index()]
    }

    #[must_use]
    pub fn is_append(&self) -> bool {
        self.append.load(Ordering::Acquire)
    }

    pub fn set_append(&self, append: bool) {
        self.append.store(append, Ordering::Release);
    }

    /// Current flags, including a toggled append mode
    #[must_use]
    pub fn flags(&self) -> OpenFlags {
        OpenFlags {
            read: self.read,
            write: self.write,
            append: self.is_append(),
            ..OpenFlags::default()
        }
    }

    pub fn check_readable(&self) -> Result<()> {
        if self.read {
            Ok(())
        } else {
            Err(Error::invalid_argument(format!("{} not open for reading", self.handle)))
        }
    }

    pub fn check_writable(&self) -> Result<()> {
        if self.write {
            Ok(())
        } else {
            Err(Error::invalid_argument(format!("{} not open for writing", self.handle)))
        }
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        *self.position.lock()
    }

    pub fn set_position(&self, position: u64) {
        *self.position.lock() = position;
    }

    /// Lock the cursor for a sequential read or write
    pub(crate) fn lock_position(&self) -> parking_lot::MutexGuard<'_, u64> {
        self.position.lock()
    }
}

impl fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenFile")
            .field("handle", &self.handle)
            .field("inode", &self.inode.id())
            .field("flags", &self.flags())
            .field("position", &self.position())
            .finish_non_exhaustive()
    }
}

/// Handle -> open file
pub struct FileTable {
    files: RwLock<HashMap<FileHandle, Arc<OpenFile>>>,
    next: AtomicU64,
}

impl FileTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    /// Reserve a fresh handle number
    pub fn next_handle(&self) -> FileHandle {
        FileHandle::from(self.next.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert(&self, file: Arc<OpenFile>) {
        self.files.write().insert(file.handle(), file);
    }

    pub fn get(&self, handle: FileHandle) -> Result<Arc<OpenFile>> {
        self.files
            .read()
            .get(&handle)
            .cloned()
            .ok_or(Error::HandleNotFound(handle))
    }

    pub fn remove(&self, handle: FileHandle) -> Result<Arc<OpenFile>> {
        self.files
            .write()
            .remove(&handle)
            .ok_or(Error::HandleNotFound(handle))
    }

    /// Remove every handle (shutdown)
    pub fn drain(&self) -> Vec<Arc<OpenFile>> {
        self.files.write().drain().map(|(_, file)| file).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}
