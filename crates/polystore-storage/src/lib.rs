//! PolyStore Storage - interval index, DRAM cache and I/O engine
//!
//! This crate implements the storage core of PolyStore:
//! - Per-file interval indexes mapping logical ranges to a device and offset
//! - Read/write walking of those indexes, allocating intervals for holes
//! - A shared DRAM cache with cold/hot LRU lists and parallel write-back
//! - Inode and open-file tables
//! - POSIX-shaped entry points over two mirrored host directories
//!
//! # Example
//! ```ignore
//! use polystore_storage::{OpenFlags, PolyStore};
//!
//! let store = PolyStore::new(config)?;
//! let fh = store.open("/polystore/data", OpenFlags::read_write().create(), 0o644)?;
//! store.write(fh, b"hello")?;
//! store.close(fh)?;
//! ```

pub mod buffer;
pub mod cache;
pub mod fs;
pub mod host;
pub mod index;
pub mod inode;
pub mod io;
pub mod lru;
pub mod raw_io;
pub mod table;

// Re-exports
pub use buffer::{BufferPool, CacheBuf, PoolStats, PoolUsage};
pub use cache::{CacheEngine, CacheSlot, CacheStats, CacheStatsSnapshot};
pub use fs::{FcntlCmd, FcntlResult, FileStat, PolyStore, Whence};
pub use host::{DevicePair, HostDirectory, MirrorDirectory};
pub use index::{IntervalEntry, IntervalIndex};
pub use inode::{DeviceFiles, Inode, InodeTable};
pub use io::{CachedIo, DirectIo, IoBackend, IoEngine, IoStats, IoStatsSnapshot};
pub use lru::{LruList, Walk};
pub use raw_io::MappedRegion;
pub use table::{FileTable, OpenFile, OpenFlags};
