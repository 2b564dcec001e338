//! Positioned device I/O
//!
//! Thin helpers over the mirror files on the fast and slow devices:
//! - Full-length positioned reads that stop at end of file
//! - Full-length positioned writes that report short transfers
//! - Space preallocation and read-only shared mappings (Linux)

use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use polystore_common::{Error, PAGE_SIZE, Result};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::ptr::NonNull;
use tracing::warn;

/// Open a device mirror for reading and writing
pub fn open_mirror(path: &Path, create: bool, mode: u32) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(create).mode(mode);
    options.open(path).map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            Error::InodeNotFound(path.display().to_string())
        } else {
            Error::Io(e)
        }
    })
}

/// Read up to `buf.len()` bytes at `offset`
///
/// Returns fewer bytes only at end of file.
pub fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(done)
}

/// Write all of `buf` at `offset`
pub fn write_full_at(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match file.write_at(&buf[done..], offset + done as u64) {
            Ok(0) => {
                warn!(offset, expected = buf.len(), actual = done, "short device write");
                return Err(Error::ShortIo {
                    expected: buf.len(),
                    actual: done,
                });
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Reserve `len` bytes at `offset`
#[cfg(target_os = "linux")]
pub fn preallocate(file: &File, offset: u64, len: u64) -> Result<()> {
    use nix::fcntl::{FallocateFlags, fallocate};
    use std::os::fd::AsRawFd;

    let offset = libc::off_t::try_from(offset)
        .map_err(|_| Error::invalid_argument(format!("offset {offset} out of range")))?;
    let len = libc::off_t::try_from(len)
        .map_err(|_| Error::invalid_argument(format!("length {len} out of range")))?;
    fallocate(file.as_raw_fd(), FallocateFlags::empty(), offset, len)
        .map_err(|errno| Error::Io(errno.into()))
}

/// Reserve `len` bytes at `offset` (extends the file on other platforms)
#[cfg(not(target_os = "linux"))]
pub fn preallocate(file: &File, offset: u64, len: u64) -> Result<()> {
    let end = offset + len;
    if file.metadata()?.len() < end {
        file.set_len(end)?;
    }
    Ok(())
}

/// Read-only shared mapping of part of a device file
pub struct MappedRegion {
    ptr: NonNull<c_void>,
    len: usize,
}

// SAFETY: the mapping is read-only and owned by this value until drop.
unsafe impl Send for MappedRegion {}
// SAFETY: only `&[u8]` is handed out.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map up to `max_len` bytes at page-aligned `offset`, clamped to the file size
    ///
    /// Returns `None` when nothing lies past `offset`.
    pub fn map(file: &File, offset: u64, max_len: usize) -> Result<Option<Self>> {
        if offset % PAGE_SIZE != 0 {
            return Err(Error::invalid_argument(format!(
                "mapping offset {offset} is not page aligned"
            )));
        }
        let file_len = file.metadata()?.len();
        let available = usize::try_from(file_len.saturating_sub(offset)).unwrap_or(usize::MAX);
        let Some(length) = NonZeroUsize::new(available.min(max_len)) else {
            return Ok(None);
        };
        let file_offset = libc::off_t::try_from(offset)
            .map_err(|_| Error::invalid_argument(format!("offset {offset} out of range")))?;

        // SAFETY: a fresh shared read-only mapping that aliases no Rust object;
        // the length never reaches past end of file.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                file,
                file_offset,
            )
        }
        .map_err(|errno| Error::Io(errno.into()))?;

        Ok(Some(Self {
            ptr,
            len: length.get(),
        }))
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len readable bytes until munmap in drop.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe a mapping created in `map` and not yet unmapped.
        if let Err(errno) = unsafe { munmap(self.ptr, self.len) } {
            warn!(len = self.len, %errno, "munmap failed");
        }
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_stops_at_eof() {
        let temp = NamedTempFile::new().unwrap();
        let file = open_mirror(temp.path(), false, 0o644).unwrap();
        write_full_at(&file, b"test data pattern", 0).unwrap();

        let mut buf = vec![0xffu8; 64];
        let n = read_full_at(&file, &mut buf, 5).unwrap();
        assert_eq!(n, 12);
        assert_eq!(&buf[..n], b"data pattern");
        assert_eq!(read_full_at(&file, &mut buf, 1000).unwrap(), 0);
    }

    #[test]
    fn test_open_missing_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_mirror(&dir.path().join("absent"), false, 0o644).unwrap_err();
        assert!(err.is_not_found());
        assert!(open_mirror(&dir.path().join("created"), true, 0o644).is_ok());
    }

    #[test]
    fn test_mapping_is_clamped_to_file() {
        let temp = NamedTempFile::new().unwrap();
        let file = open_mirror(temp.path(), false, 0o644).unwrap();
        write_full_at(&file, &[7u8; 5000], 0).unwrap();

        let region = MappedRegion::map(&file, 0, 1 << 21).unwrap().unwrap();
        assert_eq!(region.len(), 5000);
        assert!(region.as_slice().iter().all(|&b| b == 7));

        assert!(MappedRegion::map(&file, 8192, 4096).unwrap().is_none());
        assert!(MappedRegion::map(&file, 100, 4096).is_err());
    }

    #[test]
    fn test_preallocate_extends() {
        let temp = NamedTempFile::new().unwrap();
        let file = open_mirror(temp.path(), false, 0o644).unwrap();
        preallocate(&file, 0, 8192).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 8192);
    }
}
