//! Host directory service
//!
//! The store never owns a namespace of its own: every logical path is
//! mirrored under a fast-device root and a slow-device root, and the
//! [`HostDirectory`] trait is the seam through which paths are resolved
//! and mirrors are created, renamed and removed.

use crate::table::OpenFlags;
use nix::unistd::{AccessFlags, access};
use polystore_common::{Device, Error, MountConfig, Result};
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Mirror files opened for one handle
#[derive(Debug)]
pub struct DevicePair {
    pub fast: File,
    pub slow: File,
}

/// Path registrar and namespace operations
pub trait HostDirectory: Send + Sync {
    /// Canonical logical path (root-relative, `/`-separated)
    fn canonicalize(&self, path: &Path) -> Result<String>;

    /// Mirror paths of a canonical path, fast first
    fn device_paths(&self, logical: &str) -> [PathBuf; 2];

    /// Open (and with `create`, create) both mirrors
    fn open(&self, logical: &str, flags: OpenFlags, mode: u32) -> Result<DevicePair>;

    /// Last handle to a path was closed
    fn close(&self, logical: &str) -> Result<()>;

    fn rename(&self, from: &str, to: &str) -> Result<()>;

    fn unlink(&self, logical: &str) -> Result<()>;

    fn mkdir(&self, logical: &str, mode: u32) -> Result<()>;

    fn rmdir(&self, logical: &str) -> Result<()>;

    /// `access(2)` against the fast mirror
    fn access(&self, logical: &str, mode: i32) -> Result<()>;

    /// Sum of the mirror lengths
    fn mirror_len(&self, logical: &str) -> Result<u64>;
}

/// Two plain directories mirroring every logical path
#[derive(Clone, Debug)]
pub struct MirrorDirectory {
    fast_root: PathBuf,
    slow_root: PathBuf,
    logical_root: PathBuf,
}

impl MirrorDirectory {
    #[must_use]
    pub fn new(config: &MountConfig) -> Self {
        Self {
            fast_root: config.fast_root.clone(),
            slow_root: config.slow_root.clone(),
            logical_root: config.logical_root.clone(),
        }
    }

    /// Create both roots if missing
    pub fn ensure_roots(&self) -> Result<()> {
        fs::create_dir_all(&self.fast_root)?;
        fs::create_dir_all(&self.slow_root)?;
        Ok(())
    }

    #[must_use]
    pub fn root(&self, device: Device) -> &Path {
        match device {
            Device::Fast => &self.fast_root,
            Device::Slow => &self.slow_root,
        }
    }

    fn open_one(path: &Path, flags: OpenFlags, mode: u32) -> Result<File> {
        let mut options = OpenOptions::new();
        options
            .read(true)
            .write(flags.write || flags.create)
            .mode(mode);
        if flags.create && flags.exclusive {
            options.create_new(true);
        } else {
            options.create(flags.create);
        }
        Ok(options.open(path)?)
    }
}

impl HostDirectory for MirrorDirectory {
    fn canonicalize(&self, path: &Path) -> Result<String> {
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.logical_root).map_err(|_| {
                Error::invalid_argument(format!(
                    "{} is outside {}",
                    path.display(),
                    self.logical_root.display()
                ))
            })?
        } else {
            path
        };

        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                    Error::invalid_argument(format!("{} is not UTF-8", path.display()))
                })?),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(Error::invalid_argument(format!(
                        "{} escapes the store",
                        path.display()
                    )));
                }
            }
        }
        Ok(parts.join("/"))
    }

    fn device_paths(&self, logical: &str) -> [PathBuf; 2] {
        [self.fast_root.join(logical), self.slow_root.join(logical)]
    }

    fn open(&self, logical: &str, flags: OpenFlags, mode: u32) -> Result<DevicePair> {
        let [fast, slow] = self.device_paths(logical);
        let fast = Self::open_one(&fast, flags, mode)?;
        // The slow mirror follows the fast one, which already enforced O_EXCL
        let slow = Self::open_one(
            &slow,
            OpenFlags {
                exclusive: false,
                ..flags
            },
            mode,
        )?;
        Ok(DevicePair { fast, slow })
    }

    fn close(&self, logical: &str) -> Result<()> {
        debug!(path = logical, "host close");
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let [from_fast, from_slow] = self.device_paths(from);
        let [to_fast, to_slow] = self.device_paths(to);
        fs::rename(from_fast, to_fast)?;
        match fs::rename(from_slow, to_slow) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn unlink(&self, logical: &str) -> Result<()> {
        let [fast, slow] = self.device_paths(logical);
        fs::remove_file(fast)?;
        match fs::remove_file(slow) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn mkdir(&self, logical: &str, mode: u32) -> Result<()> {
        let mut builder = DirBuilder::new();
        builder.mode(mode);
        for path in self.device_paths(logical) {
            builder.create(path)?;
        }
        Ok(())
    }

    fn rmdir(&self, logical: &str) -> Result<()> {
        for path in self.device_paths(logical) {
            fs::remove_dir(path)?;
        }
        Ok(())
    }

    fn access(&self, logical: &str, mode: i32) -> Result<()> {
        let [fast, _] = self.device_paths(logical);
        access(&fast, AccessFlags::from_bits_truncate(mode))
            .map_err(|errno| Error::Io(errno.into()))
    }

    fn mirror_len(&self, logical: &str) -> Result<u64> {
        let mut total = 0;
        for path in self.device_paths(logical) {
            match fs::metadata(path) {
                Ok(meta) => total += meta.len(),
                Err(e) if e.kind() == ErrorKind::NotFound && total > 0 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }
}
