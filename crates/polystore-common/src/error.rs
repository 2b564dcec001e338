//! Error types for PolyStore
//!
//! This module defines the error taxonomy shared by the index, cache,
//! scheduler and the POSIX-shaped entry points.

use crate::types::{FileHandle, InodeId};
use thiserror::Error;

/// Common result type for PolyStore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for PolyStore
#[derive(Debug, Error)]
pub enum Error {
    // Lookup misses
    #[error("file handle not found: {0}")]
    HandleNotFound(FileHandle),

    #[error("inode not found: {0}")]
    InodeNotFound(String),

    #[error("no interval covers offset {offset} of {inode}")]
    IntervalNotFound { inode: InodeId, offset: u64 },

    // Resource limits
    #[error("interval index of {inode} exhausted: limit {limit} nodes")]
    IndexExhausted { inode: InodeId, limit: u32 },

    #[error("inode table exhausted: limit {limit} inodes")]
    InodeExhausted { limit: usize },

    // Device errors
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short device I/O: expected {expected} bytes, transferred {actual}")]
    ShortIo { expected: usize, actual: usize },

    // Placement
    #[error("invalid placement: {0}")]
    InvalidPlacement(String),

    // Memory
    #[error("cache buffer allocation failed: {0}")]
    AllocationFailure(String),

    // Caller errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(op: impl Into<String>) -> Self {
        Self::Unsupported(op.into())
    }

    /// Create an invalid placement error
    pub fn invalid_placement(msg: impl Into<String>) -> Self {
        Self::InvalidPlacement(msg.into())
    }

    /// Create an allocation failure
    pub fn allocation(msg: impl Into<String>) -> Self {
        Self::AllocationFailure(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a lookup miss
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::HandleNotFound(_) | Self::InodeNotFound(_) | Self::IntervalNotFound { .. } => {
                true
            }
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check if a fixed resource limit was reached
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(
            self,
            Self::IndexExhausted { .. } | Self::InodeExhausted { .. }
        )
    }

    /// POSIX errno for the syscall shim (positive; callers negate)
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::HandleNotFound(_) => libc::EBADF,
            Self::InodeNotFound(_) | Self::IntervalNotFound { .. } => libc::ENOENT,
            Self::IndexExhausted { .. } => libc::EFBIG,
            Self::InodeExhausted { .. } => libc::ENFILE,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::ShortIo { .. } | Self::Internal(_) => libc::EIO,
            Self::InvalidPlacement(_) | Self::InvalidArgument(_) | Self::Configuration(_) => {
                libc::EINVAL
            }
            Self::AllocationFailure(_) => libc::ENOMEM,
            Self::Unsupported(_) => libc::ENOTSUP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        assert!(Error::HandleNotFound(FileHandle::from(7)).is_not_found());
        assert!(Error::InodeNotFound("a/b".into()).is_not_found());
        let io = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(Error::from(io).is_not_found());
        assert!(!Error::internal("x").is_not_found());
    }

    #[test]
    fn test_error_exhausted() {
        let err = Error::IndexExhausted {
            inode: InodeId::from(1),
            limit: 4,
        };
        assert!(err.is_exhausted());
        assert!(Error::InodeExhausted { limit: 2 }.is_exhausted());
        assert!(!Error::allocation("full").is_exhausted());
    }

    #[test]
    fn test_error_errno() {
        assert_eq!(Error::HandleNotFound(FileHandle::from(3)).errno(), libc::EBADF);
        assert_eq!(Error::unsupported("symlink").errno(), libc::ENOTSUP);
        assert_eq!(Error::allocation("slab").errno(), libc::ENOMEM);
        assert_eq!(
            Error::ShortIo {
                expected: 10,
                actual: 3
            }
            .errno(),
            libc::EIO
        );
        let denied = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(Error::from(denied).errno(), libc::EACCES);
    }
}
