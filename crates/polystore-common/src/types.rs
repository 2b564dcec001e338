//! Core type definitions for PolyStore
//!
//! This module defines identifiers, device/placement tags and the node
//! geometry shared by the index, the cache and the I/O engine.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// log2 of the interval/cache-buffer granularity
pub const NODE_SHIFT: u32 = 21;
/// Interval/cache-buffer granularity (2 MiB)
pub const NODE_SIZE: u64 = 1 << NODE_SHIFT;
/// Mask selecting the node-aligned part of an offset
pub const NODE_MASK: u64 = !(NODE_SIZE - 1);

/// log2 of the page size used by the page-granularity cache
pub const PAGE_SHIFT: u32 = 12;
/// Page size (4 KiB)
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
/// Pages in one node
pub const PAGES_PER_NODE: usize = (NODE_SIZE / PAGE_SIZE) as usize;

/// Seed for path hashing
pub const PATH_HASH_SEED: u64 = 0x1234_5678;

/// Largest logical file size; offsets must fit in `off_t`
pub const MAX_FILE_SIZE: u64 = i64::MAX.unsigned_abs();

/// First byte of the node containing `offset`
#[must_use]
pub const fn node_start(offset: u64) -> u64 {
    offset & NODE_MASK
}

/// Last byte of the node containing `offset`
#[must_use]
pub const fn node_last(offset: u64) -> u64 {
    node_start(offset) + NODE_SIZE - 1
}

/// Round `value` up to the next node boundary
#[must_use]
pub const fn align_up_to_node(value: u64) -> u64 {
    (value + NODE_SIZE - 1) & NODE_MASK
}

/// Physical device tier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Low-latency device (persistent memory, NVMe)
    Fast,
    /// Capacity device (HDD, network storage)
    Slow,
}

impl Device {
    /// Both devices, fast first
    pub const ALL: [Self; 2] = [Self::Fast, Self::Slow];

    /// Array index for per-device tables
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Fast => 0,
            Self::Slow => 1,
        }
    }

    /// Human-readable name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Slow => "slow",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Placement state of a task, interval or inode
///
/// Tasks and intervals are always `Fast` or `Slow`. An inode starts out
/// `Undetermined`, may be pinned to one device, and becomes `Split` once
/// its intervals follow per-task placement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Placement {
    #[default]
    Undetermined = 0,
    Fast = 1,
    Slow = 2,
    Split = 3,
}

impl Placement {
    /// The device this placement names, if it names exactly one
    #[must_use]
    pub const fn device(self) -> Option<Device> {
        match self {
            Self::Fast => Some(Device::Fast),
            Self::Slow => Some(Device::Slow),
            Self::Undetermined | Self::Split => None,
        }
    }

    /// Decode from the value stored in an atomic
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Fast,
            2 => Self::Slow,
            3 => Self::Split,
            _ => Self::Undetermined,
        }
    }

    /// Encode for storage in an atomic
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<Device> for Placement {
    fn from(device: Device) -> Self {
        match device {
            Device::Fast => Self::Fast,
            Device::Slow => Self::Slow,
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Undetermined => "undetermined",
            Self::Fast => "fast",
            Self::Slow => "slow",
            Self::Split => "split",
        };
        f.write_str(name)
    }
}

/// Direction of an I/O or cache access
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// How data moves between callers and devices
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Positioned reads/writes straight to the device files
    Direct,
    /// Through the shared DRAM cache with background write-back
    #[default]
    Cached,
}

/// Cache admission policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    /// Every interval is admitted into a cache buffer
    #[default]
    Equal,
    /// Reads of fast-device intervals are served from a mapping of the
    /// device file instead of a cache buffer
    FastReadNoAdmit,
}

/// Unit of present/dirty tracking inside a cache buffer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheGranularity {
    /// One present/dirty flag per interval; whole-interval load and write-back
    #[default]
    Interval,
    /// Per-page bitmaps; partial loads and coalesced dirty-run write-back
    Page,
}

/// Placement policy run by the scheduler
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementPolicyKind {
    /// Initial assignment only; epochs collect statistics
    Static,
    /// Epoch-driven promotion and demotion
    #[default]
    Dynamic,
}

/// Error returned when an enum value cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl FromStr for Device {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "slow" => Ok(Self::Slow),
            _ => Err(ParseEnumError::new("device", s)),
        }
    }
}

impl FromStr for CacheMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "cached" | "cache" => Ok(Self::Cached),
            _ => Err(ParseEnumError::new("cache mode", s)),
        }
    }
}

impl FromStr for CachePolicy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "equal" | "1" => Ok(Self::Equal),
            "fast-read-no-admit" | "fastreadnoadmit" | "2" => Ok(Self::FastReadNoAdmit),
            _ => Err(ParseEnumError::new("cache policy", s)),
        }
    }
}

impl FromStr for CacheGranularity {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interval" => Ok(Self::Interval),
            "page" => Ok(Self::Page),
            _ => Err(ParseEnumError::new("cache granularity", s)),
        }
    }
}

impl FromStr for PlacementPolicyKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "dynamic" => Ok(Self::Dynamic),
            _ => Err(ParseEnumError::new("placement policy", s)),
        }
    }
}

/// Stable hash of a canonical logical path
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct PathHash(u64);

impl PathHash {
    /// Hash a canonical path
    #[must_use]
    pub fn of(path: &str) -> Self {
        Self(xxhash_rust::xxh64::xxh64(path.as_bytes(), PATH_HASH_SEED))
    }

    /// Raw hash value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for PathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathHash({:016x})", self.0)
    }
}

impl fmt::Display for PathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Opaque handle returned by `open`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Into)]
#[display("fh:{_0}")]
pub struct FileHandle(u64);

impl FileHandle {
    /// Raw handle number
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// In-memory inode number
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Into)]
#[display("ino:{_0}")]
pub struct InodeId(u64);

impl InodeId {
    /// Raw inode number
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Parse a capacity such as `512`, `64k`, `16M`, `32GiB`
///
/// Suffixes are binary multiples and case-insensitive; a trailing `b`/`ib`
/// is accepted. A bare number is a byte count.
pub fn parse_capacity(value: &str) -> Option<u64> {
    let trimmed = value.trim().to_ascii_lowercase();
    let without_b = trimmed
        .strip_suffix("ib")
        .or_else(|| trimmed.strip_suffix('b'))
        .unwrap_or(&trimmed);

    let (digits, shift) = match without_b.chars().last()? {
        'k' => (&without_b[..without_b.len() - 1], 10),
        'm' => (&without_b[..without_b.len() - 1], 20),
        'g' => (&without_b[..without_b.len() - 1], 30),
        't' => (&without_b[..without_b.len() - 1], 40),
        _ => (without_b, 0),
    };

    let number: u64 = digits.trim().parse().ok()?;
    number.checked_mul(1u64 << shift)
}
