//! Configuration types for PolyStore
//!
//! Every section has a `Default` tuned for a single host with one fast and
//! one slow device. Deployments override values from a TOML file (see the
//! CLI) and from `POLYSTORE_*` / `POLYCACHE_*` environment variables.

use crate::error::{Error, Result};
use crate::types::{
    CacheGranularity, CacheMode, CachePolicy, NODE_SIZE, PlacementPolicyKind, parse_capacity,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Root configuration for PolyStore
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device mirror roots
    pub mounts: MountConfig,
    /// Task placement scheduling
    pub placement: PlacementConfig,
    /// DRAM cache and write-back
    pub cache: CacheConfig,
    /// Fixed table sizes
    pub limits: LimitsConfig,
}

impl Config {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Override fields from an arbitrary variable source
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("POLYSTORE_FAST_ROOT") {
            self.mounts.fast_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("POLYSTORE_SLOW_ROOT") {
            self.mounts.slow_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("POLYSTORE_LOGICAL_ROOT") {
            self.mounts.logical_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("POLYSTORE_SCHED_SPLIT_POINT") {
            self.placement.split_point = parse_number("POLYSTORE_SCHED_SPLIT_POINT", &v)?;
        }
        if let Some(v) = lookup("POLYSTORE_SCHED_POLICY") {
            self.placement.policy = parse_enum("POLYSTORE_SCHED_POLICY", &v)?;
        }
        if let Some(v) = lookup("POLYSTORE_CACHE_MODE") {
            self.cache.mode = parse_enum("POLYSTORE_CACHE_MODE", &v)?;
        }
        if let Some(v) = lookup("POLYCACHE_POLICY") {
            self.cache.policy = parse_enum("POLYCACHE_POLICY", &v)?;
        }
        if let Some(v) = lookup("POLYCACHE_GRANULARITY") {
            self.cache.granularity = parse_enum("POLYCACHE_GRANULARITY", &v)?;
        }
        if let Some(v) = lookup("POLYCACHE_FLUSHING_BEGIN") {
            self.cache.flush_high_water = parse_bytes("POLYCACHE_FLUSHING_BEGIN", &v)?;
        }
        if let Some(v) = lookup("POLYCACHE_FLUSHING_END") {
            self.cache.flush_low_water = parse_bytes("POLYCACHE_FLUSHING_END", &v)?;
        }
        if let Some(v) = lookup("POLYCACHE_FLUSH_WORKERS") {
            self.cache.flush_workers = parse_number("POLYCACHE_FLUSH_WORKERS", &v)?;
        }
        Ok(())
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.mounts.fast_root.as_os_str().is_empty()
            || self.mounts.slow_root.as_os_str().is_empty()
        {
            return Err(Error::configuration("fast and slow roots must be set"));
        }
        if self.mounts.fast_root == self.mounts.slow_root {
            return Err(Error::configuration(
                "fast and slow roots must be different directories",
            ));
        }
        if self.placement.epoch_interval_ms == 0 {
            return Err(Error::configuration("epoch interval must be non-zero"));
        }
        self.cache.validate()?;
        if self.limits.max_inodes == 0 || self.limits.max_index_nodes == 0 {
            return Err(Error::configuration("table limits must be non-zero"));
        }
        Ok(())
    }
}

/// Device mirror roots
///
/// Every logical path exists twice, once under each root.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Root of the fast-device mirror
    pub fast_root: PathBuf,
    /// Root of the slow-device mirror
    pub slow_root: PathBuf,
    /// Logical prefix stripped from absolute paths
    pub logical_root: PathBuf,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            fast_root: PathBuf::from("/mnt/pmem/polystore"),
            slow_root: PathBuf::from("/mnt/hdd/polystore"),
            logical_root: PathBuf::from("/polystore"),
        }
    }
}

/// Task placement scheduling
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Number of tasks allowed on the fast device at once
    pub split_point: usize,
    /// Static or dynamic policy
    pub policy: PlacementPolicyKind,
    /// Epoch length (milliseconds)
    pub epoch_interval_ms: u64,
    /// Run epochs on a background thread; otherwise only on demand
    pub background_epochs: bool,
    /// Idle epochs before a fast task is demoted
    pub low_throughput_epochs: u32,
    /// Cumulative bytes after which the static policy demotes a fast task
    pub static_demote_threshold: Option<u64>,
}

impl PlacementConfig {
    /// Epoch length as a `Duration`
    #[must_use]
    pub const fn epoch_interval(&self) -> Duration {
        Duration::from_millis(self.epoch_interval_ms)
    }
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            split_point: 1,
            policy: PlacementPolicyKind::Dynamic,
            epoch_interval_ms: 200,
            background_epochs: true,
            low_throughput_epochs: 16,
            static_demote_threshold: None,
        }
    }
}

/// DRAM cache and write-back
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Direct device I/O or cached
    pub mode: CacheMode,
    /// Admission policy
    pub policy: CachePolicy,
    /// Present/dirty tracking unit
    pub granularity: CacheGranularity,
    /// Cached bytes above which a flush is dispatched
    pub flush_high_water: u64,
    /// Cached bytes a dispatch tries to get below
    pub flush_low_water: u64,
    /// Flush worker queues (power of two)
    pub flush_workers: usize,
    /// Buffer pool shards
    pub buffer_shards: usize,
    /// Node-sized buffers per shard
    pub buffer_slots_per_shard: usize,
    /// Move re-accessed intervals from the cold to the hot list
    pub promote_on_reaccess: bool,
}

impl CacheConfig {
    /// Total bytes the buffer pool can hand out
    #[must_use]
    pub const fn buffer_capacity(&self) -> u64 {
        (self.buffer_shards * self.buffer_slots_per_shard) as u64 * NODE_SIZE
    }

    fn validate(&self) -> Result<()> {
        if self.flush_low_water >= self.flush_high_water {
            return Err(Error::configuration(format!(
                "flush low water mark ({}) must be below high water mark ({})",
                self.flush_low_water, self.flush_high_water
            )));
        }
        if !self.flush_workers.is_power_of_two() {
            return Err(Error::configuration(format!(
                "flush workers must be a power of two, got {}",
                self.flush_workers
            )));
        }
        if self.buffer_shards == 0 || self.buffer_slots_per_shard == 0 {
            return Err(Error::configuration("buffer pool must have capacity"));
        }
        if self.mode == CacheMode::Cached && self.buffer_capacity() <= self.flush_high_water {
            return Err(Error::configuration(format!(
                "buffer pool ({} bytes) must exceed the flush high water mark ({})",
                self.buffer_capacity(),
                self.flush_high_water
            )));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Cached,
            policy: CachePolicy::Equal,
            granularity: CacheGranularity::Interval,
            flush_high_water: 8 * 1024 * 1024 * 1024, // 8 GB
            flush_low_water: 4 * 1024 * 1024 * 1024,  // 4 GB
            flush_workers: 2,
            buffer_shards: 8,
            buffer_slots_per_shard: 1024, // 16 GB total
            promote_on_reaccess: false,
        }
    }
}

/// Fixed table sizes
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Inodes held in memory at once
    pub max_inodes: usize,
    /// Interval nodes per inode
    pub max_index_nodes: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_inodes: 32_768,
            max_index_nodes: 65_536,
        }
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::configuration(format!("{key}: not a number: {value}")))
}

fn parse_enum<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| Error::configuration(format!("{key}: {e}")))
}

fn parse_bytes(key: &str, value: &str) -> Result<u64> {
    parse_capacity(value)
        .ok_or_else(|| Error::configuration(format!("{key}: not a capacity: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.placement.split_point, 1);
        assert_eq!(config.placement.epoch_interval(), Duration::from_millis(200));
        assert_eq!(config.cache.flush_workers, 2);
        assert_eq!(config.limits.max_index_nodes, 65_536);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("POLYSTORE_FAST_ROOT", "/tmp/fast"),
            ("POLYSTORE_SCHED_SPLIT_POINT", "4"),
            ("POLYSTORE_CACHE_MODE", "direct"),
            ("POLYCACHE_POLICY", "fast-read-no-admit"),
            ("POLYCACHE_FLUSHING_BEGIN", "64m"),
            ("POLYCACHE_FLUSHING_END", "32m"),
            ("POLYCACHE_FLUSH_WORKERS", "4"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env_from(|key| vars.get(key).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.mounts.fast_root, PathBuf::from("/tmp/fast"));
        assert_eq!(config.placement.split_point, 4);
        assert_eq!(config.cache.mode, CacheMode::Direct);
        assert_eq!(config.cache.policy, CachePolicy::FastReadNoAdmit);
        assert_eq!(config.cache.flush_high_water, 64 << 20);
        assert_eq!(config.cache.flush_low_water, 32 << 20);
        assert_eq!(config.cache.flush_workers, 4);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = Config::default();
        let err = config
            .apply_env_from(|key| (key == "POLYCACHE_FLUSHING_BEGIN").then(|| "huge".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_validate_rejects_inverted_water_marks() {
        let mut config = Config::default();
        config.cache.flush_low_water = config.cache.flush_high_water;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_odd_worker_count() {
        let mut config = Config::default();
        config.cache.flush_workers = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_small_pool() {
        let mut config = Config::default();
        config.cache.buffer_shards = 1;
        config.cache.buffer_slots_per_shard = 4;
        assert!(config.validate().is_err());

        config.cache.mode = CacheMode::Direct;
        config.validate().unwrap();
    }

    #[test]
    fn test_config_json_round_trip_keeps_sections() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.cache.flush_high_water, config.cache.flush_high_water);

        let partial: Config = serde_json::from_str(r#"{"placement":{"split_point":3}}"#).unwrap();
        assert_eq!(partial.placement.split_point, 3);
        assert_eq!(partial.placement.low_throughput_epochs, 16);
    }
}
