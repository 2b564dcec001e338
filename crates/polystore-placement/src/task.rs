//! Task contexts
//!
//! A task is one OS thread doing I/O through the store. Its counters are
//! bumped by the owning thread on every read/write; the scheduler reads and
//! resets them once per epoch and flips the placement.

use derive_more::{Display, From, Into};
use polystore_common::Device;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

/// Task identifier, unique within one scheduler
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Into, Serialize)]
#[display("task:{_0}")]
pub struct TaskId(u64);

const FAST: u8 = 0;
const SLOW: u8 = 1;

/// Per-task placement state and throughput counters
#[derive(Debug)]
pub struct TaskContext {
    id: TaskId,
    name: Option<String>,
    /// Bytes read since the last epoch
    read_bytes: AtomicU64,
    /// Bytes written since the last epoch
    write_bytes: AtomicU64,
    /// Bytes moved since registration
    total_bytes: AtomicU64,
    /// Throughput measured over the last closed epoch
    last_throughput: AtomicU64,
    /// Consecutive epochs without traffic
    low_epochs: AtomicU32,
    placement: AtomicU8,
}

impl TaskContext {
    pub(crate) fn new(id: TaskId, name: Option<String>, device: Device) -> Self {
        Self {
            id,
            name,
            read_bytes: AtomicU64::new(0),
            write_bytes: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            last_throughput: AtomicU64::new(0),
            low_epochs: AtomicU32::new(0),
            placement: AtomicU8::new(encode(device)),
        }
    }

    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Thread name at registration, if any
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Device new intervals of this task are placed on
    #[must_use]
    pub fn device(&self) -> Device {
        decode(self.placement.load(Ordering::Acquire))
    }

    pub(crate) fn set_device(&self, device: Device) {
        self.placement.store(encode(device), Ordering::Release);
    }

    /// Account bytes read
    pub fn record_read(&self, bytes: u64) {
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Account bytes written
    pub fn record_write(&self, bytes: u64) {
        self.write_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_throughput(&self) -> u64 {
        self.last_throughput.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn low_epochs(&self) -> u32 {
        self.low_epochs.load(Ordering::Relaxed)
    }

    /// Reset the epoch counters and return the bytes moved during the epoch
    pub(crate) fn close_epoch(&self) -> u64 {
        let reads = self.read_bytes.swap(0, Ordering::Relaxed);
        let writes = self.write_bytes.swap(0, Ordering::Relaxed);
        let throughput = reads + writes;
        self.last_throughput.store(throughput, Ordering::Relaxed);
        if throughput == 0 {
            self.low_epochs.fetch_add(1, Ordering::Relaxed);
        } else {
            self.low_epochs.store(0, Ordering::Relaxed);
        }
        throughput
    }

    /// Point-in-time view for reporting
    #[must_use]
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            name: self.name.clone(),
            device: self.device().as_str(),
            total_bytes: self.total_bytes(),
            last_throughput: self.last_throughput(),
            low_epochs: self.low_epochs(),
        }
    }
}

/// Serializable copy of a task's state
#[derive(Clone, Debug, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: Option<String>,
    pub device: &'static str,
    pub total_bytes: u64,
    pub last_throughput: u64,
    pub low_epochs: u32,
}

const fn encode(device: Device) -> u8 {
    match device {
        Device::Fast => FAST,
        Device::Slow => SLOW,
    }
}

const fn decode(value: u8) -> Device {
    if value == FAST { Device::Fast } else { Device::Slow }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_epoch_resets_counters() {
        let task = TaskContext::new(TaskId::from(1), None, Device::Fast);
        task.record_read(100);
        task.record_write(50);

        assert_eq!(task.close_epoch(), 150);
        assert_eq!(task.last_throughput(), 150);
        assert_eq!(task.low_epochs(), 0);
        assert_eq!(task.total_bytes(), 150);

        assert_eq!(task.close_epoch(), 0);
        assert_eq!(task.close_epoch(), 0);
        assert_eq!(task.low_epochs(), 2);
        assert_eq!(task.total_bytes(), 150);

        task.record_write(1);
        task.close_epoch();
        assert_eq!(task.low_epochs(), 0);
    }

    #[test]
    fn test_device_flip() {
        let task = TaskContext::new(TaskId::from(2), Some("worker".into()), Device::Slow);
        assert_eq!(task.device(), Device::Slow);
        task.set_device(Device::Fast);
        assert_eq!(task.device(), Device::Fast);
        assert_eq!(task.snapshot().device, "fast");
        assert_eq!(task.name(), Some("worker"));
    }
}
