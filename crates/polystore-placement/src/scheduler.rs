//! Task registry and epoch loop
//!
//! Threads register lazily on their first I/O through
//! [`PlacementScheduler::current_task`] and deregister when the thread
//! exits. The epoch loop runs the configured policy over every registered
//! task at a fixed interval; tests and embedders can also drive it by
//! calling [`PlacementScheduler::run_epoch`] directly.

use crate::policy::{EpochSample, PlacementPolicy, PolicyAction};
use crate::task::{TaskContext, TaskId, TaskSnapshot};
use parking_lot::{Mutex, RwLock};
use polystore_common::{Device, PlacementConfig, Result};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static LOCAL_TASKS: RefCell<Vec<LocalTask>> = const { RefCell::new(Vec::new()) };
}

/// A thread's registration with one scheduler; deregisters on drop
struct LocalTask {
    scheduler_id: u64,
    scheduler: Weak<PlacementScheduler>,
    task: Arc<TaskContext>,
}

impl Drop for LocalTask {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.deregister(self.task.id());
        }
    }
}

/// Outcome of one epoch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EpochReport {
    /// Epoch number after this run
    pub epoch: u64,
    /// Bytes moved by all tasks during the epoch
    pub aggregate_throughput: u64,
    pub promoted: usize,
    pub demoted: usize,
}

/// Scheduler statistics
#[derive(Clone, Debug, Serialize)]
pub struct SchedulerStats {
    pub active_tasks: usize,
    pub fast_usage: usize,
    pub split_point: usize,
    pub epoch: u64,
    pub aggregate_throughput: u64,
    pub tasks: Vec<TaskSnapshot>,
}

/// Assigns every registered task to the fast or the slow device
pub struct PlacementScheduler {
    id: u64,
    policy: PlacementPolicy,
    epoch_interval: Duration,
    tasks: RwLock<HashMap<TaskId, Arc<TaskContext>>>,
    next_task: AtomicU64,
    /// Tasks currently placed on the fast device
    fast_usage: AtomicUsize,
    epoch: AtomicU64,
    aggregate_throughput: AtomicU64,
    /// Serializes epoch runs
    epoch_lock: Mutex<()>,
    shutdown: Arc<AtomicBool>,
    epoch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PlacementScheduler {
    /// Create a scheduler; the epoch loop is not started
    #[must_use]
    pub fn new(config: &PlacementConfig) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            policy: PlacementPolicy::from_config(config),
            epoch_interval: config.epoch_interval(),
            tasks: RwLock::new(HashMap::new()),
            next_task: AtomicU64::new(1),
            fast_usage: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
            aggregate_throughput: AtomicU64::new(0),
            epoch_lock: Mutex::new(()),
            shutdown: Arc::new(AtomicBool::new(false)),
            epoch_handle: Mutex::new(None),
        })
    }

    #[must_use]
    pub const fn policy(&self) -> &PlacementPolicy {
        &self.policy
    }

    /// Register a task explicitly
    ///
    /// Most callers want [`Self::current_task`], which also deregisters
    /// the task when the calling thread exits.
    pub fn register(&self, name: Option<String>) -> Arc<TaskContext> {
        let device = if self.try_take_fast_slot() {
            Device::Fast
        } else {
            Device::Slow
        };
        let id = TaskId::from(self.next_task.fetch_add(1, Ordering::Relaxed));
        let task = Arc::new(TaskContext::new(id, name, device));

        self.tasks.write().insert(id, Arc::clone(&task));
        debug!("Registered {} on {} device", id, device);
        task
    }

    /// Remove a task; returns false if it was not registered
    pub fn deregister(&self, id: TaskId) -> bool {
        let removed = self.tasks.write().remove(&id);
        match removed {
            Some(task) => {
                if task.device() == Device::Fast {
                    self.fast_usage.fetch_sub(1, Ordering::AcqRel);
                }
                debug!("Deregistered {}", id);
                true
            }
            None => false,
        }
    }

    /// The calling thread's task, registering it on first use
    pub fn current_task(self: &Arc<Self>) -> Arc<TaskContext> {
        LOCAL_TASKS.with(|cell| {
            let mut local = cell.borrow_mut();
            if let Some(entry) = local.iter().find(|t| t.scheduler_id == self.id) {
                return Arc::clone(&entry.task);
            }
            local.retain(|t| t.scheduler.strong_count() > 0);

            let task = self.register(thread::current().name().map(str::to_string));
            local.push(LocalTask {
                scheduler_id: self.id,
                scheduler: Arc::downgrade(self),
                task: Arc::clone(&task),
            });
            task
        })
    }

    /// Take a fast slot if fewer than `split_point` are in use
    fn try_take_fast_slot(&self) -> bool {
        let split_point = self.policy.split_point();
        self.fast_usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < split_point).then_some(used + 1)
            })
            .is_ok()
    }

    /// Close the current epoch for every task and apply the policy
    pub fn run_epoch(&self) -> EpochReport {
        let _epoch = self.epoch_lock.lock();
        let tasks = self.tasks.read();

        let mut report = EpochReport::default();
        for task in tasks.values() {
            let throughput = task.close_epoch();
            report.aggregate_throughput += throughput;

            let sample = EpochSample {
                device: task.device(),
                throughput,
                low_epochs: task.low_epochs(),
                total_bytes: task.total_bytes(),
            };
            let fast_usage = self.fast_usage.load(Ordering::Acquire);
            match self.policy.evaluate(&sample, fast_usage) {
                PolicyAction::Promote => {
                    if self.try_take_fast_slot() {
                        task.set_device(Device::Fast);
                        report.promoted += 1;
                        debug!("Promoted {} to fast device", task.id());
                    }
                }
                PolicyAction::Demote => {
                    task.set_device(Device::Slow);
                    self.fast_usage.fetch_sub(1, Ordering::AcqRel);
                    report.demoted += 1;
                    debug!("Demoted {} to slow device", task.id());
                }
                PolicyAction::Keep => {}
            }
        }

        self.aggregate_throughput
            .store(report.aggregate_throughput, Ordering::Relaxed);
        report.epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        report
    }

    /// Start the background epoch thread
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut handle_slot = self.epoch_handle.lock();
        if handle_slot.is_some() {
            return Ok(());
        }

        let scheduler = Arc::downgrade(self);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.epoch_interval;

        let handle = thread::Builder::new()
            .name("polystore-epoch".to_string())
            .spawn(move || {
                info!("Placement epoch thread started");

                while !shutdown.load(Ordering::Relaxed) {
                    thread::sleep(interval);

                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let Some(scheduler) = scheduler.upgrade() else {
                        break;
                    };
                    let report = scheduler.run_epoch();
                    if report.promoted + report.demoted > 0 {
                        debug!(
                            "Epoch {}: promoted {}, demoted {}, {} bytes",
                            report.epoch,
                            report.promoted,
                            report.demoted,
                            report.aggregate_throughput
                        );
                    }
                }

                info!("Placement epoch thread stopped");
            })?;

        *handle_slot = Some(handle);
        Ok(())
    }

    /// Stop the epoch thread
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);

        if let Some(handle) = self.epoch_handle.lock().take() {
            // The epoch thread may hold the last reference itself
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    #[must_use]
    pub fn active_tasks(&self) -> usize {
        self.tasks.read().len()
    }

    #[must_use]
    pub fn fast_usage(&self) -> usize {
        self.fast_usage.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Get statistics
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let tasks = self.tasks.read();
        let mut snapshots: Vec<TaskSnapshot> = tasks.values().map(|t| t.snapshot()).collect();
        snapshots.sort_by_key(|t| t.id);

        SchedulerStats {
            active_tasks: tasks.len(),
            fast_usage: self.fast_usage(),
            split_point: self.policy.split_point(),
            epoch: self.epoch(),
            aggregate_throughput: self.aggregate_throughput.load(Ordering::Relaxed),
            tasks: snapshots,
        }
    }
}

impl Drop for PlacementScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
