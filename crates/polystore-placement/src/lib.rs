//! PolyStore Placement - per-task device assignment
//!
//! Every OS thread that performs I/O is registered as a task. The
//! scheduler assigns each task to the fast or the slow device; new
//! intervals a task allocates land on its current device.
//!
//! # Policies
//!
//! ## Static
//! The first `split_point` tasks go fast, the rest slow. Epochs only
//! collect statistics, optionally demoting a task once its cumulative
//! traffic crosses a threshold.
//!
//! ## Dynamic
//! Every epoch, slow tasks are promoted while fast slots are free and
//! fast tasks idle for too many consecutive epochs are demoted.
//!
//! # Example
//! ```ignore
//! use polystore_placement::PlacementScheduler;
//!
//! let scheduler = PlacementScheduler::new(&config.placement);
//! scheduler.start()?;
//! let device = scheduler.current_task().device();
//! ```

pub mod policy;
pub mod scheduler;
pub mod task;

pub use policy::{EpochSample, PlacementPolicy, PolicyAction};
pub use scheduler::{EpochReport, PlacementScheduler, SchedulerStats};
pub use task::{TaskContext, TaskId, TaskSnapshot};
