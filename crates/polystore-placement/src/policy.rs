//! Placement policy implementation

use polystore_common::{Device, PlacementConfig, PlacementPolicyKind};

/// What the policy wants done with one task at the end of an epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyAction {
    Keep,
    Promote,
    Demote,
}

/// A task's state after its epoch counters were closed
#[derive(Clone, Copy, Debug)]
pub struct EpochSample {
    /// Current device
    pub device: Device,
    /// Bytes moved during the epoch
    pub throughput: u64,
    /// Consecutive idle epochs, including this one
    pub low_epochs: u32,
    /// Bytes moved since registration
    pub total_bytes: u64,
}

/// Static or dynamic fast/slow assignment
#[derive(Clone, Debug)]
pub struct PlacementPolicy {
    kind: PlacementPolicyKind,
    split_point: usize,
    low_throughput_epochs: u32,
    static_demote_threshold: Option<u64>,
}

impl PlacementPolicy {
    /// Create a policy from configuration
    #[must_use]
    pub const fn from_config(config: &PlacementConfig) -> Self {
        Self {
            kind: config.policy,
            split_point: config.split_point,
            low_throughput_epochs: config.low_throughput_epochs,
            static_demote_threshold: config.static_demote_threshold,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> PlacementPolicyKind {
        self.kind
    }

    /// Number of tasks allowed on the fast device at once
    #[must_use]
    pub const fn split_point(&self) -> usize {
        self.split_point
    }

    /// Device for a task registering while `fast_usage` tasks hold fast slots
    #[must_use]
    pub const fn initial_device(&self, fast_usage: usize) -> Device {
        if fast_usage < self.split_point {
            Device::Fast
        } else {
            Device::Slow
        }
    }

    /// Decide the end-of-epoch action for one task
    #[must_use]
    pub fn evaluate(&self, sample: &EpochSample, fast_usage: usize) -> PolicyAction {
        match self.kind {
            PlacementPolicyKind::Static => self.evaluate_static(sample),
            PlacementPolicyKind::Dynamic => self.evaluate_dynamic(sample, fast_usage),
        }
    }

    fn evaluate_static(&self, sample: &EpochSample) -> PolicyAction {
        match (sample.device, self.static_demote_threshold) {
            (Device::Fast, Some(threshold)) if sample.total_bytes >= threshold => {
                PolicyAction::Demote
            }
            _ => PolicyAction::Keep,
        }
    }

    fn evaluate_dynamic(&self, sample: &EpochSample, fast_usage: usize) -> PolicyAction {
        let idle = sample.low_epochs > self.low_throughput_epochs;
        match sample.device {
            // A slot is free, but an idle task would be demoted again right away
            Device::Slow if fast_usage < self.split_point && !idle => PolicyAction::Promote,
            Device::Fast if idle => PolicyAction::Demote,
            _ => PolicyAction::Keep,
        }
    }
}
