use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    /// Share of cohort promises required to move to the commit phase.
    pub promise_threshold: f64,
    /// Share of cohort commit approvals that finalizes a transaction.
    pub commit_threshold: f64,
    /// Smallest cohort the protocol will run with.
    pub min_cluster_size: usize,
    /// Whether a shrunk peer view may downsize the cohort below the
    /// suggested size.
    pub allow_downsize: bool,
    /// Tolerated relative deviation between suggested and actual cohort
    /// size.
    pub size_tolerance: f64,
    /// Window used when deciding whether a size drop looks like a
    /// partition (seconds).
    pub partition_detection_window_secs: u64,
    /// Grace period past a record's expiration before it is garbage
    /// collected (milliseconds).
    pub resolution_grace_ms: u64,
}

impl ClusterConfig {
    pub fn partition_detection_window(&self) -> Duration {
        Duration::from_secs(self.partition_detection_window_secs)
    }

    pub fn resolution_grace(&self) -> Duration {
        Duration::from_millis(self.resolution_grace_ms)
    }

    pub fn for_tests() -> Self {
        Self {
            min_cluster_size: 1,
            resolution_grace_ms: 200,
            ..Self::default()
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            promise_threshold: 0.75,
            commit_threshold: 0.5,
            min_cluster_size: 3,
            allow_downsize: true,
            size_tolerance: 0.5,
            partition_detection_window_secs: 60,
            resolution_grace_ms: 5_000,
        }
    }
}
