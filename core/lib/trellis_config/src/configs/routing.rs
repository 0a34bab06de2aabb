use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingConfig {
    /// Cohort size for cluster assembly.
    pub cluster_size: usize,
    /// Bound on the coordinator cache.
    pub coordinator_cache_capacity: usize,
    /// Time-to-live of a cached coordinator (seconds).
    pub coordinator_cache_ttl_secs: u64,
    /// Penalty added to a peer per recorded misbehaviour.
    pub blacklist_penalty: f64,
    /// Penalty score at which a peer stops being considered.
    pub blacklist_threshold: f64,
    /// Half-life of blacklist penalties (seconds).
    pub blacklist_halflife_secs: u64,
    pub guard: GuardConfig,
}

impl RoutingConfig {
    pub fn coordinator_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.coordinator_cache_ttl_secs)
    }

    pub fn blacklist_halflife(&self) -> Duration {
        Duration::from_secs(self.blacklist_halflife_secs)
    }

    pub fn for_tests() -> Self {
        Self {
            cluster_size: 3,
            coordinator_cache_ttl_secs: 60,
            ..Self::default()
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            cluster_size: 16,
            coordinator_cache_capacity: 1_000,
            coordinator_cache_ttl_secs: 30 * 60,
            blacklist_penalty: 1.0,
            blacklist_threshold: 3.0,
            blacklist_halflife_secs: 10 * 60,
            guard: GuardConfig::default(),
        }
    }
}

/// Controls when a peer may fall back to coordinating a key itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardConfig {
    pub enabled: bool,
    /// Relative shrink of the peer view (against the high-water mark) that
    /// blocks self-coordination.
    pub shrinkage_threshold: f64,
    /// How long after losing the last connection self-coordination stays
    /// blocked (milliseconds).
    pub isolation_grace_ms: u64,
}

impl GuardConfig {
    pub fn isolation_grace(&self) -> Duration {
        Duration::from_millis(self.isolation_grace_ms)
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shrinkage_threshold: 0.4,
            isolation_grace_ms: 30_000,
        }
    }
}
