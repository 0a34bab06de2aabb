use std::{
    sync::Mutex,
    time::Instant,
};

use trellis_config::GuardConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardReason {
    /// Self-coordination is switched off.
    Disabled,
    /// The routing layer flagged a likely partition.
    Partition,
    /// The peer view shrank too far below its high-water mark.
    Shrinkage,
    /// We just lost our last connection; wait out the grace period.
    IsolationGrace,
    /// High-water mark never exceeded one peer: we are the bootstrap node.
    BootstrapNode,
    /// Isolated past the grace period; allowed, but worth a warning.
    ExtendedIsolation,
    Healthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardDecision {
    pub allow: bool,
    pub reason: GuardReason,
}

#[derive(Debug)]
struct GuardState {
    network_high_water_mark: usize,
    last_connected: Option<Instant>,
}

/// Decides whether this peer may answer "I coordinate this key" itself.
/// A peer that has fallen out of the mesh must not silently become the
/// coordinator of everything it looks up.
#[derive(Debug)]
pub struct SelfCoordinationGuard {
    config: GuardConfig,
    state: Mutex<GuardState>,
}

impl SelfCoordinationGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            state: Mutex::new(GuardState {
                network_high_water_mark: 0,
                last_connected: None,
            }),
        }
    }

    /// Feeds the latest directory readings into the guard.
    pub fn observe(&self, network_size_estimate: usize, connection_count: usize) {
        let mut state = self.state.lock().unwrap();
        state.network_high_water_mark = state
            .network_high_water_mark
            .max(network_size_estimate);
        if connection_count > 0 {
            state.last_connected = Some(Instant::now());
        }
    }

    pub fn evaluate(
        &self,
        network_size_estimate: usize,
        connection_count: usize,
        partition_suspected: bool,
    ) -> GuardDecision {
        self.observe(network_size_estimate, connection_count);
        let state = self.state.lock().unwrap();

        if !self.config.enabled {
            return GuardDecision {
                allow: false,
                reason: GuardReason::Disabled,
            };
        }
        if partition_suspected {
            return GuardDecision {
                allow: false,
                reason: GuardReason::Partition,
            };
        }
        if state.network_high_water_mark <= 1 {
            return GuardDecision {
                allow: true,
                reason: GuardReason::BootstrapNode,
            };
        }
        let ratio = network_size_estimate as f64 / state.network_high_water_mark as f64;
        if ratio < 1.0 - self.config.shrinkage_threshold {
            return GuardDecision {
                allow: false,
                reason: GuardReason::Shrinkage,
            };
        }
        if connection_count == 0 {
            let elapsed = state
                .last_connected
                .map(|at| at.elapsed())
                .unwrap_or_default();
            if elapsed < self.config.isolation_grace() {
                return GuardDecision {
                    allow: false,
                    reason: GuardReason::IsolationGrace,
                };
            }
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                "self-coordinating while isolated from the mesh"
            );
            return GuardDecision {
                allow: true,
                reason: GuardReason::ExtendedIsolation,
            };
        }
        GuardDecision {
            allow: true,
            reason: GuardReason::Healthy,
        }
    }
}
