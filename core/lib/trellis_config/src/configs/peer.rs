use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::configs::{ClusterConfig, RoutingConfig, TransactorConfig};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerConfig {
    /// How often background maintenance (consensus GC, cache sweeps) runs
    /// (milliseconds).
    pub maintenance_interval_ms: u64,
    /// Peers asked during a restore round.
    pub restore_fanout: usize,
    pub cluster: ClusterConfig,
    pub routing: RoutingConfig,
    pub transactor: TransactorConfig,
}

impl PeerConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn for_tests() -> Self {
        Self {
            maintenance_interval_ms: 50,
            restore_fanout: 3,
            cluster: ClusterConfig::for_tests(),
            routing: RoutingConfig::for_tests(),
            transactor: TransactorConfig::for_tests(),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            maintenance_interval_ms: 1_000,
            restore_fanout: 4,
            cluster: ClusterConfig::default(),
            routing: RoutingConfig::default(),
            transactor: TransactorConfig::default(),
        }
    }
}
