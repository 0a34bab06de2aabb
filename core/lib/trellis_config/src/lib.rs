//! Configuration structs for the trellis components. Durations are stored
//! as integer milliseconds/seconds with accessor methods, so configs stay
//! plain serde values.

pub mod configs;

pub use configs::{
    ClusterConfig, CollectionConfig, GuardConfig, PeerConfig, RoutingConfig, TransactorConfig,
};
