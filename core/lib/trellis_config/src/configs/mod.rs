pub mod cluster;
pub mod collection;
pub mod peer;
pub mod routing;
pub mod transactor;

pub use cluster::ClusterConfig;
pub use collection::CollectionConfig;
pub use peer::PeerConfig;
pub use routing::{GuardConfig, RoutingConfig};
pub use transactor::TransactorConfig;
