//! The coordinator cluster protocol: a coordinating peer sequences a
//! `RepoMessage` through its cohort with signed promises and commits, and
//! every member applies the operations to its repo exactly once when the
//! transaction reaches consensus.

pub mod client;
pub mod coordinator;
pub mod member;
mod metrics;
pub mod record;

pub use client::{
    serve_cluster_stream, ClusterClient, ClusterUpdateHandler, StreamClusterClient,
    CLUSTER_PROTOCOL,
};
pub use coordinator::ClusterCoordinator;
pub use member::{ClusterMember, MemberUpdate};
pub use record::{
    ClusterError, ClusterRecord, ClusterResult, ClusterSignature, MessageHash, SignatureKind,
    TransactionPhase,
};
