use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use trellis_types::{PeerId, PeerInfo};

use crate::key::Key;

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("no coordinator available for key {key}: {details}")]
    NoCoordinator { key: Key, details: String },
    #[error("peer directory failure: {0}")]
    Directory(String),
}

pub type RoutingResult<T> = Result<T, RoutingError>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {len} bytes exceeds the {max} byte cap")]
    FrameTooLarge { len: usize, max: usize },
    #[error("failed to decode frame: {0}")]
    Decode(#[from] bincode::Error),
    #[error("stream closed mid-message")]
    ConnectionClosed,
    #[error("cannot connect to {peer}: {details}")]
    Connect { peer: PeerId, details: String },
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Failures a repo protocol call can surface to the transactor.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("peer {peer} rejected the request: {details}")]
    Rejected { peer: PeerId, details: String },
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Key-space services the transactor and the peer service depend on.
#[async_trait]
pub trait KeyNetwork: Send + Sync {
    /// The peer responsible for `key`, avoiding `excluded`.
    async fn find_coordinator(&self, key: &Key, excluded: &[PeerId]) -> RoutingResult<PeerId>;

    /// The cohort of peers closest to `key`, deterministic for a fixed peer
    /// view.
    async fn find_cluster(&self, key: &Key) -> RoutingResult<BTreeMap<PeerId, PeerInfo>>;

    /// Hints that `peer` successfully coordinated `key`.
    fn record_coordinator(&self, key: &Key, peer: &PeerId, ttl: Option<Duration>);
}

/// Where the router learns about peers: overlay neighbours for a key, the
/// connection picture, and the size estimate backing the self-coordination
/// guard.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    fn self_id(&self) -> PeerId;
    fn self_info(&self) -> PeerInfo;
    /// Known peers nearest to `key`, excluding self.
    async fn peers_near(&self, key: &Key) -> RoutingResult<Vec<(PeerId, PeerInfo)>>;
    fn connection_count(&self) -> usize;
    fn network_size_estimate(&self) -> usize;
    /// Set by the routing layer when the recent peer-view churn looks like a
    /// partition rather than real shrinkage.
    fn partition_suspected(&self) -> bool;
}

pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

/// A raw bidirectional stream to a peer for one protocol exchange.
pub type PeerStream = Box<dyn DuplexStream>;

/// The transport collaborator. Implementations (an in-memory mesh, a real
/// overlay) stay outside the core.
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    async fn connect(&self, peer: &PeerId, protocol: &str) -> TransportResult<PeerStream>;
}

impl std::fmt::Debug for dyn PeerNetwork + 'static {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerNetwork").finish()
    }
}

impl std::fmt::Debug for dyn KeyNetwork + 'static {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyNetwork").finish()
    }
}
