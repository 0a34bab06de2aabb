//! The key-to-peer routing fabric and the peer wire protocol: a 256-bit key
//! space with XOR distance, coordinator selection with caching, blacklist
//! and self-coordination guard, cohort assembly, and the length-prefixed
//! framing the repo protocol runs over.

pub mod blacklist;
pub mod cache;
pub mod framing;
pub mod guard;
pub mod key;
pub mod router;
pub mod rpc;
pub mod traits;

pub use blacklist::Blacklist;
pub use cache::CoordinatorCache;
pub use framing::{read_frame, write_frame, FRAME_CAP};
pub use guard::{GuardDecision, GuardReason, SelfCoordinationGuard};
pub use key::Key;
pub use router::KeyRouter;
pub use rpc::{
    serve_repo_stream, PeerRepoRequest, RepoClient, RepoHandler, StreamRepoClient, WireResult,
    REPO_PROTOCOL,
};
pub use traits::{
    ClientError, ClientResult, KeyNetwork, PeerDirectory, PeerNetwork, PeerStream, RoutingError,
    RoutingResult, TransportError, TransportResult,
};
