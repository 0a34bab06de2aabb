//! Shared data model for the trellis block store: block identities, block
//! payloads and their mutation ops, per-action transforms, log entries, and
//! the repo protocol messages exchanged between transactors and peers.

pub mod block;
pub mod ids;
pub mod log_entry;
pub mod message;
pub mod ops;
pub mod store;
pub mod time;
pub mod transform;

pub use block::{Block, BlockHeader, BlockType};
pub use ids::{ActionContext, ActionId, ActionRev, BlockId, CollectionId, PeerId, PeerInfo, Rev};
pub use log_entry::{ActionEntry, CheckpointEntry, LogEntry, LogEntryKind};
pub use message::{
    ActionPending, BlockState, CommitOutcome, GetBlockResult, PendOutcome, PendPolicy,
    RepoMessage, RepoOperation, RepoResponse, StaleFailure,
};
pub use ops::{apply_op, apply_transform, Op, OpError, PathSeg};
pub use store::{BlockSource, BlockStore, StoreError, StoreResult};
pub use transform::{
    block_ids_for_transforms, concat_transform, distinct_block_action_transforms,
    transform_for_block_id, ActionTransforms, Transform, TransformError, Transforms,
};
