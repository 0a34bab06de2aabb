use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use trellis_types::{ActionId, ActionRev, Block, BlockId, Rev, Transform};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("no pending transaction for block {block_id} action {action_id}")]
    NoPendingTransaction {
        block_id: BlockId,
        action_id: ActionId,
    },
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Per-block bookkeeping: the latest committed action and the ordered set of
/// pending actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub latest: Option<ActionRev>,
    pub pendings: Vec<ActionId>,
}

impl BlockMetadata {
    pub fn latest_rev(&self) -> Rev {
        self.latest.as_ref().map(|ar| ar.rev).unwrap_or(0)
    }
}

/// The persistence seam under a repo. Everything is addressed by
/// `(block_id, action_id)` or `(block_id, rev)`; the on-disk layout behind
/// an implementation is not the repo's concern.
#[async_trait]
pub trait RawStorage: Send + Sync + 'static {
    async fn get_metadata(&self, block_id: &BlockId) -> StorageResult<Option<BlockMetadata>>;
    async fn save_metadata(&self, block_id: &BlockId, metadata: &BlockMetadata)
        -> StorageResult<()>;

    async fn get_revision(&self, block_id: &BlockId, rev: Rev) -> StorageResult<Option<ActionId>>;
    async fn save_revision(
        &self,
        block_id: &BlockId,
        rev: Rev,
        action_id: &ActionId,
    ) -> StorageResult<()>;
    /// Committed `(action, rev)` pairs for a block with `from <= rev <= to`,
    /// ascending.
    async fn list_revisions(
        &self,
        block_id: &BlockId,
        from: Rev,
        to: Rev,
    ) -> StorageResult<Vec<ActionRev>>;

    async fn get_pending_transaction(
        &self,
        block_id: &BlockId,
        action_id: &ActionId,
    ) -> StorageResult<Option<Transform>>;
    async fn save_pending_transaction(
        &self,
        block_id: &BlockId,
        action_id: &ActionId,
        transform: &Transform,
    ) -> StorageResult<()>;
    async fn delete_pending_transaction(
        &self,
        block_id: &BlockId,
        action_id: &ActionId,
    ) -> StorageResult<()>;
    /// Moves a pending transform into the committed set.
    async fn promote_pending_transaction(
        &self,
        block_id: &BlockId,
        action_id: &ActionId,
    ) -> StorageResult<()>;
    async fn get_committed_transaction(
        &self,
        block_id: &BlockId,
        action_id: &ActionId,
    ) -> StorageResult<Option<Transform>>;

    /// The block state right after `action_id` applied; `Some(None)` records
    /// that the action deleted the block.
    async fn get_materialized_block(
        &self,
        block_id: &BlockId,
        action_id: &ActionId,
    ) -> StorageResult<Option<Option<Block>>>;
    async fn save_materialized_block(
        &self,
        block_id: &BlockId,
        action_id: &ActionId,
        block: Option<&Block>,
    ) -> StorageResult<()>;
}
