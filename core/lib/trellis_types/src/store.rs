use async_trait::async_trait;

use crate::{
    block::{Block, BlockType},
    ids::{BlockId, CollectionId},
    ops::{Op, OpError},
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("block {0} not found")]
    NotFound(BlockId),
    #[error("block {0} already exists")]
    AlreadyExists(BlockId),
    #[error("cannot update missing block {0}; insert it first")]
    UpdateOfMissingBlock(BlockId),
    #[error("op failed on block {block_id}: {source}")]
    Op {
        block_id: BlockId,
        #[source]
        source: OpError,
    },
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read side of a block store. The staged view of a tracker and the
/// materialized view of a repo both satisfy this.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Collection every block obtained from this source belongs to.
    fn collection_id(&self) -> &CollectionId;

    /// Mints an id for a block that is about to be inserted.
    fn generate_id(&self) -> BlockId {
        BlockId::generate()
    }

    fn header_for(&self, block_type: BlockType) -> crate::block::BlockHeader {
        crate::block::BlockHeader {
            id: self.generate_id(),
            block_type,
            collection_id: self.collection_id().clone(),
        }
    }

    async fn try_get(&self, id: &BlockId) -> StoreResult<Option<Block>>;
}

/// Write side: the mutation surface the chain and log operate against.
#[async_trait]
pub trait BlockStore: BlockSource {
    async fn insert(&self, block: Block) -> StoreResult<()>;
    async fn update(&self, id: &BlockId, op: Op) -> StoreResult<()>;
    async fn delete(&self, id: &BlockId) -> StoreResult<()>;
}
