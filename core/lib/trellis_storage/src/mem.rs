use std::{
    collections::BTreeMap,
    sync::RwLock,
};

use async_trait::async_trait;
use trellis_types::{ActionId, ActionRev, Block, BlockId, Rev, Transform};

use crate::raw::{BlockMetadata, RawStorage, StorageError, StorageResult};

#[derive(Debug, Default)]
struct MemInner {
    metadata: BTreeMap<BlockId, BlockMetadata>,
    revisions: BTreeMap<(BlockId, Rev), ActionId>,
    pending: BTreeMap<(BlockId, ActionId), Transform>,
    committed: BTreeMap<(BlockId, ActionId), Transform>,
    materialized: BTreeMap<(BlockId, ActionId), Option<Block>>,
}

/// In-memory `RawStorage`. Single-process peers and tests run on this; a
/// durable backend can replace it behind the same trait.
#[derive(Debug, Default)]
pub struct MemStorage {
    inner: RwLock<MemInner>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RawStorage for MemStorage {
    async fn get_metadata(&self, block_id: &BlockId) -> StorageResult<Option<BlockMetadata>> {
        Ok(self.inner.read().unwrap().metadata.get(block_id).cloned())
    }

    async fn save_metadata(
        &self,
        block_id: &BlockId,
        metadata: &BlockMetadata,
    ) -> StorageResult<()> {
        self.inner
            .write()
            .unwrap()
            .metadata
            .insert(block_id.clone(), metadata.clone());
        Ok(())
    }

    async fn get_revision(&self, block_id: &BlockId, rev: Rev) -> StorageResult<Option<ActionId>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .revisions
            .get(&(block_id.clone(), rev))
            .cloned())
    }

    async fn save_revision(
        &self,
        block_id: &BlockId,
        rev: Rev,
        action_id: &ActionId,
    ) -> StorageResult<()> {
        self.inner
            .write()
            .unwrap()
            .revisions
            .insert((block_id.clone(), rev), action_id.clone());
        Ok(())
    }

    async fn list_revisions(
        &self,
        block_id: &BlockId,
        from: Rev,
        to: Rev,
    ) -> StorageResult<Vec<ActionRev>> {
        if from > to {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().unwrap();
        Ok(inner
            .revisions
            .range((block_id.clone(), from)..=(block_id.clone(), to))
            .map(|((_, rev), action_id)| ActionRev {
                action_id: action_id.clone(),
                rev: *rev,
            })
            .collect())
    }

    async fn get_pending_transaction(
        &self,
        block_id: &BlockId,
        action_id: &ActionId,
    ) -> StorageResult<Option<Transform>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .pending
            .get(&(block_id.clone(), action_id.clone()))
            .cloned())
    }

    async fn save_pending_transaction(
        &self,
        block_id: &BlockId,
        action_id: &ActionId,
        transform: &Transform,
    ) -> StorageResult<()> {
        self.inner
            .write()
            .unwrap()
            .pending
            .insert((block_id.clone(), action_id.clone()), transform.clone());
        Ok(())
    }

    async fn delete_pending_transaction(
        &self,
        block_id: &BlockId,
        action_id: &ActionId,
    ) -> StorageResult<()> {
        self.inner
            .write()
            .unwrap()
            .pending
            .remove(&(block_id.clone(), action_id.clone()));
        Ok(())
    }

    async fn promote_pending_transaction(
        &self,
        block_id: &BlockId,
        action_id: &ActionId,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().unwrap();
        let key = (block_id.clone(), action_id.clone());
        let transform = inner
            .pending
            .remove(&key)
            .ok_or_else(|| StorageError::NoPendingTransaction {
                block_id: block_id.clone(),
                action_id: action_id.clone(),
            })?;
        inner.committed.insert(key, transform);
        Ok(())
    }

    async fn get_committed_transaction(
        &self,
        block_id: &BlockId,
        action_id: &ActionId,
    ) -> StorageResult<Option<Transform>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .committed
            .get(&(block_id.clone(), action_id.clone()))
            .cloned())
    }

    async fn get_materialized_block(
        &self,
        block_id: &BlockId,
        action_id: &ActionId,
    ) -> StorageResult<Option<Option<Block>>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .materialized
            .get(&(block_id.clone(), action_id.clone()))
            .cloned())
    }

    async fn save_materialized_block(
        &self,
        block_id: &BlockId,
        action_id: &ActionId,
        block: Option<&Block>,
    ) -> StorageResult<()> {
        self.inner
            .write()
            .unwrap()
            .materialized
            .insert((block_id.clone(), action_id.clone()), block.cloned());
        Ok(())
    }
}
