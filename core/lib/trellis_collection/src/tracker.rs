use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use trellis_types::{
    apply_op, Block, BlockId, BlockSource, BlockStore, CollectionId, Op, StoreError, StoreResult,
    Transforms,
};

/// Stages mutations against a read-only block source. Reads see the staged
/// view; `reset` hands the accumulated `Transforms` to the caller for
/// submission and starts a fresh round.
pub struct Tracker<S> {
    source: Arc<S>,
    staged: Mutex<Transforms>,
}

impl<S: BlockSource> Tracker<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self {
            source,
            staged: Mutex::new(Transforms::default()),
        }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// Swaps the active transforms for `new` (or an empty set) and returns
    /// the old ones.
    pub fn reset(&self, new: Option<Transforms>) -> Transforms {
        std::mem::replace(
            &mut self.staged.lock().unwrap(),
            new.unwrap_or_default(),
        )
    }

    /// A copy of the currently staged transforms.
    pub fn snapshot(&self) -> Transforms {
        self.staged.lock().unwrap().clone()
    }

    pub fn is_clean(&self) -> bool {
        self.staged.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl<S: BlockSource> BlockSource for Tracker<S> {
    fn collection_id(&self) -> &CollectionId {
        self.source.collection_id()
    }

    fn generate_id(&self) -> BlockId {
        self.source.generate_id()
    }

    /// Overlays the staged inserts, updates, and deletes on the source:
    /// the staged view is what subsequent writes must see.
    async fn try_get(&self, id: &BlockId) -> StoreResult<Option<Block>> {
        let (inserted, ops, deleted) = {
            let staged = self.staged.lock().unwrap();
            (
                staged.inserts.get(id).cloned(),
                staged.updates.get(id).cloned(),
                staged.deletes.contains(id),
            )
        };
        if deleted {
            return Ok(None);
        }
        if let Some(block) = inserted {
            return Ok(Some(block));
        }
        let Some(mut block) = self.source.try_get(id).await? else {
            return Ok(None);
        };
        if let Some(ops) = ops {
            for op in &ops {
                apply_op(&mut block.payload, op).map_err(|source| StoreError::Op {
                    block_id: id.clone(),
                    source,
                })?;
            }
        }
        Ok(Some(block))
    }
}

#[async_trait]
impl<S: BlockSource> BlockStore for Tracker<S> {
    async fn insert(&self, block: Block) -> StoreResult<()> {
        let mut staged = self.staged.lock().unwrap();
        let id = block.header.id.clone();
        staged.deletes.remove(&id);
        staged.updates.remove(&id);
        staged.inserts.insert(id, block);
        Ok(())
    }

    async fn update(&self, id: &BlockId, op: Op) -> StoreResult<()> {
        let mut staged = self.staged.lock().unwrap();
        if staged.deletes.contains(id) {
            return Err(StoreError::NotFound(id.clone()));
        }
        // A freshly inserted block mutates in place; anything else records
        // the op for later application.
        if let Some(block) = staged.inserts.get_mut(id) {
            apply_op(&mut block.payload, &op).map_err(|source| StoreError::Op {
                block_id: id.clone(),
                source,
            })?;
            return Ok(());
        }
        staged.updates.entry(id.clone()).or_default().push(op);
        Ok(())
    }

    async fn delete(&self, id: &BlockId) -> StoreResult<()> {
        let mut staged = self.staged.lock().unwrap();
        // Deleting a block that only ever existed as a staged insert erases
        // it entirely; there is nothing for the network to delete.
        let was_fresh_insert = staged.inserts.remove(id).is_some();
        staged.updates.remove(id);
        if !was_fresh_insert {
            staged.deletes.insert(id.clone());
        }
        Ok(())
    }
}

impl<S> std::fmt::Debug for Tracker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("staged", &self.staged.lock().unwrap().len())
            .finish()
    }
}
