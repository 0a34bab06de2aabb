use std::sync::Mutex;

use async_trait::async_trait;
use trellis_transactor::{GetRequest, Transactor};
use trellis_types::{ActionContext, Block, BlockId, BlockSource, CollectionId, StoreError, StoreResult};

/// A read-only block source backed by the transactor: every miss of the
/// staged view above it turns into a coordinator read, optionally pinned to
/// an action context.
pub struct NetworkSource {
    transactor: Transactor,
    collection_id: CollectionId,
    context: Mutex<Option<ActionContext>>,
}

impl NetworkSource {
    pub fn new(transactor: Transactor, collection_id: CollectionId) -> Self {
        Self {
            transactor,
            collection_id,
            context: Mutex::new(None),
        }
    }

    pub fn transactor(&self) -> &Transactor {
        &self.transactor
    }

    /// Pins (or unpins) the context subsequent reads are served at.
    pub fn set_context(&self, context: Option<ActionContext>) {
        *self.context.lock().unwrap() = context;
    }
}

#[async_trait]
impl BlockSource for NetworkSource {
    fn collection_id(&self) -> &CollectionId {
        &self.collection_id
    }

    async fn try_get(&self, id: &BlockId) -> StoreResult<Option<Block>> {
        let context = self.context.lock().unwrap().clone();
        let mut results = self
            .transactor
            .get(GetRequest {
                block_ids: vec![id.clone()],
                context,
            })
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(results.remove(id).and_then(|result| result.block))
    }
}

impl std::fmt::Debug for NetworkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSource")
            .field("collection_id", &self.collection_id)
            .finish()
    }
}
