use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use trellis_types::{
    time::millis_since_epoch, ActionContext, ActionId, ActionRev, BlockId, BlockStore,
    CollectionId, LogEntry, LogEntryKind, Rev,
};

use crate::chain::{Chain, ChainPath, LogError, LogResult};

/// Token for an appended-but-unsealed action entry: the entry is in the
/// chain with empty `block_ids`, and the path tells the caller which log
/// blocks the allocation landed in.
#[derive(Debug)]
pub struct EntryAllocation<A> {
    pub path: ChainPath,
    entry: LogEntry<A>,
}

/// Result of reading the log from a revision: the current context and the
/// action entries above that revision, ascending.
#[derive(Debug)]
pub struct GetFrom<A> {
    pub context: ActionContext,
    pub entries: Vec<LogEntry<A>>,
}

/// A collection's append-only action log: a typed chain of action entries
/// and checkpoints.
#[derive(Debug)]
pub struct Log<A, S> {
    chain: Chain<LogEntry<A>, S>,
}

impl<A, S> Log<A, S>
where
    A: Serialize + DeserializeOwned + Clone,
    S: BlockStore,
{
    pub async fn create(
        store: Arc<S>,
        header_id: BlockId,
        entries_per_block: usize,
    ) -> LogResult<Self> {
        Ok(Self {
            chain: Chain::create(store, header_id, entries_per_block).await?,
        })
    }

    pub async fn open(
        store: Arc<S>,
        header_id: BlockId,
        entries_per_block: usize,
    ) -> LogResult<Self> {
        Ok(Self {
            chain: Chain::open(store, header_id, entries_per_block).await?,
        })
    }

    pub fn chain(&self) -> &Chain<LogEntry<A>, S> {
        &self.chain
    }

    pub fn header_id(&self) -> &BlockId {
        self.chain.header_id()
    }

    /// First half of an append: the entry goes into the chain with empty
    /// `block_ids`, and the allocation token carries the tail path.
    pub async fn stage_actions(
        &self,
        actions: Vec<A>,
        action_id: ActionId,
        rev: Rev,
        collection_ids: Option<Vec<CollectionId>>,
        timestamp: Option<u64>,
    ) -> LogResult<EntryAllocation<A>> {
        let entry = LogEntry::action(
            timestamp.unwrap_or_else(millis_since_epoch),
            rev,
            action_id,
            actions,
            collection_ids,
        );
        let path = self.chain.add(entry.clone()).await?;
        Ok(EntryAllocation { path, entry })
    }

    /// Second half: rewrite the staged entry with its finalized block ids.
    pub async fn seal_actions(
        &self,
        allocation: EntryAllocation<A>,
        block_ids: Vec<BlockId>,
    ) -> LogResult<ChainPath> {
        let EntryAllocation { path, mut entry } = allocation;
        match &mut entry.kind {
            LogEntryKind::Action(action) => action.block_ids = block_ids,
            LogEntryKind::Checkpoint(_) => unreachable!("allocations always hold action entries"),
        }
        self.chain.update_at(&path, entry).await?;
        Ok(path)
    }

    /// Appends an action entry whose `block_ids` are computed from the
    /// allocating tail path.
    pub async fn add_actions<F>(
        &self,
        actions: Vec<A>,
        action_id: ActionId,
        rev: Rev,
        block_ids: F,
        collection_ids: Option<Vec<CollectionId>>,
        timestamp: Option<u64>,
    ) -> LogResult<ChainPath>
    where
        F: FnOnce(&ChainPath) -> Vec<BlockId>,
    {
        let allocation = self
            .stage_actions(actions, action_id, rev, collection_ids, timestamp)
            .await?;
        let ids = block_ids(&allocation.path);
        self.seal_actions(allocation, ids).await
    }

    pub async fn add_checkpoint(
        &self,
        pendings: Vec<ActionRev>,
        rev: Rev,
        timestamp: Option<u64>,
    ) -> LogResult<ChainPath> {
        let entry = LogEntry::checkpoint(timestamp.unwrap_or_else(millis_since_epoch), rev, pendings);
        self.chain.add(entry).await
    }

    /// The current reader frontier: the pendings restated by the last
    /// checkpoint plus every action after it, pinned to the checkpoint rev
    /// (or rev 0 when the log has no checkpoint yet).
    pub async fn get_action_context(&self) -> LogResult<ActionContext> {
        let mut after_checkpoint: Vec<ActionRev> = Vec::new();
        let mut select = self.chain.select(None, false);
        while let Some((_, entry)) = select.next().await? {
            match entry.kind {
                LogEntryKind::Action(action) => {
                    after_checkpoint.push(ActionRev {
                        action_id: action.action_id,
                        rev: entry.rev,
                    });
                }
                LogEntryKind::Checkpoint(checkpoint) => {
                    let mut committed = checkpoint.pendings;
                    after_checkpoint.reverse();
                    committed.extend(after_checkpoint);
                    return Ok(ActionContext {
                        committed,
                        rev: entry.rev,
                    });
                }
            }
        }
        after_checkpoint.reverse();
        Ok(ActionContext {
            committed: after_checkpoint,
            rev: 0,
        })
    }

    /// Scans backward from the tail for everything above `start_rev`,
    /// returning the entries in ascending order together with the current
    /// context.
    pub async fn get_from(&self, start_rev: Option<Rev>) -> LogResult<GetFrom<A>> {
        let start_rev = start_rev.unwrap_or(0);
        let mut entries: Vec<LogEntry<A>> = Vec::new();
        let mut select = self.chain.select(None, false);
        while let Some((_, entry)) = select.next().await? {
            if entry.rev <= start_rev {
                break;
            }
            if matches!(entry.kind, LogEntryKind::Action(_)) {
                entries.push(entry);
            }
        }
        entries.reverse();
        Ok(GetFrom {
            context: self.get_action_context().await?,
            entries,
        })
    }

    /// Revision of the newest entry, or `None` for an empty log.
    pub async fn latest_rev(&self) -> LogResult<Option<Rev>> {
        let Some(tail) = self.chain.get_tail().await? else {
            return Ok(None);
        };
        Ok(Some(self.chain.entry_at(&tail).await?.rev))
    }

    /// The log blocks an allocation landed in, for sealing an entry.
    pub fn allocation_block_ids(&self, path: &ChainPath) -> Vec<BlockId> {
        let mut ids = vec![self.header_id().clone(), path.block_id.clone()];
        ids.dedup();
        ids
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Mutex};

    use async_trait::async_trait;
    use serde::Deserialize;
    use trellis_types::{apply_op, Block, Op, StoreError, StoreResult};

    use super::*;
    use crate::chain::ChainSelect;

    /// Plain in-memory block store, enough to host a chain.
    #[derive(Debug)]
    struct MapStore {
        collection_id: CollectionId,
        blocks: Mutex<BTreeMap<BlockId, Block>>,
        counter: Mutex<u64>,
    }

    impl MapStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                collection_id: CollectionId(BlockId::new("log-header")),
                blocks: Mutex::new(BTreeMap::new()),
                counter: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl trellis_types::BlockSource for MapStore {
        fn collection_id(&self) -> &CollectionId {
            &self.collection_id
        }

        fn generate_id(&self) -> BlockId {
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            BlockId::new(format!("data-{counter:03}"))
        }

        async fn try_get(&self, id: &BlockId) -> StoreResult<Option<Block>> {
            Ok(self.blocks.lock().unwrap().get(id).cloned())
        }
    }

    #[async_trait]
    impl BlockStore for MapStore {
        async fn insert(&self, block: Block) -> StoreResult<()> {
            self.blocks
                .lock()
                .unwrap()
                .insert(block.header.id.clone(), block);
            Ok(())
        }

        async fn update(&self, id: &BlockId, op: Op) -> StoreResult<()> {
            let mut blocks = self.blocks.lock().unwrap();
            let block = blocks
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            apply_op(&mut block.payload, &op).map_err(|source| StoreError::Op {
                block_id: id.clone(),
                source,
            })?;
            Ok(())
        }

        async fn delete(&self, id: &BlockId) -> StoreResult<()> {
            self.blocks.lock().unwrap().remove(id);
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        content: String,
    }

    fn note(content: &str) -> Note {
        Note {
            content: content.to_string(),
        }
    }

    async fn collect<'a>(
        mut select: ChainSelect<'a, LogEntry<Note>, MapStore>,
    ) -> Vec<LogEntry<Note>> {
        let mut out = Vec::new();
        while let Some((_, entry)) = select.next().await.unwrap() {
            out.push(entry);
        }
        out
    }

    async fn new_log(entries_per_block: usize) -> Log<Note, MapStore> {
        let store = MapStore::new();
        Log::create(store, BlockId::new("log-header"), entries_per_block)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn open_after_create_yields_empty_log() {
        let store = MapStore::new();
        Log::<Note, _>::create(store.clone(), BlockId::new("log-header"), 4)
            .await
            .unwrap();
        let log = Log::<Note, _>::open(store, BlockId::new("log-header"), 4)
            .await
            .unwrap();
        let read = log.get_from(None).await.unwrap();
        assert!(read.entries.is_empty());
        assert_eq!(read.context, ActionContext::default());
    }

    #[tokio::test]
    async fn added_actions_come_back_in_order() {
        let log = new_log(2).await;
        for (i, text) in ["one", "two", "three", "four", "five"].iter().enumerate() {
            let rev = (i + 1) as Rev;
            log.add_actions(
                vec![note(text)],
                ActionId::new(format!("a{rev}")),
                rev,
                |path| vec![path.block_id.clone()],
                None,
                Some(1_000 + rev),
            )
            .await
            .unwrap();
        }

        let read = log.get_from(None).await.unwrap();
        let contents: Vec<String> = read
            .entries
            .iter()
            .map(|entry| entry.as_action().unwrap().actions[0].content.clone())
            .collect();
        assert_eq!(contents, vec!["one", "two", "three", "four", "five"]);

        // Every sealed entry references the block it landed in.
        assert!(read
            .entries
            .iter()
            .all(|entry| !entry.as_action().unwrap().block_ids.is_empty()));
    }

    #[tokio::test]
    async fn get_from_skips_older_revisions() {
        let log = new_log(2).await;
        for rev in 1..=4 {
            log.add_actions(
                vec![note(&format!("n{rev}"))],
                ActionId::new(format!("a{rev}")),
                rev,
                |path| vec![path.block_id.clone()],
                None,
                None,
            )
            .await
            .unwrap();
        }
        let read = log.get_from(Some(2)).await.unwrap();
        assert_eq!(read.entries.len(), 2);
        assert_eq!(read.entries[0].rev, 3);
        assert_eq!(read.entries[1].rev, 4);
    }

    #[tokio::test]
    async fn context_reflects_last_checkpoint() {
        let log = new_log(4).await;
        log.add_actions(
            vec![note("early")],
            ActionId::new("a1"),
            1,
            |path| vec![path.block_id.clone()],
            None,
            None,
        )
        .await
        .unwrap();
        log.add_checkpoint(
            vec![ActionRev {
                action_id: ActionId::new("p1"),
                rev: 1,
            }],
            1,
            None,
        )
        .await
        .unwrap();
        log.add_actions(
            vec![note("late")],
            ActionId::new("a2"),
            2,
            |path| vec![path.block_id.clone()],
            None,
            None,
        )
        .await
        .unwrap();

        let context = log.get_action_context().await.unwrap();
        assert_eq!(context.rev, 1);
        let ids: Vec<&str> = context
            .committed
            .iter()
            .map(|ar| ar.action_id.as_str())
            .collect();
        assert_eq!(ids, vec!["p1", "a2"]);
    }

    #[tokio::test]
    async fn chain_blocks_stay_hash_linked() {
        let log = new_log(1).await;
        for rev in 1..=3 {
            log.add_actions(
                vec![note(&format!("n{rev}"))],
                ActionId::new(format!("a{rev}")),
                rev,
                |path| vec![path.block_id.clone()],
                None,
                None,
            )
            .await
            .unwrap();
        }
        let tail = log.chain().get_tail().await.unwrap().unwrap();
        assert!(log.chain().verify_link(&tail.block_id).await.unwrap());
    }

    #[tokio::test]
    async fn select_walks_both_directions() {
        let log = new_log(2).await;
        for rev in 1..=3 {
            log.add_actions(
                vec![note(&format!("n{rev}"))],
                ActionId::new(format!("a{rev}")),
                rev,
                |path| vec![path.block_id.clone()],
                None,
                None,
            )
            .await
            .unwrap();
        }
        let forward = collect(log.chain().select(None, true)).await;
        let mut backward = collect(log.chain().select(None, false)).await;
        backward.reverse();
        assert_eq!(forward.len(), 3);
        assert_eq!(
            forward.iter().map(|e| e.rev).collect::<Vec<_>>(),
            backward.iter().map(|e| e.rev).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn stage_then_seal_finalizes_block_ids() {
        let log = new_log(4).await;
        let allocation = log
            .stage_actions(vec![note("draft")], ActionId::new("a1"), 1, None, None)
            .await
            .unwrap();
        let staged = log.chain().entry_at(&allocation.path).await.unwrap();
        assert!(staged.as_action().unwrap().block_ids.is_empty());

        let path = allocation.path.clone();
        log.seal_actions(allocation, vec![path.block_id.clone()])
            .await
            .unwrap();
        let sealed = log.chain().entry_at(&path).await.unwrap();
        assert_eq!(sealed.as_action().unwrap().block_ids, vec![path.block_id]);
    }
}
