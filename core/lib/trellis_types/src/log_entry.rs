use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::ids::{ActionId, ActionRev, BlockId, CollectionId, Rev};

/// A committed client action recorded in a collection log. `block_ids` names
/// the log blocks the entry landed in; it is finalized only after that
/// allocation is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEntry<A> {
    pub action_id: ActionId,
    pub actions: Vec<A>,
    pub block_ids: Vec<BlockId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_ids: Option<Vec<CollectionId>>,
}

/// Restates the set of still-pending actions so that readers may prune log
/// entries older than the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub pendings: Vec<ActionRev>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntryKind<A> {
    Action(ActionEntry<A>),
    Checkpoint(CheckpointEntry),
}

/// One record of a collection's append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry<A> {
    pub timestamp: u64,
    pub rev: Rev,
    pub kind: LogEntryKind<A>,
}

impl<A: Serialize + DeserializeOwned> LogEntry<A> {
    pub fn action(
        timestamp: u64,
        rev: Rev,
        action_id: ActionId,
        actions: Vec<A>,
        collection_ids: Option<Vec<CollectionId>>,
    ) -> Self {
        Self {
            timestamp,
            rev,
            kind: LogEntryKind::Action(ActionEntry {
                action_id,
                actions,
                block_ids: Vec::new(),
                collection_ids,
            }),
        }
    }

    pub fn checkpoint(timestamp: u64, rev: Rev, pendings: Vec<ActionRev>) -> Self {
        Self {
            timestamp,
            rev,
            kind: LogEntryKind::Checkpoint(CheckpointEntry { pendings }),
        }
    }

    pub fn as_action(&self) -> Option<&ActionEntry<A>> {
        match &self.kind {
            LogEntryKind::Action(entry) => Some(entry),
            LogEntryKind::Checkpoint(_) => None,
        }
    }

    pub fn as_checkpoint(&self) -> Option<&CheckpointEntry> {
        match &self.kind {
            LogEntryKind::Checkpoint(entry) => Some(entry),
            LogEntryKind::Action(_) => None,
        }
    }
}
