use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    block::Block,
    ids::{ActionContext, ActionId, ActionRev, BlockId, Rev},
    transform::{ActionTransforms, Transform},
};

/// What a pend should do when conflicting pendings already exist on an
/// affected block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendPolicy {
    /// Pend alongside the existing pendings.
    Continue,
    /// Fail, reporting the conflicting action ids.
    Fail,
    /// Fail and return the conflicting transforms as well.
    Return,
}

/// One operation of a repo message. The coordinator executes these against
/// its local repo once its cluster reaches consensus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepoOperation {
    Get {
        block_ids: Vec<BlockId>,
        context: Option<ActionContext>,
    },
    Pend {
        action: ActionTransforms,
        policy: PendPolicy,
    },
    Commit {
        action_id: ActionId,
        block_ids: Vec<BlockId>,
        rev: Rev,
    },
    Cancel {
        action_id: ActionId,
        block_ids: Vec<BlockId>,
    },
}

impl RepoOperation {
    /// The block ids this operation touches.
    pub fn block_ids(&self) -> Vec<BlockId> {
        match self {
            RepoOperation::Get { block_ids, .. }
            | RepoOperation::Commit { block_ids, .. }
            | RepoOperation::Cancel { block_ids, .. } => block_ids.clone(),
            RepoOperation::Pend { action, .. } => {
                crate::transform::block_ids_for_transforms(&action.transforms)
            }
        }
    }

    /// The action id this operation belongs to, when it has one. A pend and
    /// its matching commit or cancel are not in conflict with each other.
    pub fn action_id(&self) -> Option<&ActionId> {
        match self {
            RepoOperation::Get { .. } => None,
            RepoOperation::Pend { action, .. } => Some(&action.action_id),
            RepoOperation::Commit { action_id, .. } | RepoOperation::Cancel { action_id, .. } => {
                Some(action_id)
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RepoOperation::Get { .. } => "get",
            RepoOperation::Pend { .. } => "pend",
            RepoOperation::Commit { .. } => "commit",
            RepoOperation::Cancel { .. } => "cancel",
        }
    }
}

/// A bundle of operations a coordinator sequences through its cluster as one
/// transaction. `expiration` is a unix-millisecond deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoMessage {
    pub operations: Vec<RepoOperation>,
    pub expiration: u64,
}

impl RepoMessage {
    pub fn single(operation: RepoOperation, expiration: u64) -> Self {
        Self {
            operations: vec![operation],
            expiration,
        }
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self
            .operations
            .iter()
            .flat_map(|op| op.block_ids())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Latest committed state of a block as seen by a repo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockState {
    pub latest: Option<ActionRev>,
    pub pendings: Vec<ActionId>,
}

/// Per-block answer to a get. `block: None` is a valid "not found"; an
/// absent response for a requested id is not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlockResult {
    pub block: Option<Block>,
    pub state: BlockState,
}

/// A pending action observed to conflict with a pend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPending {
    pub block_id: BlockId,
    pub action_id: ActionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
}

/// The caller's view is behind the committed state. Always a cleanly
/// returned value, never raised: `missing` lists the actions the caller has
/// to replay, `pending` the conflicting pendings it ran into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleFailure {
    pub missing: Vec<ActionTransforms>,
    pub pending: Vec<ActionPending>,
}

impl StaleFailure {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.pending.is_empty()
    }

    /// Folds another stale failure into this one, dropping duplicates.
    pub fn merge(&mut self, other: StaleFailure) {
        for missing in other.missing {
            if !self
                .missing
                .iter()
                .any(|m| m.action_id == missing.action_id)
            {
                self.missing.push(missing);
            }
        }
        for pending in other.pending {
            if !self
                .pending
                .iter()
                .any(|p| p.action_id == pending.action_id && p.block_id == pending.block_id)
            {
                self.pending.push(pending);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendOutcome {
    Pending { block_ids: Vec<BlockId> },
    Stale(StaleFailure),
}

impl PendOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, PendOutcome::Pending { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOutcome {
    Committed,
    Stale(StaleFailure),
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed)
    }
}

/// One response per operation of a `RepoMessage`, in operation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepoResponse {
    Get(BTreeMap<BlockId, GetBlockResult>),
    Pend(PendOutcome),
    Commit(CommitOutcome),
    Cancel,
}
