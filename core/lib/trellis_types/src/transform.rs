use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    block::Block,
    ids::{ActionId, BlockId, Rev},
    ops::Op,
};

/// The slice of one action that touches a single block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    pub insert: Option<Block>,
    pub updates: Vec<Op>,
    pub delete: bool,
}

impl Transform {
    pub fn insert(block: Block) -> Self {
        Self {
            insert: Some(block),
            ..Self::default()
        }
    }

    pub fn updates(ops: Vec<Op>) -> Self {
        Self {
            updates: ops,
            ..Self::default()
        }
    }

    pub fn delete() -> Self {
        Self {
            delete: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.insert.is_none() && self.updates.is_empty() && !self.delete
    }
}

/// All block mutations produced by one action. A single block appears in at
/// most one of the three groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transforms {
    pub inserts: BTreeMap<BlockId, Block>,
    pub updates: BTreeMap<BlockId, Vec<Op>>,
    pub deletes: BTreeSet<BlockId>,
}

impl Transforms {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }
}

/// A `Transforms` value attributed to its action, optionally pinned to the
/// revision the caller believes it commits at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTransforms {
    pub action_id: ActionId,
    pub rev: Option<Rev>,
    pub transforms: Transforms,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("block {0} is already inserted in this action")]
    AlreadyInserted(BlockId),
    #[error("block {0} is already deleted in this action")]
    AlreadyDeleted(BlockId),
    #[error("block {0} is already updated in this action")]
    AlreadyUpdated(BlockId),
}

/// Projects the slice of `transforms` touching `id`.
pub fn transform_for_block_id(transforms: &Transforms, id: &BlockId) -> Transform {
    Transform {
        insert: transforms.inserts.get(id).cloned(),
        updates: transforms.updates.get(id).cloned().unwrap_or_default(),
        delete: transforms.deletes.contains(id),
    }
}

/// Merges a single block's slice into an accumulator, enforcing that a block
/// is inserted xor updated xor deleted within one action. Updates folded
/// onto an existing update list are appended in order.
pub fn concat_transform(
    acc: &mut Transforms,
    id: &BlockId,
    transform: Transform,
) -> Result<(), TransformError> {
    if let Some(block) = transform.insert {
        if acc.inserts.contains_key(id) {
            return Err(TransformError::AlreadyInserted(id.clone()));
        }
        if acc.deletes.contains(id) {
            return Err(TransformError::AlreadyDeleted(id.clone()));
        }
        if acc.updates.contains_key(id) {
            return Err(TransformError::AlreadyUpdated(id.clone()));
        }
        acc.inserts.insert(id.clone(), block);
        return Ok(());
    }
    if transform.delete {
        if acc.inserts.contains_key(id) {
            return Err(TransformError::AlreadyInserted(id.clone()));
        }
        acc.updates.remove(id);
        acc.deletes.insert(id.clone());
        return Ok(());
    }
    if transform.updates.is_empty() {
        return Ok(());
    }
    if acc.deletes.contains(id) {
        return Err(TransformError::AlreadyDeleted(id.clone()));
    }
    if acc.inserts.contains_key(id) {
        return Err(TransformError::AlreadyInserted(id.clone()));
    }
    acc.updates
        .entry(id.clone())
        .or_default()
        .extend(transform.updates);
    Ok(())
}

/// The set of blocks an action touches, in id order.
pub fn block_ids_for_transforms(transforms: &Transforms) -> Vec<BlockId> {
    let mut ids: BTreeSet<&BlockId> = transforms.inserts.keys().collect();
    ids.extend(transforms.updates.keys());
    ids.extend(transforms.deletes.iter());
    ids.into_iter().cloned().collect()
}

/// Groups a list of action transforms by action id, concatenating the
/// transforms of duplicate entries. Input order of first appearance is kept.
pub fn distinct_block_action_transforms(
    items: Vec<ActionTransforms>,
) -> Result<Vec<ActionTransforms>, TransformError> {
    let mut order: Vec<ActionId> = Vec::new();
    let mut grouped: BTreeMap<ActionId, ActionTransforms> = BTreeMap::new();
    for item in items {
        match grouped.get_mut(&item.action_id) {
            None => {
                order.push(item.action_id.clone());
                grouped.insert(item.action_id.clone(), item);
            }
            Some(existing) => {
                if existing.rev.is_none() {
                    existing.rev = item.rev;
                }
                for id in block_ids_for_transforms(&item.transforms) {
                    let slice = transform_for_block_id(&item.transforms, &id);
                    concat_transform(&mut existing.transforms, &id, slice)?;
                }
            }
        }
    }
    Ok(order
        .into_iter()
        .filter_map(|id| grouped.remove(&id))
        .collect())
}
