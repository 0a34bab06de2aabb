use std::collections::BTreeMap;

use trellis_types::{
    apply_transform, block_ids_for_transforms, transform_for_block_id, ActionContext, ActionId,
    ActionPending, ActionRev, ActionTransforms, Block, BlockId, BlockState, CommitOutcome,
    GetBlockResult, PendOutcome, PendPolicy, Rev, StaleFailure, Transform, Transforms,
};

use crate::raw::{BlockMetadata, RawStorage, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("cannot update missing block {0}; an insert is required first")]
    UpdateOfMissingBlock(BlockId),
    #[error("block {block_id} is inconsistent: {details}")]
    Integrity { block_id: BlockId, details: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// The transactor-side operations on a single peer's store: stage pendings,
/// promote them at a revision, answer reads at arbitrary action contexts.
#[derive(Debug)]
pub struct Repo<S> {
    storage: S,
}

impl<S: RawStorage> Repo<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Stages an action on every block its transforms touch.
    pub async fn pend(
        &self,
        action: &ActionTransforms,
        policy: PendPolicy,
    ) -> RepoResult<PendOutcome> {
        let block_ids = block_ids_for_transforms(&action.transforms);
        let mut stale = StaleFailure::default();
        let mut metas: BTreeMap<BlockId, BlockMetadata> = BTreeMap::new();

        for block_id in &block_ids {
            let slice = transform_for_block_id(&action.transforms, block_id);
            let meta = self.storage.get_metadata(block_id).await?;

            if slice.insert.is_none() && meta.is_none() {
                return Err(RepoError::UpdateOfMissingBlock(block_id.clone()));
            }
            let meta = meta.unwrap_or_default();

            if let Some(caller_rev) = action.rev {
                if caller_rev <= meta.latest_rev() {
                    let missing = self
                        .missing_since(block_id, caller_rev, meta.latest_rev())
                        .await?;
                    stale.merge(StaleFailure {
                        missing,
                        pending: Vec::new(),
                    });
                }
            }

            let conflicting: Vec<&ActionId> = meta
                .pendings
                .iter()
                .filter(|pending| **pending != action.action_id)
                .collect();
            if !conflicting.is_empty() && !matches!(policy, PendPolicy::Continue) {
                for other in conflicting {
                    let transform = match policy {
                        PendPolicy::Return => {
                            self.storage.get_pending_transaction(block_id, other).await?
                        }
                        _ => None,
                    };
                    stale.merge(StaleFailure {
                        missing: Vec::new(),
                        pending: vec![ActionPending {
                            block_id: block_id.clone(),
                            action_id: other.clone(),
                            transform,
                        }],
                    });
                }
            }

            metas.insert(block_id.clone(), meta);
        }

        if !stale.is_empty() {
            return Ok(PendOutcome::Stale(stale));
        }

        for block_id in &block_ids {
            let slice = transform_for_block_id(&action.transforms, block_id);
            self.storage
                .save_pending_transaction(block_id, &action.action_id, &slice)
                .await?;
            let meta = metas.get_mut(block_id).expect("collected above");
            if !meta.pendings.contains(&action.action_id) {
                meta.pendings.push(action.action_id.clone());
            }
            self.storage.save_metadata(block_id, meta).await?;
        }

        Ok(PendOutcome::Pending { block_ids })
    }

    /// Promotes a pending action to committed at `rev` on every listed
    /// block, advancing metadata and materializing the post-action block.
    /// Re-committing the same `(action, rev)` is a no-op success.
    pub async fn commit(
        &self,
        action_id: &ActionId,
        block_ids: &[BlockId],
        rev: Rev,
    ) -> RepoResult<CommitOutcome> {
        let mut stale = StaleFailure::default();
        let mut was_stale = false;

        for block_id in block_ids {
            let meta = self.storage.get_metadata(block_id).await?;
            let Some(meta) = meta else {
                return Err(RepoError::Integrity {
                    block_id: block_id.clone(),
                    details: format!("commit of {action_id} at rev {rev} on unknown block"),
                });
            };

            // Idempotent retry of an already-applied commit.
            if self.storage.get_revision(block_id, rev).await?.as_ref() == Some(action_id) {
                continue;
            }

            // A block records the collection revisions that touched it, so
            // upward gaps are fine; anything at or below the latest rev is
            // a stale caller.
            if rev <= meta.latest_rev() {
                let missing = self
                    .missing_since(block_id, rev, meta.latest_rev())
                    .await?;
                stale.merge(StaleFailure {
                    missing,
                    pending: Vec::new(),
                });
                was_stale = true;
                continue;
            }

            let Some(transform) = self
                .storage
                .get_pending_transaction(block_id, action_id)
                .await?
            else {
                return Err(RepoError::Integrity {
                    block_id: block_id.clone(),
                    details: format!("commit of {action_id} without a pending transform"),
                });
            };

            let prior = match &meta.latest {
                None => None,
                Some(latest) => self
                    .materialized_at(block_id, &latest.action_id)
                    .await?,
            };
            let materialized =
                apply_transform(prior.as_ref(), &transform).map_err(|source| {
                    RepoError::Integrity {
                        block_id: block_id.clone(),
                        details: format!("transform of {action_id} failed to apply: {source}"),
                    }
                })?;

            self.storage
                .save_materialized_block(block_id, action_id, materialized.as_ref())
                .await?;
            self.storage
                .promote_pending_transaction(block_id, action_id)
                .await?;
            self.storage.save_revision(block_id, rev, action_id).await?;

            let mut meta = meta;
            meta.latest = Some(ActionRev {
                action_id: action_id.clone(),
                rev,
            });
            meta.pendings.retain(|pending| pending != action_id);
            self.storage.save_metadata(block_id, &meta).await?;
        }

        if was_stale {
            Ok(CommitOutcome::Stale(stale))
        } else {
            Ok(CommitOutcome::Committed)
        }
    }

    /// Drops a pending action from every listed block. Cancelling something
    /// that is not pending is a no-op.
    pub async fn cancel(&self, action_id: &ActionId, block_ids: &[BlockId]) -> RepoResult<()> {
        for block_id in block_ids {
            self.storage
                .delete_pending_transaction(block_id, action_id)
                .await?;
            if let Some(mut meta) = self.storage.get_metadata(block_id).await? {
                if meta.pendings.iter().any(|pending| pending == action_id) {
                    meta.pendings.retain(|pending| pending != action_id);
                    self.storage.save_metadata(block_id, &meta).await?;
                }
            }
        }
        Ok(())
    }

    /// Reads blocks at the latest committed state, or pinned to a context.
    pub async fn get(
        &self,
        block_ids: &[BlockId],
        context: Option<&ActionContext>,
    ) -> RepoResult<BTreeMap<BlockId, GetBlockResult>> {
        let mut results = BTreeMap::new();
        for block_id in block_ids {
            let meta = self.storage.get_metadata(block_id).await?;
            let Some(meta) = meta else {
                results.insert(
                    block_id.clone(),
                    GetBlockResult {
                        block: None,
                        state: BlockState::default(),
                    },
                );
                continue;
            };

            let state = BlockState {
                latest: meta.latest.clone(),
                pendings: meta.pendings.clone(),
            };
            let block = match context {
                None => match &meta.latest {
                    None => None,
                    Some(latest) => self.materialized_at(block_id, &latest.action_id).await?,
                },
                Some(context) => self.block_at_context(block_id, &meta, context).await?,
            };
            results.insert(block_id.clone(), GetBlockResult { block, state });
        }
        Ok(results)
    }

    /// View of one block consistent with applying every action the context
    /// names up to its rev.
    async fn block_at_context(
        &self,
        block_id: &BlockId,
        meta: &BlockMetadata,
        context: &ActionContext,
    ) -> RepoResult<Option<Block>> {
        // Base: the highest committed revision at or below the context rev.
        let base = if meta.latest_rev() <= context.rev {
            meta.latest.clone()
        } else {
            self.storage
                .list_revisions(block_id, 1, context.rev)
                .await?
                .into_iter()
                .last()
        };

        let (mut block, base_rev) = match base {
            None => (None, 0),
            Some(base) => {
                let block = self.materialized_at(block_id, &base.action_id).await?;
                (block, base.rev)
            }
        };

        // Overlay actions the reader knows about that are still pending (or
        // already committed) here above the base.
        for action_rev in &context.committed {
            if action_rev.rev <= base_rev || action_rev.rev > context.rev {
                continue;
            }
            let transform = match self
                .storage
                .get_pending_transaction(block_id, &action_rev.action_id)
                .await?
            {
                Some(transform) => Some(transform),
                None => {
                    self.storage
                        .get_committed_transaction(block_id, &action_rev.action_id)
                        .await?
                }
            };
            let Some(transform) = transform else {
                continue;
            };
            block = apply_transform(block.as_ref(), &transform).map_err(|source| {
                RepoError::Integrity {
                    block_id: block_id.clone(),
                    details: format!(
                        "context overlay of {} failed to apply: {source}",
                        action_rev.action_id
                    ),
                }
            })?;
        }
        Ok(block)
    }

    /// The materialized block after `action_id`; missing history is an
    /// integrity failure so the caller can restore from its cohort.
    async fn materialized_at(
        &self,
        block_id: &BlockId,
        action_id: &ActionId,
    ) -> RepoResult<Option<Block>> {
        self.storage
            .get_materialized_block(block_id, action_id)
            .await?
            .ok_or_else(|| RepoError::Integrity {
                block_id: block_id.clone(),
                details: format!("materialized block missing for action {action_id}"),
            })
    }

    /// Actions the caller must replay to advance from `from` to `to`,
    /// grouped per action with the transforms that landed on this block.
    async fn missing_since(
        &self,
        block_id: &BlockId,
        from: Rev,
        to: Rev,
    ) -> RepoResult<Vec<ActionTransforms>> {
        if from > to {
            return Ok(Vec::new());
        }
        let mut missing = Vec::new();
        for action_rev in self.storage.list_revisions(block_id, from, to).await? {
            let transform = self
                .storage
                .get_committed_transaction(block_id, &action_rev.action_id)
                .await?
                .unwrap_or_default();
            let mut transforms = Transforms::default();
            place_transform(&mut transforms, block_id, transform);
            missing.push(ActionTransforms {
                action_id: action_rev.action_id,
                rev: Some(action_rev.rev),
                transforms,
            });
        }
        Ok(missing)
    }
}

fn place_transform(transforms: &mut Transforms, block_id: &BlockId, transform: Transform) {
    if let Some(block) = transform.insert {
        transforms.inserts.insert(block_id.clone(), block);
    } else if transform.delete {
        transforms.deletes.insert(block_id.clone());
    } else if !transform.updates.is_empty() {
        transforms.updates.insert(block_id.clone(), transform.updates);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;
    use trellis_types::{
        concat_transform, BlockHeader, BlockType, CollectionId, Op, Transform,
    };

    use super::*;
    use crate::mem::MemStorage;

    fn repo() -> Repo<MemStorage> {
        Repo::new(MemStorage::new())
    }

    fn block(id: &str, payload: serde_json::Value) -> Block {
        Block::new(
            BlockHeader {
                id: BlockId::new(id),
                block_type: BlockType::Other("app".into()),
                collection_id: CollectionId(BlockId::new("col")),
            },
            payload,
        )
    }

    fn insert_action(action: &str, id: &str, payload: serde_json::Value) -> ActionTransforms {
        let mut transforms = Transforms::default();
        concat_transform(
            &mut transforms,
            &BlockId::new(id),
            Transform::insert(block(id, payload)),
        )
        .unwrap();
        ActionTransforms {
            action_id: ActionId::new(action),
            rev: Some(1),
            transforms,
        }
    }

    fn update_action(action: &str, id: &str, rev: Rev, op: Op) -> ActionTransforms {
        let mut transforms = Transforms::default();
        concat_transform(&mut transforms, &BlockId::new(id), Transform::updates(vec![op]))
            .unwrap();
        ActionTransforms {
            action_id: ActionId::new(action),
            rev: Some(rev),
            transforms,
        }
    }

    #[tokio::test]
    async fn pend_commit_get_round_trip() {
        let repo = repo();
        let action = insert_action("a1", "b1", json!({"n": 1}));

        let outcome = repo.pend(&action, PendPolicy::Fail).await.unwrap();
        assert_matches!(outcome, PendOutcome::Pending { .. });

        let outcome = repo
            .commit(&ActionId::new("a1"), &[BlockId::new("b1")], 1)
            .await
            .unwrap();
        assert_matches!(outcome, CommitOutcome::Committed);

        let results = repo.get(&[BlockId::new("b1")], None).await.unwrap();
        let result = &results[&BlockId::new("b1")];
        assert_eq!(result.block.as_ref().unwrap().payload, json!({"n": 1}));
        assert_eq!(
            result.state.latest,
            Some(ActionRev {
                action_id: ActionId::new("a1"),
                rev: 1
            })
        );
    }

    #[tokio::test]
    async fn update_of_missing_block_is_refused() {
        let repo = repo();
        let action = update_action("a1", "nope", 1, Op::set(vec!["n".into()], json!(2)));
        let err = repo.pend(&action, PendPolicy::Fail).await.unwrap_err();
        assert_matches!(err, RepoError::UpdateOfMissingBlock(id) if id == BlockId::new("nope"));
    }

    #[tokio::test]
    async fn conflicting_pend_reports_stale_with_pending() {
        let repo = repo();
        repo.pend(&insert_action("a1", "b1", json!({})), PendPolicy::Fail)
            .await
            .unwrap();

        let conflicting = insert_action("a2", "b1", json!({}));
        let outcome = repo.pend(&conflicting, PendPolicy::Fail).await.unwrap();
        let PendOutcome::Stale(stale) = outcome else {
            panic!("expected stale outcome");
        };
        assert_eq!(stale.pending.len(), 1);
        assert_eq!(stale.pending[0].action_id, ActionId::new("a1"));
        assert!(stale.pending[0].transform.is_none());

        // Return policy also carries the conflicting transform.
        let outcome = repo.pend(&conflicting, PendPolicy::Return).await.unwrap();
        let PendOutcome::Stale(stale) = outcome else {
            panic!("expected stale outcome");
        };
        assert!(stale.pending[0].transform.is_some());

        // Continue policy pends alongside.
        let outcome = repo.pend(&conflicting, PendPolicy::Continue).await.unwrap();
        assert_matches!(outcome, PendOutcome::Pending { .. });
    }

    #[tokio::test]
    async fn stale_rev_lists_missing_actions() {
        let repo = repo();
        repo.pend(&insert_action("a1", "b1", json!({"n": 0})), PendPolicy::Fail)
            .await
            .unwrap();
        repo.commit(&ActionId::new("a1"), &[BlockId::new("b1")], 1)
            .await
            .unwrap();

        // A second caller still believing rev 1 is next must replay a1.
        let behind = insert_action("a2", "b1", json!({"n": 9}));
        let outcome = repo.pend(&behind, PendPolicy::Fail).await.unwrap();
        let PendOutcome::Stale(stale) = outcome else {
            panic!("expected stale outcome");
        };
        assert_eq!(stale.missing.len(), 1);
        assert_eq!(stale.missing[0].action_id, ActionId::new("a1"));
        assert_eq!(stale.missing[0].rev, Some(1));
    }

    #[tokio::test]
    async fn commit_is_idempotent_and_rejects_stale_revs() {
        let repo = repo();
        repo.pend(&insert_action("a1", "b1", json!({})), PendPolicy::Fail)
            .await
            .unwrap();
        repo.commit(&ActionId::new("a1"), &[BlockId::new("b1")], 1)
            .await
            .unwrap();

        // Same (action, rev) again: no-op success.
        let outcome = repo
            .commit(&ActionId::new("a1"), &[BlockId::new("b1")], 1)
            .await
            .unwrap();
        assert_matches!(outcome, CommitOutcome::Committed);

        // A commit at or below the latest rev is stale and lists what the
        // caller must replay.
        let update = update_action("a2", "b1", 2, Op::set(vec!["n".into()], json!(1)));
        repo.pend(&update, PendPolicy::Fail).await.unwrap();
        let outcome = repo
            .commit(&ActionId::new("a2"), &[BlockId::new("b1")], 1)
            .await
            .unwrap();
        let CommitOutcome::Stale(stale) = outcome else {
            panic!("expected stale commit");
        };
        assert_eq!(stale.missing[0].action_id, ActionId::new("a1"));

        // An upward gap commits fine: intermediate collection revisions
        // simply did not touch this block.
        let outcome = repo
            .commit(&ActionId::new("a2"), &[BlockId::new("b1")], 4)
            .await
            .unwrap();
        assert_matches!(outcome, CommitOutcome::Committed);
    }

    #[tokio::test]
    async fn cancel_unstages_a_pending_action() {
        let repo = repo();
        repo.pend(&insert_action("a1", "b1", json!({})), PendPolicy::Fail)
            .await
            .unwrap();
        repo.cancel(&ActionId::new("a1"), &[BlockId::new("b1")])
            .await
            .unwrap();

        let results = repo.get(&[BlockId::new("b1")], None).await.unwrap();
        assert!(results[&BlockId::new("b1")].state.pendings.is_empty());

        // The slot is free again.
        let outcome = repo
            .pend(&insert_action("a2", "b1", json!({})), PendPolicy::Fail)
            .await
            .unwrap();
        assert_matches!(outcome, PendOutcome::Pending { .. });
    }

    #[tokio::test]
    async fn context_read_pins_to_older_revision() {
        let repo = repo();
        repo.pend(&insert_action("a1", "b1", json!({"n": 1})), PendPolicy::Fail)
            .await
            .unwrap();
        repo.commit(&ActionId::new("a1"), &[BlockId::new("b1")], 1)
            .await
            .unwrap();
        repo.pend(
            &update_action("a2", "b1", 2, Op::set(vec!["n".into()], json!(2))),
            PendPolicy::Fail,
        )
        .await
        .unwrap();
        repo.commit(&ActionId::new("a2"), &[BlockId::new("b1")], 2)
            .await
            .unwrap();

        let pinned = ActionContext {
            committed: vec![],
            rev: 1,
        };
        let results = repo
            .get(&[BlockId::new("b1")], Some(&pinned))
            .await
            .unwrap();
        assert_eq!(
            results[&BlockId::new("b1")].block.as_ref().unwrap().payload,
            json!({"n": 1})
        );

        let results = repo.get(&[BlockId::new("b1")], None).await.unwrap();
        assert_eq!(
            results[&BlockId::new("b1")].block.as_ref().unwrap().payload,
            json!({"n": 2})
        );
    }

    #[tokio::test]
    async fn context_read_overlays_known_pendings() {
        let repo = repo();
        repo.pend(&insert_action("a1", "b1", json!({"n": 1})), PendPolicy::Fail)
            .await
            .unwrap();
        repo.commit(&ActionId::new("a1"), &[BlockId::new("b1")], 1)
            .await
            .unwrap();
        // a2 is pending here but the reader already knows it commits at 2.
        repo.pend(
            &update_action("a2", "b1", 2, Op::set(vec!["n".into()], json!(5))),
            PendPolicy::Fail,
        )
        .await
        .unwrap();

        let context = ActionContext {
            committed: vec![ActionRev {
                action_id: ActionId::new("a2"),
                rev: 2,
            }],
            rev: 2,
        };
        let results = repo
            .get(&[BlockId::new("b1")], Some(&context))
            .await
            .unwrap();
        assert_eq!(
            results[&BlockId::new("b1")].block.as_ref().unwrap().payload,
            json!({"n": 5})
        );
    }

    #[tokio::test]
    async fn unknown_block_reads_as_not_found() {
        let repo = repo();
        let results = repo.get(&[BlockId::new("ghost")], None).await.unwrap();
        let result = &results[&BlockId::new("ghost")];
        assert!(result.block.is_none());
        assert!(result.state.latest.is_none());
    }
}
