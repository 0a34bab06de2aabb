use std::{collections::BTreeMap, sync::Arc};

use trellis_config::TransactorConfig;
use trellis_network::{Key, KeyNetwork, PeerRepoRequest, RepoClient, RoutingError};
use trellis_types::{
    block_ids_for_transforms, concat_transform, time::millis_since_epoch, transform_for_block_id,
    ActionContext, ActionId, ActionTransforms, BlockId, CommitOutcome, GetBlockResult,
    PendOutcome, PendPolicy, RepoOperation, Rev, StaleFailure, Transforms,
};

use crate::{
    batch::{batches_for_payload, process_batches, BatchRun, CoordinatorBatch},
    metrics::{TransactorOp, METRICS},
};

#[derive(Debug, thiserror::Error)]
pub enum TransactorError {
    #[error("incomplete read, {} batch(es) unresolved: {}", statuses.len(), statuses.join(", "))]
    IncompleteRead {
        statuses: Vec<String>,
        /// First underlying failure, when one was reported.
        cause: Option<String>,
    },
    #[error("pend did not reach every coordinator: {}", statuses.join(", "))]
    IncompletePend { statuses: Vec<String> },
    #[error("{phase} commit failed: {}", statuses.join(", "))]
    CommitFailed {
        phase: &'static str,
        statuses: Vec<String>,
    },
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

pub type TransactorResult<T> = Result<T, TransactorError>;

#[derive(Debug, Clone)]
pub struct GetRequest {
    pub block_ids: Vec<BlockId>,
    pub context: Option<ActionContext>,
}

#[derive(Debug, Clone)]
pub struct PendRequest {
    pub action_id: ActionId,
    pub transforms: Transforms,
    /// Revision the action intends to commit at, when known.
    pub rev: Option<Rev>,
    pub policy: PendPolicy,
}

#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub action_id: ActionId,
    pub block_ids: Vec<BlockId>,
    pub header_id: Option<BlockId>,
    pub tail_id: BlockId,
    pub rev: Rev,
}

/// Client-side fan-out: one call per logical transaction, dispatched to the
/// coordinator of every affected block, with retry against the rest of the
/// cohort and best-effort cancellation on failure.
#[derive(Clone)]
pub struct Transactor {
    client: Arc<dyn RepoClient>,
    router: Arc<dyn KeyNetwork>,
    config: TransactorConfig,
}

impl std::fmt::Debug for Transactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transactor")
            .field("config", &self.config)
            .finish()
    }
}

fn id_merge(existing: Option<Vec<BlockId>>, block_id: &BlockId) -> Vec<BlockId> {
    let mut payload = existing.unwrap_or_default();
    if !payload.contains(block_id) {
        payload.push(block_id.clone());
    }
    payload
}

impl Transactor {
    pub fn new(
        client: Arc<dyn RepoClient>,
        router: Arc<dyn KeyNetwork>,
        config: TransactorConfig,
    ) -> Self {
        Self {
            client,
            router,
            config,
        }
    }

    /// Reads blocks through their coordinators. A `block: None` response is
    /// a valid "not found"; coordinators that stay silent get one second
    /// chance with the original peer excluded before the read fails as
    /// incomplete.
    pub async fn get(
        &self,
        request: GetRequest,
    ) -> TransactorResult<BTreeMap<BlockId, GetBlockResult>> {
        METRICS.calls[&TransactorOp::Get].inc();
        let now = millis_since_epoch();
        let budget = self.config.operation_timeout().as_millis() as u64;
        let deadline = now + budget;
        // The first pass stops early enough to leave the second chance a
        // real time slice.
        let first_deadline = now + budget / 2;

        let context = request.context.clone();
        let dispatch = |batch: CoordinatorBatch<Vec<BlockId>>| {
            let client = self.client.clone();
            let context = context.clone();
            async move {
                client
                    .get(
                        &batch.peer_id,
                        PeerRepoRequest {
                            operation: RepoOperation::Get {
                                block_ids: batch.payload,
                                context,
                            },
                            expiration: deadline,
                        },
                    )
                    .await
                    .map_err(|err| err.to_string())
            }
        };

        let batches =
            batches_for_payload(&request.block_ids, &id_merge, &[], self.router.as_ref()).await?;
        let first = process_batches(
            batches,
            &dispatch,
            &id_merge,
            self.router.as_ref(),
            first_deadline,
        )
        .await;

        let mut results: BTreeMap<BlockId, GetBlockResult> = BTreeMap::new();
        merge_get_responses(&mut results, &first);

        let mut statuses = Vec::new();
        let missing: Vec<BlockId> = request
            .block_ids
            .iter()
            .filter(|id| !results.contains_key(*id))
            .cloned()
            .collect();

        if !missing.is_empty() && millis_since_epoch() < deadline {
            // Second-chance pass, only for batches that never answered, with
            // the silent peer excluded.
            let mut second_runs = Vec::new();
            for slot in first.incomplete_batches() {
                let excluded = {
                    let mut excluded = slot.batch.excluded_peers.clone();
                    excluded.push(slot.batch.peer_id.clone());
                    excluded
                };
                let retry = batches_for_payload(
                    &slot.batch.block_ids,
                    &id_merge,
                    &excluded,
                    self.router.as_ref(),
                )
                .await?;
                second_runs.push(
                    process_batches(retry, &dispatch, &id_merge, self.router.as_ref(), deadline)
                        .await,
                );
            }
            for run in &second_runs {
                merge_get_responses(&mut results, run);
                statuses.extend(run.statuses());
            }
        }

        let missing: Vec<BlockId> = request
            .block_ids
            .iter()
            .filter(|id| !results.contains_key(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            METRICS.incomplete_reads.inc();
            statuses.extend(first.statuses());
            let cause = first_failure(&first);
            return Err(TransactorError::IncompleteRead { statuses, cause });
        }
        Ok(results)
    }

    /// Publishes an action as pending on every affected block. Blocks that
    /// share a coordinator are pended in one call so the coordinator sees
    /// the whole multi-block action.
    pub async fn pend(&self, request: PendRequest) -> TransactorResult<PendOutcome> {
        METRICS.calls[&TransactorOp::Pend].inc();
        let deadline = millis_since_epoch() + self.config.operation_timeout().as_millis() as u64;
        let block_ids = block_ids_for_transforms(&request.transforms);

        let transforms = request.transforms.clone();
        let merge = move |existing: Option<Transforms>, block_id: &BlockId| {
            let mut acc = existing.unwrap_or_default();
            let slice = transform_for_block_id(&transforms, block_id);
            concat_transform(&mut acc, block_id, slice)
                .expect("slices of one action stay disjoint");
            acc
        };

        let action_id = request.action_id.clone();
        let rev = request.rev;
        let policy = request.policy;
        let dispatch = |batch: CoordinatorBatch<Transforms>| {
            let client = self.client.clone();
            let action_id = action_id.clone();
            async move {
                client
                    .pend(
                        &batch.peer_id,
                        PeerRepoRequest {
                            operation: RepoOperation::Pend {
                                action: ActionTransforms {
                                    action_id,
                                    rev,
                                    transforms: batch.payload,
                                },
                                policy,
                            },
                            expiration: deadline,
                        },
                    )
                    .await
                    .map_err(|err| err.to_string())
            }
        };

        let batches =
            batches_for_payload(&block_ids, &merge, &[], self.router.as_ref()).await?;
        let run =
            process_batches(batches, dispatch, &merge, self.router.as_ref(), deadline).await;

        let mut stale = StaleFailure::default();
        let mut any_stale = false;
        for response in run.responses() {
            if let PendOutcome::Stale(failure) = response {
                any_stale = true;
                stale.merge(failure.clone());
            }
        }
        let all_pending = run.every_batch(|slot| {
            matches!(slot.response(), Some(PendOutcome::Pending { .. }))
        });

        if all_pending {
            // Remember who coordinated each block for the next call.
            for slot in run.all_batches(|slot| slot.succeeded()) {
                for block_id in &slot.batch.block_ids {
                    self.router.record_coordinator(
                        &Key::for_block(block_id),
                        &slot.batch.peer_id,
                        None,
                    );
                }
            }
            return Ok(PendOutcome::Pending { block_ids });
        }

        self.cancel_in_background(request.action_id.clone(), block_ids);
        if any_stale {
            return Ok(PendOutcome::Stale(stale));
        }
        Err(TransactorError::IncompletePend {
            statuses: run.statuses(),
        })
    }

    /// Finalizes a pended action: the optional header first, then the tail,
    /// then everything else. The tail commit is the linearization point;
    /// failures after it are tolerated and healed by reconciliation.
    pub async fn commit(&self, request: CommitRequest) -> TransactorResult<CommitOutcome> {
        METRICS.calls[&TransactorOp::Commit].inc();

        if let Some(header_id) = &request.header_id {
            if *header_id != request.tail_id {
                match self
                    .commit_blocks(&request, std::slice::from_ref(header_id))
                    .await
                {
                    Ok(CommitOutcome::Committed) => {}
                    other => {
                        self.cancel_in_background(
                            request.action_id.clone(),
                            request.block_ids.clone(),
                        );
                        return other.map_err(|statuses| TransactorError::CommitFailed {
                            phase: "header",
                            statuses,
                        });
                    }
                }
            }
        }

        match self
            .commit_blocks(&request, std::slice::from_ref(&request.tail_id))
            .await
        {
            Ok(CommitOutcome::Committed) => {}
            other => {
                self.cancel_in_background(request.action_id.clone(), request.block_ids.clone());
                return other.map_err(|statuses| TransactorError::CommitFailed {
                    phase: "tail",
                    statuses,
                });
            }
        }

        // Past the linearization point: remaining failures are demoted.
        let rest: Vec<BlockId> = request
            .block_ids
            .iter()
            .filter(|id| {
                **id != request.tail_id && Some(*id) != request.header_id.as_ref()
            })
            .cloned()
            .collect();
        if !rest.is_empty() {
            match self.commit_blocks(&request, &rest).await {
                Ok(CommitOutcome::Committed) => {}
                Ok(CommitOutcome::Stale(failure)) => {
                    METRICS.tolerated_commit_failures.inc();
                    tracing::warn!(
                        action_id = %request.action_id,
                        rev = request.rev,
                        ?failure,
                        "non-tail commit reported stale after tail committed; \
                         reconciliation will finalize"
                    );
                }
                Err(statuses) => {
                    METRICS.tolerated_commit_failures.inc();
                    tracing::warn!(
                        action_id = %request.action_id,
                        rev = request.rev,
                        statuses = statuses.join(", "),
                        "non-tail commit incomplete after tail committed; \
                         reconciliation will finalize"
                    );
                }
            }
        }
        Ok(CommitOutcome::Committed)
    }

    /// Best-effort cancel fan-out under its own (shorter) deadline.
    pub async fn cancel(&self, action_id: ActionId, block_ids: Vec<BlockId>) -> TransactorResult<()> {
        METRICS.calls[&TransactorOp::Cancel].inc();
        let deadline =
            millis_since_epoch() + self.config.abort_or_cancel_timeout().as_millis() as u64;

        let dispatch = |batch: CoordinatorBatch<Vec<BlockId>>| {
            let client = self.client.clone();
            let action_id = action_id.clone();
            async move {
                client
                    .cancel(
                        &batch.peer_id,
                        PeerRepoRequest {
                            operation: RepoOperation::Cancel {
                                action_id,
                                block_ids: batch.payload,
                            },
                            expiration: deadline,
                        },
                    )
                    .await
                    .map_err(|err| err.to_string())
            }
        };

        let batches = batches_for_payload(&block_ids, &id_merge, &[], self.router.as_ref()).await?;
        let run =
            process_batches(batches, dispatch, &id_merge, self.router.as_ref(), deadline).await;
        if !run.every_batch(|slot| slot.succeeded()) {
            tracing::debug!(
                action_id = %action_id,
                statuses = run.statuses().join(", "),
                "cancel did not reach every coordinator"
            );
        }
        Ok(())
    }

    /// Commits a subset of the request's blocks through their coordinators.
    /// `Err` carries batch statuses for the caller's aggregate error.
    async fn commit_blocks(
        &self,
        request: &CommitRequest,
        block_ids: &[BlockId],
    ) -> Result<CommitOutcome, Vec<String>> {
        let deadline = millis_since_epoch() + self.config.operation_timeout().as_millis() as u64;
        let action_id = request.action_id.clone();
        let rev = request.rev;

        let dispatch = |batch: CoordinatorBatch<Vec<BlockId>>| {
            let client = self.client.clone();
            let action_id = action_id.clone();
            async move {
                client
                    .commit(
                        &batch.peer_id,
                        PeerRepoRequest {
                            operation: RepoOperation::Commit {
                                action_id,
                                block_ids: batch.payload,
                                rev,
                            },
                            expiration: deadline,
                        },
                    )
                    .await
                    .map_err(|err| err.to_string())
            }
        };

        let batches = batches_for_payload(block_ids, &id_merge, &[], self.router.as_ref())
            .await
            .map_err(|err| vec![err.to_string()])?;
        let run =
            process_batches(batches, dispatch, &id_merge, self.router.as_ref(), deadline).await;

        if !run.every_batch(|slot| slot.succeeded()) {
            return Err(run.statuses());
        }
        let mut stale = StaleFailure::default();
        let mut any_stale = false;
        for response in run.responses() {
            if let CommitOutcome::Stale(failure) = response {
                any_stale = true;
                stale.merge(failure.clone());
            }
        }
        if any_stale {
            Ok(CommitOutcome::Stale(stale))
        } else {
            Ok(CommitOutcome::Committed)
        }
    }

    /// Detached cancel bound to the cancel deadline; its own failures are
    /// swallowed so they never mask the caller's error path.
    fn cancel_in_background(&self, action_id: ActionId, block_ids: Vec<BlockId>) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.cancel(action_id.clone(), block_ids).await {
                tracing::debug!(%action_id, %err, "background cancel failed");
            }
        });
    }
}

fn merge_get_responses(
    results: &mut BTreeMap<BlockId, GetBlockResult>,
    run: &BatchRun<Vec<BlockId>, BTreeMap<BlockId, GetBlockResult>>,
) {
    for response in run.responses() {
        for (block_id, result) in response {
            match results.get(block_id) {
                // Prefer a response that materialized the block; first
                // arrival wins otherwise.
                Some(existing) if existing.block.is_some() || result.block.is_none() => {}
                _ => {
                    results.insert(block_id.clone(), result.clone());
                }
            }
        }
    }
}

fn first_failure<P, R>(run: &BatchRun<P, R>) -> Option<String> {
    run.slots.iter().find_map(|slot| match &slot.outcome {
        Some(crate::batch::BatchOutcome::Failed(details)) => Some(details.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::Mutex,
        time::Duration,
    };

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use trellis_network::{ClientError, ClientResult, RoutingResult, TransportError};
    use trellis_types::{
        Block, BlockHeader, BlockState, BlockType, CollectionId, PeerId, PeerInfo, RepoResponse,
        Transform,
    };

    use super::*;

    fn test_block(id: &str) -> Block {
        Block::new(
            BlockHeader {
                id: BlockId::new(id),
                block_type: BlockType::Other("app".into()),
                collection_id: CollectionId(BlockId::new("col")),
            },
            serde_json::json!({"id": id}),
        )
    }

    /// Routes every key to the first peer not excluded.
    struct ListRouter {
        peers: Vec<PeerId>,
        hints: Mutex<Vec<(Key, PeerId)>>,
    }

    impl ListRouter {
        fn new(peers: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                peers: peers.iter().map(|p| PeerId::new(*p)).collect(),
                hints: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl KeyNetwork for ListRouter {
        async fn find_coordinator(
            &self,
            _key: &Key,
            excluded: &[PeerId],
        ) -> RoutingResult<PeerId> {
            self.peers
                .iter()
                .find(|peer| !excluded.contains(peer))
                .cloned()
                .ok_or_else(|| RoutingError::Directory("exhausted".into()))
        }

        async fn find_cluster(&self, _key: &Key) -> RoutingResult<BTreeMap<PeerId, PeerInfo>> {
            Ok(self
                .peers
                .iter()
                .map(|peer| (peer.clone(), PeerInfo::default()))
                .collect())
        }

        fn record_coordinator(&self, key: &Key, peer: &PeerId, _ttl: Option<Duration>) {
            self.hints.lock().unwrap().push((*key, peer.clone()));
        }
    }

    type Reply = Result<RepoResponse, String>;

    /// Scriptable repo client: per-peer replies plus a call journal.
    #[derive(Default)]
    struct ScriptedClient {
        replies: Mutex<BTreeMap<PeerId, Vec<Reply>>>,
        calls: Mutex<Vec<(PeerId, String)>>,
    }

    impl ScriptedClient {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn script(&self, peer: &str, reply: Reply) {
            self.replies
                .lock()
                .unwrap()
                .entry(PeerId::new(peer))
                .or_default()
                .push(reply);
        }

        fn calls(&self) -> Vec<(PeerId, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RepoClient for ScriptedClient {
        async fn call(
            &self,
            peer: &PeerId,
            request: PeerRepoRequest,
        ) -> ClientResult<RepoResponse> {
            self.calls
                .lock()
                .unwrap()
                .push((peer.clone(), request.operation.kind().to_string()));
            let reply = self
                .replies
                .lock()
                .unwrap()
                .get_mut(peer)
                .and_then(|replies| {
                    if replies.is_empty() {
                        None
                    } else {
                        Some(replies.remove(0))
                    }
                });
            match reply {
                Some(Ok(response)) => Ok(response),
                Some(Err(details)) => Err(ClientError::Rejected {
                    peer: peer.clone(),
                    details,
                }),
                None => Err(ClientError::Transport(TransportError::ConnectionClosed)),
            }
        }
    }

    fn get_response(found: &[&str], missing: &[&str]) -> RepoResponse {
        let mut map = BTreeMap::new();
        for id in found {
            map.insert(
                BlockId::new(*id),
                GetBlockResult {
                    block: Some(test_block(id)),
                    state: BlockState::default(),
                },
            );
        }
        for id in missing {
            map.insert(
                BlockId::new(*id),
                GetBlockResult {
                    block: None,
                    state: BlockState::default(),
                },
            );
        }
        RepoResponse::Get(map)
    }

    fn transactor(client: Arc<ScriptedClient>, router: Arc<ListRouter>) -> Transactor {
        Transactor::new(client, router, TransactorConfig::for_tests())
    }

    fn single_insert(action: &str, block: &str) -> PendRequest {
        let mut transforms = Transforms::default();
        concat_transform(
            &mut transforms,
            &BlockId::new(block),
            Transform::insert(test_block(block)),
        )
        .unwrap();
        PendRequest {
            action_id: ActionId::new(action),
            transforms,
            rev: Some(1),
            policy: PendPolicy::Fail,
        }
    }

    #[tokio::test]
    async fn get_returns_merged_results() {
        let client = ScriptedClient::new();
        client.script("p1", Ok(get_response(&["b1"], &["b2"])));
        let txr = transactor(client.clone(), ListRouter::new(&["p1"]));

        let results = txr
            .get(GetRequest {
                block_ids: vec![BlockId::new("b1"), BlockId::new("b2")],
                context: None,
            })
            .await
            .unwrap();

        assert!(results[&BlockId::new("b1")].block.is_some());
        // b2 answered with "not found", which is a valid response.
        assert!(results[&BlockId::new("b2")].block.is_none());
    }

    #[tokio::test]
    async fn get_retries_failed_coordinator_with_exclusion() {
        let client = ScriptedClient::new();
        // p1 fails outright; the engine retries against p2.
        client.script("p1", Err("connection reset".into()));
        client.script("p2", Ok(get_response(&["b1"], &[])));
        let txr = transactor(client.clone(), ListRouter::new(&["p1", "p2"]));

        let results = txr
            .get(GetRequest {
                block_ids: vec![BlockId::new("b1")],
                context: None,
            })
            .await
            .unwrap();
        assert!(results[&BlockId::new("b1")].block.is_some());
        let calls = client.calls();
        assert_eq!(calls[0].0, PeerId::new("p1"));
        assert_eq!(calls[1].0, PeerId::new("p2"));
    }

    #[tokio::test]
    async fn get_fails_incomplete_when_no_peer_answers() {
        let client = ScriptedClient::new();
        let txr = transactor(client, ListRouter::new(&["p1", "p2"]));

        let err = txr
            .get(GetRequest {
                block_ids: vec![BlockId::new("b1")],
                context: None,
            })
            .await
            .unwrap_err();
        assert_matches!(err, TransactorError::IncompleteRead { cause: Some(_), .. });
    }

    #[tokio::test]
    async fn pend_success_records_coordinator_hints() {
        let client = ScriptedClient::new();
        client.script(
            "p1",
            Ok(RepoResponse::Pend(PendOutcome::Pending {
                block_ids: vec![BlockId::new("b1")],
            })),
        );
        let router = ListRouter::new(&["p1"]);
        let txr = transactor(client, router.clone());

        let outcome = txr.pend(single_insert("a1", "b1")).await.unwrap();
        assert_matches!(outcome, PendOutcome::Pending { .. });
        let hints = router.hints.lock().unwrap();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].1, PeerId::new("p1"));
    }

    #[tokio::test]
    async fn stale_pend_surfaces_aggregated_failure_and_cancels() {
        let client = ScriptedClient::new();
        let stale = StaleFailure {
            missing: vec![],
            pending: vec![trellis_types::ActionPending {
                block_id: BlockId::new("b1"),
                action_id: ActionId::new("other"),
                transform: None,
            }],
        };
        client.script("p1", Ok(RepoResponse::Pend(PendOutcome::Stale(stale))));
        client.script("p1", Ok(RepoResponse::Cancel));
        let txr = transactor(client.clone(), ListRouter::new(&["p1"]));

        let outcome = txr.pend(single_insert("a1", "b1")).await.unwrap();
        let PendOutcome::Stale(failure) = outcome else {
            panic!("expected stale");
        };
        assert_eq!(failure.pending[0].action_id, ActionId::new("other"));

        // The background cancel reaches the coordinator.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let kinds: Vec<String> = client.calls().into_iter().map(|(_, kind)| kind).collect();
        assert!(kinds.contains(&"cancel".to_string()));
    }

    #[tokio::test]
    async fn commit_orders_header_tail_then_rest() {
        let client = ScriptedClient::new();
        for _ in 0..3 {
            client.script("p1", Ok(RepoResponse::Commit(CommitOutcome::Committed)));
        }
        let txr = transactor(client.clone(), ListRouter::new(&["p1"]));

        let outcome = txr
            .commit(CommitRequest {
                action_id: ActionId::new("a1"),
                block_ids: vec![BlockId::new("h"), BlockId::new("t"), BlockId::new("x")],
                header_id: Some(BlockId::new("h")),
                tail_id: BlockId::new("t"),
                rev: 1,
            })
            .await
            .unwrap();
        assert_matches!(outcome, CommitOutcome::Committed);
        // Three separate commit rounds: header, tail, rest.
        let kinds: Vec<String> = client.calls().into_iter().map(|(_, kind)| kind).collect();
        assert_eq!(kinds, vec!["commit", "commit", "commit"]);
    }

    #[tokio::test]
    async fn non_tail_commit_failure_is_tolerated() {
        let client = ScriptedClient::new();
        // Tail commit succeeds; the remaining block's coordinators never
        // answer. The overall commit still succeeds.
        client.script("p1", Ok(RepoResponse::Commit(CommitOutcome::Committed)));
        let txr = transactor(client.clone(), ListRouter::new(&["p1"]));

        let outcome = txr
            .commit(CommitRequest {
                action_id: ActionId::new("a1"),
                block_ids: vec![BlockId::new("t"), BlockId::new("x")],
                header_id: None,
                tail_id: BlockId::new("t"),
                rev: 1,
            })
            .await
            .unwrap();
        assert_matches!(outcome, CommitOutcome::Committed);
    }

    #[tokio::test]
    async fn tail_commit_failure_cancels_and_raises() {
        let client = ScriptedClient::new();
        let txr = transactor(client.clone(), ListRouter::new(&["p1"]));

        let err = txr
            .commit(CommitRequest {
                action_id: ActionId::new("a1"),
                block_ids: vec![BlockId::new("t")],
                header_id: None,
                tail_id: BlockId::new("t"),
                rev: 1,
            })
            .await
            .unwrap_err();
        assert_matches!(err, TransactorError::CommitFailed { phase: "tail", .. });
    }

    #[tokio::test]
    async fn cancel_is_best_effort() {
        let client = ScriptedClient::new();
        let txr = transactor(client, ListRouter::new(&["p1"]));
        // No scripted replies: every call fails, cancel still returns Ok.
        txr.cancel(ActionId::new("a1"), vec![BlockId::new("b1")])
            .await
            .unwrap();
    }
}
