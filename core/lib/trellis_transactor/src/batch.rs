use std::{collections::BTreeMap, future::Future, time::Duration};

use futures::stream::{FuturesUnordered, StreamExt};
use trellis_network::{Key, KeyNetwork, RoutingResult};
use trellis_types::{time::millis_since_epoch, BlockId, PeerId};

use crate::metrics::METRICS;

/// The unit of fan-out: every block currently coordinated by `peer_id`,
/// with the payload slice those blocks contribute to the call.
#[derive(Debug, Clone)]
pub struct CoordinatorBatch<P> {
    pub peer_id: PeerId,
    pub block_ids: Vec<BlockId>,
    pub payload: P,
    /// Peers already tried (and failed) for these blocks.
    pub excluded_peers: Vec<PeerId>,
}

#[derive(Debug, Clone)]
pub enum BatchOutcome<R> {
    Ok(R),
    Failed(String),
}

/// A batch plus its position in the retry forest. `root` points at the
/// original batch a retry descends from, keeping the forest flat: retries
/// of retries attach to the same root.
#[derive(Debug)]
pub struct BatchSlot<P, R> {
    pub batch: CoordinatorBatch<P>,
    pub outcome: Option<BatchOutcome<R>>,
    pub root: usize,
}

impl<P, R> BatchSlot<P, R> {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, Some(BatchOutcome::Ok(_)))
    }

    pub fn response(&self) -> Option<&R> {
        match &self.outcome {
            Some(BatchOutcome::Ok(response)) => Some(response),
            _ => None,
        }
    }

    fn state(&self) -> String {
        match &self.outcome {
            None => "in-flight".to_string(),
            Some(BatchOutcome::Ok(_)) => "ok".to_string(),
            Some(BatchOutcome::Failed(details)) => format!("failed: {details}"),
        }
    }
}

/// Result of driving a set of batches: the initial batches and every retry,
/// with the `root` association flattening the retry tree.
#[derive(Debug)]
pub struct BatchRun<P, R> {
    pub slots: Vec<BatchSlot<P, R>>,
}

impl<P, R> BatchRun<P, R> {
    pub fn roots(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(index, slot)| slot.root == *index)
            .map(|(index, _)| index)
    }

    /// Slots that never produced an outcome before the deadline.
    pub fn incomplete_batches(&self) -> Vec<&BatchSlot<P, R>> {
        self.slots
            .iter()
            .filter(|slot| slot.outcome.is_none())
            .collect()
    }

    pub fn all_batches<F>(&self, predicate: F) -> Vec<&BatchSlot<P, R>>
    where
        F: Fn(&BatchSlot<P, R>) -> bool,
    {
        self.slots.iter().filter(|slot| predicate(slot)).collect()
    }

    /// Holds iff, for every root, some batch in its retry chain satisfies
    /// the predicate: a response that arrives anywhere in the chain counts.
    pub fn every_batch<F>(&self, predicate: F) -> bool
    where
        F: Fn(&BatchSlot<P, R>) -> bool,
    {
        self.roots().all(|root| {
            self.slots
                .iter()
                .any(|slot| slot.root == root && predicate(slot))
        })
    }

    /// Successful responses anywhere in the run, root-first.
    pub fn responses(&self) -> Vec<&R> {
        self.slots.iter().filter_map(|slot| slot.response()).collect()
    }

    /// Per-batch status strings of the shape `{peer}[block:{id}]({state})`.
    pub fn statuses(&self) -> Vec<String> {
        self.slots
            .iter()
            .flat_map(|slot| {
                let state = slot.state();
                slot.batch
                    .block_ids
                    .iter()
                    .map(move |id| format!("{}[block:{}]({})", slot.batch.peer_id, id, state))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// Groups `(block, peer)` pairs by peer, folding each block's payload slice
/// into the peer's batch. `merge(None, id)` starts a fresh payload.
pub fn batches_by_peer<P, M>(
    pairs: Vec<(BlockId, PeerId)>,
    merge: &M,
    excluded: &[PeerId],
) -> Vec<CoordinatorBatch<P>>
where
    M: Fn(Option<P>, &BlockId) -> P,
{
    let mut grouped: BTreeMap<PeerId, (Vec<BlockId>, Option<P>)> = BTreeMap::new();
    for (block_id, peer_id) in pairs {
        let (block_ids, payload) = grouped.entry(peer_id).or_insert_with(|| (Vec::new(), None));
        *payload = Some(merge(payload.take(), &block_id));
        if !block_ids.contains(&block_id) {
            block_ids.push(block_id);
        }
    }
    grouped
        .into_iter()
        .map(|(peer_id, (block_ids, payload))| CoordinatorBatch {
            peer_id,
            block_ids,
            payload: payload.expect("every batch folds at least one block"),
            excluded_peers: excluded.to_vec(),
        })
        .collect()
}

/// Resolves a coordinator per distinct block id and groups the result by
/// peer.
pub async fn batches_for_payload<P, M>(
    block_ids: &[BlockId],
    merge: &M,
    excluded: &[PeerId],
    router: &dyn KeyNetwork,
) -> RoutingResult<Vec<CoordinatorBatch<P>>>
where
    M: Fn(Option<P>, &BlockId) -> P,
{
    let mut distinct: Vec<BlockId> = block_ids.to_vec();
    distinct.sort();
    distinct.dedup();

    let mut pairs = Vec::with_capacity(distinct.len());
    for block_id in distinct {
        let peer = router
            .find_coordinator(&Key::for_block(&block_id), excluded)
            .await?;
        pairs.push((block_id, peer));
    }
    Ok(batches_by_peer(pairs, merge, excluded))
}

/// Drives a set of batches to completion. Every batch is dispatched
/// concurrently; a failure before `expiration` re-resolves coordinators for
/// the failed blocks (excluding the peer that failed) and attaches the new
/// batches to the original root. Batches still unanswered at the deadline
/// stay `in-flight`.
pub async fn process_batches<P, R, M, F, Fut>(
    initial: Vec<CoordinatorBatch<P>>,
    process: F,
    merge: &M,
    router: &dyn KeyNetwork,
    expiration: u64,
) -> BatchRun<P, R>
where
    P: Clone,
    M: Fn(Option<P>, &BlockId) -> P,
    F: Fn(CoordinatorBatch<P>) -> Fut,
    Fut: Future<Output = Result<R, String>>,
{
    let mut run = BatchRun { slots: Vec::new() };
    let mut in_flight = FuturesUnordered::new();

    let dispatch = |slot_index: usize, batch: CoordinatorBatch<P>| {
        let remaining = expiration.saturating_sub(millis_since_epoch());
        let fut = process(batch);
        async move {
            if remaining == 0 {
                // Past the deadline: report as in-flight, do not dispatch.
                return (slot_index, None);
            }
            match tokio::time::timeout(Duration::from_millis(remaining), fut).await {
                Ok(result) => (slot_index, Some(result)),
                Err(_) => (slot_index, None),
            }
        }
    };

    for batch in initial {
        let index = run.slots.len();
        in_flight.push(dispatch(index, batch.clone()));
        run.slots.push(BatchSlot {
            batch,
            outcome: None,
            root: index,
        });
    }

    while let Some((index, result)) = in_flight.next().await {
        match result {
            None => {
                // Timed out: stays in-flight; no retry past the deadline.
            }
            Some(Ok(response)) => {
                run.slots[index].outcome = Some(BatchOutcome::Ok(response));
            }
            Some(Err(details)) => {
                run.slots[index].outcome = Some(BatchOutcome::Failed(details));
                if millis_since_epoch() >= expiration {
                    continue;
                }
                METRICS.batch_retries.inc();

                let root = run.slots[index].root;
                let failed = &run.slots[index].batch;
                let mut excluded = failed.excluded_peers.clone();
                if !excluded.contains(&failed.peer_id) {
                    excluded.push(failed.peer_id.clone());
                }
                match batches_for_payload(&failed.block_ids, merge, &excluded, router).await {
                    Ok(retries) => {
                        for retry in retries {
                            let retry_index = run.slots.len();
                            in_flight.push(dispatch(retry_index, retry.clone()));
                            run.slots.push(BatchSlot {
                                batch: retry,
                                outcome: None,
                                root,
                            });
                        }
                    }
                    Err(err) => {
                        tracing::debug!(%err, "no further coordinators for failed batch");
                    }
                }
            }
        }
    }

    run
}
