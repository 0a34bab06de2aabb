use std::{collections::BTreeMap, sync::Arc};

use trellis_network::{Key, KeyNetwork, PeerRepoRequest, RepoClient};
use trellis_storage::{BlockMetadata, RawStorage, Repo};
use trellis_types::{
    time::millis_since_epoch, ActionContext, BlockId, GetBlockResult, PeerId, RepoOperation,
};

use crate::metrics::METRICS;

/// Fetches one block from the cohort responsible for it, verifies that a
/// majority of responders agree, and repairs the local repo with the
/// agreed state. Returns the restored view.
///
/// Repair covers the metadata and the materialized block at the latest
/// committed action; historical transforms stay with the peers that hold
/// them.
pub async fn restore_block<S: RawStorage>(
    repo: &Repo<S>,
    router: &dyn KeyNetwork,
    client: &Arc<dyn RepoClient>,
    self_id: &PeerId,
    block_id: &BlockId,
    context: Option<&ActionContext>,
    fanout: usize,
    deadline_ms: u64,
) -> anyhow::Result<GetBlockResult> {
    let cohort = router.find_cluster(&Key::for_block(block_id)).await?;
    let peers: Vec<PeerId> = cohort
        .keys()
        .filter(|peer| *peer != self_id)
        .take(fanout.max(1))
        .cloned()
        .collect();
    if peers.is_empty() {
        METRICS.failed_restores.inc();
        anyhow::bail!("no cohort peer available to restore {block_id}");
    }

    let mut responses: Vec<GetBlockResult> = Vec::new();
    for peer in &peers {
        let request = PeerRepoRequest {
            operation: RepoOperation::Get {
                block_ids: vec![block_id.clone()],
                context: context.cloned(),
            },
            expiration: millis_since_epoch() + deadline_ms,
        };
        match client.get(peer, request).await {
            Ok(mut results) => {
                if let Some(result) = results.remove(block_id) {
                    responses.push(result);
                }
            }
            Err(err) => {
                tracing::debug!(%peer, %block_id, %err, "restore fetch failed");
            }
        }
    }
    if responses.is_empty() {
        METRICS.failed_restores.inc();
        anyhow::bail!("no cohort peer answered while restoring {block_id}");
    }

    // Majority agreement over the responder set.
    let mut tallies: BTreeMap<String, (usize, GetBlockResult)> = BTreeMap::new();
    for response in &responses {
        let fingerprint = format!(
            "{:?}|{:?}",
            response.state.latest,
            response.block.as_ref().map(|block| &block.payload)
        );
        tallies
            .entry(fingerprint)
            .and_modify(|(count, _)| *count += 1)
            .or_insert((1, response.clone()));
    }
    let (count, agreed) = tallies
        .into_values()
        .max_by_key(|(count, _)| *count)
        .expect("responses is non-empty");
    if count * 2 <= responses.len() {
        METRICS.failed_restores.inc();
        anyhow::bail!(
            "cohort disagrees about {block_id}: best view held by {count} of {}",
            responses.len()
        );
    }

    // Repair the local copy so future reads and commits line up.
    if let Some(latest) = &agreed.state.latest {
        let storage = repo.storage();
        storage
            .save_metadata(
                block_id,
                &BlockMetadata {
                    latest: Some(latest.clone()),
                    pendings: agreed.state.pendings.clone(),
                },
            )
            .await?;
        storage
            .save_revision(block_id, latest.rev, &latest.action_id)
            .await?;
        storage
            .save_materialized_block(block_id, &latest.action_id, agreed.block.as_ref())
            .await?;
        tracing::info!(%block_id, rev = latest.rev, "block restored from cohort");
    }
    METRICS.restored_reads.inc();
    Ok(agreed)
}
