use std::sync::Arc;

use trellis_config::ClusterConfig;
use trellis_network::{Key, KeyNetwork};
use trellis_storage::RawStorage;
use trellis_types::{
    time::millis_since_epoch, PeerInfo, RepoMessage, RepoResponse,
};

use crate::{
    client::ClusterClient,
    member::ClusterMember,
    metrics::METRICS,
    record::{
        derive_phase, ClusterError, ClusterRecord, ClusterResult, TransactionPhase,
    },
};

/// Upper bound on gossip rounds for one transaction; two suffice on the
/// happy path (promises, then commits).
const MAX_ROUNDS: usize = 8;

/// Drives a transaction from the coordinating peer: assembles the cohort
/// for the message's anchor key, gossips the record until the cohort
/// commits, and executes locally at consensus to produce the caller's
/// responses.
pub struct ClusterCoordinator<S> {
    member: Arc<ClusterMember<S>>,
    client: Arc<dyn ClusterClient>,
    router: Arc<dyn KeyNetwork>,
    self_info: PeerInfo,
    config: ClusterConfig,
}

impl<S: RawStorage> ClusterCoordinator<S> {
    pub fn new(
        member: Arc<ClusterMember<S>>,
        client: Arc<dyn ClusterClient>,
        router: Arc<dyn KeyNetwork>,
        self_info: PeerInfo,
        config: ClusterConfig,
    ) -> Self {
        Self {
            member,
            client,
            router,
            self_info,
            config,
        }
    }

    pub fn member(&self) -> &Arc<ClusterMember<S>> {
        &self.member
    }

    /// Sequences `message` through the cohort and returns the executed
    /// operation responses.
    pub async fn execute(&self, message: RepoMessage) -> ClusterResult<Vec<RepoResponse>> {
        let block_ids = message.block_ids();
        // The smallest affected block anchors the cohort; the cohort stays
        // frozen for the lifetime of this message hash.
        let mut cohort = match block_ids.first() {
            Some(anchor) => self.router.find_cluster(&Key::for_block(anchor)).await?,
            None => Default::default(),
        };
        cohort
            .entry(self.member.self_id().clone())
            .or_insert_with(|| self.self_info.clone());

        if cohort.len() < self.config.min_cluster_size && !self.config.allow_downsize {
            return Err(ClusterError::CohortTooSmall {
                got: cohort.len(),
                min: self.config.min_cluster_size,
            });
        }

        let mut record = ClusterRecord::new(cohort, message);
        record.suggested_cluster_size = Some(record.peers.len());
        record.min_required_size = Some(self.config.min_cluster_size);
        let message_hash = record.message_hash;
        let expiration = record.message.expiration;

        let mut responses = None;
        let update = self.member.update(record).await?;
        if update.responses.is_some() {
            responses = update.responses;
        }
        let mut record = update.record;

        for round in 0..MAX_ROUNDS {
            let phase = derive_phase(
                &record,
                self.member.self_id(),
                false,
                self.config.commit_threshold,
            );
            match phase {
                TransactionPhase::Consensus => {
                    METRICS.coordinated.inc();
                    // Propagate the final record so every member observes
                    // the commit majority and executes.
                    self.finalize(&record).await;
                    return responses.ok_or_else(|| {
                        ClusterError::Repo(
                            "consensus reached without local execution responses".to_string(),
                        )
                    });
                }
                TransactionPhase::Rejected => {
                    return Err(ClusterError::Rejected {
                        message_hash,
                        reasons: record.reject_reasons(),
                    });
                }
                _ => {}
            }
            if millis_since_epoch() >= expiration {
                return Err(ClusterError::Expired { message_hash });
            }

            tracing::debug!(%message_hash, round, ?phase, "cluster gossip round");
            let peers: Vec<_> = record
                .peers
                .keys()
                .filter(|peer| *peer != self.member.self_id())
                .cloned()
                .collect();
            let mut reached = 0usize;
            for peer in peers {
                match self.client.update(&peer, record.clone()).await {
                    Ok(returned) => {
                        reached += 1;
                        let update = self.member.update(returned).await?;
                        if update.responses.is_some() {
                            responses = update.responses;
                        }
                        record = update.record;
                    }
                    Err(ClusterError::PeerRejected { peer, details }) => {
                        // The peer dropped this transaction (conflict race,
                        // expiration); its verdict reaches us through the
                        // next merged record or ends the transaction here.
                        tracing::warn!(%peer, details, %message_hash, "cluster update rejected");
                    }
                    Err(err) => {
                        tracing::warn!(%peer, %err, %message_hash, "cluster update failed");
                    }
                }
            }
            if reached == 0 && record.peers.len() > 1 {
                return Err(ClusterError::Rejected {
                    message_hash,
                    reasons: vec!["no cohort member reachable".to_string()],
                });
            }
        }

        Err(ClusterError::Expired { message_hash })
    }

    /// Best-effort fan-out of the finalized record. Members that miss it
    /// stay behind until the read path restores them.
    async fn finalize(&self, record: &ClusterRecord) {
        let peers: Vec<_> = record
            .peers
            .keys()
            .filter(|peer| *peer != self.member.self_id())
            .cloned()
            .collect();
        for peer in peers {
            if let Err(err) = self.client.update(&peer, record.clone()).await {
                tracing::debug!(
                    %peer,
                    message_hash = %record.message_hash,
                    %err,
                    "final record propagation failed"
                );
            }
        }
    }
}

impl<S> std::fmt::Debug for ClusterCoordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCoordinator").finish()
    }
}
