use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::watch;
use trellis_config::PeerConfig;
use trellis_consensus::{
    ClusterClient, ClusterCoordinator, ClusterMember, ClusterUpdateHandler,
};
use trellis_crypto::Keypair;
use trellis_network::{KeyNetwork, PeerRepoRequest, RepoClient, RepoHandler};
use trellis_storage::{RawStorage, Repo, RepoError};
use trellis_types::{
    ActionContext, BlockId, GetBlockResult, PeerId, PeerInfo, RepoMessage, RepoOperation,
    RepoResponse,
};

use crate::{metrics::METRICS, restore::restore_block};

/// One peer of the mesh: serves the repo protocol to transactors, drives
/// the cluster protocol for blocks it coordinates, and participates in
/// clusters run by other coordinators.
pub struct PeerService<S> {
    peer_id: PeerId,
    repo: Arc<Repo<S>>,
    member: Arc<ClusterMember<S>>,
    coordinator: Arc<ClusterCoordinator<S>>,
    router: Arc<dyn KeyNetwork>,
    repo_client: Arc<dyn RepoClient>,
    config: PeerConfig,
}

impl<S: RawStorage> PeerService<S> {
    pub fn new(
        peer_id: PeerId,
        keypair: Keypair,
        storage: S,
        router: Arc<dyn KeyNetwork>,
        cluster_client: Arc<dyn ClusterClient>,
        repo_client: Arc<dyn RepoClient>,
        multiaddrs: Vec<String>,
        config: PeerConfig,
    ) -> Arc<Self> {
        let self_info = PeerInfo {
            multiaddrs,
            public_key: keypair.public_key_bytes(),
        };
        let repo = Arc::new(Repo::new(storage));
        let member = Arc::new(ClusterMember::new(
            peer_id.clone(),
            keypair,
            repo.clone(),
            config.cluster.clone(),
        ));
        let coordinator = Arc::new(ClusterCoordinator::new(
            member.clone(),
            cluster_client,
            router.clone(),
            self_info,
            config.cluster.clone(),
        ));
        Arc::new(Self {
            peer_id,
            repo,
            member,
            coordinator,
            router,
            repo_client,
            config,
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn repo(&self) -> &Arc<Repo<S>> {
        &self.repo
    }

    pub fn router(&self) -> &Arc<dyn KeyNetwork> {
        &self.router
    }

    /// Handler for incoming cluster protocol streams.
    pub fn cluster_handler(self: &Arc<Self>) -> Arc<dyn ClusterUpdateHandler> {
        self.member.clone()
    }

    /// Background maintenance: consensus expiration sweeps, until the stop
    /// signal flips.
    pub async fn run(self: Arc<Self>, mut stop_receiver: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut timer = tokio::time::interval(self.config.maintenance_interval());
        while !*stop_receiver.borrow_and_update() {
            tokio::select! {
                _ = timer.tick() => { /* continue iterations */ }
                _ = stop_receiver.changed() => break,
            }
            self.member.sweep_expired();
        }
        tracing::info!(peer_id = %self.peer_id, "stop signal received, peer service is shutting down");
        Ok(())
    }

    /// Serves one read directly from the local repo, running a cohort
    /// restore for blocks whose history is missing here.
    async fn serve_get(
        &self,
        block_ids: Vec<BlockId>,
        context: Option<ActionContext>,
    ) -> Result<RepoResponse, String> {
        match self.repo.get(&block_ids, context.as_ref()).await {
            Ok(results) => Ok(RepoResponse::Get(results)),
            Err(RepoError::Integrity { block_id, details }) => {
                tracing::warn!(%block_id, details, "read hit missing history; restoring from cohort");
                let mut results: BTreeMap<BlockId, GetBlockResult> = BTreeMap::new();
                for id in &block_ids {
                    let restored = restore_block(
                        self.repo.as_ref(),
                        self.router.as_ref(),
                        &self.repo_client,
                        &self.peer_id,
                        id,
                        context.as_ref(),
                        self.config.restore_fanout,
                        self.config.transactor.operation_timeout_ms,
                    )
                    .await
                    .map_err(|err| err.to_string())?;
                    results.insert(id.clone(), restored);
                }
                Ok(RepoResponse::Get(results))
            }
            Err(err) => Err(err.to_string()),
        }
    }
}

#[async_trait]
impl<S: RawStorage> RepoHandler for PeerService<S> {
    /// Entry point for transactor requests: reads come straight from the
    /// repo; mutations are sequenced through this peer's cluster.
    async fn handle(&self, request: PeerRepoRequest) -> Result<RepoResponse, String> {
        METRICS.repo_requests.inc();
        match request.operation {
            RepoOperation::Get { block_ids, context } => {
                self.serve_get(block_ids, context).await
            }
            operation => {
                let message = RepoMessage::single(operation, request.expiration);
                let mut responses = self
                    .coordinator
                    .execute(message)
                    .await
                    .map_err(|err| err.to_string())?;
                responses
                    .pop()
                    .ok_or_else(|| "cluster execution produced no response".to_string())
            }
        }
    }
}

impl<S> std::fmt::Debug for PeerService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerService")
            .field("peer_id", &self.peer_id)
            .finish()
    }
}
