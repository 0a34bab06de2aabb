//! An in-memory peer mesh for tests: real framing, real routers, real
//! cluster rounds, with streams carried over in-process duplex pipes and
//! injectable connect failures.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use trellis_config::{PeerConfig, RoutingConfig};
use trellis_consensus::{
    serve_cluster_stream, ClusterUpdateHandler, StreamClusterClient, CLUSTER_PROTOCOL,
};
use trellis_crypto::Keypair;
use trellis_network::{
    serve_repo_stream, Key, KeyRouter, PeerDirectory, PeerNetwork, PeerStream, RepoHandler,
    RoutingResult, StreamRepoClient, TransportError, TransportResult, REPO_PROTOCOL,
};
use trellis_peer::PeerService;
use trellis_storage::MemStorage;
use trellis_transactor::Transactor;
use trellis_types::{PeerId, PeerInfo};

#[derive(Clone)]
struct Endpoints {
    info: PeerInfo,
    repo: Arc<dyn RepoHandler>,
    cluster: Arc<dyn ClusterUpdateHandler>,
}

/// The shared "wire": peers register their protocol handlers; connects
/// hand back one end of a duplex pipe with the server half being served in
/// a background task.
pub struct LocalNetwork {
    endpoints: Mutex<HashMap<PeerId, Endpoints>>,
    /// Pending injected connect failures per (peer, protocol).
    failures: Mutex<HashMap<(PeerId, String), usize>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(
        &self,
        peer_id: PeerId,
        info: PeerInfo,
        repo: Arc<dyn RepoHandler>,
        cluster: Arc<dyn ClusterUpdateHandler>,
    ) {
        self.endpoints.lock().unwrap().insert(
            peer_id,
            Endpoints {
                info,
                repo,
                cluster,
            },
        );
    }

    /// Makes the next `count` connects to `peer` on `protocol` fail with a
    /// transport error.
    pub fn fail_next(&self, peer: &PeerId, protocol: &str, count: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert((peer.clone(), protocol.to_string()), count);
    }

    pub fn peer_infos(&self) -> Vec<(PeerId, PeerInfo)> {
        self.endpoints
            .lock()
            .unwrap()
            .iter()
            .map(|(peer, endpoints)| (peer.clone(), endpoints.info.clone()))
            .collect()
    }
}

#[async_trait]
impl PeerNetwork for LocalNetwork {
    async fn connect(&self, peer: &PeerId, protocol: &str) -> TransportResult<PeerStream> {
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&(peer.clone(), protocol.to_string())) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransportError::Connect {
                        peer: peer.clone(),
                        details: "injected failure".to_string(),
                    });
                }
            }
        }
        let endpoints = self
            .endpoints
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .ok_or_else(|| TransportError::Connect {
                peer: peer.clone(),
                details: "unknown peer".to_string(),
            })?;

        let (client, server) = tokio::io::duplex(256 * 1024);
        match protocol {
            REPO_PROTOCOL => {
                let handler = endpoints.repo;
                tokio::spawn(async move {
                    if let Err(err) = serve_repo_stream(Box::new(server), handler).await {
                        tracing::debug!(%err, "repo stream ended with transport error");
                    }
                });
            }
            CLUSTER_PROTOCOL => {
                let handler = endpoints.cluster;
                tokio::spawn(async move {
                    if let Err(err) = serve_cluster_stream(Box::new(server), handler).await {
                        tracing::debug!(%err, "cluster stream ended with transport error");
                    }
                });
            }
            other => {
                return Err(TransportError::Connect {
                    peer: peer.clone(),
                    details: format!("unknown protocol {other}"),
                })
            }
        }
        Ok(Box::new(client))
    }
}

/// One peer's view of the mesh: everyone registered on the shared network.
pub struct MeshDirectory {
    self_id: PeerId,
    self_info: PeerInfo,
    network: Arc<LocalNetwork>,
}

#[async_trait]
impl PeerDirectory for MeshDirectory {
    fn self_id(&self) -> PeerId {
        self.self_id.clone()
    }

    fn self_info(&self) -> PeerInfo {
        self.self_info.clone()
    }

    async fn peers_near(&self, _key: &Key) -> RoutingResult<Vec<(PeerId, PeerInfo)>> {
        Ok(self
            .network
            .peer_infos()
            .into_iter()
            .filter(|(peer, _)| *peer != self.self_id)
            .collect())
    }

    fn connection_count(&self) -> usize {
        self.network.peer_infos().len().saturating_sub(1)
    }

    fn network_size_estimate(&self) -> usize {
        self.network.peer_infos().len()
    }

    fn partition_suspected(&self) -> bool {
        false
    }
}

/// A fully wired mesh of peers over one `LocalNetwork`.
pub struct LocalMesh {
    pub network: Arc<LocalNetwork>,
    pub peers: Vec<Arc<PeerService<MemStorage>>>,
    config: PeerConfig,
}

impl LocalMesh {
    pub fn new(size: usize, config: PeerConfig) -> Self {
        let network = LocalNetwork::new();
        let mut peers = Vec::with_capacity(size);
        for i in 0..size {
            let peer_id = PeerId::new(format!("peer-{i}"));
            let service = Self::spawn_peer(&network, peer_id, &config);
            peers.push(service);
        }
        Self {
            network,
            peers,
            config,
        }
    }

    /// Builds and registers one more peer on the shared network.
    pub fn add_peer(&mut self, name: &str) -> Arc<PeerService<MemStorage>> {
        let service = Self::spawn_peer(&self.network, PeerId::new(name), &self.config);
        self.peers.push(service.clone());
        service
    }

    fn spawn_peer(
        network: &Arc<LocalNetwork>,
        peer_id: PeerId,
        config: &PeerConfig,
    ) -> Arc<PeerService<MemStorage>> {
        let keypair = Keypair::generate();
        let info = PeerInfo {
            multiaddrs: vec![format!("/memory/{peer_id}")],
            public_key: keypair.public_key_bytes(),
        };
        let directory = Arc::new(MeshDirectory {
            self_id: peer_id.clone(),
            self_info: info.clone(),
            network: network.clone(),
        });
        let router = Arc::new(KeyRouter::new(directory, config.routing.clone()));
        let service = PeerService::new(
            peer_id.clone(),
            keypair,
            MemStorage::new(),
            router,
            Arc::new(StreamClusterClient::new(network.clone())),
            Arc::new(StreamRepoClient::new(network.clone())),
            info.multiaddrs.clone(),
            config.clone(),
        );
        network.register(peer_id, info, service.clone(), service.cluster_handler());
        service
    }

    /// A transactor for an external client of the mesh. The client's router
    /// never self-coordinates: it is not a storage peer.
    pub fn client_transactor(&self, name: &str) -> Transactor {
        let client_id = PeerId::new(name);
        let mut routing: RoutingConfig = self.config.routing.clone();
        routing.guard.enabled = false;
        let directory = Arc::new(MeshDirectory {
            self_id: client_id,
            self_info: PeerInfo::default(),
            network: self.network.clone(),
        });
        let router = Arc::new(KeyRouter::new(directory, routing));
        Transactor::new(
            Arc::new(StreamRepoClient::new(self.network.clone())),
            router,
            self.config.transactor.clone(),
        )
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }
}
