use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use trellis_network::{read_frame, write_frame, PeerNetwork, PeerStream, TransportResult};
use trellis_types::PeerId;

use crate::record::{ClusterError, ClusterRecord, ClusterResult};

/// Protocol id for member-to-member record gossip.
pub const CLUSTER_PROTOCOL: &str = "trellis/cluster/1";

#[derive(Debug, Serialize, Deserialize)]
pub enum WireClusterResult {
    Ok(ClusterRecord),
    Err(String),
}

/// How a coordinator reaches the rest of its cohort.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn update(&self, peer: &PeerId, record: ClusterRecord) -> ClusterResult<ClusterRecord>;
}

impl std::fmt::Debug for dyn ClusterClient + 'static {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient").finish()
    }
}

/// `ClusterClient` over raw peer streams: one framed record out, one framed
/// record back.
pub struct StreamClusterClient {
    network: Arc<dyn PeerNetwork>,
}

impl StreamClusterClient {
    pub fn new(network: Arc<dyn PeerNetwork>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl ClusterClient for StreamClusterClient {
    async fn update(&self, peer: &PeerId, record: ClusterRecord) -> ClusterResult<ClusterRecord> {
        let mut stream = self.network.connect(peer, CLUSTER_PROTOCOL).await?;
        write_frame(stream.as_mut(), &record).await?;
        let result: WireClusterResult = read_frame(stream.as_mut()).await?;
        match result {
            WireClusterResult::Ok(record) => Ok(record),
            WireClusterResult::Err(details) => Err(ClusterError::PeerRejected {
                peer: peer.clone(),
                details,
            }),
        }
    }
}

impl std::fmt::Debug for StreamClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClusterClient").finish()
    }
}

/// Server half: the member processing incoming record updates.
#[async_trait]
pub trait ClusterUpdateHandler: Send + Sync {
    async fn apply_update(&self, record: ClusterRecord) -> Result<ClusterRecord, String>;
}

/// Serves one accepted cluster protocol stream.
pub async fn serve_cluster_stream(
    mut stream: PeerStream,
    handler: Arc<dyn ClusterUpdateHandler>,
) -> TransportResult<()> {
    let record: ClusterRecord = read_frame(stream.as_mut()).await?;
    let result = match handler.apply_update(record).await {
        Ok(record) => WireClusterResult::Ok(record),
        Err(details) => WireClusterResult::Err(details),
    };
    write_frame(stream.as_mut(), &result).await
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use trellis_types::{time::millis_since_epoch, BlockId, RepoMessage, RepoOperation};

    use super::*;
    use crate::record::ClusterSignature;

    struct Countersigner;

    #[async_trait]
    impl ClusterUpdateHandler for Countersigner {
        async fn apply_update(&self, mut record: ClusterRecord) -> Result<ClusterRecord, String> {
            record.promises.insert(
                PeerId::new("remote"),
                ClusterSignature {
                    kind: crate::record::SignatureKind::Approve,
                    signature: vec![7; 64],
                    reject_reason: None,
                },
            );
            Ok(record)
        }
    }

    struct PipeNetwork {
        handler: Arc<dyn ClusterUpdateHandler>,
    }

    #[async_trait]
    impl PeerNetwork for PipeNetwork {
        async fn connect(
            &self,
            _peer: &PeerId,
            _protocol: &str,
        ) -> TransportResult<PeerStream> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let handler = self.handler.clone();
            tokio::spawn(serve_cluster_stream(Box::new(server), handler));
            Ok(Box::new(client))
        }
    }

    #[tokio::test]
    async fn records_round_trip_over_the_stream() {
        let client = StreamClusterClient::new(Arc::new(PipeNetwork {
            handler: Arc::new(Countersigner),
        }));
        let record = ClusterRecord::new(
            BTreeMap::new(),
            RepoMessage::single(
                RepoOperation::Cancel {
                    action_id: trellis_types::ActionId::new("a1"),
                    block_ids: vec![BlockId::new("b1")],
                },
                millis_since_epoch() + 1_000,
            ),
        );

        let returned = client
            .update(&PeerId::new("remote"), record.clone())
            .await
            .unwrap();
        assert_eq!(returned.message_hash, record.message_hash);
        assert!(returned.promises.contains_key(&PeerId::new("remote")));
    }
}
