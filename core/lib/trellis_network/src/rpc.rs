use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use trellis_types::{
    BlockId, CommitOutcome, GetBlockResult, PendOutcome, PeerId, RepoOperation, RepoResponse,
};

use crate::{
    framing::{read_frame, write_frame},
    traits::{ClientError, ClientResult, PeerNetwork, PeerStream},
};

/// Protocol id the repo request/response exchange runs on.
pub const REPO_PROTOCOL: &str = "trellis/repo/1";

/// One repo operation addressed to the coordinator of its blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRepoRequest {
    pub operation: RepoOperation,
    /// Unix-millisecond deadline the coordinator should respect.
    pub expiration: u64,
}

/// Wire envelope for the response; a rejection carries a reason string so
/// the caller can build its aggregate error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireResult {
    Ok(RepoResponse),
    Err(String),
}

/// The transactor's view of remote repos: one call per operation, addressed
/// to the chosen coordinator peer.
#[async_trait]
pub trait RepoClient: Send + Sync {
    async fn call(&self, peer: &PeerId, request: PeerRepoRequest) -> ClientResult<RepoResponse>;

    async fn get(
        &self,
        peer: &PeerId,
        request: PeerRepoRequest,
    ) -> ClientResult<BTreeMap<BlockId, GetBlockResult>> {
        match self.call(peer, request).await? {
            RepoResponse::Get(results) => Ok(results),
            other => Err(unexpected(peer, "get", &other)),
        }
    }

    async fn pend(&self, peer: &PeerId, request: PeerRepoRequest) -> ClientResult<PendOutcome> {
        match self.call(peer, request).await? {
            RepoResponse::Pend(outcome) => Ok(outcome),
            other => Err(unexpected(peer, "pend", &other)),
        }
    }

    async fn commit(
        &self,
        peer: &PeerId,
        request: PeerRepoRequest,
    ) -> ClientResult<CommitOutcome> {
        match self.call(peer, request).await? {
            RepoResponse::Commit(outcome) => Ok(outcome),
            other => Err(unexpected(peer, "commit", &other)),
        }
    }

    async fn cancel(&self, peer: &PeerId, request: PeerRepoRequest) -> ClientResult<()> {
        match self.call(peer, request).await? {
            RepoResponse::Cancel => Ok(()),
            other => Err(unexpected(peer, "cancel", &other)),
        }
    }
}

impl std::fmt::Debug for dyn RepoClient + 'static {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoClient").finish()
    }
}

fn unexpected(peer: &PeerId, expected: &str, got: &RepoResponse) -> ClientError {
    ClientError::Rejected {
        peer: peer.clone(),
        details: format!("expected a {expected} response, got {got:?}"),
    }
}

/// `RepoClient` over raw peer streams: one framed request, one framed
/// response per call.
pub struct StreamRepoClient {
    network: Arc<dyn PeerNetwork>,
}

impl StreamRepoClient {
    pub fn new(network: Arc<dyn PeerNetwork>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl RepoClient for StreamRepoClient {
    async fn call(&self, peer: &PeerId, request: PeerRepoRequest) -> ClientResult<RepoResponse> {
        let mut stream = self.network.connect(peer, REPO_PROTOCOL).await?;
        write_frame(stream.as_mut(), &request).await?;
        let result: WireResult = read_frame(stream.as_mut()).await?;
        match result {
            WireResult::Ok(response) => Ok(response),
            WireResult::Err(details) => Err(ClientError::Rejected {
                peer: peer.clone(),
                details,
            }),
        }
    }
}

impl std::fmt::Debug for StreamRepoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRepoClient").finish()
    }
}

/// Server half of the repo protocol.
#[async_trait]
pub trait RepoHandler: Send + Sync {
    async fn handle(&self, request: PeerRepoRequest) -> Result<RepoResponse, String>;
}

/// Serves a single accepted repo protocol stream: read the request, hand it
/// to the handler, write the reply. Transport failures bubble up to the
/// accept loop for logging.
pub async fn serve_repo_stream(
    mut stream: PeerStream,
    handler: Arc<dyn RepoHandler>,
) -> crate::traits::TransportResult<()> {
    let request: PeerRepoRequest = read_frame(stream.as_mut()).await?;
    let result = match handler.handle(request).await {
        Ok(response) => WireResult::Ok(response),
        Err(details) => WireResult::Err(details),
    };
    write_frame(stream.as_mut(), &result).await
}

#[cfg(test)]
mod tests {
    use trellis_types::{time::millis_since_epoch, ActionId};

    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl RepoHandler for EchoHandler {
        async fn handle(&self, request: PeerRepoRequest) -> Result<RepoResponse, String> {
            match request.operation {
                RepoOperation::Cancel { .. } => Ok(RepoResponse::Cancel),
                _ => Err("unsupported".to_string()),
            }
        }
    }

    struct OneShotNetwork {
        handler: Arc<dyn RepoHandler>,
    }

    #[async_trait]
    impl PeerNetwork for OneShotNetwork {
        async fn connect(
            &self,
            _peer: &PeerId,
            _protocol: &str,
        ) -> crate::traits::TransportResult<PeerStream> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let handler = self.handler.clone();
            tokio::spawn(serve_repo_stream(Box::new(server), handler));
            Ok(Box::new(client))
        }
    }

    #[tokio::test]
    async fn request_and_response_cross_the_stream() {
        let client = StreamRepoClient::new(Arc::new(OneShotNetwork {
            handler: Arc::new(EchoHandler),
        }));
        let request = PeerRepoRequest {
            operation: RepoOperation::Cancel {
                action_id: ActionId::new("a1"),
                block_ids: vec![BlockId::new("b1")],
            },
            expiration: millis_since_epoch() + 1_000,
        };
        client.cancel(&PeerId::new("p1"), request).await.unwrap();
    }

    #[tokio::test]
    async fn handler_rejections_surface_as_rejected() {
        let client = StreamRepoClient::new(Arc::new(OneShotNetwork {
            handler: Arc::new(EchoHandler),
        }));
        let request = PeerRepoRequest {
            operation: RepoOperation::Get {
                block_ids: vec![BlockId::new("b1")],
                context: None,
            },
            expiration: millis_since_epoch() + 1_000,
        };
        let err = client.get(&PeerId::new("p1"), request).await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected { .. }));
    }
}
