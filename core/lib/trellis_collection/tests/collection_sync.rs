//! Collection behaviour against a single local repo: create, append, sync,
//! open from another handle, reconcile racing writers.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use trellis_collection::{Collection, CollectionError, CollectionOptions};
use trellis_config::TransactorConfig;
use trellis_network::{
    ClientError, ClientResult, Key, KeyNetwork, PeerRepoRequest, RepoClient, RoutingResult,
};
use trellis_storage::{MemStorage, Repo};
use trellis_transactor::Transactor;
use trellis_types::{
    BlockId, CollectionId, PeerId, PeerInfo, RepoOperation, RepoResponse,
};

/// Executes repo operations directly against one in-process repo, playing
/// the role of a single-peer network.
struct LocalRepoClient {
    repo: Arc<Repo<MemStorage>>,
}

#[async_trait]
impl RepoClient for LocalRepoClient {
    async fn call(&self, peer: &PeerId, request: PeerRepoRequest) -> ClientResult<RepoResponse> {
        let reject = |details: String| ClientError::Rejected {
            peer: peer.clone(),
            details,
        };
        match request.operation {
            RepoOperation::Get { block_ids, context } => self
                .repo
                .get(&block_ids, context.as_ref())
                .await
                .map(RepoResponse::Get)
                .map_err(|err| reject(err.to_string())),
            RepoOperation::Pend { action, policy } => self
                .repo
                .pend(&action, policy)
                .await
                .map(RepoResponse::Pend)
                .map_err(|err| reject(err.to_string())),
            RepoOperation::Commit {
                action_id,
                block_ids,
                rev,
            } => self
                .repo
                .commit(&action_id, &block_ids, rev)
                .await
                .map(RepoResponse::Commit)
                .map_err(|err| reject(err.to_string())),
            RepoOperation::Cancel {
                action_id,
                block_ids,
            } => self
                .repo
                .cancel(&action_id, &block_ids)
                .await
                .map(|()| RepoResponse::Cancel)
                .map_err(|err| reject(err.to_string())),
        }
    }
}

struct SinglePeerRouter;

#[async_trait]
impl KeyNetwork for SinglePeerRouter {
    async fn find_coordinator(&self, _key: &Key, _excluded: &[PeerId]) -> RoutingResult<PeerId> {
        Ok(PeerId::new("local"))
    }

    async fn find_cluster(&self, _key: &Key) -> RoutingResult<BTreeMap<PeerId, PeerInfo>> {
        Ok([(PeerId::new("local"), PeerInfo::default())].into())
    }

    fn record_coordinator(&self, _key: &Key, _peer: &PeerId, _ttl: Option<Duration>) {}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DiaryEntry {
    content: String,
    ts: u64,
}

fn entry(content: &str, ts: u64) -> DiaryEntry {
    DiaryEntry {
        content: content.to_string(),
        ts,
    }
}

fn local_transactor(repo: &Arc<Repo<MemStorage>>) -> Transactor {
    Transactor::new(
        Arc::new(LocalRepoClient { repo: repo.clone() }),
        Arc::new(SinglePeerRouter),
        TransactorConfig::for_tests(),
    )
}

async fn open_diary(
    repo: &Arc<Repo<MemStorage>>,
    name: &str,
) -> Collection<DiaryEntry> {
    Collection::create_or_open(
        local_transactor(repo),
        CollectionId(BlockId::new(name)),
        CollectionOptions {
            config: trellis_config::CollectionConfig::for_tests(),
            ..CollectionOptions::default()
        },
    )
    .await
    .unwrap()
}

async fn read_all(diary: &Collection<DiaryEntry>) -> Vec<DiaryEntry> {
    diary.select_log(true).try_collect().await.unwrap()
}

#[tokio::test]
async fn single_node_diary_round_trip() {
    let repo = Arc::new(Repo::new(MemStorage::new()));
    let diary = open_diary(&repo, "d1").await;

    diary.act(vec![entry("hello", 1)]).await.unwrap();
    diary.sync().await.unwrap();

    let entries = read_all(&diary).await;
    assert_eq!(entries, vec![entry("hello", 1)]);
}

#[tokio::test]
async fn reopened_collection_sees_committed_entries() {
    let repo = Arc::new(Repo::new(MemStorage::new()));
    let writer = open_diary(&repo, "d1").await;
    writer.act(vec![entry("one", 1), entry("two", 2)]).await.unwrap();
    writer.sync().await.unwrap();

    let reader = open_diary(&repo, "d1").await;
    let entries = read_all(&reader).await;
    assert_eq!(entries, vec![entry("one", 1), entry("two", 2)]);
}

#[tokio::test]
async fn second_writer_appends_after_update() {
    let repo = Arc::new(Repo::new(MemStorage::new()));
    let a = open_diary(&repo, "d1").await;
    a.act(vec![entry("from-a", 1)]).await.unwrap();
    a.sync().await.unwrap();

    let b = open_diary(&repo, "d1").await;
    b.act(vec![entry("from-b", 2)]).await.unwrap();
    b.sync().await.unwrap();

    a.update().await.unwrap();
    let entries = read_all(&a).await;
    assert_eq!(entries, vec![entry("from-a", 1), entry("from-b", 2)]);
}

#[tokio::test]
async fn racing_writer_goes_stale_then_recovers_via_update_and_sync() {
    let repo = Arc::new(Repo::new(MemStorage::new()));
    let a = open_diary(&repo, "d1").await;
    a.sync().await.unwrap(); // publish the header at rev 1

    let b = open_diary(&repo, "d1").await;

    // Both writers queue an entry; a lands first.
    a.act(vec![entry("fast", 1)]).await.unwrap();
    b.act(vec![entry("slow", 2)]).await.unwrap();
    a.sync().await.unwrap();

    let err = b.sync().await.unwrap_err();
    assert!(matches!(err, CollectionError::StaleSync(_)));

    // Update replays what landed first, then the retry commits.
    b.update_and_sync().await.unwrap();

    a.update().await.unwrap();
    let entries = read_all(&a).await;
    assert_eq!(entries, vec![entry("fast", 1), entry("slow", 2)]);
}

#[tokio::test]
async fn conflict_filter_can_drop_local_actions() {
    let repo = Arc::new(Repo::new(MemStorage::new()));
    let a = open_diary(&repo, "d1").await;
    a.sync().await.unwrap();

    let dropper: trellis_collection::ConflictFilter<DiaryEntry> =
        Arc::new(|local, remote| {
            // Drop the local action when a remote one carries the same
            // content.
            if remote.iter().any(|r| r.content == local.content) {
                None
            } else {
                Some(local.clone())
            }
        });
    let b = Collection::<DiaryEntry>::create_or_open(
        local_transactor(&repo),
        CollectionId(BlockId::new("d1")),
        CollectionOptions {
            config: trellis_config::CollectionConfig::for_tests(),
            filter_conflict: Some(dropper),
            ..CollectionOptions::default()
        },
    )
    .await
    .unwrap();

    a.act(vec![entry("dup", 1)]).await.unwrap();
    b.act(vec![entry("dup", 9)]).await.unwrap();
    a.sync().await.unwrap();

    b.update_and_sync().await.unwrap();
    let entries = read_all(&b).await;
    // The duplicate local action was dropped by the filter.
    assert_eq!(entries, vec![entry("dup", 1)]);
}

#[tokio::test]
async fn checkpoints_do_not_strand_other_writers() {
    let repo = Arc::new(Repo::new(MemStorage::new()));
    let config = trellis_config::CollectionConfig {
        entries_per_block: 4,
        checkpoint_interval: 2,
    };
    let a = Collection::<DiaryEntry>::create_or_open(
        local_transactor(&repo),
        CollectionId(BlockId::new("d1")),
        CollectionOptions {
            config: config.clone(),
            ..CollectionOptions::default()
        },
    )
    .await
    .unwrap();

    // Two synced actions trip the checkpoint interval.
    a.sync().await.unwrap();
    a.act(vec![entry("e1", 1)]).await.unwrap();
    a.sync().await.unwrap();
    a.act(vec![entry("e2", 2)]).await.unwrap();
    a.sync().await.unwrap();

    // A writer opening after the checkpoint lands above it, not inside it.
    let b = Collection::<DiaryEntry>::create_or_open(
        local_transactor(&repo),
        CollectionId(BlockId::new("d1")),
        CollectionOptions {
            config,
            ..CollectionOptions::default()
        },
    )
    .await
    .unwrap();
    b.act(vec![entry("e3", 3)]).await.unwrap();
    b.sync().await.unwrap();

    // The original writer keeps appending too.
    a.update().await.unwrap();
    a.act(vec![entry("e4", 4)]).await.unwrap();
    a.sync().await.unwrap();

    let entries = read_all(&a).await;
    assert_eq!(
        entries,
        vec![entry("e1", 1), entry("e2", 2), entry("e3", 3), entry("e4", 4)]
    );
}

#[tokio::test]
async fn select_log_backward_reverses_order() {
    let repo = Arc::new(Repo::new(MemStorage::new()));
    let diary = open_diary(&repo, "d1").await;
    for i in 1..=5 {
        diary.act(vec![entry(&format!("e{i}"), i)]).await.unwrap();
        diary.sync().await.unwrap();
    }

    let forward = read_all(&diary).await;
    let backward: Vec<DiaryEntry> = diary.select_log(false).try_collect().await.unwrap();
    let mut reversed = backward.clone();
    reversed.reverse();
    assert_eq!(forward, reversed);
    assert_eq!(forward.len(), 5);
}
