use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{de::DeserializeOwned, Serialize};
use trellis_config::CollectionConfig;
use trellis_log::{Log, LogError};
use trellis_transactor::{CommitRequest, PendRequest, Transactor, TransactorError};
use trellis_types::{
    block_ids_for_transforms, ActionId, BlockId, BlockSource, CollectionId, CommitOutcome,
    LogEntryKind, PendOutcome, PendPolicy, Rev, StaleFailure, StoreError,
};

use crate::{source::NetworkSource, tracker::Tracker};

#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Transactor(#[from] TransactorError),
    #[error("sync is behind the committed log; update and retry")]
    StaleSync(StaleFailure),
    #[error("action handler failed: {0}")]
    Handler(String),
}

pub type CollectionResult<T> = Result<T, CollectionError>;

/// Applies one logical action to whatever local projection the application
/// maintains. Invoked for locally queued actions on `act` and for remote
/// actions replayed during `update`.
#[async_trait]
pub trait ActionHandler<A>: Send + Sync {
    async fn apply(&self, action: &A) -> Result<(), String>;
}

/// Reconciles one locally queued action against the remote actions that
/// landed first. Returning `None` drops the local action; returning a
/// (possibly rewritten) action keeps it.
pub type ConflictFilter<A> = Arc<dyn Fn(&A, &[A]) -> Option<A> + Send + Sync>;

pub struct CollectionOptions<A> {
    pub config: CollectionConfig,
    pub handler: Option<Arc<dyn ActionHandler<A>>>,
    pub filter_conflict: Option<ConflictFilter<A>>,
}

impl<A> Default for CollectionOptions<A> {
    fn default() -> Self {
        Self {
            config: CollectionConfig::default(),
            handler: None,
            filter_conflict: None,
        }
    }
}

#[derive(Debug)]
struct SyncState<A> {
    last_rev: Rev,
    queued: Vec<A>,
    /// Action id carried across retries of a failed sync, so a retry stays
    /// idempotent.
    sync_action_id: Option<ActionId>,
    actions_since_checkpoint: usize,
}

/// A log-backed, replayable collection. `act` queues actions locally;
/// `sync` publishes everything queued as one pend+commit; `update` replays
/// what other peers committed and reconciles the local tail.
pub struct Collection<A> {
    collection_id: CollectionId,
    transactor: Transactor,
    tracker: Arc<Tracker<NetworkSource>>,
    log: Log<A, Tracker<NetworkSource>>,
    config: CollectionConfig,
    handler: Option<Arc<dyn ActionHandler<A>>>,
    filter_conflict: Option<ConflictFilter<A>>,
    /// The latch serializing `update` and `sync` (and ordering `act`s).
    state: tokio::sync::Mutex<SyncState<A>>,
}

impl<A> Collection<A>
where
    A: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Opens the collection named by `collection_id`, creating its log
    /// header locally when no peer knows it yet. A created header is
    /// staged only; the first `sync` publishes it.
    pub async fn create_or_open(
        transactor: Transactor,
        collection_id: CollectionId,
        options: CollectionOptions<A>,
    ) -> CollectionResult<Self> {
        let source = Arc::new(NetworkSource::new(transactor.clone(), collection_id.clone()));
        let tracker = Arc::new(Tracker::new(source));
        let header_id = collection_id.block_id().clone();

        let (log, last_rev) = match tracker.try_get(&header_id).await? {
            Some(_) => {
                let log = Log::open(
                    tracker.clone(),
                    header_id,
                    options.config.entries_per_block,
                )
                .await?;
                let last_rev = log.latest_rev().await?.unwrap_or(0);
                (log, last_rev)
            }
            None => {
                tracing::info!(%collection_id, "creating new collection log");
                let log = Log::create(
                    tracker.clone(),
                    header_id,
                    options.config.entries_per_block,
                )
                .await?;
                (log, 0)
            }
        };

        Ok(Self {
            collection_id,
            transactor,
            tracker,
            log,
            config: options.config,
            handler: options.handler,
            filter_conflict: options.filter_conflict,
            state: tokio::sync::Mutex::new(SyncState {
                last_rev,
                queued: Vec::new(),
                sync_action_id: None,
                actions_since_checkpoint: 0,
            }),
        })
    }

    pub fn collection_id(&self) -> &CollectionId {
        &self.collection_id
    }

    /// The staged view; applications write their own blocks through it.
    pub fn tracker(&self) -> &Arc<Tracker<NetworkSource>> {
        &self.tracker
    }

    /// Appends logical actions locally. Nothing is said to the network
    /// until `sync`.
    pub async fn act(&self, actions: Vec<A>) -> CollectionResult<()> {
        let mut state = self.state.lock().await;
        if let Some(handler) = &self.handler {
            for action in &actions {
                handler
                    .apply(action)
                    .await
                    .map_err(CollectionError::Handler)?;
            }
        }
        state.queued.extend(actions);
        Ok(())
    }

    /// Publishes everything queued since the last sync as a single action
    /// at the next revision. Failure leaves the staged state untouched and
    /// a retry reuses the same action id.
    pub async fn sync(&self) -> CollectionResult<()> {
        let mut state = self.state.lock().await;
        self.sync_locked(&mut state).await
    }

    /// Replays remote log entries committed since our last known revision
    /// and reconciles the locally queued tail through the conflict filter.
    pub async fn update(&self) -> CollectionResult<()> {
        let mut state = self.state.lock().await;
        self.update_locked(&mut state).await
    }

    /// `update` then `sync` under a single latch acquisition.
    pub async fn update_and_sync(&self) -> CollectionResult<()> {
        let mut state = self.state.lock().await;
        self.update_locked(&mut state).await?;
        self.sync_locked(&mut state).await
    }

    async fn sync_locked(&self, state: &mut SyncState<A>) -> CollectionResult<()> {
        if state.queued.is_empty() && self.tracker.is_clean() {
            return Ok(());
        }
        // Snapshot before the log append: a failed publish must restore the
        // tracker to exactly this point so a retry can re-append at the
        // right revision.
        let restore_point = self.tracker.snapshot();
        let action_id = state
            .sync_action_id
            .get_or_insert_with(ActionId::generate)
            .clone();
        let rev = state.last_rev + 1;
        let action_count = state.queued.len();

        let result = self
            .publish(state.queued.clone(), &action_id, rev)
            .await;
        match result {
            Ok(()) => {}
            Err(err) => {
                self.tracker.reset(Some(restore_point));
                return Err(err);
            }
        }

        state.last_rev = rev;
        state.queued.clear();
        state.sync_action_id = None;
        state.actions_since_checkpoint += action_count;

        if state.actions_since_checkpoint >= self.config.checkpoint_interval {
            if let Err(err) = self.write_checkpoint(state).await {
                tracing::warn!(%err, collection_id = %self.collection_id, "checkpoint write failed");
            }
        }
        Ok(())
    }

    /// Appends the log entry and runs the pend+commit pair.
    async fn publish(
        &self,
        actions: Vec<A>,
        action_id: &ActionId,
        rev: Rev,
    ) -> CollectionResult<()> {
        let allocation = self
            .log
            .stage_actions(actions, action_id.clone(), rev, None, None)
            .await?;
        let tail_id = allocation.path.block_id.clone();
        let log_blocks = self.log.allocation_block_ids(&allocation.path);
        self.log.seal_actions(allocation, log_blocks).await?;

        let transforms = self.tracker.reset(None);
        let block_ids = block_ids_for_transforms(&transforms);

        let pend = self
            .transactor
            .pend(PendRequest {
                action_id: action_id.clone(),
                transforms,
                rev: Some(rev),
                policy: PendPolicy::Fail,
            })
            .await?;
        if let PendOutcome::Stale(stale) = pend {
            return Err(CollectionError::StaleSync(stale));
        }

        let header_id = self.collection_id.block_id().clone();
        let commit = self
            .transactor
            .commit(CommitRequest {
                action_id: action_id.clone(),
                header_id: block_ids.contains(&header_id).then_some(header_id),
                tail_id,
                block_ids,
                rev,
            })
            .await?;
        if let CommitOutcome::Stale(stale) = commit {
            return Err(CollectionError::StaleSync(stale));
        }
        Ok(())
    }

    /// A checkpoint restates the still-pending set so readers may prune
    /// older entries; it rides its own pend+commit cycle.
    async fn write_checkpoint(&self, state: &mut SyncState<A>) -> CollectionResult<()> {
        let restore_point = self.tracker.snapshot();
        let action_id = ActionId::generate();
        let rev = state.last_rev + 1;

        let result: CollectionResult<()> = async {
            self.log.add_checkpoint(Vec::new(), rev, None).await?;
            let transforms = self.tracker.reset(None);
            let block_ids = block_ids_for_transforms(&transforms);
            let tail = self
                .log
                .chain()
                .get_tail()
                .await?
                .expect("checkpoint was just appended");
            let pend = self
                .transactor
                .pend(PendRequest {
                    action_id: action_id.clone(),
                    transforms,
                    rev: Some(rev),
                    policy: PendPolicy::Fail,
                })
                .await?;
            if let PendOutcome::Stale(stale) = pend {
                return Err(CollectionError::StaleSync(stale));
            }
            let commit = self
                .transactor
                .commit(CommitRequest {
                    action_id,
                    header_id: None,
                    tail_id: tail.block_id,
                    block_ids,
                    rev,
                })
                .await?;
            if let CommitOutcome::Stale(stale) = commit {
                return Err(CollectionError::StaleSync(stale));
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                state.last_rev = rev;
                state.actions_since_checkpoint = 0;
                Ok(())
            }
            Err(err) => {
                self.tracker.reset(Some(restore_point));
                Err(err)
            }
        }
    }

    async fn update_locked(&self, state: &mut SyncState<A>) -> CollectionResult<()> {
        // Read the committed log through a fresh overlay so locally staged
        // mutations do not shadow what the network has.
        let read_tracker = Arc::new(Tracker::new(self.tracker.source().clone()));
        let log = match Log::<A, _>::open(
            read_tracker,
            self.collection_id.block_id().clone(),
            self.config.entries_per_block,
        )
        .await
        {
            Ok(log) => log,
            Err(LogError::HeaderNotFound(_)) => {
                // Nothing published yet; nothing to replay.
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let read = log.get_from(Some(state.last_rev)).await?;
        // Checkpoints advance the log rev without showing up as entries, so
        // the frontier comes from the tail, not from the replayed actions.
        let latest_rev = log.latest_rev().await?.unwrap_or(0);
        if read.entries.is_empty() {
            state.last_rev = state.last_rev.max(latest_rev);
            return Ok(());
        }

        let mut remote_actions: Vec<A> = Vec::new();
        for entry in &read.entries {
            if let LogEntryKind::Action(action_entry) = &entry.kind {
                remote_actions.extend(action_entry.actions.iter().cloned());
            }
        }

        if let Some(handler) = &self.handler {
            for action in &remote_actions {
                handler
                    .apply(action)
                    .await
                    .map_err(CollectionError::Handler)?;
            }
        }

        // Reconcile the local tail with what landed first.
        if !state.queued.is_empty() {
            let kept: Vec<A> = match &self.filter_conflict {
                None => state.queued.clone(),
                Some(filter) => state
                    .queued
                    .iter()
                    .filter_map(|local| filter(local, &remote_actions))
                    .collect(),
            };
            let dropped = state.queued.len() - kept.len();
            if dropped > 0 {
                tracing::debug!(
                    collection_id = %self.collection_id,
                    dropped,
                    "conflict filter dropped local actions"
                );
            }
            state.queued = kept;
        }
        state.last_rev = state.last_rev.max(latest_rev);
        Ok(())
    }

    /// Streams the committed actions of the log, oldest-first when
    /// `forward`.
    pub fn select_log(&self, forward: bool) -> BoxStream<'static, CollectionResult<A>> {
        let source = self.tracker.source().clone();
        let collection_id = self.collection_id.clone();
        let entries_per_block = self.config.entries_per_block;

        struct Walk<A> {
            log: Log<A, Tracker<NetworkSource>>,
            cursor: Option<BlockId>,
            buffer: VecDeque<A>,
            forward: bool,
        }

        Box::pin(futures::stream::try_unfold(None::<Walk<A>>, move |walk| {
            let source = source.clone();
            let collection_id = collection_id.clone();
            async move {
                let mut walk = match walk {
                    Some(walk) => walk,
                    None => {
                        let tracker = Arc::new(Tracker::new(source));
                        let log = match Log::<A, _>::open(
                            tracker,
                            collection_id.block_id().clone(),
                            entries_per_block,
                        )
                        .await
                        {
                            Ok(log) => log,
                            Err(LogError::HeaderNotFound(_)) => return Ok(None),
                            Err(err) => return Err(CollectionError::Log(err)),
                        };
                        let (head, tail) = log.chain().bounds().await?;
                        Walk {
                            log,
                            cursor: if forward { head } else { tail },
                            buffer: VecDeque::new(),
                            forward,
                        }
                    }
                };

                loop {
                    if let Some(action) = walk.buffer.pop_front() {
                        return Ok(Some((action, Some(walk))));
                    }
                    let Some(block_id) = walk.cursor.clone() else {
                        return Ok(None);
                    };
                    let (entries, prior, next) =
                        walk.log.chain().block_entries(&block_id).await?;
                    walk.cursor = if walk.forward { next } else { prior };

                    let mut actions: Vec<A> = entries
                        .into_iter()
                        .filter_map(|entry| match entry.kind {
                            LogEntryKind::Action(action_entry) => Some(action_entry.actions),
                            LogEntryKind::Checkpoint(_) => None,
                        })
                        .flatten()
                        .collect();
                    if !walk.forward {
                        actions.reverse();
                    }
                    walk.buffer.extend(actions);
                }
            }
        }))
    }
}

impl<A> std::fmt::Debug for Collection<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("collection_id", &self.collection_id)
            .finish()
    }
}
