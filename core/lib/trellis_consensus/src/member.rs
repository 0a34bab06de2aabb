use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use trellis_config::ClusterConfig;
use trellis_crypto::{CryptoProvider, Keypair, Secp256k1Provider};
use trellis_storage::{RawStorage, Repo};
use trellis_types::{time::millis_since_epoch, PeerId, RepoOperation, RepoResponse};

use crate::{
    metrics::METRICS,
    record::{
        derive_phase, race_winner, records_conflict, ClusterError, ClusterRecord, ClusterResult,
        ClusterSignature, CommitPayload, MessageHash, PromisePayload, SignatureKind,
        TransactionPhase,
    },
};

#[derive(Debug)]
struct ActiveTransaction {
    record: ClusterRecord,
    /// Set once the member has queued this expired transaction for removal.
    reject_appended: bool,
}

/// Outcome of feeding a record to a member: the updated record to gossip
/// back, and the operation responses when this very call drove the
/// transaction to consensus and executed it.
#[derive(Debug)]
pub struct MemberUpdate {
    pub record: ClusterRecord,
    pub phase: TransactionPhase,
    pub responses: Option<Vec<RepoResponse>>,
}

/// One cohort member's view of the cluster protocol. All `update` calls for
/// the same message hash are serialized through a per-hash lock; distinct
/// transactions proceed in parallel.
pub struct ClusterMember<S> {
    self_id: PeerId,
    keypair: Keypair,
    provider: Secp256k1Provider,
    repo: Arc<Repo<S>>,
    config: ClusterConfig,
    active: Mutex<HashMap<MessageHash, ActiveTransaction>>,
    locks: Mutex<HashMap<MessageHash, Arc<tokio::sync::Mutex<()>>>>,
    executed: Mutex<HashSet<MessageHash>>,
}

impl<S: RawStorage> ClusterMember<S> {
    pub fn new(
        self_id: PeerId,
        keypair: Keypair,
        repo: Arc<Repo<S>>,
        config: ClusterConfig,
    ) -> Self {
        Self {
            self_id,
            keypair,
            provider: Secp256k1Provider,
            repo,
            config,
            active: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            executed: Mutex::new(HashSet::new()),
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    pub fn repo(&self) -> &Arc<Repo<S>> {
        &self.repo
    }

    fn lock_for(&self, hash: &MessageHash) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(*hash)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Processes an incoming record for a transaction: validate, merge into
    /// the tracked record, resolve conflicts, then advance our own part of
    /// the protocol as far as it will go.
    pub async fn update(&self, incoming: ClusterRecord) -> ClusterResult<MemberUpdate> {
        let hash = incoming.message_hash;
        let lock = self.lock_for(&hash);
        let _serialized = lock.lock().await;

        // A transaction we already executed is settled; duplicates are
        // acknowledged without re-driving anything.
        if self.executed.lock().unwrap().contains(&hash) {
            return Ok(MemberUpdate {
                phase: derive_phase(
                    &incoming,
                    &self.self_id,
                    false,
                    self.config.commit_threshold,
                ),
                record: incoming,
                responses: None,
            });
        }

        self.validate(&incoming)?;
        let mut record = self.merge_into_active(incoming)?;

        // Conflict check against the rest of the active table.
        if let Some(winner_hash) = self.resolve_conflicts(&record)? {
            // The incoming transaction lost the race: reject it locally so
            // its coordinator learns, and keep it out of the active table.
            let reject = self.sign_promise_reject(
                &record,
                format!("conflict lost to {winner_hash}"),
            );
            record.promises.insert(self.self_id.clone(), reject);
            self.active.lock().unwrap().remove(&hash);
            METRICS.races_lost.inc();
            return Ok(MemberUpdate {
                phase: TransactionPhase::Rejected,
                record,
                responses: None,
            });
        }

        // Register the survivor before driving phases, so a concurrent
        // conflicting transaction already sees it in the active table.
        self.active.lock().unwrap().insert(
            hash,
            ActiveTransaction {
                record: record.clone(),
                reject_appended: false,
            },
        );

        let mut responses = None;
        let phase = loop {
            let phase = derive_phase(
                &record,
                &self.self_id,
                false,
                self.config.commit_threshold,
            );
            match phase {
                TransactionPhase::OurPromiseNeeded => {
                    let signature = self.sign_promise(&record);
                    record.promises.insert(self.self_id.clone(), signature);
                }
                TransactionPhase::OurCommitNeeded => {
                    let signature = self.sign_commit(&record);
                    record.commits.insert(self.self_id.clone(), signature);
                }
                TransactionPhase::Consensus => {
                    responses = self.execute_once(&record).await?;
                    break phase;
                }
                TransactionPhase::Rejected
                | TransactionPhase::Promising
                | TransactionPhase::Propagating => break phase,
            }
        };

        let mut active = self.active.lock().unwrap();
        if phase.is_terminal() {
            active.remove(&hash);
            if phase == TransactionPhase::Rejected {
                METRICS.rejected.inc();
            }
        } else {
            active.insert(
                hash,
                ActiveTransaction {
                    record: record.clone(),
                    reject_appended: false,
                },
            );
        }
        drop(active);
        if phase.is_terminal() {
            self.locks.lock().unwrap().remove(&hash);
        }

        Ok(MemberUpdate {
            record,
            phase,
            responses,
        })
    }

    /// Expiration housekeeping: reject expired transactions we never
    /// promised, and drop transactions past their resolution window.
    pub fn sweep_expired(&self) {
        let now = millis_since_epoch();
        let grace = self.config.resolution_grace().as_millis() as u64;
        let mut active = self.active.lock().unwrap();
        let mut dropped = Vec::new();
        for (hash, transaction) in active.iter_mut() {
            let expiration = transaction.record.message.expiration;
            if now < expiration {
                continue;
            }
            if !transaction.record.promises.contains_key(&self.self_id)
                && !transaction.reject_appended
            {
                let reject =
                    self.sign_promise_reject(&transaction.record, "expired".to_string());
                transaction
                    .record
                    .promises
                    .insert(self.self_id.clone(), reject);
                transaction.reject_appended = true;
                METRICS.expired.inc();
            }
            if now >= expiration + grace {
                dropped.push(*hash);
            }
        }
        for hash in &dropped {
            active.remove(hash);
        }
        drop(active);
        if !dropped.is_empty() {
            let mut locks = self.locks.lock().unwrap();
            for hash in &dropped {
                locks.remove(hash);
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    fn validate(&self, record: &ClusterRecord) -> ClusterResult<()> {
        if crate::record::message_hash(&record.message) != record.message_hash {
            return Err(ClusterError::Forgery {
                message_hash: record.message_hash,
            });
        }
        if record.message.expiration <= millis_since_epoch() {
            return Err(ClusterError::Expired {
                message_hash: record.message_hash,
            });
        }
        for (peer, signature) in &record.promises {
            let info = record.peers.get(peer).ok_or(ClusterError::PeersMismatch {
                message_hash: record.message_hash,
            })?;
            let payload = PromisePayload {
                message_hash: &record.message_hash,
                message: &record.message,
            };
            if !self
                .provider
                .verify(&payload, &signature.signature, &info.public_key)?
            {
                return Err(ClusterError::SignatureInvalid {
                    message_hash: record.message_hash,
                    peer: peer.clone(),
                });
            }
        }
        for (peer, signature) in &record.commits {
            let info = record.peers.get(peer).ok_or(ClusterError::PeersMismatch {
                message_hash: record.message_hash,
            })?;
            let payload = CommitPayload {
                message_hash: &record.message_hash,
                message: &record.message,
                promises: &record.promises,
            };
            if !self
                .provider
                .verify(&payload, &signature.signature, &info.public_key)?
            {
                return Err(ClusterError::SignatureInvalid {
                    message_hash: record.message_hash,
                    peer: peer.clone(),
                });
            }
        }
        Ok(())
    }

    /// Merges the incoming signatures into the tracked record. The
    /// non-signature fields must match exactly.
    fn merge_into_active(&self, incoming: ClusterRecord) -> ClusterResult<ClusterRecord> {
        let active = self.active.lock().unwrap();
        let Some(existing) = active.get(&incoming.message_hash) else {
            return Ok(incoming);
        };
        let mut merged = existing.record.clone();
        drop(active);

        if merged.peers != incoming.peers {
            return Err(ClusterError::PeersMismatch {
                message_hash: incoming.message_hash,
            });
        }
        if merged.message != incoming.message {
            return Err(ClusterError::Forgery {
                message_hash: incoming.message_hash,
            });
        }
        for (peer, signature) in incoming.promises {
            merged.promises.entry(peer).or_insert(signature);
        }
        for (peer, signature) in incoming.commits {
            merged.commits.entry(peer).or_insert(signature);
        }
        Ok(merged)
    }

    /// Runs race resolution against every conflicting active transaction.
    /// Returns the winner's hash when `record` loses; drops losers from the
    /// active table when `record` wins.
    fn resolve_conflicts(&self, record: &ClusterRecord) -> ClusterResult<Option<MessageHash>> {
        let mut active = self.active.lock().unwrap();
        let mut losers = Vec::new();
        for (other_hash, other) in active.iter() {
            if *other_hash == record.message_hash {
                continue;
            }
            if !records_conflict(record, &other.record) {
                continue;
            }
            let winner = race_winner(record, &other.record);
            if winner.message_hash == record.message_hash {
                losers.push(*other_hash);
            } else {
                return Ok(Some(*other_hash));
            }
        }
        for loser in losers {
            tracing::debug!(
                winner = %record.message_hash,
                loser = %loser,
                "conflicting transaction dropped after race resolution"
            );
            active.remove(&loser);
        }
        Ok(None)
    }

    fn sign_promise(&self, record: &ClusterRecord) -> ClusterSignature {
        let payload = PromisePayload {
            message_hash: &record.message_hash,
            message: &record.message,
        };
        ClusterSignature {
            kind: SignatureKind::Approve,
            signature: self.provider.sign(&payload, &self.keypair.secret_key),
            reject_reason: None,
        }
    }

    fn sign_promise_reject(&self, record: &ClusterRecord, reason: String) -> ClusterSignature {
        let payload = PromisePayload {
            message_hash: &record.message_hash,
            message: &record.message,
        };
        ClusterSignature {
            kind: SignatureKind::Reject,
            signature: self.provider.sign(&payload, &self.keypair.secret_key),
            reject_reason: Some(reason),
        }
    }

    fn sign_commit(&self, record: &ClusterRecord) -> ClusterSignature {
        let payload = CommitPayload {
            message_hash: &record.message_hash,
            message: &record.message,
            promises: &record.promises,
        };
        ClusterSignature {
            kind: SignatureKind::Approve,
            signature: self.provider.sign(&payload, &self.keypair.secret_key),
            reject_reason: None,
        }
    }

    /// Applies the message operations to the local repo, exactly once per
    /// message hash.
    async fn execute_once(
        &self,
        record: &ClusterRecord,
    ) -> ClusterResult<Option<Vec<RepoResponse>>> {
        if !self.executed.lock().unwrap().insert(record.message_hash) {
            return Ok(None);
        }
        METRICS.executed.inc();

        let mut responses = Vec::with_capacity(record.message.operations.len());
        for operation in &record.message.operations {
            let response = match operation {
                RepoOperation::Get { block_ids, context } => RepoResponse::Get(
                    self.repo
                        .get(block_ids, context.as_ref())
                        .await
                        .map_err(|err| ClusterError::Repo(err.to_string()))?,
                ),
                RepoOperation::Pend { action, policy } => RepoResponse::Pend(
                    self.repo
                        .pend(action, *policy)
                        .await
                        .map_err(|err| ClusterError::Repo(err.to_string()))?,
                ),
                RepoOperation::Commit {
                    action_id,
                    block_ids,
                    rev,
                } => RepoResponse::Commit(
                    self.repo
                        .commit(action_id, block_ids, *rev)
                        .await
                        .map_err(|err| ClusterError::Repo(err.to_string()))?,
                ),
                RepoOperation::Cancel {
                    action_id,
                    block_ids,
                } => {
                    self.repo
                        .cancel(action_id, block_ids)
                        .await
                        .map_err(|err| ClusterError::Repo(err.to_string()))?;
                    RepoResponse::Cancel
                }
            };
            responses.push(response);
        }
        Ok(Some(responses))
    }
}

#[async_trait::async_trait]
impl<S: RawStorage> crate::client::ClusterUpdateHandler for ClusterMember<S> {
    async fn apply_update(&self, record: ClusterRecord) -> Result<ClusterRecord, String> {
        self.update(record)
            .await
            .map(|update| update.record)
            .map_err(|err| err.to_string())
    }
}

impl<S> std::fmt::Debug for ClusterMember<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterMember")
            .field("self_id", &self.self_id)
            .finish()
    }
}
