use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use trellis_crypto::{canonical_digest, CryptoError, Digest};
use trellis_network::{RoutingError, TransportError};
use trellis_types::{PeerId, PeerInfo, RepoMessage};

/// Stable, collision-resistant identity of a cluster transaction: SHA-256
/// over the canonical encoding of its message.
pub type MessageHash = Digest;

pub fn message_hash(message: &RepoMessage) -> MessageHash {
    canonical_digest(message)
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("transaction {message_hash} is expired")]
    Expired { message_hash: MessageHash },
    #[error("signature of {peer} on {message_hash} does not verify")]
    SignatureInvalid {
        message_hash: MessageHash,
        peer: PeerId,
    },
    #[error("message content for {message_hash} differs from its hash: forged record")]
    Forgery { message_hash: MessageHash },
    #[error("peer set for {message_hash} does not match the tracked record")]
    PeersMismatch { message_hash: MessageHash },
    #[error("transaction {message_hash} was rejected: {reasons:?}")]
    Rejected {
        message_hash: MessageHash,
        reasons: Vec<String>,
    },
    #[error("cohort of {got} peers is below the minimum of {min}")]
    CohortTooSmall { got: usize, min: usize },
    #[error("repo execution failed: {0}")]
    Repo(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("cluster peer {peer} rejected the update: {details}")]
    PeerRejected { peer: PeerId, details: String },
}

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureKind {
    Approve,
    Reject,
}

/// A peer's signed vote on one phase of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSignature {
    pub kind: SignatureKind,
    pub signature: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
}

impl ClusterSignature {
    pub fn is_approve(&self) -> bool {
        matches!(self.kind, SignatureKind::Approve)
    }
}

/// The record a cohort gossips while sequencing one transaction. The
/// non-signature fields are fixed at creation; only `promises` and
/// `commits` grow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub message_hash: MessageHash,
    pub peers: BTreeMap<PeerId, PeerInfo>,
    pub message: RepoMessage,
    pub promises: BTreeMap<PeerId, ClusterSignature>,
    pub commits: BTreeMap<PeerId, ClusterSignature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_cluster_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_required_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_size_hint: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_size_confidence: Option<f64>,
}

impl ClusterRecord {
    pub fn new(peers: BTreeMap<PeerId, PeerInfo>, message: RepoMessage) -> Self {
        Self {
            message_hash: message_hash(&message),
            peers,
            message,
            promises: BTreeMap::new(),
            commits: BTreeMap::new(),
            suggested_cluster_size: None,
            min_required_size: None,
            network_size_hint: None,
            network_size_confidence: None,
        }
    }

    pub fn promise_approvals(&self) -> usize {
        self.promises.values().filter(|sig| sig.is_approve()).count()
    }

    pub fn commit_approvals(&self) -> usize {
        self.commits.values().filter(|sig| sig.is_approve()).count()
    }

    pub fn commit_rejects(&self) -> usize {
        self.commits.len() - self.commit_approvals()
    }

    pub fn has_promise_reject(&self) -> bool {
        self.promises.values().any(|sig| !sig.is_approve())
    }

    pub fn reject_reasons(&self) -> Vec<String> {
        self.promises
            .values()
            .chain(self.commits.values())
            .filter_map(|sig| sig.reject_reason.clone())
            .collect()
    }

    /// Simple majority of cohort commits approving.
    pub fn has_commit_majority(&self, threshold: f64) -> bool {
        let cohort = self.peers.len().max(1);
        (self.commit_approvals() as f64) / (cohort as f64) > threshold
    }
}

/// What a promise signature covers: the transaction identity and its
/// message, so a promise cannot be replayed onto different content.
#[derive(Serialize)]
pub struct PromisePayload<'a> {
    pub message_hash: &'a MessageHash,
    pub message: &'a RepoMessage,
}

/// What a commit signature covers: additionally the complete promise set,
/// so a commit pins the promises it was based on.
#[derive(Serialize)]
pub struct CommitPayload<'a> {
    pub message_hash: &'a MessageHash,
    pub message: &'a RepoMessage,
    pub promises: &'a BTreeMap<PeerId, ClusterSignature>,
}

/// Where one member sees a transaction, derived from the record and the
/// member's own participation; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    /// A promise reject or a majority of commit rejects: terminal.
    Rejected,
    /// We have not promised yet and nothing blocks us from doing so.
    OurPromiseNeeded,
    /// Waiting for the rest of the cohort's promises.
    Promising,
    /// Every promise is in and our commit is missing.
    OurCommitNeeded,
    /// Commit approvals form a majority: terminal, execute.
    Consensus,
    /// Our part is done; the rest of the cohort is still committing.
    Propagating,
}

impl TransactionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionPhase::Rejected | TransactionPhase::Consensus)
    }
}

/// Derives the phase for `self_id`. `blocked` reports a conflicting
/// transaction in the local active set that race resolution has not decided
/// in this record's favour.
pub fn derive_phase(
    record: &ClusterRecord,
    self_id: &PeerId,
    blocked: bool,
    commit_threshold: f64,
) -> TransactionPhase {
    let cohort = record.peers.len().max(1);
    if record.has_promise_reject()
        || (record.commit_rejects() as f64) / (cohort as f64) > commit_threshold
    {
        return TransactionPhase::Rejected;
    }
    if !record.promises.contains_key(self_id) && !blocked {
        return TransactionPhase::OurPromiseNeeded;
    }
    if record.promises.len() < cohort {
        return TransactionPhase::Promising;
    }
    if !record.commits.contains_key(self_id) {
        return TransactionPhase::OurCommitNeeded;
    }
    if record.has_commit_majority(commit_threshold) {
        return TransactionPhase::Consensus;
    }
    TransactionPhase::Propagating
}

/// Conflict and race resolution between two transactions touching an
/// overlapping block: the one with more accumulated promises survives;
/// ties go to the lexicographically larger message hash. Deterministic on
/// every peer observing both records.
pub fn race_winner<'a>(a: &'a ClusterRecord, b: &'a ClusterRecord) -> &'a ClusterRecord {
    match a.promise_approvals().cmp(&b.promise_approvals()) {
        std::cmp::Ordering::Greater => a,
        std::cmp::Ordering::Less => b,
        std::cmp::Ordering::Equal => {
            if a.message_hash.as_bytes() >= b.message_hash.as_bytes() {
                a
            } else {
                b
            }
        }
    }
}

/// Two transactions conflict when they touch an overlapping block id and
/// belong to different actions; a pend and its own commit do not conflict.
pub fn records_conflict(a: &ClusterRecord, b: &ClusterRecord) -> bool {
    let blocks_a = a.message.block_ids();
    let blocks_b = b.message.block_ids();
    let overlap = blocks_a.iter().any(|id| blocks_b.contains(id));
    if !overlap {
        return false;
    }
    let actions_a: Vec<_> = a
        .message
        .operations
        .iter()
        .filter_map(|op| op.action_id())
        .collect();
    let actions_b: Vec<_> = b
        .message
        .operations
        .iter()
        .filter_map(|op| op.action_id())
        .collect();
    if actions_a.is_empty() || actions_b.is_empty() {
        // Reads do not conflict with anything.
        return false;
    }
    !actions_a.iter().any(|action| actions_b.contains(action))
}

#[cfg(test)]
mod tests {
    use trellis_types::{ActionId, ActionTransforms, BlockId, PendPolicy, RepoOperation, Transforms};

    use super::*;

    fn record_for(action: &str, blocks: &[&str], expiration: u64) -> ClusterRecord {
        let mut transforms = Transforms::default();
        for block in blocks {
            transforms.deletes.insert(BlockId::new(*block));
        }
        let message = RepoMessage::single(
            RepoOperation::Pend {
                action: ActionTransforms {
                    action_id: ActionId::new(action),
                    rev: None,
                    transforms,
                },
                policy: PendPolicy::Fail,
            },
            expiration,
        );
        let peers = [("p1", ""), ("p2", ""), ("p3", "")]
            .iter()
            .map(|(id, _)| (PeerId::new(*id), PeerInfo::default()))
            .collect();
        ClusterRecord::new(peers, message)
    }

    fn approve() -> ClusterSignature {
        ClusterSignature {
            kind: SignatureKind::Approve,
            signature: vec![1],
            reject_reason: None,
        }
    }

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let a = record_for("a1", &["b1"], 10);
        let b = record_for("a1", &["b1"], 10);
        let c = record_for("a1", &["b2"], 10);
        assert_eq!(a.message_hash, b.message_hash);
        assert_ne!(a.message_hash, c.message_hash);
    }

    #[test]
    fn phase_progression_follows_the_table() {
        let self_id = PeerId::new("p1");
        let mut record = record_for("a1", &["b1"], 10);

        assert_eq!(
            derive_phase(&record, &self_id, false, 0.5),
            TransactionPhase::OurPromiseNeeded
        );
        record.promises.insert(self_id.clone(), approve());
        assert_eq!(
            derive_phase(&record, &self_id, false, 0.5),
            TransactionPhase::Promising
        );
        record.promises.insert(PeerId::new("p2"), approve());
        record.promises.insert(PeerId::new("p3"), approve());
        assert_eq!(
            derive_phase(&record, &self_id, false, 0.5),
            TransactionPhase::OurCommitNeeded
        );
        record.commits.insert(self_id.clone(), approve());
        assert_eq!(
            derive_phase(&record, &self_id, false, 0.5),
            TransactionPhase::Propagating
        );
        record.commits.insert(PeerId::new("p2"), approve());
        assert_eq!(
            derive_phase(&record, &self_id, false, 0.5),
            TransactionPhase::Consensus
        );
    }

    #[test]
    fn promise_reject_is_terminal() {
        let self_id = PeerId::new("p1");
        let mut record = record_for("a1", &["b1"], 10);
        record.promises.insert(
            PeerId::new("p2"),
            ClusterSignature {
                kind: SignatureKind::Reject,
                signature: vec![],
                reject_reason: Some("expired".into()),
            },
        );
        assert_eq!(
            derive_phase(&record, &self_id, false, 0.5),
            TransactionPhase::Rejected
        );
    }

    #[test]
    fn race_prefers_promises_then_hash() {
        let mut a = record_for("a1", &["b1"], 10);
        let b = record_for("a2", &["b1"], 10);
        assert!(records_conflict(&a, &b));

        // Same promise count: larger hash wins on both orderings.
        let tie_winner = race_winner(&a, &b).message_hash;
        assert_eq!(race_winner(&b, &a).message_hash, tie_winner);

        // More promises beats the hash tiebreak.
        a.promises.insert(PeerId::new("p2"), approve());
        assert_eq!(race_winner(&a, &b).message_hash, a.message_hash);
        assert_eq!(race_winner(&b, &a).message_hash, a.message_hash);
    }

    #[test]
    fn same_action_operations_do_not_conflict() {
        let pend = record_for("a1", &["b1"], 10);
        let commit = {
            let message = RepoMessage::single(
                RepoOperation::Commit {
                    action_id: ActionId::new("a1"),
                    block_ids: vec![BlockId::new("b1")],
                    rev: 1,
                },
                10,
            );
            ClusterRecord::new(pend.peers.clone(), message)
        };
        assert!(!records_conflict(&pend, &commit));
    }

    #[test]
    fn disjoint_blocks_do_not_conflict() {
        let a = record_for("a1", &["b1"], 10);
        let b = record_for("a2", &["b2"], 10);
        assert!(!records_conflict(&a, &b));
    }
}
