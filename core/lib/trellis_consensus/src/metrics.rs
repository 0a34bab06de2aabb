use vise::{Counter, Metrics};

#[derive(Debug, Metrics)]
#[metrics(prefix = "trellis_consensus")]
pub(crate) struct ConsensusMetrics {
    /// Transactions executed against the local repo.
    pub executed: Counter,
    /// Transactions that ended rejected.
    pub rejected: Counter,
    /// Incoming transactions dropped by race resolution.
    pub races_lost: Counter,
    /// Transactions reject-promised after expiring unanswered.
    pub expired: Counter,
    /// Coordinator rounds driven to consensus.
    pub coordinated: Counter,
}

#[vise::register]
pub(crate) static METRICS: vise::Global<ConsensusMetrics> = vise::Global::new();
