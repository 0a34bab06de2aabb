use vise::{Counter, Metrics};

#[derive(Debug, Metrics)]
#[metrics(prefix = "trellis_peer")]
pub(crate) struct PeerMetrics {
    /// Repo protocol requests served.
    pub repo_requests: Counter,
    /// Reads answered only after a restore round.
    pub restored_reads: Counter,
    /// Restore rounds that could not reach agreement.
    pub failed_restores: Counter,
}

#[vise::register]
pub(crate) static METRICS: vise::Global<PeerMetrics> = vise::Global::new();
