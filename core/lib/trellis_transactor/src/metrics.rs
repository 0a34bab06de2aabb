use vise::{Counter, EncodeLabelSet, EncodeLabelValue, Family, Metrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue, EncodeLabelSet)]
#[metrics(label = "op", rename_all = "snake_case")]
pub(crate) enum TransactorOp {
    Get,
    Pend,
    Commit,
    Cancel,
}

#[derive(Debug, Metrics)]
#[metrics(prefix = "trellis_transactor")]
pub(crate) struct TransactorMetrics {
    /// Calls issued, by operation.
    pub calls: Family<TransactorOp, Counter>,
    /// Batches re-dispatched after a coordinator failure.
    pub batch_retries: Counter,
    /// Reads that missed their deadline for at least one block.
    pub incomplete_reads: Counter,
    /// Commits where a non-tail block failed after the tail committed.
    pub tolerated_commit_failures: Counter,
}

#[vise::register]
pub(crate) static METRICS: vise::Global<TransactorMetrics> = vise::Global::new();
