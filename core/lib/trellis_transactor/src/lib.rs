//! The transactor: presents a multi-block, multi-peer transaction as a
//! single `get`/`pend`/`commit`/`cancel` call. Operations are grouped into
//! per-coordinator batches, dispatched concurrently, and retried against
//! the rest of the cohort when a coordinator fails to answer.

pub mod batch;
mod metrics;
pub mod transactor;

pub use batch::{
    batches_by_peer, batches_for_payload, process_batches, BatchOutcome, BatchRun, BatchSlot,
    CoordinatorBatch,
};
pub use transactor::{
    CommitRequest, GetRequest, PendRequest, Transactor, TransactorError, TransactorResult,
};
