//! Log-structured collections: a tracker that stages block mutations
//! against a read-only source, and the log-backed, replayable collection
//! state machine that publishes staged actions through the transactor.

pub mod collection;
pub mod source;
pub mod tracker;

pub use collection::{
    ActionHandler, Collection, CollectionError, CollectionOptions, CollectionResult,
    ConflictFilter,
};
pub use source::NetworkSource;
pub use tracker::Tracker;
