//! Log-structured storage over a block store: a doubly-navigable chain of
//! hash-linked data blocks anchored by a header block, and the typed action
//! log a collection appends to.

pub mod chain;
pub mod log;

pub use chain::{Chain, ChainPath, ChainSelect, LogError, LogResult};
pub use log::{EntryAllocation, GetFrom, Log};
