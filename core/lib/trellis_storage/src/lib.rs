//! Per-peer storage for the trellis block store. `RawStorage` is the narrow
//! persistence contract (addressed by block id and action id or revision);
//! `MemStorage` keeps everything in process memory; `Repo` implements the
//! transactional pend/commit/get/cancel semantics on top.

pub mod mem;
pub mod raw;
pub mod repo;

pub use mem::MemStorage;
pub use raw::{BlockMetadata, RawStorage, StorageError, StorageResult};
pub use repo::{Repo, RepoError, RepoResult};
