use serde::{Deserialize, Serialize};

use crate::ids::{BlockId, CollectionId};

/// Discriminates the two block shapes every collection carries (its log
/// header and the hash-linked log data nodes) from application blocks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BlockType {
    LogHeader,
    LogData,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub id: BlockId,
    pub block_type: BlockType,
    pub collection_id: CollectionId,
}

/// The atomic unit of storage and addressing: a header plus an open payload.
///
/// The payload is a JSON value so that application block shapes stay open
/// while mutation ops can still address into them structurally. serde_json
/// keeps object keys sorted, so a block's serialized form is stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub payload: serde_json::Value,
}

impl Block {
    pub fn new(header: BlockHeader, payload: serde_json::Value) -> Self {
        Self { header, payload }
    }

    pub fn id(&self) -> &BlockId {
        &self.header.id
    }
}
