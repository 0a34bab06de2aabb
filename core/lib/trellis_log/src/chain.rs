use std::{marker::PhantomData, sync::Arc};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use trellis_crypto::sha256;
use trellis_types::{
    Block, BlockHeader, BlockId, BlockStore, BlockType, Op, PathSeg, StoreError,
};

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("chain block {block_id} is corrupt: {details}")]
    Corrupt { block_id: BlockId, details: String },
    #[error("chain header {0} not found")]
    HeaderNotFound(BlockId),
    #[error("no entry at {block_id}[{index}]")]
    NoSuchEntry { block_id: BlockId, index: usize },
}

pub type LogResult<T> = Result<T, LogError>;

/// Position of one entry in a chain: the data block and the entry index
/// inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainPath {
    pub block_id: BlockId,
    pub index: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HeaderPayload {
    head: Option<BlockId>,
    tail: Option<BlockId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodePayload {
    entries: Vec<serde_json::Value>,
    prior_id: Option<BlockId>,
    next_id: Option<BlockId>,
    prior_hash: Option<String>,
}

/// The part of a data block covered by its successor's `prior_hash`. The
/// forward link mutates after the hash is taken, so it stays out.
#[derive(Serialize)]
struct SealedNode<'a> {
    id: &'a BlockId,
    collection_id: &'a trellis_types::CollectionId,
    entries: &'a [serde_json::Value],
    prior_id: &'a Option<BlockId>,
    prior_hash: &'a Option<String>,
}

fn sealed_digest(block: &Block, node: &NodePayload) -> String {
    let sealed = SealedNode {
        id: &block.header.id,
        collection_id: &block.header.collection_id,
        entries: &node.entries,
        prior_id: &node.prior_id,
        prior_hash: &node.prior_hash,
    };
    let bytes = trellis_crypto::canonical_bytes(&sealed);
    sha256(&bytes).to_base64url()
}

fn decode_header(block: &Block) -> LogResult<HeaderPayload> {
    serde_json::from_value(block.payload.clone()).map_err(|err| LogError::Corrupt {
        block_id: block.header.id.clone(),
        details: format!("bad header payload: {err}"),
    })
}

fn decode_node(block: &Block) -> LogResult<NodePayload> {
    serde_json::from_value(block.payload.clone()).map_err(|err| LogError::Corrupt {
        block_id: block.header.id.clone(),
        details: format!("bad chain node payload: {err}"),
    })
}

/// A doubly-navigable, hash-linked sequence of data blocks anchored by a
/// header block. Entries are typed; blocks hold up to `entries_per_block`
/// of them before a new tail is allocated.
#[derive(Debug)]
pub struct Chain<T, S> {
    store: Arc<S>,
    header_id: BlockId,
    entries_per_block: usize,
    _entries: PhantomData<fn() -> T>,
}

impl<T, S> Chain<T, S>
where
    T: Serialize + DeserializeOwned,
    S: BlockStore,
{
    /// Creates the header block and an empty chain behind it.
    pub async fn create(
        store: Arc<S>,
        header_id: BlockId,
        entries_per_block: usize,
    ) -> LogResult<Self> {
        let header = Block::new(
            BlockHeader {
                id: header_id.clone(),
                block_type: BlockType::LogHeader,
                collection_id: store.collection_id().clone(),
            },
            serde_json::to_value(HeaderPayload::default()).expect("header payload serializes"),
        );
        store.insert(header).await?;
        Ok(Self {
            store,
            header_id,
            entries_per_block: entries_per_block.max(1),
            _entries: PhantomData,
        })
    }

    /// Opens an existing chain by its header block.
    pub async fn open(
        store: Arc<S>,
        header_id: BlockId,
        entries_per_block: usize,
    ) -> LogResult<Self> {
        let header = store
            .try_get(&header_id)
            .await?
            .ok_or_else(|| LogError::HeaderNotFound(header_id.clone()))?;
        decode_header(&header)?;
        Ok(Self {
            store,
            header_id,
            entries_per_block: entries_per_block.max(1),
            _entries: PhantomData,
        })
    }

    pub fn header_id(&self) -> &BlockId {
        &self.header_id
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn header(&self) -> LogResult<HeaderPayload> {
        let block = self
            .store
            .try_get(&self.header_id)
            .await?
            .ok_or_else(|| LogError::HeaderNotFound(self.header_id.clone()))?;
        decode_header(&block)
    }

    async fn node(&self, block_id: &BlockId) -> LogResult<(Block, NodePayload)> {
        let block = self
            .store
            .try_get(block_id)
            .await?
            .ok_or_else(|| LogError::Corrupt {
                block_id: block_id.clone(),
                details: "chain node missing from store".to_string(),
            })?;
        let node = decode_node(&block)?;
        Ok((block, node))
    }

    fn encode_entry(&self, entry: &T) -> serde_json::Value {
        serde_json::to_value(entry).expect("chain entry serializes")
    }

    fn decode_entry(&self, block_id: &BlockId, value: &serde_json::Value) -> LogResult<T> {
        serde_json::from_value(value.clone()).map_err(|err| LogError::Corrupt {
            block_id: block_id.clone(),
            details: format!("bad chain entry: {err}"),
        })
    }

    /// Appends an entry, allocating and hash-linking a new tail block when
    /// the current one is full. Returns the path of the new entry.
    pub async fn add(&self, entry: T) -> LogResult<ChainPath> {
        let header = self.header().await?;
        let encoded = self.encode_entry(&entry);

        let tail = match &header.tail {
            Some(tail_id) => {
                let (block, node) = self.node(tail_id).await?;
                if node.entries.len() < self.entries_per_block {
                    let index = node.entries.len();
                    self.store
                        .update(
                            tail_id,
                            Op::Splice {
                                path: vec![PathSeg::Key("entries".into())],
                                index,
                                remove: 0,
                                insert: vec![encoded],
                            },
                        )
                        .await?;
                    return Ok(ChainPath {
                        block_id: tail_id.clone(),
                        index,
                    });
                }
                Some((block, node))
            }
            None => None,
        };

        // Allocate a fresh tail; hash-link it to the sealed predecessor.
        let new_id = self.store.generate_id();
        let (prior_id, prior_hash) = match &tail {
            Some((block, node)) => (
                Some(block.header.id.clone()),
                Some(sealed_digest(block, node)),
            ),
            None => (None, None),
        };
        let payload = NodePayload {
            entries: vec![encoded],
            prior_id: prior_id.clone(),
            next_id: None,
            prior_hash,
        };
        let block = Block::new(
            BlockHeader {
                id: new_id.clone(),
                block_type: BlockType::LogData,
                collection_id: self.store.collection_id().clone(),
            },
            serde_json::to_value(payload).expect("node payload serializes"),
        );
        self.store.insert(block).await?;

        if let Some(prior_id) = &prior_id {
            self.store
                .update(
                    prior_id,
                    Op::set(
                        vec![PathSeg::Key("next_id".into())],
                        serde_json::to_value(&new_id).expect("block id serializes"),
                    ),
                )
                .await?;
        }
        if header.head.is_none() {
            self.store
                .update(
                    &self.header_id,
                    Op::set(
                        vec![PathSeg::Key("head".into())],
                        serde_json::to_value(&new_id).expect("block id serializes"),
                    ),
                )
                .await?;
        }
        self.store
            .update(
                &self.header_id,
                Op::set(
                    vec![PathSeg::Key("tail".into())],
                    serde_json::to_value(&new_id).expect("block id serializes"),
                ),
            )
            .await?;

        Ok(ChainPath {
            block_id: new_id,
            index: 0,
        })
    }

    /// Rewrites the entry at `path` in place.
    pub async fn update_at(&self, path: &ChainPath, entry: T) -> LogResult<()> {
        let (_, node) = self.node(&path.block_id).await?;
        if path.index >= node.entries.len() {
            return Err(LogError::NoSuchEntry {
                block_id: path.block_id.clone(),
                index: path.index,
            });
        }
        self.store
            .update(
                &path.block_id,
                Op::Set {
                    path: vec![
                        PathSeg::Key("entries".into()),
                        PathSeg::Index(path.index),
                    ],
                    value: self.encode_entry(&entry),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn entry_at(&self, path: &ChainPath) -> LogResult<T> {
        let (_, node) = self.node(&path.block_id).await?;
        let value = node
            .entries
            .get(path.index)
            .ok_or_else(|| LogError::NoSuchEntry {
                block_id: path.block_id.clone(),
                index: path.index,
            })?;
        self.decode_entry(&path.block_id, value)
    }

    /// Path of the last entry, or `None` for an empty chain.
    pub async fn get_tail(&self) -> LogResult<Option<ChainPath>> {
        let header = self.header().await?;
        let Some(tail_id) = header.tail else {
            return Ok(None);
        };
        let (_, node) = self.node(&tail_id).await?;
        if node.entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(ChainPath {
            block_id: tail_id,
            index: node.entries.len() - 1,
        }))
    }

    /// Head and tail data block ids, for callers that page block-by-block.
    pub async fn bounds(&self) -> LogResult<(Option<BlockId>, Option<BlockId>)> {
        let header = self.header().await?;
        Ok((header.head, header.tail))
    }

    /// All entries of one data block plus its neighbour links.
    pub async fn block_entries(
        &self,
        block_id: &BlockId,
    ) -> LogResult<(Vec<T>, Option<BlockId>, Option<BlockId>)> {
        let (_, node) = self.node(block_id).await?;
        let mut entries = Vec::with_capacity(node.entries.len());
        for value in &node.entries {
            entries.push(self.decode_entry(block_id, value)?);
        }
        Ok((entries, node.prior_id, node.next_id))
    }

    /// Walks entries starting at `starting` (default: head when forward,
    /// tail when backward).
    pub fn select(&self, starting: Option<ChainPath>, forward: bool) -> ChainSelect<'_, T, S> {
        ChainSelect {
            chain: self,
            cursor: starting,
            initialized: false,
            forward,
        }
    }

    /// Verifies the hash link from `block_id` back to its predecessor.
    pub async fn verify_link(&self, block_id: &BlockId) -> LogResult<bool> {
        let (_, node) = self.node(block_id).await?;
        let (Some(prior_id), Some(prior_hash)) = (&node.prior_id, &node.prior_hash) else {
            return Ok(node.prior_id.is_none() && node.prior_hash.is_none());
        };
        let (prior_block, prior_node) = self.node(prior_id).await?;
        Ok(sealed_digest(&prior_block, &prior_node) == *prior_hash)
    }
}

/// Cursor over chain entries, yielding `(path, entry)` pairs.
#[derive(Debug)]
pub struct ChainSelect<'a, T, S> {
    chain: &'a Chain<T, S>,
    cursor: Option<ChainPath>,
    initialized: bool,
    forward: bool,
}

impl<T, S> ChainSelect<'_, T, S>
where
    T: Serialize + DeserializeOwned,
    S: BlockStore,
{
    pub async fn next(&mut self) -> LogResult<Option<(ChainPath, T)>> {
        if !self.initialized {
            self.initialized = true;
            if self.cursor.is_none() {
                let header = self.chain.header().await?;
                self.cursor = if self.forward {
                    header.head.map(|block_id| ChainPath { block_id, index: 0 })
                } else {
                    self.chain.get_tail().await?
                };
            }
        }
        let Some(path) = self.cursor.clone() else {
            return Ok(None);
        };

        let (_, node) = self.chain.node(&path.block_id).await?;
        let value = node
            .entries
            .get(path.index)
            .ok_or_else(|| LogError::NoSuchEntry {
                block_id: path.block_id.clone(),
                index: path.index,
            })?;
        let entry = self.chain.decode_entry(&path.block_id, value)?;

        // Advance the cursor for the next call.
        self.cursor = if self.forward {
            if path.index + 1 < node.entries.len() {
                Some(ChainPath {
                    block_id: path.block_id.clone(),
                    index: path.index + 1,
                })
            } else {
                match node.next_id {
                    Some(next_id) => Some(ChainPath {
                        block_id: next_id,
                        index: 0,
                    }),
                    None => None,
                }
            }
        } else if path.index > 0 {
            Some(ChainPath {
                block_id: path.block_id.clone(),
                index: path.index - 1,
            })
        } else {
            match node.prior_id {
                Some(prior_id) => {
                    let (_, prior) = self.chain.node(&prior_id).await?;
                    if prior.entries.is_empty() {
                        None
                    } else {
                        Some(ChainPath {
                            block_id: prior_id,
                            index: prior.entries.len() - 1,
                        })
                    }
                }
                None => None,
            }
        };

        Ok(Some((path, entry)))
    }
}
